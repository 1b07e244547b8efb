//! The replicator: turns the trust graph into admission and pull policy.
//!
//! `feed_wants` and `blocked` live behind one lock and are recomputed
//! from the graph on a debounced root-log tick: every append resets a
//! fixed window, and the walk runs once the window elapses. Imperative
//! overrides exist for CLI control and always take effect immediately.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use scuttle_store::{FeedStore, ReceiveLog};
use scuttle_types::{FeedRef, Result, ScuttleError};

use crate::graph::GraphBuilder;

#[derive(Default)]
struct Sets {
    feed_wants: HashSet<FeedRef>,
    blocked: HashSet<FeedRef>,
}

/// Replication policy holder.
pub struct Replicator {
    builder: GraphBuilder,
    feeds: Arc<FeedStore>,
    self_id: FeedRef,
    hop_count: u32,
    sets: Mutex<Sets>,
}

impl Replicator {
    /// Creates the replicator and runs an initial graph walk.
    pub fn new(
        builder: GraphBuilder,
        feeds: Arc<FeedStore>,
        self_id: FeedRef,
        hop_count: u32,
    ) -> Result<Arc<Self>> {
        let r = Arc::new(Self {
            builder,
            feeds,
            self_id,
            hop_count,
            sets: Mutex::new(Sets::default()),
        });
        r.recompute()?;
        Ok(r)
    }

    /// Recomputes both sets from the current graph.
    pub fn recompute(&self) -> Result<()> {
        let graph = self.builder.build()?;
        let wants = graph.hops(&self.self_id, self.hop_count);
        let blocked = graph.blocks(&self.self_id);

        let mut sets = self.lock();
        for feed in wants {
            sets.feed_wants.insert(feed);
        }
        sets.blocked = blocked;
        // Never fetch or admit a blocked feed.
        let blocked_now = sets.blocked.clone();
        for feed in blocked_now {
            sets.feed_wants.remove(&feed);
        }
        tracing::debug!(
            wants = sets.feed_wants.len(),
            blocked = sets.blocked.len(),
            hops = self.hop_count,
            "replication sets updated"
        );
        Ok(())
    }

    /// Spawns the debounced update task: recompute `debounce` after the
    /// most recent root-log append, until shutdown.
    pub fn spawn_debounce(
        self: &Arc<Self>,
        log: Arc<ReceiveLog>,
        debounce: Duration,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let this = self.clone();
        let mut appends = log.subscribe();
        tokio::spawn(async move {
            let timer = tokio::time::sleep(debounce);
            tokio::pin!(timer);
            let mut pending = false;

            loop {
                tokio::select! {
                    recv = appends.recv() => match recv {
                        Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => {
                            pending = true;
                            timer.as_mut().reset(tokio::time::Instant::now() + debounce);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = &mut timer, if pending => {
                        pending = false;
                        if let Err(e) = this.recompute() {
                            tracing::error!(error = %e, "replication update failed");
                        }
                    }
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Admission check for an inbound peer connection.
    ///
    /// Blocked feeds are denied outright; feeds in the want set are
    /// admitted; a node with no stored feeds admits anyone not blocked
    /// (trust-on-first-use re-sync).
    pub fn authorize(&self, remote: &FeedRef) -> Result<()> {
        let sets = self.lock();
        if sets.blocked.contains(remote) {
            return Err(ScuttleError::Unauthorized {
                remote: remote.to_string(),
            });
        }
        if sets.feed_wants.contains(remote) {
            return Ok(());
        }
        drop(sets);

        if self.feeds.is_empty()? {
            tracing::warn!(remote = %remote, "no stored feeds, trust-on-first-use admission");
            return Ok(());
        }
        Err(ScuttleError::Unauthorized {
            remote: remote.to_string(),
        })
    }

    /// Adds a feed to the want set.
    pub fn replicate(&self, feed: &FeedRef) {
        self.lock().feed_wants.insert(*feed);
    }

    /// Removes a feed from the want set.
    pub fn dont_replicate(&self, feed: &FeedRef) {
        self.lock().feed_wants.remove(feed);
    }

    /// Blocks a feed: denied admission and never fetched.
    pub fn block(&self, feed: &FeedRef) {
        let mut sets = self.lock();
        sets.blocked.insert(*feed);
        sets.feed_wants.remove(feed);
    }

    /// Unblocks a feed.
    pub fn unblock(&self, feed: &FeedRef) {
        self.lock().blocked.remove(feed);
    }

    /// Snapshot of the current want set.
    pub fn feed_wants(&self) -> HashSet<FeedRef> {
        self.lock().feed_wants.clone()
    }

    /// Snapshot of the current block set.
    pub fn blocked(&self) -> HashSet<FeedRef> {
        self.lock().blocked.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Sets> {
        // The sets lock is never held across await points; poisoning
        // only happens if a recompute panicked, which is fatal anyway.
        self.sets.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
