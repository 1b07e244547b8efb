//! Blob want/have exchange.
//!
//! One duplex stream per peer carries maps of `blob ref → i64`:
//! negative values are wants (hop count toward the origin, decreasing),
//! non-negative values advertise the blob's size. The [`WantManager`]
//! owns the local want set; one [`WantProc`] per peer tracks what that
//! peer wants and answers or propagates incoming entries.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;

use scuttle_store::{BlobOp, BlobStore};
use scuttle_types::{BlobRef, Result, ScuttleError};

/// Capacity of the local want-update broadcast.
const UPDATE_CAPACITY: usize = 256;

// ---------------------------------------------------------------------------
// WantMsg
// ---------------------------------------------------------------------------

/// One wire update: blob refs mapped to distances (negative) or sizes
/// (non-negative).
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct WantMsg(pub BTreeMap<String, i64>);

impl WantMsg {
    /// Builds a message from typed pairs.
    pub fn from_pairs(pairs: impl IntoIterator<Item = (BlobRef, i64)>) -> Self {
        Self(
            pairs
                .into_iter()
                .map(|(blob, v)| (blob.to_string(), v))
                .collect(),
        )
    }

    /// Typed view; entries with unparseable refs are dropped.
    pub fn entries(&self) -> Vec<(BlobRef, i64)> {
        self.0
            .iter()
            .filter_map(|(k, v)| k.parse().ok().map(|blob| (blob, *v)))
            .collect()
    }

    /// True when the update carries nothing.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

// ---------------------------------------------------------------------------
// WantManager
// ---------------------------------------------------------------------------

/// Owns the local want set.
pub struct WantManager {
    store: Arc<BlobStore>,
    wants: Mutex<HashMap<BlobRef, i64>>,
    updates: broadcast::Sender<(BlobRef, i64)>,
    max_fetch: u64,
    progress_timeout: Duration,
}

impl WantManager {
    /// Creates the manager over the local blob store. A transfer is
    /// abandoned when no chunk arrives within `progress_timeout` or the
    /// accumulated size exceeds `max_fetch`.
    pub fn new(store: Arc<BlobStore>, max_fetch: u64, progress_timeout: Duration) -> Arc<Self> {
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Arc::new(Self {
            store,
            wants: Mutex::new(HashMap::new()),
            updates,
            max_fetch,
            progress_timeout,
        })
    }

    /// Spawns the watcher that clears wants once a blob arrives, by any
    /// source.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        let mut changes = this.store.changes();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(note) if note.op == BlobOp::Put => {
                            this.satisfy(&note.blob);
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        })
    }

    /// Wants a blob at the default distance (−1).
    pub fn want(&self, blob: &BlobRef) -> Result<()> {
        self.want_with_dist(blob, -1)
    }

    /// Wants a blob at an explicit (negative) distance. A blob already
    /// on disk is not wanted.
    pub fn want_with_dist(&self, blob: &BlobRef, dist: i64) -> Result<()> {
        if dist >= 0 {
            return Err(ScuttleError::Config {
                reason: format!("want distance must be negative, got {dist}"),
            });
        }
        if self.store.has(blob) {
            return Ok(());
        }
        self.lock().insert(*blob, dist);
        let _ = self.updates.send((*blob, dist));
        Ok(())
    }

    /// True if the blob is currently wanted.
    pub fn wants(&self, blob: &BlobRef) -> bool {
        self.lock().contains_key(blob)
    }

    /// Removes a blob from the want set (it arrived or was abandoned).
    pub fn satisfy(&self, blob: &BlobRef) {
        self.lock().remove(blob);
    }

    /// Snapshot of the current want map.
    pub fn current(&self) -> WantMsg {
        WantMsg::from_pairs(self.lock().iter().map(|(b, d)| (*b, *d)))
    }

    /// Subscribes to newly added local wants.
    pub fn subscribe(&self) -> broadcast::Receiver<(BlobRef, i64)> {
        self.updates.subscribe()
    }

    /// The local blob store.
    pub fn store(&self) -> &Arc<BlobStore> {
        &self.store
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<BlobRef, i64>> {
        self.wants.lock().unwrap_or_else(|p| p.into_inner())
    }
}

// ---------------------------------------------------------------------------
// BlobFetcher
// ---------------------------------------------------------------------------

/// Opens a `blobs.get` source stream on the peer this proc talks to.
///
/// Implemented by the transport glue; the receiver yields content
/// chunks and closes at end of blob.
pub trait BlobFetcher: Send + Sync {
    /// Starts fetching `blob` from the peer.
    fn fetch(&self, blob: BlobRef) -> mpsc::Receiver<Vec<u8>>;
}

// ---------------------------------------------------------------------------
// WantProc
// ---------------------------------------------------------------------------

/// Per-peer want exchange state.
pub struct WantProc {
    wmgr: Arc<WantManager>,
    out: mpsc::Sender<WantMsg>,
    fetcher: Arc<dyn BlobFetcher>,
    remote_wants: Mutex<HashMap<BlobRef, i64>>,
}

impl WantProc {
    /// Attaches a proc to one peer stream: sends the full local want
    /// map and spawns the notifier that answers this peer's recorded
    /// wants whenever a blob lands locally.
    pub async fn attach(
        wmgr: Arc<WantManager>,
        out: mpsc::Sender<WantMsg>,
        fetcher: Arc<dyn BlobFetcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let proc = Arc::new(Self {
            wmgr: wmgr.clone(),
            out: out.clone(),
            fetcher,
            remote_wants: Mutex::new(HashMap::new()),
        });

        // Step 1 of the exchange: announce everything we want.
        let _ = out.send(wmgr.current()).await;

        proc.clone().spawn_notifier(shutdown);
        proc
    }

    /// Applies one incoming update from the peer.
    pub async fn process(&self, msg: WantMsg) -> Result<()> {
        let mut response = BTreeMap::new();

        for (blob, dist) in msg.entries() {
            if dist < 0 {
                match self.wmgr.store().size(&blob) {
                    Ok(size) => {
                        self.remote().remove(&blob);
                        response.insert(blob.to_string(), size as i64);
                    }
                    Err(ScuttleError::NotFound { .. }) => {
                        // Propagate: one hop further from the origin.
                        self.remote().insert(blob, dist - 1);
                    }
                    Err(e) => return Err(e),
                }
            } else if self.wmgr.wants(&blob) {
                self.spawn_fetch(blob);
            }
        }

        // Coalesce: nothing meaningful to add, say nothing.
        if response.is_empty() {
            return Ok(());
        }
        self.out
            .send(WantMsg(response))
            .await
            .map_err(|_| ScuttleError::Storage {
                reason: "want stream closed".into(),
            })
    }

    /// What this peer currently wants from us.
    pub fn remote_wants(&self) -> HashMap<BlobRef, i64> {
        self.remote().clone()
    }

    fn spawn_fetch(&self, blob: BlobRef) {
        let wmgr = self.wmgr.clone();
        let fetcher = self.fetcher.clone();
        tokio::spawn(async move {
            let mut rx = fetcher.fetch(blob);
            let mut data = Vec::new();
            loop {
                let chunk = match tokio::time::timeout(wmgr.progress_timeout, rx.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(_) => {
                        tracing::warn!(blob = %blob, "fetch stalled, discarding");
                        return;
                    }
                };
                data.extend_from_slice(&chunk);
                if data.len() as u64 > wmgr.max_fetch {
                    tracing::warn!(blob = %blob, "fetch exceeded size cap, discarding");
                    return;
                }
            }
            match wmgr.store().put_bytes(&data) {
                Ok(stored) if stored == blob => {
                    wmgr.satisfy(&blob);
                }
                Ok(stored) => {
                    tracing::warn!(expected = %blob, actual = %stored, "fetched blob hash mismatch");
                    let _ = wmgr.store().delete(&stored);
                }
                Err(e) => {
                    tracing::warn!(blob = %blob, error = %e, "blob store put failed");
                }
            }
        });
    }

    fn spawn_notifier(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut changes = self.wmgr.store().changes();
        let mut new_wants = self.wmgr.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    change = changes.recv() => match change {
                        Ok(note) if note.op == BlobOp::Put => {
                            if self.remote().contains_key(&note.blob) {
                                if let Ok(size) = self.wmgr.store().size(&note.blob) {
                                    self.remote().remove(&note.blob);
                                    let msg = WantMsg::from_pairs([(note.blob, size as i64)]);
                                    if self.out.send(msg).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    update = new_wants.recv() => match update {
                        Ok((blob, dist)) => {
                            let msg = WantMsg::from_pairs([(blob, dist)]);
                            if self.out.send(msg).await.is_err() {
                                return;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            return;
                        }
                    }
                }
            }
        });
    }

    fn remote(&self) -> std::sync::MutexGuard<'_, HashMap<BlobRef, i64>> {
        self.remote_wants.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Spawns the idle keepalive for one want stream: an empty update every
/// `cadence` so the transport sees a living stream.
pub fn spawn_keepalive(
    out: mpsc::Sender<WantMsg>,
    cadence: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(cadence);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if out.send(WantMsg::default()).await.is_err() {
                        return;
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

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
