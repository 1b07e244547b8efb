//! History-stream gossip: serving and consuming `createHistoryStream`.
//!
//! The serving side emits a feed's stored canonical bytes from a start
//! sequence, optionally staying live. The pulling side is the
//! [`FeedManager`]: one task per wanted feed per connection, capped by
//! a semaphore, each draining into the validating ingestion path. A
//! validation failure kills that feed's task; other feeds continue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;

use scuttle_store::FeedStore;
use scuttle_types::FeedRef;

/// Per-stream outbound buffer.
const STREAM_BUFFER: usize = 64;

// ---------------------------------------------------------------------------
// Args
// ---------------------------------------------------------------------------

/// Arguments of a `createHistoryStream` request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CreateHistoryStreamArgs {
    /// The feed to stream.
    pub id: FeedRef,
    /// First author sequence to emit (1-based).
    #[serde(default = "default_seq")]
    pub seq: u64,
    /// Keep the stream open and emit future appends.
    #[serde(default)]
    pub live: bool,
    /// Wrap each message with its key instead of raw value bytes.
    #[serde(default)]
    pub keys: bool,
    /// Maximum number of messages to emit.
    #[serde(default)]
    pub limit: Option<u64>,
}

fn default_seq() -> u64 {
    1
}

impl CreateHistoryStreamArgs {
    /// A non-live raw stream for `id` from `seq`.
    pub fn from_seq(id: FeedRef, seq: u64) -> Self {
        Self {
            id,
            seq,
            live: false,
            keys: false,
            limit: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Serving side
// ---------------------------------------------------------------------------

/// Serves history streams from the local stores.
pub struct HistoryStreamHandler {
    feeds: Arc<FeedStore>,
    keepalive: Duration,
}

impl HistoryStreamHandler {
    /// Creates the handler; `keepalive` is the idle cadence of live
    /// streams (empty frames the consumer discards).
    pub fn new(feeds: Arc<FeedStore>, keepalive: Duration) -> Self {
        Self { feeds, keepalive }
    }

    /// Runs one stream until caught up (non-live), the limit is hit,
    /// the consumer goes away, or shutdown.
    pub async fn handle(
        &self,
        args: CreateHistoryStreamArgs,
        out: mpsc::Sender<Vec<u8>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut next = args.seq.max(1);
        let mut remaining = args.limit;
        let signal = self.feeds.user_feeds().append_signal();

        loop {
            let notified = signal.notified();

            let batch = match self.feeds.read_feed(&args.id, next) {
                Ok(batch) => batch,
                Err(e) => {
                    tracing::warn!(feed = %args.id, error = %e, "history stream read failed");
                    return;
                }
            };
            let mut sent_any = false;
            for msg in batch {
                next = msg.sequence() + 1;
                if let Some(left) = remaining.as_mut() {
                    if *left == 0 {
                        return;
                    }
                    *left -= 1;
                }
                let frame = if args.keys { keyed_frame(&msg) } else { msg.raw().to_vec() };
                if out.send(frame).await.is_err() {
                    return;
                }
                sent_any = true;
            }

            if sent_any {
                continue;
            }
            if !args.live {
                return;
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep(self.keepalive) => {
                    if out.send(Vec::new()).await.is_err() {
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
    }
}

/// `keys: true` wrapper: `{key, value}` JSON for classic messages.
/// Binary envelopes fall back to their raw form.
fn keyed_frame(msg: &scuttle_codec::Message) -> Vec<u8> {
    match serde_json::from_slice::<serde_json::Value>(msg.raw()) {
        Ok(value) => serde_json::json!({
            "key": msg.key().to_string(),
            "value": value,
        })
        .to_string()
        .into_bytes(),
        Err(_) => msg.raw().to_vec(),
    }
}

// ---------------------------------------------------------------------------
// Pulling side
// ---------------------------------------------------------------------------

/// Opens outbound history streams on a peer connection.
///
/// Implemented by the transport glue; tests satisfy it with in-process
/// channel pairs feeding a remote [`HistoryStreamHandler`].
pub trait HistorySource: Send + Sync {
    /// Opens one stream; the receiver yields raw message frames.
    fn open(&self, args: CreateHistoryStreamArgs) -> mpsc::Receiver<Vec<u8>>;
}

struct TaskHandle {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Owns one replication task per wanted feed.
pub struct FeedManager {
    feeds: Arc<FeedStore>,
    semaphore: Arc<Semaphore>,
    tasks: Mutex<HashMap<FeedRef, TaskHandle>>,
}

impl FeedManager {
    /// Creates a manager capping concurrent streams at `max_streams`.
    pub fn new(feeds: Arc<FeedStore>, max_streams: usize) -> Arc<Self> {
        Arc::new(Self {
            feeds,
            semaphore: Arc::new(Semaphore::new(max_streams)),
            tasks: Mutex::new(HashMap::new()),
        })
    }

    /// Reconciles the running tasks with `wanted`: new feeds start a
    /// task on `source`, removed feeds are cancelled.
    pub fn sync_feeds(self: &Arc<Self>, wanted: &HashSet<FeedRef>, source: &Arc<dyn HistorySource>) {
        let mut tasks = self.lock();

        let stale: Vec<FeedRef> = tasks.keys().filter(|f| !wanted.contains(f)).copied().collect();
        for feed in stale {
            if let Some(task) = tasks.remove(&feed) {
                let _ = task.cancel.send(true);
                task.handle.abort();
            }
        }

        for feed in wanted {
            if !tasks.contains_key(feed) {
                tasks.insert(*feed, self.spawn_feed(*feed, source.clone()));
            }
        }
    }

    /// Re-seats every task on a fresh connection without losing tips:
    /// each restarted task asks for `tip + 1`.
    pub fn reseat(self: &Arc<Self>, wanted: &HashSet<FeedRef>, source: &Arc<dyn HistorySource>) {
        self.stop_all();
        self.sync_feeds(wanted, source);
    }

    /// Cancels every running task.
    pub fn stop_all(&self) {
        let mut tasks = self.lock();
        for (_, task) in tasks.drain() {
            let _ = task.cancel.send(true);
            task.handle.abort();
        }
    }

    /// Feeds with a running replication task.
    pub fn active_feeds(&self) -> Vec<FeedRef> {
        self.lock().keys().copied().collect()
    }

    fn spawn_feed(self: &Arc<Self>, feed: FeedRef, source: Arc<dyn HistorySource>) -> TaskHandle {
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let feeds = self.feeds.clone();
        let semaphore = self.semaphore.clone();

        let handle = tokio::spawn(async move {
            let Ok(_permit) = semaphore.acquire_owned().await else {
                return;
            };

            let from = match feeds.tip(&feed) {
                Ok(tip) => tip.map(|t| t.sequence + 1).unwrap_or(1),
                Err(e) => {
                    tracing::warn!(feed = %feed, error = %e, "tip lookup failed");
                    return;
                }
            };
            let mut rx = source.open(CreateHistoryStreamArgs {
                id: feed,
                seq: from,
                live: true,
                keys: false,
                limit: None,
            });

            loop {
                tokio::select! {
                    frame = rx.recv() => match frame {
                        Some(raw) if raw.is_empty() => {} // keepalive
                        Some(raw) => {
                            if let Err(e) = feeds.append_raw(&raw).await {
                                if e.is_validation() {
                                    tracing::warn!(feed = %feed, error = %e, "validation failed, dropping feed task");
                                } else {
                                    tracing::warn!(feed = %feed, error = %e, "append failed, dropping feed task");
                                }
                                return;
                            }
                        }
                        None => return,
                    },
                    _ = cancel_rx.changed() => {
                        if *cancel_rx.borrow() {
                            return;
                        }
                    }
                }
            }
        });

        TaskHandle {
            cancel: cancel_tx,
            handle,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<FeedRef, TaskHandle>> {
        self.tasks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Creates a channel pair sized for one history stream.
pub fn stream_channel() -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<Vec<u8>>) {
    mpsc::channel(STREAM_BUFFER)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_codec::{legacy, Content};
    use scuttle_crypto::signing::KeyPair;
    use scuttle_store::{MultilogSet, ReceiveLog};
    use serde_json::json;

    fn store() -> (tempfile::TempDir, Arc<FeedStore>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_db = sled::open(dir.path().join("log")).expect("sled");
        let sub_db = sled::open(dir.path().join("sublogs")).expect("sled");
        let log = ReceiveLog::open(&log_db).expect("log");
        let set = MultilogSet::new(sub_db);
        let uf = set.open("userFeeds").expect("multilog");
        let feeds = FeedStore::new(log, uf, &log_db, None).expect("store");
        (dir, feeds)
    }

    async fn fill(feeds: &Arc<FeedStore>, kp: &KeyPair, n: usize) {
        for i in 0..n {
            let tip = feeds.tip(&kp.id()).expect("tip");
            let msg = legacy::sign(
                kp,
                tip.as_ref(),
                i as f64,
                &Content::Clear(json!({"type": "test", "i": i})),
                None,
            )
            .expect("sign");
            feeds.append_message(&msg).await.expect("append");
        }
    }

    /// A history source backed by a remote store's handler.
    struct RemoteSource {
        feeds: Arc<FeedStore>,
        keepalive: Duration,
    }

    impl HistorySource for RemoteSource {
        fn open(&self, args: CreateHistoryStreamArgs) -> mpsc::Receiver<Vec<u8>> {
            let (tx, rx) = stream_channel();
            let handler = HistoryStreamHandler::new(self.feeds.clone(), self.keepalive);
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            tokio::spawn(async move {
                // Keep the shutdown sender alive for the stream's life.
                let _hold = _shutdown_tx;
                handler.handle(args, tx, shutdown_rx).await;
            });
            rx
        }
    }

    #[tokio::test]
    async fn serves_history_from_seq() {
        let (_dir, server) = store();
        let kp = KeyPair::from_seed(&[1; 32]);
        fill(&server, &kp, 5).await;

        let handler = HistoryStreamHandler::new(server.clone(), Duration::from_secs(5));
        let (tx, mut rx) = stream_channel();
        let (_stx, srx) = watch::channel(false);
        handler
            .handle(CreateHistoryStreamArgs::from_seq(kp.id(), 3), tx, srx)
            .await;

        let mut got = Vec::new();
        while let Some(frame) = rx.recv().await {
            got.push(frame);
        }
        assert_eq!(got.len(), 3);
        let first = scuttle_codec::verify_raw(&got[0], None, None);
        // Sequence 3 verified standalone reports a gap, proving it is #3.
        assert!(matches!(
            first.unwrap_err(),
            scuttle_types::ScuttleError::SequenceGap { got: 3, .. }
        ));
    }

    #[tokio::test]
    async fn limit_caps_the_stream() {
        let (_dir, server) = store();
        let kp = KeyPair::from_seed(&[1; 32]);
        fill(&server, &kp, 5).await;

        let handler = HistoryStreamHandler::new(server.clone(), Duration::from_secs(5));
        let (tx, mut rx) = stream_channel();
        let (_stx, srx) = watch::channel(false);
        let mut args = CreateHistoryStreamArgs::from_seq(kp.id(), 1);
        args.limit = Some(2);
        handler.handle(args, tx, srx).await;

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 2);
    }

    #[tokio::test]
    async fn feed_manager_replicates_and_stays_live() {
        let (_sdir, server) = store();
        let (_cdir, client) = store();
        let kp = KeyPair::from_seed(&[1; 32]);
        fill(&server, &kp, 3).await;

        let source: Arc<dyn HistorySource> = Arc::new(RemoteSource {
            feeds: server.clone(),
            keepalive: Duration::from_millis(50),
        });
        let manager = FeedManager::new(client.clone(), 50);
        manager.sync_feeds(&[kp.id()].into_iter().collect(), &source);

        for _ in 0..200 {
            if client.tip(&kp.id()).expect("tip").map(|t| t.sequence) == Some(3) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.tip(&kp.id()).expect("tip").expect("tip").sequence, 3);

        // A live append on the server propagates.
        fill(&server, &kp, 1).await;
        for _ in 0..200 {
            if client.tip(&kp.id()).expect("tip").map(|t| t.sequence) == Some(4) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(client.tip(&kp.id()).expect("tip").expect("tip").sequence, 4);

        manager.stop_all();
    }

    #[tokio::test]
    async fn bad_frames_kill_only_that_feed() {
        let (_sdir, server) = store();
        let (_cdir, client) = store();
        let good = KeyPair::from_seed(&[1; 32]);
        fill(&server, &good, 2).await;
        let bad = KeyPair::from_seed(&[2; 32]).id();

        /// Emits garbage for one feed, proxies the rest.
        struct PoisonSource {
            inner: RemoteSource,
            poison: FeedRef,
        }
        impl HistorySource for PoisonSource {
            fn open(&self, args: CreateHistoryStreamArgs) -> mpsc::Receiver<Vec<u8>> {
                if args.id == self.poison {
                    let (tx, rx) = stream_channel();
                    tokio::spawn(async move {
                        let _ = tx.send(b"{\"not\": \"a message\"}".to_vec()).await;
                    });
                    rx
                } else {
                    self.inner.open(args)
                }
            }
        }

        let source: Arc<dyn HistorySource> = Arc::new(PoisonSource {
            inner: RemoteSource {
                feeds: server.clone(),
                keepalive: Duration::from_millis(50),
            },
            poison: bad,
        });

        let manager = FeedManager::new(client.clone(), 50);
        manager.sync_feeds(&[good.id(), bad].into_iter().collect(), &source);

        for _ in 0..200 {
            if client.tip(&good.id()).expect("tip").map(|t| t.sequence) == Some(2) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        // The good feed fully replicated; the poisoned one stored nothing.
        assert_eq!(client.tip(&good.id()).expect("tip").expect("tip").sequence, 2);
        assert!(client.tip(&bad).expect("tip").is_none());

        manager.stop_all();
    }

    #[tokio::test]
    async fn sync_feeds_cancels_removed() {
        let (_sdir, server) = store();
        let (_cdir, client) = store();
        let kp = KeyPair::from_seed(&[1; 32]);
        fill(&server, &kp, 1).await;

        let source: Arc<dyn HistorySource> = Arc::new(RemoteSource {
            feeds: server.clone(),
            keepalive: Duration::from_millis(50),
        });
        let manager = FeedManager::new(client.clone(), 50);
        manager.sync_feeds(&[kp.id()].into_iter().collect(), &source);
        assert_eq!(manager.active_feeds(), vec![kp.id()]);

        manager.sync_feeds(&HashSet::new(), &source);
        assert!(manager.active_feeds().is_empty());
    }
}
