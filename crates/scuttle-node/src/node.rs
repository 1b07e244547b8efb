//! Node assembly and lifecycle.
//!
//! # State machine
//!
//! ```text
//! Initializing ──start()──▶ Running ──shutdown()──▶ ShuttingDown
//! ```
//!
//! `open` builds every subsystem without spawning tasks; `start`
//! registers the sink indexes and spawns the background tasks;
//! `shutdown` fires the watch signal, cancels replication, drains the
//! indexers to their checkpoints and flushes the stores in reverse
//! dependency order.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use scuttle_codec::ContentUnboxer;
use scuttle_crypto::signing::{self, KeyPair};
use scuttle_index::{
    about, by_type, contacts, group_members, privates, AboutSink, AboutStore, ByTypeSink,
    ContactsSink, ContactsStore, Cursor, GroupMembersSink, IndexRunner, PrivatesSink, TanglesSink,
};
use scuttle_private::{GroupManager, KeyStore};
use scuttle_replicate::{
    CreateHistoryStreamArgs, FeedManager, GraphBuilder, HistorySource, HistoryStreamHandler,
    Replicator, WantManager,
};
use scuttle_store::{
    feeds::USER_FEEDS, multilog::type_addr, repo::open_sled, BlobStore, FeedStore, Multilog,
    MultilogSet, PublishLog, ReceiveLog, Repo,
};
use scuttle_types::config::NodeConfig;
use scuttle_types::{FeedRef, Result, ScuttleError};

// ---------------------------------------------------------------------------
// NodeState
// ---------------------------------------------------------------------------

/// Lifecycle state of the node.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeState {
    /// Subsystems built, no tasks running.
    Initializing,
    /// Indexers and replication tasks active.
    Running,
    /// Drained and flushed; terminal.
    ShuttingDown,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Running => write!(f, "running"),
            Self::ShuttingDown => write!(f, "shutting_down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

/// One running peer: stores, indexes, replication and group crypto.
pub struct Node {
    state: NodeState,
    pub(crate) config: NodeConfig,
    pub(crate) repo: Repo,
    pub(crate) keypair: Arc<KeyPair>,
    pub(crate) log: Arc<ReceiveLog>,
    pub(crate) feeds: Arc<FeedStore>,
    pub(crate) publish: Arc<PublishLog>,
    pub(crate) blobs: Arc<BlobStore>,
    pub(crate) want_manager: Arc<WantManager>,
    pub(crate) groups: Arc<GroupManager>,
    pub(crate) by_type: Multilog,
    pub(crate) tangles: Multilog,
    pub(crate) privates: Multilog,
    pub(crate) contacts: ContactsStore,
    pub(crate) abouts: AboutStore,
    pub(crate) graph: GraphBuilder,
    pub(crate) replicator: Arc<Replicator>,
    pub(crate) feed_manager: Arc<FeedManager>,
    shutdown_tx: watch::Sender<bool>,
    pub(crate) shutdown_rx: watch::Receiver<bool>,
    runner: Option<IndexRunner>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Opens (or creates) a node at the repository root.
    ///
    /// The key pair is loaded from `secret`, generated on first run.
    pub fn open(root: &Path, config: NodeConfig) -> Result<Self> {
        config.validate()?;
        let repo = Repo::open(root)?;
        let keypair = Arc::new(signing::load_or_create(&repo.secret_path())?);
        tracing::info!(id = %keypair.id(), root = %root.display(), "opening node");

        let log_db = open_sled(&repo.log_path())?;
        let sublog_db = open_sled(&repo.sublogs_path())?;
        let index_db = open_sled(&repo.indexes_db_path())?;

        let log = ReceiveLog::open(&log_db)?;
        let multilogs = MultilogSet::new(sublog_db);
        let user_feeds = multilogs.open(USER_FEEDS)?;
        let by_type = multilogs.open(by_type::NAME)?;
        let tangles = multilogs.open("tangles")?;
        let privates = multilogs.open(privates::NAME)?;

        let feeds = FeedStore::new(log.clone(), user_feeds, &log_db, config.hmac_key)?;
        let publish = Arc::new(PublishLog::new(keypair.clone(), feeds.clone(), config.hmac_key));

        let blobs = Arc::new(BlobStore::open(repo.blobs_path())?);
        let want_manager = WantManager::new(
            blobs.clone(),
            config.blob_fetch_max_bytes,
            Duration::from_secs(config.blob_progress_timeout_secs),
        );

        let keystore = KeyStore::open(&index_db)?;
        let groups = Arc::new(GroupManager::new(
            keypair.clone(),
            publish.clone(),
            feeds.clone(),
            keystore,
            &index_db,
        )?);

        let contacts = ContactsStore::open(&index_db)?;
        let abouts = AboutStore::open(&index_db)?;
        let graph = GraphBuilder::new(contacts.clone());
        let replicator = Replicator::new(
            graph.clone(),
            feeds.clone(),
            keypair.id(),
            config.hop_count,
        )?;
        let feed_manager = FeedManager::new(feeds.clone(), config.max_history_streams);

        if config.enable_peer_invites {
            tracing::warn!("peer-invites guest service is present but not wired; flag has no effect");
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            state: NodeState::Initializing,
            config,
            repo,
            keypair,
            log,
            feeds,
            publish,
            blobs,
            want_manager,
            groups,
            by_type,
            tangles,
            privates,
            contacts,
            abouts,
            graph,
            replicator,
            feed_manager,
            shutdown_tx,
            shutdown_rx,
            runner: None,
            tasks: Vec::new(),
        })
    }

    /// Registers every sink index and spawns the background tasks.
    ///
    /// Must run inside a tokio runtime. Double-start is rejected.
    pub fn start(&mut self) -> Result<()> {
        if self.state != NodeState::Initializing {
            return Err(ScuttleError::Config {
                reason: format!("cannot start from state {}", self.state),
            });
        }

        let unboxer: Arc<dyn ContentUnboxer> = self.groups.clone();
        let mut runner = IndexRunner::new(self.log.clone(), self.shutdown_rx.clone());

        runner.serve(
            Cursor::open(self.repo.index_path(by_type::NAME)?),
            Box::new(ByTypeSink::new(self.by_type.clone(), unboxer.clone())),
        );
        runner.serve(
            Cursor::open(self.repo.index_path(scuttle_index::tangles::NAME)?),
            Box::new(TanglesSink::new(self.tangles.clone(), unboxer.clone())),
        );
        runner.serve(
            Cursor::open(self.repo.index_path(privates::NAME)?),
            Box::new(PrivatesSink::new(
                self.privates.clone(),
                unboxer.clone(),
                self.keypair.id(),
            )),
        );

        runner.serve_from(
            self.by_type.clone(),
            type_addr("contact"),
            Cursor::open(self.repo.index_path(contacts::NAME)?),
            Box::new(ContactsSink::new(self.contacts.clone(), unboxer.clone())),
        );
        runner.serve_from(
            self.by_type.clone(),
            type_addr("about"),
            Cursor::open(self.repo.index_path(about::NAME)?),
            Box::new(AboutSink::new(self.abouts.clone(), unboxer)),
        );
        runner.serve_from(
            self.by_type.clone(),
            type_addr("group/add-member"),
            Cursor::open(self.repo.index_path(group_members::NAME)?),
            Box::new(GroupMembersSink::new(self.groups.clone())),
        );

        self.runner = Some(runner);
        self.tasks.push(self.replicator.spawn_debounce(
            self.log.clone(),
            Duration::from_secs(self.config.replicate_debounce_secs),
            self.shutdown_rx.clone(),
        ));
        self.tasks.push(self.want_manager.spawn(self.shutdown_rx.clone()));

        self.state = NodeState::Running;
        tracing::info!("node running");
        Ok(())
    }

    /// Graceful teardown: stop replication, drain indexers, flush.
    pub async fn shutdown(&mut self) -> Result<()> {
        if self.state != NodeState::Running {
            return Err(ScuttleError::Config {
                reason: format!("cannot shut down from state {}", self.state),
            });
        }
        self.state = NodeState::ShuttingDown;
        tracing::info!("node shutting down");

        self.feed_manager.stop_all();
        let _ = self.shutdown_tx.send(true);

        if let Some(runner) = self.runner.take() {
            runner.join().await;
        }
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }

        self.by_type.flush()?;
        self.tangles.flush()?;
        self.privates.flush()?;
        self.feeds.user_feeds().flush()?;
        self.log.flush()?;
        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> NodeState {
        self.state
    }

    /// The local identity.
    pub fn whoami(&self) -> FeedRef {
        self.keypair.id()
    }

    /// Admission check for an inbound connection.
    pub fn authorize(&self, remote: &FeedRef) -> Result<()> {
        if *remote == self.keypair.id() {
            return Ok(());
        }
        if self.config.promisc {
            return Ok(());
        }
        self.replicator.authorize(remote)
    }

    /// Attaches an authorized peer connection: starts one outbound
    /// history stream per wanted feed, asking for `tip + 1`.
    pub fn connect_peer(&self, remote: &FeedRef, source: &Arc<dyn HistorySource>) -> Result<()> {
        self.authorize(remote)?;
        self.feed_manager
            .sync_feeds(&self.replicator.feed_wants(), source);
        Ok(())
    }

    /// Re-seats replication tasks on a reconnected transport.
    pub fn reconnect_peer(&self, remote: &FeedRef, source: &Arc<dyn HistorySource>) -> Result<()> {
        self.authorize(remote)?;
        self.feed_manager
            .reseat(&self.replicator.feed_wants(), source);
        Ok(())
    }

    /// A history-stream handler bound to this node's stores.
    pub fn history_handler(&self) -> HistoryStreamHandler {
        HistoryStreamHandler::new(
            self.feeds.clone(),
            Duration::from_secs(self.config.keepalive_secs),
        )
    }

    /// Serves one inbound `createHistoryStream` request.
    pub async fn serve_history_stream(
        &self,
        args: CreateHistoryStreamArgs,
        out: tokio::sync::mpsc::Sender<Vec<u8>>,
    ) {
        self.history_handler()
            .handle(args, out, self.shutdown_rx.clone())
            .await;
    }

    /// The group manager.
    pub fn groups(&self) -> &Arc<GroupManager> {
        &self.groups
    }

    /// The replication policy holder.
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// The blob store.
    pub fn blobs(&self) -> &Arc<BlobStore> {
        &self.blobs
    }

    /// The blob want manager.
    pub fn want_manager(&self) -> &Arc<WantManager> {
        &self.want_manager
    }

    /// The validated feed store.
    pub fn feeds(&self) -> &Arc<FeedStore> {
        &self.feeds
    }
}
