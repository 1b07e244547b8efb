//! Persistence layer: the receive log, multilogs, feed ingestion, the
//! publish log, and the content-addressed blob store.
//!
//! All durable state lives under a single repository root (see
//! [`repo::Repo`]); sled backs the keyed stores and plain files back
//! blobs and index cursors.

pub mod blobs;
pub mod feeds;
pub mod multilog;
pub mod publish;
pub mod receive_log;
pub mod repo;

pub use blobs::{BlobNotification, BlobOp, BlobStore};
pub use feeds::FeedStore;
pub use multilog::{Multilog, MultilogSet};
pub use publish::PublishLog;
pub use receive_log::{LogEntry, ReceiveLog};
pub use repo::Repo;
