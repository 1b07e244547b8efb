//! Replication: who to pull, who to admit, and how bytes move.
//!
//! The [`graph::GraphBuilder`] materializes the follow/block graph from
//! the contacts index; the [`replicator::Replicator`] debounces graph
//! changes into its want/block sets and gates connections; the
//! [`gossip`] module serves and consumes `createHistoryStream`; the
//! [`wants`] module runs the blob want/have exchange. The RPC transport
//! itself is an external collaborator, abstracted as the stream-opening
//! traits in [`gossip`] and [`wants`].

pub mod gossip;
pub mod graph;
pub mod replicator;
pub mod wants;

pub use gossip::{CreateHistoryStreamArgs, FeedManager, HistorySource, HistoryStreamHandler};
pub use graph::{Graph, GraphBuilder};
pub use replicator::Replicator;
pub use wants::{BlobFetcher, WantManager, WantMsg, WantProc};
