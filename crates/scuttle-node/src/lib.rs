//! The node: wires stores, indexes, replication and crypto into one
//! running peer and exposes the query surface the RPC layer dispatches
//! into.

pub mod manifest;
pub mod node;
pub mod queries;

pub use manifest::{manifest_json, MethodKind, RPC_METHODS};
pub use node::{Node, NodeState};
pub use queries::UptoInfo;
