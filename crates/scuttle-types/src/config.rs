//! Node configuration with documented defaults.
//!
//! All operational parameters are centralized here. Every value has a
//! default matching the protocol's reference behavior.

use serde::{Deserialize, Serialize};

use crate::{Result, ScuttleError};

/// Global node configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeConfig {
    /// BFS distance over the follow graph within which feeds are
    /// replicated.
    pub hop_count: u32,

    /// Debounce window, in seconds, between a root-log append and the
    /// replicator recomputing its want/block sets.
    pub replicate_debounce_secs: u64,

    /// Maximum number of simultaneously open history streams per peer.
    pub max_history_streams: usize,

    /// Default timeout for a single RPC call, in seconds.
    pub rpc_timeout_secs: u64,

    /// Keepalive cadence for long-lived history streams, in seconds.
    pub keepalive_secs: u64,

    /// A blob transfer is abandoned after this many seconds without
    /// progress.
    pub blob_progress_timeout_secs: u64,

    /// Maximum size of a blob fetched over the want protocol, in bytes.
    pub blob_fetch_max_bytes: u64,

    /// Optional 32-byte HMAC key mixed into message signing. Nodes with
    /// different keys cannot exchange messages.
    pub hmac_key: Option<[u8; 32]>,

    /// Accept any peer connection regardless of the trust graph.
    pub promisc: bool,

    /// Enables the peer-invites guest service. The service is shipped
    /// disabled; admission ignores it unless this is set.
    pub enable_peer_invites: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            hop_count: 2,
            replicate_debounce_secs: 15,
            max_history_streams: 50,
            rpc_timeout_secs: 30,
            keepalive_secs: 5,
            blob_progress_timeout_secs: 600,
            blob_fetch_max_bytes: 5 * 1024 * 1024,
            hmac_key: None,
            promisc: false,
            enable_peer_invites: false,
        }
    }
}

impl NodeConfig {
    /// Validates all configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.max_history_streams == 0 {
            return Err(ScuttleError::Config {
                reason: "max_history_streams must be greater than 0".into(),
            });
        }
        if self.replicate_debounce_secs == 0 {
            return Err(ScuttleError::Config {
                reason: "replicate_debounce_secs must be greater than 0".into(),
            });
        }
        if self.rpc_timeout_secs == 0 {
            return Err(ScuttleError::Config {
                reason: "rpc_timeout_secs must be greater than 0".into(),
            });
        }
        if self.blob_fetch_max_bytes == 0 {
            return Err(ScuttleError::Config {
                reason: "blob_fetch_max_bytes must be greater than 0".into(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = NodeConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_values() {
        let config = NodeConfig::default();
        assert_eq!(config.hop_count, 2);
        assert_eq!(config.replicate_debounce_secs, 15);
        assert_eq!(config.max_history_streams, 50);
        assert_eq!(config.rpc_timeout_secs, 30);
        assert_eq!(config.keepalive_secs, 5);
        assert!(!config.promisc);
        assert!(!config.enable_peer_invites);
    }

    #[test]
    fn zero_stream_cap_rejected() {
        let config = NodeConfig {
            max_history_streams: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn zero_debounce_rejected() {
        let config = NodeConfig {
            replicate_debounce_secs: 0,
            ..NodeConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
