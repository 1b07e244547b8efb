//! Group-membership sink.
//!
//! Fed indirectly from the by-type sublog `group/add-member` (which the
//! by-type sink populates from *decrypted* envelopes). Each add-member
//! payload carries the group key and root; unboxing one means this node
//! was invited (or is the inviter), so the key is registered and the
//! member roster updated.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::Value;

use scuttle_private::GroupManager;
use scuttle_store::LogEntry;
use scuttle_types::{FeedRef, MessageRef, ReceiveSeq, Result};

use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "group-members";

/// Registers discovered group keys and membership.
pub struct GroupMembersSink {
    groups: Arc<GroupManager>,
}

impl GroupMembersSink {
    /// Creates the sink over the group manager.
    pub fn new(groups: Arc<GroupManager>) -> Self {
        Self { groups }
    }
}

impl SinkIndex for GroupMembersSink {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process(&mut self, _seq: ReceiveSeq, entry: &LogEntry) -> Result<()> {
        use scuttle_codec::ContentUnboxer as _;

        let Some(msg) = entry.as_message() else {
            return Ok(());
        };
        let Some(plain) = self.groups.unbox(msg) else {
            return Ok(());
        };
        let Ok(value) = serde_json::from_slice::<Value>(&plain) else {
            return Ok(());
        };
        if value.get("type").and_then(Value::as_str) != Some("group/add-member") {
            return Ok(());
        }

        let Some(group_key) = value
            .get("groupKey")
            .and_then(Value::as_str)
            .and_then(|s| B64.decode(s).ok())
            .filter(|k| k.len() == 32)
        else {
            return Ok(());
        };
        let Some(root) = value
            .get("root")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<MessageRef>().ok())
        else {
            return Ok(());
        };

        let mut key = [0u8; 32];
        key.copy_from_slice(&group_key);
        let cloaked = self.groups.join(key, root)?;

        // Roster: the inviter plus every feed named in recps.
        self.groups.record_member(&cloaked, &msg.author())?;
        if let Some(Value::Array(recps)) = value.get("recps") {
            for recp in recps {
                if let Some(feed) = recp.as_str().and_then(|s| s.parse::<FeedRef>().ok()) {
                    self.groups.record_member(&cloaked, &feed)?;
                }
            }
        }
        tracing::debug!(group = %cloaked, "group membership updated");
        Ok(())
    }
}
