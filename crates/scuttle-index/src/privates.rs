//! Privates sink: receive sequences of messages the local key unboxes.
//!
//! Sublogs are keyed by recipient scheme (`box1:` / `box2:` plus the
//! local identity), so the private-read stream is one sublog scan plus
//! decryption.

use std::sync::Arc;

use scuttle_codec::{Content, ContentUnboxer};
use scuttle_store::{multilog::private_addr, LogEntry, Multilog};
use scuttle_types::{FeedRef, ReceiveSeq, Result};

use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "privates";

/// Maintains the privates multilog.
pub struct PrivatesSink {
    multilog: Multilog,
    unboxer: Arc<dyn ContentUnboxer>,
    local: FeedRef,
}

impl PrivatesSink {
    /// Creates the sink for the local identity.
    pub fn new(multilog: Multilog, unboxer: Arc<dyn ContentUnboxer>, local: FeedRef) -> Self {
        Self {
            multilog,
            unboxer,
            local,
        }
    }
}

impl SinkIndex for PrivatesSink {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process(&mut self, seq: ReceiveSeq, entry: &LogEntry) -> Result<()> {
        let Some(msg) = entry.as_message() else {
            return Ok(());
        };
        let scheme = match msg.content() {
            Content::Box1(_) => "box1",
            Content::Box2(_) => "box2",
            Content::Clear(_) => return Ok(()),
        };
        if self.unboxer.unbox(msg).is_none() {
            return Ok(());
        }
        self.multilog
            .append_unique(&private_addr(scheme, &self.local), seq)?;
        Ok(())
    }
}
