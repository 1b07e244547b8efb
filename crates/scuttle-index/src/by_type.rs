//! By-type sink: one sublog per content-type string.
//!
//! Cleartext objects are indexed under their `type`. Envelopes that
//! unbox with local key material are indexed under the *decrypted*
//! type; this is what gives the indirect sinks (contacts, abouts,
//! group membership) their view of encrypted traffic.

use std::sync::Arc;

use scuttle_codec::ContentUnboxer;
use scuttle_store::{multilog::type_addr, LogEntry, Multilog};
use scuttle_types::{ReceiveSeq, Result};

use crate::content_value;
use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "byType";

/// Maintains the by-type multilog.
pub struct ByTypeSink {
    multilog: Multilog,
    unboxer: Arc<dyn ContentUnboxer>,
}

impl ByTypeSink {
    /// Creates the sink over the by-type multilog.
    pub fn new(multilog: Multilog, unboxer: Arc<dyn ContentUnboxer>) -> Self {
        Self { multilog, unboxer }
    }
}

impl SinkIndex for ByTypeSink {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process(&mut self, seq: ReceiveSeq, entry: &LogEntry) -> Result<()> {
        let Some(msg) = entry.as_message() else {
            return Ok(());
        };
        let Some(value) = content_value(msg, &self.unboxer) else {
            return Ok(());
        };
        let Some(type_str) = value.get("type").and_then(serde_json::Value::as_str) else {
            return Ok(());
        };
        self.multilog.append_unique(&type_addr(type_str), seq)?;
        Ok(())
    }
}
