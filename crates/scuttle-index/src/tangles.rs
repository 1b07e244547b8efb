//! Tangles sink: one sublog per tangle root.
//!
//! A message belongs to a tangle when its content carries a `root`
//! pointer (classic threads) or a `tangles.<name>.root` pointer
//! (group tangles). Encrypted members are indexed through the unboxer.

use std::collections::HashSet;
use std::sync::Arc;

use serde_json::Value;

use scuttle_codec::ContentUnboxer;
use scuttle_store::{multilog::tangle_addr, LogEntry, Multilog};
use scuttle_types::{MessageRef, ReceiveSeq, Result};

use crate::content_value;
use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "tangles";

/// Maintains the tangles multilog.
pub struct TanglesSink {
    multilog: Multilog,
    unboxer: Arc<dyn ContentUnboxer>,
}

impl TanglesSink {
    /// Creates the sink over the tangles multilog.
    pub fn new(multilog: Multilog, unboxer: Arc<dyn ContentUnboxer>) -> Self {
        Self { multilog, unboxer }
    }
}

impl SinkIndex for TanglesSink {
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
        for root in tangle_roots(&value) {
            self.multilog.append_unique(&tangle_addr(&root), seq)?;
        }
        Ok(())
    }
}

/// Collects every distinct tangle root a content value points at.
fn tangle_roots(value: &Value) -> Vec<MessageRef> {
    let mut seen = HashSet::new();
    let mut out = Vec::new();

    let mut push = |candidate: Option<&Value>| {
        if let Some(root) = candidate.and_then(Value::as_str).and_then(|s| s.parse().ok()) {
            if seen.insert(root) {
                out.push(root);
            }
        }
    };

    push(value.get("root"));
    if let Some(Value::Object(tangles)) = value.get("tangles") {
        for tangle in tangles.values() {
            push(tangle.get("root"));
        }
    }
    out
}
