//! About sink: name/description/image aggregation per feed.
//!
//! Fed indirectly from the by-type sublog `about`. Self-assigned values
//! are *chosen*; values assigned by others accumulate in a *prescribed*
//! multiset. `getSignifier` prefers chosen, then the most frequent
//! prescribed value.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use scuttle_codec::ContentUnboxer;
use scuttle_store::LogEntry;
use scuttle_types::{FeedRef, ReceiveSeq, Result, ScuttleError};

use crate::content_value;
use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "abouts";

/// Signifiers the aggregation tracks.
const SIGNIFIERS: [&str; 3] = ["name", "description", "image"];

// ---------------------------------------------------------------------------
// Signifier
// ---------------------------------------------------------------------------

/// Aggregated values for one signifier of one feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Signifier {
    /// The target's own latest assignment.
    pub chosen: Option<String>,
    /// Third-party assignments with occurrence counts.
    pub prescribed: BTreeMap<String, u32>,
}

impl Signifier {
    /// Resolves the display value: chosen first, then the most frequent
    /// prescribed value (ties break lexicographically).
    pub fn resolve(&self) -> Option<String> {
        if let Some(chosen) = &self.chosen {
            return Some(chosen.clone());
        }
        self.prescribed
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(value, _)| value.clone())
    }
}

/// Aggregated signifiers of one feed.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AboutInfo {
    /// Display name.
    pub name: Signifier,
    /// Free-form description.
    pub description: Signifier,
    /// Avatar blob reference.
    pub image: Signifier,
}

// ---------------------------------------------------------------------------
// AboutStore
// ---------------------------------------------------------------------------

/// Read/write access to the aggregated about table.
#[derive(Clone)]
pub struct AboutStore {
    tree: sled::Tree,
}

impl AboutStore {
    /// Opens the about table inside `db`.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("abouts").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open about store: {e}"),
        })?;
        Ok(Self { tree })
    }

    /// Aggregated info for `target`, empty if nothing was published.
    pub fn collected_for(&self, target: &FeedRef) -> Result<AboutInfo> {
        match self.tree.get(target.stored_bytes()).map_err(storage_err)? {
            Some(bytes) => ciborium::from_reader(bytes.as_ref()).map_err(|e| ScuttleError::Corrupt {
                index: NAME.into(),
                reason: format!("undecodable about record: {e}"),
            }),
            None => Ok(AboutInfo::default()),
        }
    }

    /// The resolved value of one signifier (`name`, `description`,
    /// `image`), falling back to the wire id for names.
    pub fn get_signifier(&self, target: &FeedRef, signifier: &str) -> Result<Option<String>> {
        let info = self.collected_for(target)?;
        let resolved = match signifier {
            "name" => info.name.resolve().or_else(|| Some(target.to_string())),
            "description" => info.description.resolve(),
            "image" => info.image.resolve(),
            _ => None,
        };
        Ok(resolved)
    }

    fn store(&self, target: &FeedRef, info: &AboutInfo) -> Result<()> {
        let mut buf = Vec::new();
        ciborium::into_writer(info, &mut buf).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to encode about record: {e}"),
        })?;
        self.tree
            .insert(target.stored_bytes(), buf)
            .map_err(storage_err)?;
        Ok(())
    }
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("about store: {e}"),
    }
}

// ---------------------------------------------------------------------------
// AboutSink
// ---------------------------------------------------------------------------

/// Applies `about` messages to the aggregation.
pub struct AboutSink {
    store: AboutStore,
    unboxer: Arc<dyn ContentUnboxer>,
}

impl AboutSink {
    /// Creates the sink over an open about table.
    pub fn new(store: AboutStore, unboxer: Arc<dyn ContentUnboxer>) -> Self {
        Self { store, unboxer }
    }
}

impl SinkIndex for AboutSink {
    fn name(&self) -> &'static str {
        NAME
    }

    fn process(&mut self, _seq: ReceiveSeq, entry: &LogEntry) -> Result<()> {
        let Some(msg) = entry.as_message() else {
            return Ok(());
        };
        let Some(value) = content_value(msg, &self.unboxer) else {
            return Ok(());
        };
        // Abouts can also target messages (votes); only feeds aggregate.
        let Some(target) = value
            .get("about")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<FeedRef>().ok())
        else {
            return Ok(());
        };

        let is_self = msg.author() == target;
        let mut info = self.store.collected_for(&target)?;
        let mut dirty = false;

        for name in SIGNIFIERS {
            let Some(assigned) = signifier_value(&value, name) else {
                continue;
            };
            let slot = match name {
                "name" => &mut info.name,
                "description" => &mut info.description,
                _ => &mut info.image,
            };
            if is_self {
                slot.chosen = Some(assigned);
            } else {
                *slot.prescribed.entry(assigned).or_insert(0) += 1;
            }
            dirty = true;
        }

        if dirty {
            self.store.store(&target, &info)?;
        }
        Ok(())
    }
}

/// Extracts a signifier value; images may be `"&…"` or `{link: "&…"}`.
fn signifier_value(content: &Value, signifier: &str) -> Option<String> {
    match content.get(signifier)? {
        Value::String(s) => Some(s.clone()),
        Value::Object(obj) => obj.get("link").and_then(Value::as_str).map(String::from),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_codec::{legacy, Content, FeedTip, Message};
    use scuttle_crypto::signing::KeyPair;
    use serde_json::json;

    struct NoKeys;
    impl ContentUnboxer for NoKeys {
        fn unbox(&self, _msg: &Message) -> Option<Vec<u8>> {
            None
        }
    }

    fn sink() -> (tempfile::TempDir, AboutSink, AboutStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path().join("indexes")).expect("sled");
        let store = AboutStore::open(&db).expect("store");
        let sink = AboutSink::new(store.clone(), Arc::new(NoKeys));
        (dir, sink, store)
    }

    fn about_msg(kp: &KeyPair, tip: Option<&FeedTip>, content: serde_json::Value) -> Message {
        legacy::sign(kp, tip, 1.0, &Content::Clear(content), None).expect("sign")
    }

    #[test]
    fn self_chosen_name_wins_over_prescribed() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]);

        let self_name = about_msg(
            &alice,
            None,
            json!({"type": "about", "about": alice.id().to_string(), "name": "N1"}),
        );
        let other_name = about_msg(
            &bob,
            None,
            json!({"type": "about", "about": alice.id().to_string(), "name": "N2"}),
        );

        sink.process(1, &LogEntry::Message(Box::new(self_name)))?;
        sink.process(2, &LogEntry::Message(Box::new(other_name)))?;

        assert_eq!(store.get_signifier(&alice.id(), "name")?, Some("N1".into()));
        let info = store.collected_for(&alice.id())?;
        assert_eq!(info.name.prescribed.get("N2"), Some(&1));
        Ok(())
    }

    #[test]
    fn prescribed_majority_resolves_without_chosen() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let target = KeyPair::from_seed(&[1; 32]).id();
        let bob = KeyPair::from_seed(&[2; 32]);
        let carol = KeyPair::from_seed(&[3; 32]);

        let m1 = about_msg(
            &bob,
            None,
            json!({"type": "about", "about": target.to_string(), "name": "popular"}),
        );
        let m2 = about_msg(
            &carol,
            None,
            json!({"type": "about", "about": target.to_string(), "name": "popular"}),
        );
        let m3 = about_msg(
            &bob,
            Some(&m1.as_tip()),
            json!({"type": "about", "about": target.to_string(), "name": "rare"}),
        );

        sink.process(1, &LogEntry::Message(Box::new(m1)))?;
        sink.process(2, &LogEntry::Message(Box::new(m2)))?;
        sink.process(3, &LogEntry::Message(Box::new(m3)))?;

        assert_eq!(store.get_signifier(&target, "name")?, Some("popular".into()));
        Ok(())
    }

    #[test]
    fn unnamed_feed_falls_back_to_id() -> Result<()> {
        let (_dir, _sink, store) = sink();
        let target = KeyPair::from_seed(&[7; 32]).id();
        assert_eq!(store.get_signifier(&target, "name")?, Some(target.to_string()));
        Ok(())
    }

    #[test]
    fn image_link_object_is_unwrapped() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let blob = "&uaGieSQDJcHfUp6hjIcIq55GoZh4Ug7tNmgaohoxrpw=.sha256";

        let msg = about_msg(
            &alice,
            None,
            json!({
                "type": "about",
                "about": alice.id().to_string(),
                "image": {"link": blob, "size": 1234}
            }),
        );
        sink.process(1, &LogEntry::Message(Box::new(msg)))?;
        assert_eq!(store.get_signifier(&alice.id(), "image")?, Some(blob.into()));
        Ok(())
    }

    #[test]
    fn message_targets_are_skipped() -> Result<()> {
        let (_dir, mut sink, _store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let msg = about_msg(
            &alice,
            None,
            json!({
                "type": "about",
                "about": "%AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=.sha256",
                "name": "a thread title"
            }),
        );
        // Must not error; simply no feed aggregation happens.
        sink.process(1, &LogEntry::Message(Box::new(msg)))?;
        Ok(())
    }
}
