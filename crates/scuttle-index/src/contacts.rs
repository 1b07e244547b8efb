//! Contacts sink: the persistent follow/block edge log.
//!
//! Fed indirectly from the by-type sublog `contact`. For each ordered
//! pair `(author, contact)` the latest edge wins; since per-author
//! messages arrive in author-sequence order, processing in receive
//! order and overwriting yields exactly that.

use std::sync::Arc;

use serde_json::Value;

use scuttle_codec::ContentUnboxer;
use scuttle_store::LogEntry;
use scuttle_types::{FeedRef, ReceiveSeq, Result, ScuttleError};

use crate::content_value;
use crate::runner::SinkIndex;

/// Index name, used for the cursor directory.
pub const NAME: &str = "contacts";

// ---------------------------------------------------------------------------
// EdgeKind
// ---------------------------------------------------------------------------

/// Label of the latest relationship between an ordered feed pair.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EdgeKind {
    /// `following: true`
    Follow,
    /// `following: false`
    Unfollow,
    /// `blocking: true`
    Block,
    /// `blocking: false`
    Unblock,
}

impl EdgeKind {
    fn to_byte(self) -> u8 {
        match self {
            Self::Follow => 1,
            Self::Unfollow => 2,
            Self::Block => 3,
            Self::Unblock => 4,
        }
    }

    fn from_byte(b: u8) -> Option<Self> {
        match b {
            1 => Some(Self::Follow),
            2 => Some(Self::Unfollow),
            3 => Some(Self::Block),
            4 => Some(Self::Unblock),
            _ => None,
        }
    }
}

// ---------------------------------------------------------------------------
// ContactsStore
// ---------------------------------------------------------------------------

/// Read/write access to the persisted edge table.
#[derive(Clone)]
pub struct ContactsStore {
    tree: sled::Tree,
}

impl ContactsStore {
    /// Opens the edge table inside `db`.
    pub fn open(db: &sled::Db) -> Result<Self> {
        let tree = db.open_tree("contacts-edges").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open contacts store: {e}"),
        })?;
        Ok(Self { tree })
    }

    /// Records the latest edge for `(src, dst)`.
    pub fn set_edge(&self, src: &FeedRef, dst: &FeedRef, kind: EdgeKind) -> Result<()> {
        self.tree
            .insert(edge_key(src, dst), &[kind.to_byte()])
            .map_err(storage_err)?;
        Ok(())
    }

    /// The latest edge for `(src, dst)`, if any message set one.
    pub fn edge(&self, src: &FeedRef, dst: &FeedRef) -> Result<Option<EdgeKind>> {
        match self.tree.get(edge_key(src, dst)).map_err(storage_err)? {
            Some(bytes) if bytes.len() == 1 => Ok(EdgeKind::from_byte(bytes[0])),
            Some(_) => Err(ScuttleError::Corrupt {
                index: NAME.into(),
                reason: "edge record must be one byte".into(),
            }),
            None => Ok(None),
        }
    }

    /// Every stored edge, as `(src, dst, kind)` triples.
    pub fn all_edges(&self) -> Result<Vec<(FeedRef, FeedRef, EdgeKind)>> {
        let mut out = Vec::new();
        for item in self.tree.iter() {
            let (key, value) = item.map_err(storage_err)?;
            if key.len() != 66 || value.len() != 1 {
                return Err(ScuttleError::Corrupt {
                    index: NAME.into(),
                    reason: "malformed edge record".into(),
                });
            }
            let src = FeedRef::from_stored_bytes(&key[..33])?;
            let dst = FeedRef::from_stored_bytes(&key[33..])?;
            if let Some(kind) = EdgeKind::from_byte(value[0]) {
                out.push((src, dst, kind));
            }
        }
        Ok(out)
    }
}

fn edge_key(src: &FeedRef, dst: &FeedRef) -> Vec<u8> {
    let mut key = Vec::with_capacity(66);
    key.extend_from_slice(&src.stored_bytes());
    key.extend_from_slice(&dst.stored_bytes());
    key
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("contacts store: {e}"),
    }
}

// ---------------------------------------------------------------------------
// ContactsSink
// ---------------------------------------------------------------------------

/// Applies `contact` messages to the edge table.
pub struct ContactsSink {
    store: ContactsStore,
    unboxer: Arc<dyn ContentUnboxer>,
}

impl ContactsSink {
    /// Creates the sink over an open edge table.
    pub fn new(store: ContactsStore, unboxer: Arc<dyn ContentUnboxer>) -> Self {
        Self { store, unboxer }
    }
}

impl SinkIndex for ContactsSink {
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
        let Some(dst) = value
            .get("contact")
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<FeedRef>().ok())
        else {
            return Ok(());
        };
        let Some(kind) = edge_kind(&value) else {
            return Ok(());
        };
        self.store.set_edge(&msg.author(), &dst, kind)
    }
}

/// Maps contact flags to an edge label; blocking takes precedence.
fn edge_kind(value: &Value) -> Option<EdgeKind> {
    let following = value.get("following").and_then(Value::as_bool);
    let blocking = value.get("blocking").and_then(Value::as_bool);
    match (blocking, following) {
        (Some(true), _) => Some(EdgeKind::Block),
        (_, Some(true)) => Some(EdgeKind::Follow),
        (Some(false), _) => Some(EdgeKind::Unblock),
        (_, Some(false)) => Some(EdgeKind::Unfollow),
        (None, None) => None,
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

    fn sink() -> (tempfile::TempDir, ContactsSink, ContactsStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = sled::open(dir.path().join("indexes")).expect("sled");
        let store = ContactsStore::open(&db).expect("store");
        let sink = ContactsSink::new(store.clone(), Arc::new(NoKeys));
        (dir, sink, store)
    }

    fn contact_msg(
        kp: &KeyPair,
        tip: Option<&FeedTip>,
        dst: &FeedRef,
        fields: serde_json::Value,
    ) -> Message {
        let mut content = json!({"type": "contact", "contact": dst.to_string()});
        if let (Some(obj), Some(extra)) = (content.as_object_mut(), fields.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        legacy::sign(kp, tip, 1.0, &Content::Clear(content), None).expect("sign")
    }

    #[test]
    fn follow_then_block_latest_wins() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]).id();

        let m1 = contact_msg(&alice, None, &bob, json!({"following": true}));
        let m2 = contact_msg(&alice, Some(&m1.as_tip()), &bob, json!({"blocking": true}));

        sink.process(1, &LogEntry::Message(Box::new(m1)))?;
        assert_eq!(store.edge(&alice.id(), &bob)?, Some(EdgeKind::Follow));

        sink.process(2, &LogEntry::Message(Box::new(m2)))?;
        assert_eq!(store.edge(&alice.id(), &bob)?, Some(EdgeKind::Block));
        Ok(())
    }

    #[test]
    fn unfollow_and_unblock_edges() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]).id();

        let m1 = contact_msg(&alice, None, &bob, json!({"following": false}));
        sink.process(1, &LogEntry::Message(Box::new(m1.clone())))?;
        assert_eq!(store.edge(&alice.id(), &bob)?, Some(EdgeKind::Unfollow));

        let m2 = contact_msg(&alice, Some(&m1.as_tip()), &bob, json!({"blocking": false}));
        sink.process(2, &LogEntry::Message(Box::new(m2)))?;
        assert_eq!(store.edge(&alice.id(), &bob)?, Some(EdgeKind::Unblock));
        Ok(())
    }

    #[test]
    fn flagless_contact_is_ignored() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]).id();

        let msg = contact_msg(&alice, None, &bob, json!({}));
        sink.process(1, &LogEntry::Message(Box::new(msg)))?;
        assert_eq!(store.edge(&alice.id(), &bob)?, None);
        Ok(())
    }

    #[test]
    fn edges_are_directional() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]).id();

        let msg = contact_msg(&alice, None, &bob, json!({"following": true}));
        sink.process(1, &LogEntry::Message(Box::new(msg)))?;

        assert_eq!(store.edge(&alice.id(), &bob)?, Some(EdgeKind::Follow));
        assert_eq!(store.edge(&bob, &alice.id())?, None);
        Ok(())
    }

    #[test]
    fn all_edges_enumerates() -> Result<()> {
        let (_dir, mut sink, store) = sink();
        let alice = KeyPair::from_seed(&[1; 32]);
        let bob = KeyPair::from_seed(&[2; 32]).id();
        let carol = KeyPair::from_seed(&[3; 32]).id();

        let m1 = contact_msg(&alice, None, &bob, json!({"following": true}));
        let m2 = contact_msg(&alice, Some(&m1.as_tip()), &carol, json!({"blocking": true}));
        sink.process(1, &LogEntry::Message(Box::new(m1)))?;
        sink.process(2, &LogEntry::Message(Box::new(m2)))?;

        let edges = store.all_edges()?;
        assert_eq!(edges.len(), 2);
        Ok(())
    }
}
