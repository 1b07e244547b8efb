//! Group management over box2.
//!
//! A group is a 32-byte symmetric key plus the message that founded it
//! (the group tangle root). Groups are referred to by a cloaked id
//! derived from the key and root, so naming a group never reveals its
//! secret. Members are invited with `group/add-member` envelopes sealed
//! both to the group and to the invitee's direct-message key.

use std::fmt;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde_json::json;

use scuttle_codec::{Content, ContentUnboxer, Message};
use scuttle_crypto::hkdf::derive_to;
use scuttle_crypto::secretbox::generate_key;
use scuttle_crypto::signing::KeyPair;
use scuttle_store::{FeedStore, PublishLog};
use scuttle_types::{FeedRef, MessageRef, Result, ScuttleError};

use crate::box1;
use crate::box2;
use crate::keys::{KeyScheme, KeyStore, StoredKey};

// ---------------------------------------------------------------------------
// CloakedId
// ---------------------------------------------------------------------------

/// Key-derived opaque identifier of a group.
///
/// Wire form: `%<base64>.cloaked`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub struct CloakedId([u8; 32]);

impl CloakedId {
    /// Derives the cloaked id from a group key and its tangle root.
    pub fn derive(group_key: &[u8; 32], root: &MessageRef) -> Result<Self> {
        let derived = derive_to(group_key, &[b"cloaked_msg_id", &root.stored_bytes()])?;
        Ok(Self(*derived.as_bytes()))
    }

    /// Raw id bytes, used as the key-store address.
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Reconstructs a cloaked id from stored bytes.
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl fmt::Display for CloakedId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "%{}.cloaked", B64.encode(self.0))
    }
}

// ---------------------------------------------------------------------------
// GroupManager
// ---------------------------------------------------------------------------

/// Creates groups, invites members, publishes into groups, and unboxes
/// whatever the local key material can open.
pub struct GroupManager {
    keypair: Arc<KeyPair>,
    publish: Arc<PublishLog>,
    feeds: Arc<FeedStore>,
    keystore: KeyStore,
    roots: sled::Tree,
    members: sled::Tree,
}

impl GroupManager {
    /// Creates the manager; `db` hosts the group root and member trees.
    pub fn new(
        keypair: Arc<KeyPair>,
        publish: Arc<PublishLog>,
        feeds: Arc<FeedStore>,
        keystore: KeyStore,
        db: &sled::Db,
    ) -> Result<Self> {
        let roots = db.open_tree("group-roots").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open group roots: {e}"),
        })?;
        let members = db.open_tree("group-members").map_err(|e| ScuttleError::Fatal {
            reason: format!("failed to open group members: {e}"),
        })?;
        Ok(Self {
            keypair,
            publish,
            feeds,
            keystore,
            roots,
            members,
        })
    }

    /// The local identity.
    pub fn id(&self) -> FeedRef {
        self.keypair.id()
    }

    /// The underlying key store.
    pub fn keystore(&self) -> &KeyStore {
        &self.keystore
    }

    /// Creates a new group: samples a key, publishes the encrypted
    /// `group/init` root, and registers the key under the cloaked id.
    pub async fn init(&self, name: &str) -> Result<(CloakedId, MessageRef)> {
        let group_key = generate_key();

        let content = json!({
            "type": "group/init",
            "name": name,
            "tangles": {
                "group": { "root": null, "previous": null }
            }
        });
        let root = self.publish_boxed(&content, &[group_key]).await?;

        let cloaked = CloakedId::derive(&group_key, &root)?;
        self.register_group(cloaked, group_key, root, "group/init")?;
        self.record_member(&cloaked, &self.keypair.id())?;
        tracing::info!(group = %cloaked, root = %root, "group created");
        Ok((cloaked, root))
    }

    /// Registers a group discovered elsewhere (an accepted invitation).
    pub fn join(&self, group_key: [u8; 32], root: MessageRef) -> Result<CloakedId> {
        let cloaked = CloakedId::derive(&group_key, &root)?;
        self.register_group(cloaked, group_key, root, "group/add-member")?;
        Ok(cloaked)
    }

    /// Invites `member` into the group: publishes a `group/add-member`
    /// envelope sealed to the group key and to the member's DM key.
    pub async fn add_member(
        &self,
        cloaked: &CloakedId,
        member: &FeedRef,
        greeting: &str,
    ) -> Result<MessageRef> {
        let group_key = self.group_key(cloaked)?;
        let root = self.group_root(cloaked)?;
        let dm_keys = self.get_or_derive_key_for(member)?;
        let dm_key = dm_keys.first().ok_or_else(|| ScuttleError::Crypto {
            reason: format!("no direct-message key for {member}"),
        })?;

        let content = json!({
            "type": "group/add-member",
            "version": "v1",
            "groupKey": B64.encode(group_key),
            "root": root.to_string(),
            "text": greeting,
            "recps": [cloaked.to_string(), member.to_string()],
            "tangles": {
                "group": { "root": root.to_string(), "previous": [root.to_string()] }
            }
        });
        let key = self.publish_boxed(&content, &[group_key, dm_key.key]).await?;
        self.record_member(cloaked, member)?;
        Ok(key)
    }

    /// Publishes an encrypted post into the group's tangle.
    pub async fn publish_post_to(&self, cloaked: &CloakedId, text: &str) -> Result<MessageRef> {
        let group_key = self.group_key(cloaked)?;
        let root = self.group_root(cloaked)?;

        let content = json!({
            "type": "post",
            "text": text,
            "recps": [cloaked.to_string()],
            "tangles": {
                "group": { "root": root.to_string(), "previous": [root.to_string()] }
            }
        });
        self.publish_boxed(&content, &[group_key]).await
    }

    /// Tries every candidate key (group, direct-message, previous-slot)
    /// against each slot of a box2 envelope.
    pub fn decrypt_box2(
        &self,
        ciphertext: &[u8],
        author: &FeedRef,
        previous: Option<&MessageRef>,
    ) -> Result<Vec<u8>> {
        let mut candidates = Vec::new();
        for scheme in KeyScheme::all() {
            for stored in self.keystore.all_for_scheme(scheme)? {
                candidates.push(stored.key);
            }
        }
        // Pairwise keys can be derived on demand even before any
        // message from the author was unboxed.
        if let Ok(dm) = box2::derive_dm_key(&self.keypair, author) {
            candidates.push(dm);
        }

        box2::decrypt(ciphertext, author, previous, &candidates).ok_or_else(|| {
            ScuttleError::Crypto {
                reason: "no candidate key opens this envelope".into(),
            }
        })
    }

    /// The memoized direct-message key list for `peer`, deriving and
    /// persisting the first entry on demand.
    pub fn get_or_derive_key_for(&self, peer: &FeedRef) -> Result<Vec<StoredKey>> {
        let addr = peer.stored_bytes();
        let existing = self.keystore.get(KeyScheme::DirectMessage, &addr)?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        let key = box2::derive_dm_key(&self.keypair, peer)?;
        self.keystore.add(
            KeyScheme::DirectMessage,
            &addr,
            StoredKey {
                key,
                origin: "derived".into(),
            },
        )?;
        self.keystore.get(KeyScheme::DirectMessage, &addr)
    }

    /// Known members of a group, in discovery order.
    pub fn members(&self, cloaked: &CloakedId) -> Result<Vec<FeedRef>> {
        match self.members.get(cloaked.as_bytes()).map_err(storage_err)? {
            Some(bytes) => {
                let stored: Vec<Vec<u8>> =
                    ciborium::from_reader(bytes.as_ref()).map_err(|e| ScuttleError::Corrupt {
                        index: "group-members".into(),
                        reason: format!("undecodable member list: {e}"),
                    })?;
                stored.iter().map(|b| FeedRef::from_stored_bytes(b)).collect()
            }
            None => Ok(Vec::new()),
        }
    }

    /// Records `member` in the group's member list (idempotent).
    pub fn record_member(&self, cloaked: &CloakedId, member: &FeedRef) -> Result<()> {
        let mut current = self.members(cloaked)?;
        if current.contains(member) {
            return Ok(());
        }
        current.push(*member);
        let stored: Vec<Vec<u8>> = current.iter().map(|f| f.stored_bytes().to_vec()).collect();
        let mut buf = Vec::new();
        ciborium::into_writer(&stored, &mut buf).map_err(|e| ScuttleError::Storage {
            reason: format!("failed to encode member list: {e}"),
        })?;
        self.members.insert(cloaked.as_bytes(), buf).map_err(storage_err)?;
        Ok(())
    }

    /// Every group this node holds a key for.
    pub fn list_groups(&self) -> Result<Vec<CloakedId>> {
        let mut out = Vec::new();
        for addr in self.keystore.addrs_for_scheme(KeyScheme::Group)? {
            if addr.len() == 32 {
                let mut bytes = [0u8; 32];
                bytes.copy_from_slice(&addr);
                out.push(CloakedId::from_bytes(bytes));
            }
        }
        Ok(out)
    }

    async fn publish_boxed(
        &self,
        content: &serde_json::Value,
        recipient_keys: &[[u8; 32]],
    ) -> Result<MessageRef> {
        let plaintext = serde_json::to_vec(content).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("group content encoding failed: {e}"),
        })?;
        let previous = self.feeds.tip(&self.keypair.id())?.map(|t| t.key);
        let ciphertext = box2::encrypt(
            &plaintext,
            &self.keypair.id(),
            previous.as_ref(),
            recipient_keys,
        )?;
        self.publish.publish(&Content::Box2(ciphertext)).await
    }

    fn register_group(
        &self,
        cloaked: CloakedId,
        group_key: [u8; 32],
        root: MessageRef,
        origin: &str,
    ) -> Result<()> {
        self.keystore.add(
            KeyScheme::Group,
            cloaked.as_bytes(),
            StoredKey {
                key: group_key,
                origin: origin.into(),
            },
        )?;
        self.roots
            .insert(cloaked.as_bytes(), &root.stored_bytes()[..])
            .map_err(storage_err)?;
        Ok(())
    }

    fn group_key(&self, cloaked: &CloakedId) -> Result<[u8; 32]> {
        let keys = self.keystore.get(KeyScheme::Group, cloaked.as_bytes())?;
        keys.first().map(|k| k.key).ok_or_else(|| ScuttleError::NotFound {
            what: format!("group key for {cloaked}"),
        })
    }

    fn group_root(&self, cloaked: &CloakedId) -> Result<MessageRef> {
        let bytes = self
            .roots
            .get(cloaked.as_bytes())
            .map_err(storage_err)?
            .ok_or_else(|| ScuttleError::NotFound {
                what: format!("group root for {cloaked}"),
            })?;
        if bytes.len() != 33 {
            return Err(ScuttleError::Corrupt {
                index: "group-roots".into(),
                reason: format!("root record must be 33 bytes, got {}", bytes.len()),
            });
        }
        let algo = match bytes[0] {
            1 => scuttle_types::MsgAlgo::Sha256,
            2 => scuttle_types::MsgAlgo::Gabby,
            other => {
                return Err(ScuttleError::Corrupt {
                    index: "group-roots".into(),
                    reason: format!("unknown message algo tag {other}"),
                })
            }
        };
        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[1..]);
        Ok(MessageRef::new(algo, hash))
    }
}

impl ContentUnboxer for GroupManager {
    fn unbox(&self, msg: &Message) -> Option<Vec<u8>> {
        match msg.content() {
            Content::Box1(ct) => box1::decrypt(ct, &self.keypair),
            Content::Box2(ct) => self
                .decrypt_box2(ct, &msg.author(), msg.previous().as_ref())
                .ok(),
            Content::Clear(_) => None,
        }
    }
}

fn storage_err(e: sled::Error) -> ScuttleError {
    ScuttleError::Storage {
        reason: format!("group manager: {e}"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use scuttle_store::{MultilogSet, ReceiveLog};

    struct Fixture {
        _dir: tempfile::TempDir,
        feeds: Arc<FeedStore>,
        groups: GroupManager,
    }

    fn fixture(seed: u8) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let log_db = sled::open(dir.path().join("log")).expect("sled");
        let sub_db = sled::open(dir.path().join("sublogs")).expect("sled");
        let idx_db = sled::open(dir.path().join("indexes")).expect("sled");

        let log = ReceiveLog::open(&log_db).expect("log");
        let set = MultilogSet::new(sub_db);
        let uf = set.open("userFeeds").expect("multilog");
        let feeds = FeedStore::new(log, uf, &log_db, None).expect("store");

        let kp = Arc::new(KeyPair::from_seed(&[seed; 32]));
        let publish = Arc::new(PublishLog::new(kp.clone(), feeds.clone(), None));
        let keystore = KeyStore::open(&idx_db).expect("keystore");
        let groups =
            GroupManager::new(kp, publish, feeds.clone(), keystore, &idx_db).expect("groups");

        Fixture {
            _dir: dir,
            feeds,
            groups,
        }
    }

    #[tokio::test]
    async fn init_publishes_encrypted_root() -> Result<()> {
        let fx = fixture(0x01);
        let (cloaked, root) = fx.groups.init("my group").await?;

        let msg = fx.feeds.get(&root)?;
        assert!(msg.content().is_encrypted());

        // The creator can decrypt the init message.
        let ct = match msg.content() {
            Content::Box2(ct) => ct.clone(),
            other => panic!("expected Box2, got {other:?}"),
        };
        let clear = fx
            .groups
            .decrypt_box2(&ct, &msg.author(), msg.previous().as_ref())?;
        let value: serde_json::Value = serde_json::from_slice(&clear).expect("json");
        assert_eq!(value["type"], "group/init");

        assert_eq!(fx.groups.list_groups()?, vec![cloaked]);
        Ok(())
    }

    #[tokio::test]
    async fn add_member_envelope_opens_with_dm_key() -> Result<()> {
        let alice = fixture(0x01);
        let bob = fixture(0x02);
        let bob_id = bob.groups.id();

        let (cloaked, _root) = alice.groups.init("shared").await?;
        let add_ref = alice.groups.add_member(&cloaked, &bob_id, "welcome!").await?;

        let msg = alice.feeds.get(&add_ref)?;
        let ct = match msg.content() {
            Content::Box2(ct) => ct.clone(),
            other => panic!("expected Box2, got {other:?}"),
        };

        // Bob holds no group key yet; only the DM key opens the slot.
        let clear = bob
            .groups
            .decrypt_box2(&ct, &msg.author(), msg.previous().as_ref())?;
        let value: serde_json::Value = serde_json::from_slice(&clear).expect("json");
        assert_eq!(value["type"], "group/add-member");

        // The payload carries the actual group key.
        let carried = B64
            .decode(value["groupKey"].as_str().expect("groupKey"))
            .expect("base64");
        assert_eq!(carried.len(), 32);
        Ok(())
    }

    #[tokio::test]
    async fn joined_member_reads_group_posts() -> Result<()> {
        let alice = fixture(0x01);
        let bob = fixture(0x02);

        let (cloaked, root) = alice.groups.init("readers").await?;
        let post_ref = alice.groups.publish_post_to(&cloaked, "hello group").await?;

        // Simulate bob accepting the invite payload.
        let alice_key = alice
            .groups
            .keystore()
            .get(KeyScheme::Group, cloaked.as_bytes())?[0]
            .key;
        let joined = bob.groups.join(alice_key, root)?;
        assert_eq!(joined, cloaked);

        let msg = alice.feeds.get(&post_ref)?;
        let ct = match msg.content() {
            Content::Box2(ct) => ct.clone(),
            other => panic!("expected Box2, got {other:?}"),
        };
        let clear = bob
            .groups
            .decrypt_box2(&ct, &msg.author(), msg.previous().as_ref())?;
        let value: serde_json::Value = serde_json::from_slice(&clear).expect("json");
        assert_eq!(value["text"], "hello group");
        Ok(())
    }

    #[tokio::test]
    async fn dm_keys_match_across_peers() -> Result<()> {
        let alice = fixture(0x01);
        let bob = fixture(0x02);

        let a_keys = alice.groups.get_or_derive_key_for(&bob.groups.id())?;
        let b_keys = bob.groups.get_or_derive_key_for(&alice.groups.id())?;
        assert_eq!(a_keys.len(), 1);
        assert_eq!(a_keys[0].key, b_keys[0].key);

        // Memoized: a second call returns the stored key.
        let again = alice.groups.get_or_derive_key_for(&bob.groups.id())?;
        assert_eq!(again, a_keys);
        Ok(())
    }

    #[tokio::test]
    async fn members_are_recorded() -> Result<()> {
        let alice = fixture(0x01);
        let bob = fixture(0x02);
        let (cloaked, _) = alice.groups.init("roster").await?;
        alice.groups.add_member(&cloaked, &bob.groups.id(), "hi").await?;

        let members = alice.groups.members(&cloaked)?;
        assert_eq!(members, vec![alice.groups.id(), bob.groups.id()]);
        Ok(())
    }
}
