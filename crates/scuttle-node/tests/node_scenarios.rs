//! End-to-end scenarios over whole nodes: group full-circle, private
//! reads, hops gating, feed nulling, blob exchange and about
//! aggregation. Peers are wired with in-process channel transports.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;

use scuttle_codec::{legacy, Content};
use scuttle_crypto::signing::KeyPair;
use scuttle_node::{Node, NodeState};
use scuttle_replicate::gossip::stream_channel;
use scuttle_replicate::{BlobFetcher, CreateHistoryStreamArgs, HistorySource, HistoryStreamHandler};
use scuttle_store::{BlobStore, FeedStore};
use scuttle_types::config::NodeConfig;
use scuttle_types::{FeedRef, Result, ScuttleError};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn test_config() -> NodeConfig {
    NodeConfig {
        // Short debounce keeps the replication tests snappy.
        replicate_debounce_secs: 1,
        ..NodeConfig::default()
    }
}

fn open_node(dir: &std::path::Path) -> Node {
    let mut node = Node::open(dir, test_config()).expect("node open");
    node.start().expect("node start");
    node
}

/// In-process transport: opens history streams against another node's
/// stores.
struct NodeSource {
    feeds: Arc<FeedStore>,
}

impl HistorySource for NodeSource {
    fn open(&self, args: CreateHistoryStreamArgs) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = stream_channel();
        let handler = HistoryStreamHandler::new(self.feeds.clone(), Duration::from_millis(100));
        let (hold_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        tokio::spawn(async move {
            let _hold = hold_tx;
            handler.handle(args, tx, shutdown_rx).await;
        });
        rx
    }
}

fn source_for(node: &Node) -> Arc<dyn HistorySource> {
    Arc::new(NodeSource {
        feeds: node.feeds().clone(),
    })
}

/// Fetches blob bytes straight out of another node's store.
struct NodeBlobFetcher {
    store: Arc<BlobStore>,
}

impl BlobFetcher for NodeBlobFetcher {
    fn fetch(&self, blob: scuttle_types::BlobRef) -> mpsc::Receiver<Vec<u8>> {
        let (tx, rx) = mpsc::channel(4);
        let store = self.store.clone();
        tokio::spawn(async move {
            if let Ok(data) = store.get(&blob) {
                let _ = tx.send(data).await;
            }
        });
        rx
    }
}

async fn wait_until<F: Fn() -> bool>(cond: F, what: &str) {
    for _ in 0..500 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

fn tip_seq(node: &Node, feed: &FeedRef) -> Option<u64> {
    node.feeds().tip(feed).expect("tip").map(|t| t.sequence)
}

// ---------------------------------------------------------------------------
// 1. Full-circle group
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn group_full_circle() -> Result<()> {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let mut alice = open_node(dir_a.path());
    let mut bob = open_node(dir_b.path());
    let alice_id = alice.whoami();
    let bob_id = bob.whoami();

    // A plaintext message, then the encrypted group lifecycle.
    alice.publish(&json!({"type": "test", "text": "hello, world!"})).await?;
    let (cloaked, root) = alice.groups().init("hello, my group").await?;

    // The root is encrypted and its creator can decrypt it.
    let root_msg = alice.get(&root)?;
    assert!(root_msg.content().is_encrypted());
    let ct = match root_msg.content() {
        Content::Box2(ct) => ct.clone(),
        other => panic!("expected Box2, got {other:?}"),
    };
    let clear = alice
        .groups()
        .decrypt_box2(&ct, &root_msg.author(), root_msg.previous().as_ref())?;
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&clear).expect("json")["type"],
        "group/init"
    );

    let post_ref = alice
        .groups()
        .publish_post_to(&cloaked, "just a small test group!")
        .await?;

    // Bob speaks and follows alice.
    bob.publish(&json!({"type": "test", "text": "shalom!"})).await?;
    bob.publish(&json!({"type": "contact", "contact": alice_id.to_string(), "following": true}))
        .await?;

    // Both sides derive the same pairwise key.
    let dm_a = alice.groups().get_or_derive_key_for(&bob_id)?;
    let dm_b = bob.groups().get_or_derive_key_for(&alice_id)?;
    assert_eq!(dm_a.len(), 1);
    assert_eq!(dm_a[0].key, dm_b[0].key);

    let add_ref = alice.groups().add_member(&cloaked, &bob_id, "welcome, tal!").await?;

    // Replicate both directions.
    alice.replicator().replicate(&bob_id);
    bob.replicator().replicate(&alice_id);
    alice.connect_peer(&bob_id, &source_for(&bob))?;
    bob.connect_peer(&alice_id, &source_for(&alice))?;

    wait_until(|| tip_seq(&bob, &alice_id) == Some(4), "bob to copy alice's feed").await;
    wait_until(|| tip_seq(&alice, &bob_id) == Some(2), "alice to copy bob's feed").await;

    // Bob's indexers unbox the add-member envelope and join the group.
    wait_until(
        || !bob.groups().list_groups().unwrap_or_default().is_empty(),
        "bob to join the group",
    )
    .await;

    // The add-member payload carries alice's group key.
    let add_copy = bob.get(&add_ref)?;
    let add_ct = match add_copy.content() {
        Content::Box2(ct) => ct.clone(),
        other => panic!("expected Box2, got {other:?}"),
    };
    let add_clear = bob
        .groups()
        .decrypt_box2(&add_ct, &add_copy.author(), add_copy.previous().as_ref())?;
    let add_value: serde_json::Value = serde_json::from_slice(&add_clear).expect("json");
    assert_eq!(add_value["type"], "group/add-member");
    let alice_group_key = alice
        .groups()
        .keystore()
        .get(scuttle_private::KeyScheme::Group, cloaked.as_bytes())?[0]
        .key;
    use base64::Engine as _;
    let carried = base64::engine::general_purpose::STANDARD
        .decode(add_value["groupKey"].as_str().expect("groupKey"))
        .expect("base64");
    assert_eq!(carried, alice_group_key);

    // Bob reads the group post and replies into the tangle.
    let post_copy = bob.get(&post_ref)?;
    let post_ct = match post_copy.content() {
        Content::Box2(ct) => ct.clone(),
        other => panic!("expected Box2, got {other:?}"),
    };
    let post_clear = bob
        .groups()
        .decrypt_box2(&post_ct, &post_copy.author(), post_copy.previous().as_ref())?;
    assert_eq!(
        serde_json::from_slice::<serde_json::Value>(&post_clear).expect("json")["text"],
        "just a small test group!"
    );

    let reply = bob
        .groups()
        .publish_post_to(&cloaked, &format!("thanks [@sarah]({alice_id})!"))
        .await?;
    assert!(bob.get(&reply)?.content().is_encrypted());

    bob.shutdown().await?;
    alice.shutdown().await?;
    assert_eq!(alice.state(), NodeState::ShuttingDown);
    Ok(())
}

// ---------------------------------------------------------------------------
// 2. Private DM to self
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn private_publish_and_read_back() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut node = open_node(dir.path());
    let me = node.whoami();

    const N: usize = 32;
    for i in 0..N {
        node.publish_private(
            &json!({"type": "test", "msg": "hello, world", "i": i}),
            &[me],
        )
        .await?;
    }

    wait_until(
        || node.private_read().map(|rows| rows.len()).unwrap_or(0) == N,
        "privates index to catch up",
    )
    .await;

    let rows = node.private_read()?;
    assert_eq!(rows.len(), N);
    for (i, (msg, value)) in rows.iter().enumerate() {
        // Receive order equals publish order for a single feed.
        assert_eq!(msg.sequence(), i as u64 + 1);
        assert_eq!(value["msg"], "hello, world");
        assert_eq!(value["i"], i as u64);
        assert!(msg.content().is_encrypted());
    }

    node.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 3. Hops gating
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn hops_gate_authorization() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut node = open_node(dir.path());

    let b = KeyPair::from_seed(&[0xB0; 32]);
    let c = KeyPair::from_seed(&[0xC0; 32]);
    let d = KeyPair::from_seed(&[0xD0; 32]).id();
    let e = KeyPair::from_seed(&[0xE0; 32]).id();

    // A follows B from its own feed.
    node.publish(&json!({"type": "contact", "contact": b.id().to_string(), "following": true}))
        .await?;

    // B follows C and C follows D, ingested as replicated feeds.
    let b_msg = legacy::sign(
        &b,
        None,
        1.0,
        &Content::Clear(json!({"type": "contact", "contact": c.id().to_string(), "following": true})),
        None,
    )?;
    node.feeds().append_raw(b_msg.raw()).await?;
    let c_msg = legacy::sign(
        &c,
        None,
        2.0,
        &Content::Clear(json!({"type": "contact", "contact": d.to_string(), "following": true})),
        None,
    )?;
    node.feeds().append_raw(c_msg.raw()).await?;

    wait_until(
        || node.is_following(&c.id(), &d).unwrap_or(false),
        "contacts index to catch up",
    )
    .await;

    node.replicator().recompute()?;

    assert!(node.authorize(&b.id()).is_ok());
    assert!(node.authorize(&c.id()).is_ok());
    assert!(matches!(node.authorize(&d), Err(ScuttleError::Unauthorized { .. })));
    assert!(matches!(node.authorize(&e), Err(ScuttleError::Unauthorized { .. })));

    let hops = node.hops(None, 2)?;
    assert!(hops.contains(&b.id()) && hops.contains(&c.id()));
    assert!(!hops.contains(&d));

    node.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 4. Null feed
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn null_feed_rewrites_to_sentinel() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut node = open_node(dir.path());

    let f = KeyPair::from_seed(&[0xF0; 32]);
    let mut tip = None;
    for i in 0..3 {
        let msg = legacy::sign(
            &f,
            tip.as_ref(),
            i as f64,
            &Content::Clear(json!({"type": "spam", "i": i})),
            None,
        )?;
        node.feeds().append_raw(msg.raw()).await?;
        tip = Some(msg.as_tip());
    }

    wait_until(
        || node.messages_of_type("spam").map(|m| m.len()).unwrap_or(0) == 3,
        "by-type index to catch up",
    )
    .await;

    node.null_feed(&f.id()).await?;

    // Entries keep their receive sequences but read as the sentinel.
    assert_eq!(node.feeds().log().last_seq(), Some(3));
    for seq in 1..=3 {
        assert!(matches!(
            node.feeds().log().get(seq)?,
            Some(scuttle_store::LogEntry::Nulled)
        ));
    }
    assert!(node.feeds().tip(&f.id())?.is_none());
    assert!(node.feed_stream(&f.id(), 1)?.is_empty());

    // Downstream reads skip the sentinel without erroring.
    assert!(node.messages_of_type("spam")?.is_empty());
    assert!(node.log_stream(1, 100)?.is_empty());

    // The pipeline keeps indexing new appends after the null.
    node.publish(&json!({"type": "post", "text": "still alive"})).await?;
    wait_until(
        || node.messages_of_type("post").map(|m| m.len()).unwrap_or(0) == 1,
        "indexing to continue after null",
    )
    .await;

    node.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 5. Blob exchange
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn blob_exchange_converges() -> Result<()> {
    let dir_a = tempfile::tempdir().expect("tempdir");
    let dir_b = tempfile::tempdir().expect("tempdir");
    let mut alice = open_node(dir_a.path());
    let mut bob = open_node(dir_b.path());

    let x = alice.blobs_add(b"blob x")?;
    let y = bob.blobs_add(b"blob y")?;

    alice.blobs_want(&x)?; // already held, no-op
    alice.blobs_want(&y)?;
    bob.blobs_want(&x)?;
    bob.blobs_want(&y)?; // already held, no-op

    let (out_a, mut from_a) = mpsc::channel(16);
    let (out_b, mut from_b) = mpsc::channel(16);
    let proc_a = alice
        .create_wants(
            out_a,
            Arc::new(NodeBlobFetcher {
                store: bob.blobs().clone(),
            }),
        )
        .await;
    let proc_b = bob
        .create_wants(
            out_b,
            Arc::new(NodeBlobFetcher {
                store: alice.blobs().clone(),
            }),
        )
        .await;

    let pump_a = tokio::spawn(async move {
        while let Some(msg) = from_a.recv().await {
            if proc_b.process(msg).await.is_err() {
                return;
            }
        }
    });
    let pump_b = tokio::spawn(async move {
        while let Some(msg) = from_b.recv().await {
            if proc_a.process(msg).await.is_err() {
                return;
            }
        }
    });

    {
        let (alice_b, bob_b) = (alice.blobs().clone(), bob.blobs().clone());
        wait_until(
            move || alice_b.has(&y) && bob_b.has(&x),
            "both stores to converge",
        )
        .await;
    }

    assert_eq!(alice.blobs_get(&y)?, b"blob y");
    assert_eq!(bob.blobs_get(&x)?, b"blob x");

    let (am, bm) = (alice.want_manager().clone(), bob.want_manager().clone());
    wait_until(
        move || am.current().is_empty() && bm.current().is_empty(),
        "want sets to drain",
    )
    .await;

    pump_a.abort();
    pump_b.abort();
    bob.shutdown().await?;
    alice.shutdown().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// 6. About aggregation
// ---------------------------------------------------------------------------

#[tokio::test(flavor = "multi_thread")]
async fn self_chosen_name_wins() -> Result<()> {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut node = open_node(dir.path());
    let me = node.whoami();

    node.publish(&json!({"type": "about", "about": me.to_string(), "name": "N1"})).await?;

    let b = KeyPair::from_seed(&[0xAB; 32]);
    let other = legacy::sign(
        &b,
        None,
        1.0,
        &Content::Clear(json!({"type": "about", "about": me.to_string(), "name": "N2"})),
        None,
    )?;
    node.feeds().append_raw(other.raw()).await?;

    wait_until(
        || {
            node.about_info(&me)
                .map(|info| info.name.prescribed.contains_key("N2"))
                .unwrap_or(false)
        },
        "about index to catch up",
    )
    .await;

    assert_eq!(node.get_signifier(&me)?, Some("N1".into()));
    let info = node.about_info(&me)?;
    assert_eq!(info.name.chosen, Some("N1".into()));
    assert_eq!(info.name.prescribed.get("N2"), Some(&1));

    // An unnamed feed resolves to its wire id.
    assert_eq!(node.get_signifier(&b.id())?, Some(b.id().to_string()));

    node.shutdown().await?;
    Ok(())
}
