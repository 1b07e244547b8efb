//! The query surface the RPC layer dispatches into.
//!
//! Methods mirror the manifest: log/feed reads, publishing (clear and
//! private), graph queries, name resolution, tangle and partial reads,
//! and blob operations. Everything here is a thin, typed layer over the
//! stores and indexes.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;

use scuttle_codec::{Content, ContentUnboxer, Message};
use scuttle_index::AboutInfo;
use scuttle_private::box1;
use scuttle_replicate::{BlobFetcher, WantProc};
use scuttle_store::multilog::{private_addr, tangle_addr, type_addr};
use scuttle_store::LogEntry;
use scuttle_types::{BlobRef, FeedRef, MessageRef, ReceiveSeq, Result, ScuttleError};

use crate::node::Node;

/// One row of `replicate.upto`: a feed and its stored tip sequence.
#[derive(Clone, Debug, Serialize)]
pub struct UptoInfo {
    /// The feed.
    pub id: FeedRef,
    /// Latest stored author sequence.
    pub sequence: u64,
}

impl Node {
    // -----------------------------------------------------------------
    // Log and feed reads
    // -----------------------------------------------------------------

    /// `get`: one message by reference.
    pub fn get(&self, key: &MessageRef) -> Result<Message> {
        self.feeds.get(key)
    }

    /// `createLogStream`: receive-log entries from `from`, capped at
    /// `limit`, nulled slots skipped.
    pub fn log_stream(&self, from: ReceiveSeq, limit: usize) -> Result<Vec<(ReceiveSeq, Message)>> {
        let last = match self.log.last_seq() {
            Some(last) => last,
            None => return Ok(Vec::new()),
        };
        let mut out = Vec::new();
        for (seq, entry) in self.log.range(from.max(1), last)? {
            if let LogEntry::Message(msg) = entry {
                out.push((seq, *msg));
                if out.len() >= limit {
                    break;
                }
            }
        }
        Ok(out)
    }

    /// `createFeedStream` / `createUserStream` / `getFeed`: one feed in
    /// author-sequence order from `from_seq`.
    pub fn feed_stream(&self, feed: &FeedRef, from_seq: u64) -> Result<Vec<Message>> {
        self.feeds.read_feed(feed, from_seq)
    }

    /// `createSequenceStream`: the current receive-log high-water mark.
    pub fn last_receive_seq(&self) -> Option<ReceiveSeq> {
        self.log.last_seq()
    }

    /// `getFeedReverse`: newest first.
    pub fn feed_stream_reverse(&self, feed: &FeedRef, limit: usize) -> Result<Vec<Message>> {
        let mut msgs = self.feeds.read_feed(feed, 1)?;
        msgs.reverse();
        msgs.truncate(limit);
        Ok(msgs)
    }

    /// `replicate.upto`: every stored feed with its tip sequence.
    pub fn replicate_upto(&self) -> Result<Vec<UptoInfo>> {
        let mut out = Vec::new();
        for feed in self.feeds.known_feeds()? {
            if let Some(tip) = self.feeds.tip(&feed)? {
                out.push(UptoInfo {
                    id: feed,
                    sequence: tip.sequence,
                });
            }
        }
        out.sort_by_key(|u| u.id);
        Ok(out)
    }

    /// Rewrites a feed's entries to the nulled sentinel.
    pub async fn null_feed(&self, feed: &FeedRef) -> Result<()> {
        self.feeds.null_feed(feed).await
    }

    // -----------------------------------------------------------------
    // Publishing
    // -----------------------------------------------------------------

    /// `publish`: appends a cleartext (or pre-boxed) content value to
    /// the own feed.
    pub async fn publish(&self, content: &Value) -> Result<MessageRef> {
        let content = Content::classify(content)?;
        self.publish.publish(&content).await
    }

    /// Publishes a box1 private message to up to seven recipients.
    pub async fn publish_private(
        &self,
        content: &Value,
        recipients: &[FeedRef],
    ) -> Result<MessageRef> {
        let plaintext = serde_json::to_vec(content).map_err(|e| ScuttleError::MalformedContent {
            reason: format!("private content encoding failed: {e}"),
        })?;
        let boxed = box1::encrypt(&plaintext, recipients)?;
        self.publish.publish(&Content::Box1(boxed)).await
    }

    /// `private.read`: every stored message the local key unboxes, in
    /// receive order, paired with its decrypted content.
    pub fn private_read(&self) -> Result<Vec<(Message, Value)>> {
        let unboxer: Arc<dyn ContentUnboxer> = self.groups.clone();
        let mut rows: Vec<(ReceiveSeq, Message, Value)> = Vec::new();

        for scheme in ["box1", "box2"] {
            let addr = private_addr(scheme, &self.keypair.id());
            for seq in self.privates.read_from(&addr, 0)? {
                let Some(LogEntry::Message(msg)) = self.log.get(seq)? else {
                    continue;
                };
                let Some(plain) = unboxer.unbox(&msg) else {
                    continue;
                };
                let value: Value =
                    serde_json::from_slice(&plain).map_err(|e| ScuttleError::MalformedContent {
                        reason: format!("decrypted content is not JSON: {e}"),
                    })?;
                rows.push((seq, *msg, value));
            }
        }
        rows.sort_by_key(|(seq, _, _)| *seq);
        Ok(rows.into_iter().map(|(_, msg, value)| (msg, value)).collect())
    }

    // -----------------------------------------------------------------
    // Graph queries
    // -----------------------------------------------------------------

    /// `friends.isFollowing`.
    pub fn is_following(&self, source: &FeedRef, dest: &FeedRef) -> Result<bool> {
        Ok(self.graph.build()?.is_following(source, dest))
    }

    /// `friends.isBlocking`.
    pub fn is_blocking(&self, source: &FeedRef, dest: &FeedRef) -> Result<bool> {
        Ok(self.graph.build()?.is_blocking(source, dest))
    }

    /// `friends.hops`: feeds within `max` hops of `start` (the local
    /// identity when `start` is `None`), sorted for stable output.
    pub fn hops(&self, start: Option<FeedRef>, max: u32) -> Result<Vec<FeedRef>> {
        let start = start.unwrap_or_else(|| self.keypair.id());
        let mut out: Vec<FeedRef> = self.graph.hops(&start, max)?.into_iter().collect();
        out.sort();
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Names
    // -----------------------------------------------------------------

    /// `names.get`: resolved names for every known feed.
    pub fn names_get(&self) -> Result<Vec<(FeedRef, String)>> {
        let mut out = Vec::new();
        for feed in self.feeds.known_feeds()? {
            if let Some(name) = self.abouts.get_signifier(&feed, "name")? {
                out.push((feed, name));
            }
        }
        Ok(out)
    }

    /// `names.getSignifier`: the display name for one feed.
    pub fn get_signifier(&self, feed: &FeedRef) -> Result<Option<String>> {
        self.abouts.get_signifier(feed, "name")
    }

    /// `names.getImageFor`: the avatar blob ref for one feed.
    pub fn get_image_for(&self, feed: &FeedRef) -> Result<Option<BlobRef>> {
        match self.abouts.get_signifier(feed, "image")? {
            Some(s) => Ok(s.parse().ok()),
            None => Ok(None),
        }
    }

    /// Full about aggregation for one feed.
    pub fn about_info(&self, feed: &FeedRef) -> Result<AboutInfo> {
        self.abouts.collected_for(feed)
    }

    // -----------------------------------------------------------------
    // Tangles and partial replication
    // -----------------------------------------------------------------

    /// `tangles` / `getTangle`: members of one tangle in receive order.
    pub fn tangle_read(&self, root: &MessageRef) -> Result<Vec<Message>> {
        self.read_sublog(&self.tangles, &tangle_addr(root))
    }

    /// `getMessagesOfType`: by-type sublog projection.
    pub fn messages_of_type(&self, content_type: &str) -> Result<Vec<Message>> {
        self.read_sublog(&self.by_type, &type_addr(content_type))
    }

    fn read_sublog(
        &self,
        multilog: &scuttle_store::Multilog,
        addr: &[u8],
    ) -> Result<Vec<Message>> {
        let mut out = Vec::new();
        for seq in multilog.read_from(addr, 0)? {
            if let Some(LogEntry::Message(msg)) = self.log.get(seq)? {
                out.push(*msg);
            }
        }
        Ok(out)
    }

    // -----------------------------------------------------------------
    // Blobs
    // -----------------------------------------------------------------

    /// `blobs.add`.
    pub fn blobs_add(&self, bytes: &[u8]) -> Result<BlobRef> {
        self.blobs.put_bytes(bytes)
    }

    /// `blobs.get`.
    pub fn blobs_get(&self, blob: &BlobRef) -> Result<Vec<u8>> {
        self.blobs.get(blob)
    }

    /// `blobs.has`.
    pub fn blobs_has(&self, blob: &BlobRef) -> bool {
        self.blobs.has(blob)
    }

    /// `blobs.size`.
    pub fn blobs_size(&self, blob: &BlobRef) -> Result<u64> {
        self.blobs.size(blob)
    }

    /// `blobs.rm`.
    pub fn blobs_rm(&self, blob: &BlobRef) -> Result<()> {
        self.blobs.delete(blob)
    }

    /// `blobs.ls`.
    pub fn blobs_ls(&self) -> Result<Vec<BlobRef>> {
        self.blobs.list()
    }

    /// `blobs.want`.
    pub fn blobs_want(&self, blob: &BlobRef) -> Result<()> {
        self.want_manager.want(blob)
    }

    /// `blobs.createWants`: attaches the want exchange for one peer.
    pub async fn create_wants(
        &self,
        out: tokio::sync::mpsc::Sender<scuttle_replicate::WantMsg>,
        fetcher: Arc<dyn BlobFetcher>,
    ) -> Arc<WantProc> {
        WantProc::attach(
            self.want_manager.clone(),
            out,
            fetcher,
            self.shutdown_rx.clone(),
        )
        .await
    }

    // -----------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------

    /// `status`: a small operational snapshot.
    pub fn status(&self) -> Result<Value> {
        Ok(serde_json::json!({
            "id": self.whoami().to_string(),
            "state": self.state().to_string(),
            "receiveSeq": self.log.last_seq().unwrap_or(0),
            "feeds": self.feeds.known_feeds()?.len(),
            "blobsWanted": !self.want_manager.current().is_empty(),
        }))
    }
}
