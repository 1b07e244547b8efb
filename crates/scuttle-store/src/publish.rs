//! The publish log: appends to the node's own feed.
//!
//! Resolves the own tip, signs the content in the key pair's feed
//! format (honoring the configured signing HMAC), stamps the current
//! time, and pushes the result through the regular ingestion path so
//! publishes and replicated appends share one chain of custody.

use std::sync::Arc;

use scuttle_codec::{gabby, legacy, Content, Message};
use scuttle_crypto::signing::KeyPair;
use scuttle_types::{FeedAlgo, MessageRef, Result};

use crate::feeds::FeedStore;

/// Appends signed messages to the local feed.
pub struct PublishLog {
    keypair: Arc<KeyPair>,
    feeds: Arc<FeedStore>,
    hmac: Option<[u8; 32]>,
}

impl PublishLog {
    /// Creates a publish log for the local identity.
    pub fn new(keypair: Arc<KeyPair>, feeds: Arc<FeedStore>, hmac: Option<[u8; 32]>) -> Self {
        Self { keypair, feeds, hmac }
    }

    /// The local identity.
    pub fn id(&self) -> scuttle_types::FeedRef {
        self.keypair.id()
    }

    /// Signs and appends `content`, returning the new message reference.
    pub async fn publish(&self, content: &Content) -> Result<MessageRef> {
        let msg = self.sign(content)?;
        self.feeds.append_message(&msg).await?;
        Ok(msg.key())
    }

    /// Signs and appends, returning the whole message.
    pub async fn publish_message(&self, content: &Content) -> Result<Message> {
        let msg = self.sign(content)?;
        self.feeds.append_message(&msg).await?;
        Ok(msg)
    }

    fn sign(&self, content: &Content) -> Result<Message> {
        let tip = self.feeds.tip(&self.keypair.id())?;
        let now_ms = chrono::Utc::now().timestamp_millis() as f64;
        match self.keypair.id().algo() {
            FeedAlgo::Classic => {
                legacy::sign(&self.keypair, tip.as_ref(), now_ms, content, self.hmac.as_ref())
            }
            FeedAlgo::Gabby => {
                gabby::sign(&self.keypair, tip.as_ref(), now_ms, content, self.hmac.as_ref())
            }
        }
    }
}
