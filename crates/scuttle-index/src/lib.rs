//! Derived indexes over the receive log.
//!
//! A sink index consumes `(receive_seq, entry)` pairs in strict order,
//! updates its derived state, and persists how far it has processed.
//! The [`runner::IndexRunner`] drives every registered sink from its
//! cursor, catching up from disk and then tailing live appends. A sink
//! can also be attached *indirectly* to a by-type sublog so it only
//! sees a filtered projection (contacts, abouts, group membership).

pub mod about;
pub mod by_type;
pub mod contacts;
pub mod cursor;
pub mod group_members;
pub mod privates;
pub mod runner;
pub mod tangles;

pub use about::{AboutInfo, AboutSink, AboutStore, Signifier};
pub use by_type::ByTypeSink;
pub use contacts::{ContactsSink, ContactsStore, EdgeKind};
pub use cursor::Cursor;
pub use group_members::GroupMembersSink;
pub use privates::PrivatesSink;
pub use runner::{IndexRunner, SinkIndex};
pub use tangles::TanglesSink;

use std::sync::Arc;

use scuttle_codec::{Content, ContentUnboxer, Message};

/// Resolves a message's content to a cleartext JSON value, unboxing
/// envelopes with the local key material.
///
/// Returns `None` for envelopes no local key opens and for unboxed
/// payloads that are not JSON objects.
pub(crate) fn content_value(
    msg: &Message,
    unboxer: &Arc<dyn ContentUnboxer>,
) -> Option<serde_json::Value> {
    match msg.content() {
        Content::Clear(value) => Some(value.clone()),
        Content::Box1(_) | Content::Box2(_) => {
            let plain = unboxer.unbox(msg)?;
            serde_json::from_slice(&plain).ok()
        }
    }
}
