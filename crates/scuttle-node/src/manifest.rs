//! The RPC method registry and the `manifest` blob.
//!
//! Clients fetch the manifest once and use it for dispatch, so the
//! table below is part of the wire contract: every supported method
//! appears with its call kind.

use serde_json::{json, Value};

/// How a method's request/response is shaped on the wire.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum MethodKind {
    /// One request, one reply.
    Async,
    /// One request, one immediate reply.
    Sync,
    /// One request, a stream of replies.
    Source,
    /// Bidirectional stream.
    Duplex,
}

impl MethodKind {
    /// The manifest string for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Async => "async",
            Self::Sync => "sync",
            Self::Source => "source",
            Self::Duplex => "duplex",
        }
    }
}

/// Every supported method with its kind, dotted for namespaces.
pub const RPC_METHODS: &[(&str, MethodKind)] = &[
    ("manifest", MethodKind::Sync),
    ("whoami", MethodKind::Sync),
    ("get", MethodKind::Async),
    ("publish", MethodKind::Async),
    ("createHistoryStream", MethodKind::Source),
    ("createUserStream", MethodKind::Source),
    ("createFeedStream", MethodKind::Source),
    ("createLogStream", MethodKind::Source),
    ("createSequenceStream", MethodKind::Source),
    ("partialReplication.getFeed", MethodKind::Source),
    ("partialReplication.getFeedReverse", MethodKind::Source),
    ("partialReplication.getTangle", MethodKind::Async),
    ("partialReplication.getMessagesOfType", MethodKind::Source),
    ("private.read", MethodKind::Source),
    ("tangles", MethodKind::Source),
    ("names.get", MethodKind::Async),
    ("names.getSignifier", MethodKind::Async),
    ("names.getImageFor", MethodKind::Async),
    ("friends.isFollowing", MethodKind::Async),
    ("friends.isBlocking", MethodKind::Async),
    ("friends.hops", MethodKind::Source),
    ("replicate.upto", MethodKind::Source),
    ("groups.create", MethodKind::Async),
    ("groups.invite", MethodKind::Async),
    ("groups.publishTo", MethodKind::Async),
    ("blobs.get", MethodKind::Source),
    ("blobs.add", MethodKind::Sync),
    ("blobs.rm", MethodKind::Async),
    ("blobs.ls", MethodKind::Source),
    ("blobs.has", MethodKind::Async),
    ("blobs.size", MethodKind::Async),
    ("blobs.want", MethodKind::Async),
    ("blobs.createWants", MethodKind::Source),
    ("status", MethodKind::Sync),
];

/// Builds the nested manifest object returned by the `manifest` call.
pub fn manifest_json() -> Value {
    let mut root = serde_json::Map::new();
    for (method, kind) in RPC_METHODS {
        let mut parts = method.split('.');
        let head = parts.next().unwrap_or(method);
        match parts.next() {
            None => {
                root.insert(head.to_string(), json!(kind.as_str()));
            }
            Some(tail) => {
                let entry = root
                    .entry(head.to_string())
                    .or_insert_with(|| Value::Object(serde_json::Map::new()));
                if let Value::Object(obj) = entry {
                    obj.insert(tail.to_string(), json!(kind.as_str()));
                }
            }
        }
    }
    Value::Object(root)
}

/// Looks a method's kind up by its dotted name.
pub fn method_kind(name: &str) -> Option<MethodKind> {
    RPC_METHODS
        .iter()
        .find(|(m, _)| *m == name)
        .map(|(_, k)| *k)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_nests_namespaces() {
        let m = manifest_json();
        assert_eq!(m["whoami"], "sync");
        assert_eq!(m["createHistoryStream"], "source");
        assert_eq!(m["friends"]["isFollowing"], "async");
        assert_eq!(m["blobs"]["createWants"], "source");
        assert_eq!(m["partialReplication"]["getFeed"], "source");
    }

    #[test]
    fn every_method_resolves() {
        for (name, kind) in RPC_METHODS {
            assert_eq!(method_kind(name), Some(*kind));
        }
        assert_eq!(method_kind("no.such.method"), None);
    }

    #[test]
    fn replication_surface_is_present() {
        let m = manifest_json();
        assert_eq!(m["replicate"]["upto"], "source");
        assert_eq!(m["private"]["read"], "source");
        assert_eq!(m["groups"]["create"], "async");
    }
}
