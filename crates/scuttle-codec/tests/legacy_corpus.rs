//! Frozen conformance corpus for the classic canonicalizer.
//!
//! Every entry is a message (or message fragment) already in canonical
//! form; parsing and re-encoding must reproduce the input byte for
//! byte. These strings are frozen: a formatting change that breaks
//! them breaks compatibility with every existing classic feed.

use scuttle_codec::canonical::{encode, parse, v8_binary};
use scuttle_crypto::hash::sha256;

fn assert_canonical_identity(frozen: &str) {
    let value = parse(frozen.as_bytes()).expect("corpus entry must parse");
    let reencoded = encode(&value);
    assert_eq!(reencoded, frozen, "canonicalize ∘ parse must be identity");
}

#[test]
fn corpus_first_network_message() {
    let frozen = [
        "{",
        "  \"previous\": null,",
        "  \"author\": \"@U5GvOKP/YUza9k53DSXxT0mk3PIrnyAmessvIfyPvPw=.ed25519\",",
        "  \"sequence\": 1,",
        "  \"timestamp\": 1449006842739,",
        "  \"hash\": \"sha256\",",
        "  \"content\": {",
        "    \"type\": \"post\",",
        "    \"text\": \"This is the first post!\"",
        "  },",
        "  \"signature\": \"QYOR/zU9dxE1aKBaxc3C0DJ4gRyZtlMfPLt+CGJcY73sv5abKKKxr1SqhOvnm8TY784VHE8kZHCD8RdzFl1tBA==.sig.ed25519\"",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn corpus_float_timestamp() {
    let frozen = [
        "{",
        "  \"previous\": \"%XphMUkWQtomKjXQvFGfsGYpt69sgEY7Y4Vou9hEuJhs=.sha256\",",
        "  \"author\": \"@FCX/tsDLpubCPKKfIrw4gc+SQkHcaD17s7GI6i/ziWY=.ed25519\",",
        "  \"sequence\": 2,",
        "  \"timestamp\": 1453901022.525,",
        "  \"hash\": \"sha256\",",
        "  \"content\": {",
        "    \"type\": \"test\",",
        "    \"count\": 0.5",
        "  },",
        "  \"signature\": \"AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA==.sig.ed25519\"",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn corpus_nested_arrays_and_mentions() {
    let frozen = [
        "{",
        "  \"type\": \"post\",",
        "  \"text\": \"with refs\",",
        "  \"mentions\": [",
        "    {",
        "      \"link\": \"&uaGieSQDJcHfUp6hjIcIq55GoZh4Ug7tNmgaohoxrpw=.sha256\",",
        "      \"name\": \"file.txt\"",
        "    },",
        "    {",
        "      \"link\": \"@FCX/tsDLpubCPKKfIrw4gc+SQkHcaD17s7GI6i/ziWY=.ed25519\"",
        "    }",
        "  ],",
        "  \"channel\": \"rust\"",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn corpus_empty_containers_and_booleans() {
    let frozen = [
        "{",
        "  \"type\": \"contact\",",
        "  \"contact\": \"@U5GvOKP/YUza9k53DSXxT0mk3PIrnyAmessvIfyPvPw=.ed25519\",",
        "  \"following\": true,",
        "  \"blocking\": false,",
        "  \"extra\": {},",
        "  \"tags\": []",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn corpus_unicode_text_untouched() {
    let frozen = [
        "{",
        "  \"type\": \"about\",",
        "  \"about\": \"@U5GvOKP/YUza9k53DSXxT0mk3PIrnyAmessvIfyPvPw=.ed25519\",",
        "  \"name\": \"søren — 日本語テスト\"",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn corpus_escaped_controls() {
    let frozen = [
        "{",
        "  \"type\": \"post\",",
        "  \"text\": \"line one\\nline\\ttwo \\\"quoted\\\" back\\\\slash\"",
        "}",
    ]
    .join("\n");
    assert_canonical_identity(&frozen);
}

#[test]
fn hashing_transform_is_stable_on_unicode() {
    // The hash input is the latin1 squash of the canonical string, so
    // multi-byte characters must hash identically on every run and
    // differently from their ASCII lookalikes.
    let frozen = "{\n  \"name\": \"søren\"\n}";
    let a = sha256(&v8_binary(frozen));
    let b = sha256(&v8_binary(frozen));
    assert_eq!(a, b);

    let ascii = "{\n  \"name\": \"soren\"\n}";
    assert_ne!(a, sha256(&v8_binary(ascii)));
}

#[test]
fn reencoding_normalizes_compact_input() {
    // Compact (non-canonical) input must normalize to the frozen form.
    let compact = r#"{"type":"post","text":"hi","n":7}"#;
    let canonical = "{\n  \"type\": \"post\",\n  \"text\": \"hi\",\n  \"n\": 7\n}";
    let value = parse(compact.as_bytes()).expect("compact input must parse");
    assert_eq!(encode(&value), canonical);
}
