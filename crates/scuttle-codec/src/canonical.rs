//! Canonical byte form of classic messages.
//!
//! Classic signing and hashing require the exact output of the legacy
//! scripting engine's `JSON.stringify(value, null, 2)`:
//!
//! - insertion order preserved at every object depth,
//! - two-space indentation, one space after each colon,
//! - integral doubles printed without a decimal point (`-0` prints `0`),
//!   non-integral doubles as their shortest round-trippable decimal,
//! - control characters escaped (`\b \t \n \f \r`, `\u00xx` otherwise),
//!   non-ASCII code points passed through verbatim.
//!
//! Hashing additionally squashes the canonical string through the
//! engine's internal "binary" encoding: every UTF-16 code unit is
//! truncated to its low byte ([`v8_binary`]).
//!
//! The output is frozen by the conformance corpus in
//! `tests/legacy_corpus.rs`; do not change formatting behavior without
//! extending the corpus.

use serde_json::Value;

use scuttle_types::{Result, ScuttleError};

/// Largest double the legacy engine prints in positional notation.
const POSITIONAL_LIMIT: f64 = 1e21;

/// Parses classic message bytes into a JSON value, preserving key order.
pub fn parse(raw: &[u8]) -> Result<Value> {
    serde_json::from_slice(raw).map_err(|e| ScuttleError::MalformedContent {
        reason: format!("invalid message JSON: {e}"),
    })
}

/// Serializes `value` into the canonical pretty-printed form.
pub fn encode(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value, 0);
    out
}

/// Maps the canonical string's UTF-16 code units to their low bytes.
///
/// This is the byte stream the message hash is computed over.
pub fn v8_binary(s: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(s.len());
    for unit in s.encode_utf16() {
        out.push((unit & 0xFF) as u8);
    }
    out
}

fn push_indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push_str("  ");
    }
}

fn write_value(out: &mut String, value: &Value, depth: usize) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(true) => out.push_str("true"),
        Value::Bool(false) => out.push_str("false"),
        Value::Number(n) => write_number(out, n),
        Value::String(s) => write_string(out, s),
        Value::Array(items) => {
            if items.is_empty() {
                out.push_str("[]");
                return;
            }
            out.push_str("[\n");
            for (i, item) in items.iter().enumerate() {
                push_indent(out, depth + 1);
                write_value(out, item, depth + 1);
                if i + 1 < items.len() {
                    out.push(',');
                }
                out.push('\n');
            }
            push_indent(out, depth);
            out.push(']');
        }
        Value::Object(map) => {
            if map.is_empty() {
                out.push_str("{}");
                return;
            }
            out.push_str("{\n");
            let last = map.len() - 1;
            for (i, (key, val)) in map.iter().enumerate() {
                push_indent(out, depth + 1);
                write_string(out, key);
                out.push_str(": ");
                write_value(out, val, depth + 1);
                if i != last {
                    out.push(',');
                }
                out.push('\n');
            }
            push_indent(out, depth);
            out.push('}');
        }
    }
}

fn write_number(out: &mut String, n: &serde_json::Number) {
    if let Some(u) = n.as_u64() {
        out.push_str(&u.to_string());
    } else if let Some(i) = n.as_i64() {
        out.push_str(&i.to_string());
    } else if let Some(f) = n.as_f64() {
        write_float(out, f);
    } else {
        // serde_json numbers are always one of the above.
        out.push_str("null");
    }
}

fn write_float(out: &mut String, f: f64) {
    if f == 0.0 {
        // covers -0
        out.push('0');
        return;
    }
    if f.fract() == 0.0 && f.abs() < POSITIONAL_LIMIT {
        out.push_str(&format!("{}", f as i128));
        return;
    }
    let mut buf = ryu::Buffer::new();
    out.push_str(buf.format(f));
}

fn write_string(out: &mut String, s: &str) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\u{08}' => out.push_str("\\b"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\u{0C}' => out.push_str("\\f"),
            '\r' => out.push_str("\\r"),
            c if (c as u32) < 0x20 => {
                out.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => out.push(c),
        }
    }
    out.push('"');
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
