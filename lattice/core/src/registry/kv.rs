// Copyright (c) Mysten Labs, Inc.
// SPDX-License-Identifier: Apache-2.0

//! Logical request/response shapes of the registry's JSON API. The server is
//! lenient about integer width and routinely encodes numbers as strings, so
//! every unpack helper here accepts both.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{Map, Value};

/// Sentinel range-end: callers pass this to request "the key's lexicographic
/// successor", turning a key into a prefix scan.
pub const RANGE_END_SUCCESSOR: &[u8] = b"+1";

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResponseHeader {
    pub cluster_id: u64,
    pub member_id: u64,
    pub revision: i64,
    pub raft_term: u64,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct KeyValue {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub create_revision: i64,
    pub mod_revision: i64,
    pub version: i64,
    pub lease: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WatchEventKind {
    Put,
    Delete,
}

#[derive(Clone, Debug)]
pub struct WatchEvent {
    pub kind: WatchEventKind,
    pub kv: KeyValue,
    pub prev_kv: Option<KeyValue>,
}

/// One logical message on a watch stream, or the synthetic batch produced
/// from the initial range snapshot (`snapshot == true`, all events PUT).
#[derive(Clone, Debug, Default)]
pub struct WatchBatch {
    pub watch_id: i64,
    pub created: bool,
    pub canceled: bool,
    pub compact_revision: i64,
    pub snapshot: bool,
    pub cancel_reason: String,
    pub events: Vec<WatchEvent>,
}

impl WatchBatch {
    pub fn new_snapshot(events: Vec<WatchEvent>) -> WatchBatch {
        WatchBatch {
            snapshot: true,
            events,
            ..WatchBatch::default()
        }
    }
}

pub fn unpack_i64(value: &Value, key: &str) -> i64 {
    match value.get(key) {
        Some(Value::Number(number)) => number.as_i64().unwrap_or_default(),
        Some(Value::String(text)) => text.parse().unwrap_or_default(),
        _ => 0,
    }
}

pub fn unpack_u64(value: &Value, key: &str) -> u64 {
    match value.get(key) {
        Some(Value::Number(number)) => number.as_u64().unwrap_or_default(),
        Some(Value::String(text)) => text.parse().unwrap_or_default(),
        _ => 0,
    }
}

pub fn unpack_bool(value: &Value, key: &str) -> bool {
    match value.get(key) {
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_i64().unwrap_or_default() != 0,
        Some(Value::String(text)) => text.parse::<i64>().map(|v| v != 0).unwrap_or(false),
        _ => false,
    }
}

pub fn unpack_string(value: &Value, key: &str) -> Option<String> {
    let field = value.get(key)?;
    Some(match field {
        Value::String(text) => text.clone(),
        Value::Bool(flag) => flag.to_string(),
        Value::Number(number) => number.to_string(),
        Value::Null => "null".to_string(),
        Value::Object(_) | Value::Array(_) => return None,
    })
}

pub fn pack_base64(target: &mut Map<String, Value>, key: &str, data: &[u8]) {
    target.insert(key.to_string(), Value::String(BASE64.encode(data)));
}

pub fn unpack_base64(value: &Value, key: &str) -> Option<Vec<u8>> {
    let Some(Value::String(encoded)) = value.get(key) else {
        return None;
    };
    BASE64.decode(encoded).ok()
}

pub fn unpack_header(value: &Value) -> ResponseHeader {
    ResponseHeader {
        cluster_id: unpack_u64(value, "cluster_id"),
        member_id: unpack_u64(value, "member_id"),
        revision: unpack_i64(value, "revision"),
        raft_term: unpack_u64(value, "raft_term"),
    }
}

pub fn unpack_key_value(value: &Value) -> KeyValue {
    KeyValue {
        key: unpack_base64(value, "key").unwrap_or_default(),
        value: unpack_base64(value, "value").unwrap_or_default(),
        create_revision: unpack_i64(value, "create_revision"),
        mod_revision: unpack_i64(value, "mod_revision"),
        version: unpack_i64(value, "version"),
        lease: unpack_i64(value, "lease"),
    }
}

/// Lexicographic successor of `key`: increment the last byte, carrying by
/// stripping trailing `0xFF` bytes. An all-`0xFF` key has no successor and
/// yields an empty vec, which `pack_key_range` omits; callers treating the
/// range as "to the end of the keyspace" must pass an explicit bound instead.
pub fn lexicographic_successor(key: &[u8]) -> Vec<u8> {
    let mut successor = key.to_vec();
    while let Some(last) = successor.last_mut() {
        if *last == 0xff {
            successor.pop();
        } else {
            *last += 1;
            return successor;
        }
    }
    successor
}

/// Writes `key` and `range_end` into a request object, resolving the `"+1"`
/// sentinel to the key's lexicographic successor. Empty fields are omitted.
pub fn pack_key_range(target: &mut Map<String, Value>, key: &[u8], range_end: &[u8]) {
    let range_end = if range_end == RANGE_END_SUCCESSOR {
        lexicographic_successor(key)
    } else {
        range_end.to_vec()
    };

    if !key.is_empty() {
        pack_base64(target, "key", key);
    }
    if !range_end.is_empty() {
        pack_base64(target, "range_end", &range_end);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn successor_increments_last_byte() {
        assert_eq!(lexicographic_successor(b"/lattice/by_id/"), b"/lattice/by_id0");
        assert_eq!(lexicographic_successor(b"a"), b"b");
        assert!(lexicographic_successor(b"").is_empty());
    }

    #[test]
    fn successor_carries_over_trailing_ff() {
        assert_eq!(lexicographic_successor(&[b'a', 0xff, 0xff]), vec![b'b']);
    }

    #[test]
    fn successor_of_all_ff_is_empty() {
        assert!(lexicographic_successor(&[0xff, 0xff]).is_empty());

        let mut target = Map::new();
        pack_key_range(&mut target, &[0xff, 0xff], RANGE_END_SUCCESSOR);
        assert!(target.contains_key("key"));
        assert!(!target.contains_key("range_end"));
    }

    #[test]
    fn key_range_resolves_sentinel() {
        let mut target = Map::new();
        pack_key_range(&mut target, b"/svc/a/", RANGE_END_SUCCESSOR);
        let range_end = unpack_base64(&Value::Object(target), "range_end").unwrap();
        assert_eq!(range_end, b"/svc/a0");
    }

    #[test]
    fn key_range_passes_literal_range_end() {
        let mut target = Map::new();
        pack_key_range(&mut target, b"a", b"z");
        let value = Value::Object(target);
        assert_eq!(unpack_base64(&value, "key").unwrap(), b"a");
        assert_eq!(unpack_base64(&value, "range_end").unwrap(), b"z");
    }

    #[test]
    fn unpack_accepts_strings_for_numbers() {
        let value = json!({
            "revision": "42",
            "raft_term": 7,
            "created": "1",
            "canceled": false,
        });
        assert_eq!(unpack_i64(&value, "revision"), 42);
        assert_eq!(unpack_u64(&value, "raft_term"), 7);
        assert!(unpack_bool(&value, "created"));
        assert!(!unpack_bool(&value, "canceled"));
        assert_eq!(unpack_i64(&value, "missing"), 0);
    }

    #[test]
    fn key_value_round_trip() {
        let mut target = Map::new();
        pack_base64(&mut target, "key", b"/lattice/by_id/2a");
        pack_base64(&mut target, "value", b"{\"id\":42}");
        target.insert("mod_revision".to_string(), json!("9"));
        let kv = unpack_key_value(&Value::Object(target));
        assert_eq!(kv.key, b"/lattice/by_id/2a");
        assert_eq!(kv.value, b"{\"id\":42}");
        assert_eq!(kv.mod_revision, 9);
    }
}
