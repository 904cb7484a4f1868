//! Clock, id and response-envelope helpers.

use serde_json::{Map, Value as JsonValue};
use std::time::{SystemTime, UNIX_EPOCH};
use ulid::Ulid;

pub const ENVELOPE_VERSION: &str = "1.0.0";

const RESERVED_ENVELOPE_KEYS: [&str; 5] = ["envelope_version", "ts", "event_id", "cmd", "status"];

/// Unix-epoch seconds with a `Z` suffix (e.g. `1771220592Z`).
pub fn now_epoch_z() -> String {
    epoch_z_from_millis(now_epoch_millis())
}

/// Unix-epoch milliseconds. Lease arithmetic is done in this unit.
pub fn now_epoch_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn epoch_z_from_millis(ms: u64) -> String {
    format!("{}Z", ms / 1000)
}

/// Event ids and claim tokens. Lexically sortable by creation time.
pub fn new_event_id() -> String {
    Ulid::new().to_string()
}

/// Wraps a command result for `--format json`.
///
/// Object bodies are flattened into the envelope (reserved keys win); any
/// other body is placed under `data`.
pub fn command_envelope(cmd: &str, status: &str, body: JsonValue) -> JsonValue {
    let mut envelope = Map::new();
    envelope.insert("envelope_version".into(), ENVELOPE_VERSION.into());
    envelope.insert("ts".into(), now_epoch_z().into());
    envelope.insert("event_id".into(), new_event_id().into());
    envelope.insert("cmd".into(), cmd.into());
    envelope.insert("status".into(), status.into());
    match body {
        JsonValue::Object(fields) => {
            for (key, value) in fields {
                if !RESERVED_ENVELOPE_KEYS.contains(&key.as_str()) {
                    envelope.insert(key, value);
                }
            }
        }
        JsonValue::Null => {}
        other => {
            envelope.insert("data".into(), other);
        }
    }
    JsonValue::Object(envelope)
}
