//! Published events.
//!
//! An `Event` is created by `EventBus::publish` and lives only while the relay
//! matches and delivers it. It is never persisted.
//!
//! Notes on fields:
//! - `topic`: `service/event_name` string used for routing
//! - `payload`: JSON object; insertion order is preserved on the wire
//! - `published_at`: set by the bus at publish time

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

/// Event payload: an ordered JSON object.
pub type Payload = Map<String, Value>;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: Payload,
    pub published_at: DateTime<Utc>,
}

impl Event {
    pub fn new(topic: impl Into<String>, payload: Payload) -> Self {
        Self {
            topic: topic.into(),
            payload,
            published_at: Utc::now(),
        }
    }
}

/// Build a `Payload` from a `serde_json::json!` object literal.
///
/// Non-object values produce an empty payload.
pub fn payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}
