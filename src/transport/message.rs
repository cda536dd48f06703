//! Wire frames
//!
//! JSON text frames exchanged over the WebSocket. Client frames are tagged by
//! `action`, server frames by `type`.
//!
//! Every field of a client frame is optional at the serde level so that a
//! frame which names a known action but omits a field can be answered with a
//! precise error instead of a generic parse failure. The router enforces
//! presence.

use serde::{Deserialize, Serialize};

use crate::broker::message::{Event, Payload};

/// Text of the synthetic frame that replaces dropped backlog.
pub const BACKLOG_DROPPED: &str = "backlog dropped";

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        topic: Option<String>,
    },
    Unsubscribe {
        topic: Option<String>,
    },
    Command {
        service: Option<String>,
        command: Option<String>,
        params: Option<Payload>,
    },
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Event { topic: String, payload: Payload },
    Error { message: String },
}

impl ServerMessage {
    pub fn event(event: &Event) -> Self {
        ServerMessage::Event {
            topic: event.topic.clone(),
            payload: event.payload.clone(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }

    pub fn backlog_dropped() -> Self {
        Self::error(BACKLOG_DROPPED)
    }

    /// Serialize to the JSON text carried in a WebSocket frame.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
