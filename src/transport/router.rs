//! Command router
//!
//! Turns inbound text frames into relay operations or service commands.
//! Validation always completes before anything is dispatched: a frame is
//! either fully applied or answered with a single error and ignored.
//!
//! Service commands are checked against a static whitelist. Passing the
//! whitelist only means the name is known; the call still needs a handler
//! registered with `CommandRouter::with_service`. Services with no in-process
//! backend are usually served by `BusServiceHandler`, which forwards the
//! command onto the bus for whichever service owns it.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::broker::{EventBus, Payload, RelayHandle};
use crate::broker::topic::Pattern;
use crate::transport::message::ClientMessage;
use crate::utils::error::{CommandError, ProtocolError};

/// Services and the commands each one accepts.
pub const SERVICE_COMMANDS: &[(&str, &[&str])] = &[
    (
        "AndroidAuto",
        &[
            "start_discovery",
            "stop_discovery",
            "connect_device",
            "disconnect",
            "retry_connection",
            "start_projection",
            "stop_projection",
        ],
    ),
    ("Audio", &["set_route", "set_volume", "mute", "unmute"]),
    ("Media", &["play", "pause", "stop", "next", "previous"]),
    ("Bluetooth", &["start_pairing", "disconnect_device"]),
    ("Preferences", &["get", "set"]),
];

/// Backend side of a whitelisted service.
///
/// Handlers only dispatch; any outcome is published on the bus later.
pub trait ServiceHandler: Send + Sync {
    fn handle(&self, command: &str, params: &Payload) -> Result<(), CommandError>;
}

/// Forwards commands for one service onto the bus as
/// `<service_topic>/<command>_requested`, carrying the command's params.
///
/// `AndroidAuto` becomes `android_auto`, `Audio` becomes `audio`.
#[derive(Debug, Clone)]
pub struct BusServiceHandler {
    topic_prefix: String,
    bus: EventBus,
}

impl BusServiceHandler {
    pub fn new(service: &str, bus: EventBus) -> Self {
        Self {
            topic_prefix: service_topic(service),
            bus,
        }
    }

    pub fn topic_for(&self, command: &str) -> String {
        format!("{}/{command}_requested", self.topic_prefix)
    }
}

impl ServiceHandler for BusServiceHandler {
    fn handle(&self, command: &str, params: &Payload) -> Result<(), CommandError> {
        let topic = self.topic_for(command);
        debug!(topic = %topic, "Forwarding command to the bus");
        self.bus.publish(topic, params.clone());
        Ok(())
    }
}

/// `CamelCase` service name to its `snake_case` topic segment.
pub fn service_topic(service: &str) -> String {
    let mut topic = String::with_capacity(service.len() + 4);
    for (i, ch) in service.chars().enumerate() {
        if ch.is_ascii_uppercase() {
            if i > 0 {
                topic.push('_');
            }
            topic.push(ch.to_ascii_lowercase());
        } else {
            topic.push(ch);
        }
    }
    topic
}

/// A fully validated client request.
#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    Subscribe(Pattern),
    Unsubscribe(Pattern),
    Command {
        service: String,
        command: String,
        params: Payload,
    },
}

fn whitelisted_commands(service: &str) -> Option<&'static [&'static str]> {
    SERVICE_COMMANDS
        .iter()
        .find(|(name, _)| *name == service)
        .map(|(_, commands)| *commands)
}

#[derive(Default, Clone)]
pub struct CommandRouter {
    handlers: HashMap<String, Arc<dyn ServiceHandler>>,
}

impl std::fmt::Debug for CommandRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut services: Vec<_> = self.handlers.keys().collect();
        services.sort();
        f.debug_struct("CommandRouter")
            .field("services", &services)
            .finish()
    }
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach the handler for `service`, replacing any earlier one.
    pub fn with_service(mut self, service: impl Into<String>, handler: Arc<dyn ServiceHandler>) -> Self {
        self.handlers.insert(service.into(), handler);
        self
    }

    /// Give every whitelisted service that still lacks a handler a
    /// `BusServiceHandler` on `bus`.
    pub fn with_bus_services(mut self, bus: &EventBus) -> Self {
        for (service, _) in SERVICE_COMMANDS {
            if !self.handlers.contains_key(*service) {
                self.handlers.insert(
                    service.to_string(),
                    Arc::new(BusServiceHandler::new(service, bus.clone())),
                );
            }
        }
        self
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.handlers.contains_key(service)
    }

    /// Parse and validate one text frame.
    pub fn parse(&self, text: &str) -> Result<Request, ProtocolError> {
        let value: Value = serde_json::from_str(text).map_err(|_| ProtocolError::InvalidMessage)?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::InvalidMessage)?;
        if !matches!(action, "subscribe" | "unsubscribe" | "command") {
            return Err(ProtocolError::UnknownAction(action.to_string()));
        }

        let message: ClientMessage =
            serde_json::from_value(value).map_err(|_| ProtocolError::InvalidMessage)?;

        match message {
            ClientMessage::Subscribe { topic } => Ok(Request::Subscribe(parse_pattern(topic)?)),
            ClientMessage::Unsubscribe { topic } => Ok(Request::Unsubscribe(parse_pattern(topic)?)),
            ClientMessage::Command {
                service,
                command,
                params,
            } => {
                let service = service.ok_or(ProtocolError::MissingField("service"))?;
                let command = command.ok_or(ProtocolError::MissingField("command"))?;
                let allowed = whitelisted_commands(&service)
                    .ok_or_else(|| ProtocolError::UnknownService(service.clone()))?;
                if !allowed.contains(&command.as_str()) {
                    return Err(ProtocolError::UnknownCommand { service, command });
                }
                Ok(Request::Command {
                    service,
                    command,
                    params: params.unwrap_or_default(),
                })
            }
        }
    }

    /// Apply a validated request on behalf of `client_id`.
    pub fn route(
        &self,
        client_id: &str,
        request: Request,
        relay: &RelayHandle,
    ) -> Result<(), ProtocolError> {
        match request {
            Request::Subscribe(pattern) => relay.subscribe(client_id, pattern),
            Request::Unsubscribe(pattern) => relay.unsubscribe(client_id, pattern),
            Request::Command {
                service,
                command,
                params,
            } => {
                let handler = self
                    .handlers
                    .get(&service)
                    .ok_or_else(|| ProtocolError::ServiceUnavailable(service.clone()))?;
                handler.handle(&command, &params)?;
                info!(client_id, service = %service, command = %command, "Command dispatched");
            }
        }
        Ok(())
    }

    /// Parse, validate and apply one text frame from `client_id`.
    pub fn handle_frame(
        &self,
        client_id: &str,
        text: &str,
        relay: &RelayHandle,
    ) -> Result<(), ProtocolError> {
        let request = self.parse(text).inspect_err(|e| {
            debug!(
                client_id,
                error = %e,
                frame = %text.chars().take(100).collect::<String>(),
                "Rejected client frame"
            );
        })?;
        self.route(client_id, request, relay)
    }
}

fn parse_pattern(topic: Option<String>) -> Result<Pattern, ProtocolError> {
    let topic = topic.ok_or(ProtocolError::MissingField("topic"))?;
    Pattern::parse(&topic).map_err(ProtocolError::InvalidPattern)
}
