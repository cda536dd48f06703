//! # eventfabric
//!
//! `eventfabric` is the event distribution fabric of an automotive head unit.
//! Backend services publish topic-tagged state changes onto a single
//! in-process bus; a relay matches them against the patterns held by
//! WebSocket-connected UI clients and delivers them in order. A connection
//! state machine drives discovery, connect and retry for the external device
//! session and publishes its transitions onto the same bus.
//!
//! ## Core Modules
//!
//! - `broker`: topic matching, the event bus, the connection registry and the relay loop.
//! - `client`: one connected client and its bounded outbox.
//! - `config`: layered configuration (defaults, file, `FABRIC_*` environment).
//! - `session`: the device connection state machine, its facade and command bridge.
//! - `transport`: wire frames, the command router and the WebSocket server.
//! - `utils`: the error taxonomy and tracing setup.

pub mod broker;
pub mod client;
pub mod config;
pub mod session;
pub mod transport;
pub mod utils;
