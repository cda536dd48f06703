//! The `client` module defines the representation of a client in the fabric.
//!
//! It provides the `Client` struct, which encapsulates one live connection
//! as the relay sees it (its unique identifier, its patterns and the producer
//! side of its frame channel), and the `Outbox` its writer drains.

pub mod pubsub_client;
pub use pubsub_client::{Client, ClientId, FrameSender, Outbox};
