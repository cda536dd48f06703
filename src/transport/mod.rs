//! The `transport` module is responsible for handling network communication
//! with clients, primarily via WebSockets.
//!
//! It defines the JSON frames exchanged with clients, the command router that
//! validates and dispatches inbound frames, TLS loading for `wss://`, and the
//! WebSocket server itself.

pub mod message;
pub mod router;
pub mod tls;
pub mod websocket;

pub use router::{CommandRouter, Request, ServiceHandler};
pub use websocket::{WebSocketServer, start_websocket_server};
