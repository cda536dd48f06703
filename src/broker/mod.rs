//! The broker is the event distribution core: topic matching, the event bus,
//! the connection registry and the relay loop that ties them together.
//!
//! Public types:
//! - `EventBus` / `BusReceiver`: the process-wide publish point and its consumer end
//! - `Relay` / `RelayHandle`: the broadcast loop and the handle used to drive it
//! - `ConnectionRegistry`: per-client subscription sets
//! - `Pattern`: validated subscription pattern

pub mod bus;
pub mod engine;
pub mod message;
pub mod registry;
pub mod topic;

pub use bus::{BusReceiver, EventBus, Publisher};
pub use engine::{LocalSubscriber, Relay, RelayHandle};
pub use message::{Event, Payload};
pub use registry::ConnectionRegistry;
pub use topic::Pattern;
