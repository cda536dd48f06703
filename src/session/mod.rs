//! The `session` module drives the single external device session: a
//! connection state machine with exponential-backoff retries and a
//! connection timeout, the facade it calls into, and the router bridge that
//! lets clients start and stop it.

pub mod commands;
pub mod facade;
pub mod machine;
pub mod state;

pub use commands::SessionCommandHandler;
pub use facade::{BusFacade, SessionFacade};
pub use machine::{ConnectionStateMachine, SessionCommand, SessionHandle, SessionSnapshot};
pub use state::{ConnectionState, RetryPolicy};

#[cfg(test)]
mod tests;
