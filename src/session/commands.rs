//! Router bridge for the `AndroidAuto` service.
//!
//! Maps whitelisted session commands onto the connection state machine.
//! Projection commands belong to the protocol session itself and are
//! forwarded to it over the bus (`android_auto/<command>_requested`).

use tracing::info;

use crate::broker::{EventBus, Payload};
use crate::session::machine::SessionHandle;
use crate::transport::router::{BusServiceHandler, ServiceHandler};
use crate::utils::error::CommandError;

#[derive(Debug, Clone)]
pub struct SessionCommandHandler {
    session: SessionHandle,
    projection: BusServiceHandler,
}

impl SessionCommandHandler {
    pub fn new(session: SessionHandle, bus: EventBus) -> Self {
        Self {
            session,
            projection: BusServiceHandler::new("AndroidAuto", bus),
        }
    }
}

impl ServiceHandler for SessionCommandHandler {
    fn handle(&self, command: &str, params: &Payload) -> Result<(), CommandError> {
        match command {
            "start_discovery" => self.session.start_connection(),
            "stop_discovery" | "disconnect" => self.session.stop_connection(),
            "connect_device" => {
                let device_id = params
                    .get("device_id")
                    .and_then(|v| v.as_str())
                    .filter(|id| !id.is_empty())
                    .ok_or_else(|| CommandError::InvalidParams("device_id".to_string()))?;
                self.session.connect_to_device(device_id);
            }
            "retry_connection" => {
                self.session.reset_retry_count();
                self.session.start_connection();
            }
            "start_projection" | "stop_projection" => {
                return self.projection.handle(command, params);
            }
            other => return Err(CommandError::Unsupported(other.to_string())),
        }
        info!(command, "Session command dispatched");
        Ok(())
    }
}
