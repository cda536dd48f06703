//! The device-session facade the state machine drives.
//!
//! All three calls are dispatch-only: they start work and return. Outcomes
//! come back later through `SessionHandle::connection_established`,
//! `connection_failed` or `connection_state_changed`.

use serde_json::json;
use tracing::debug;

use crate::broker::EventBus;
use crate::broker::message::payload;

pub trait SessionFacade: Send + Sync {
    fn start_discovery(&self);
    fn connect_to_device(&self, device_id: &str);
    fn disconnect(&self);
}

/// Facade that forwards requests to the device session service as bus
/// events (`android_auto/*_requested`).
#[derive(Debug, Clone)]
pub struct BusFacade {
    bus: EventBus,
}

impl BusFacade {
    pub fn new(bus: EventBus) -> Self {
        Self { bus }
    }
}

impl SessionFacade for BusFacade {
    fn start_discovery(&self) {
        debug!("Requesting device discovery");
        self.bus
            .publish("android_auto/discovery_requested", payload(json!({})));
    }

    fn connect_to_device(&self, device_id: &str) {
        debug!(device_id, "Requesting device connection");
        self.bus.publish(
            "android_auto/connect_requested",
            payload(json!({ "device_id": device_id })),
        );
    }

    fn disconnect(&self) {
        debug!("Requesting disconnect");
        self.bus
            .publish("android_auto/disconnect_requested", payload(json!({})));
    }
}
