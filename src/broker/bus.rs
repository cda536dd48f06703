//! Event bus
//!
//! The single logical publish point of the process. One bus is constructed at
//! startup and its `EventBus` handle is cloned into every producer; the
//! matching `BusReceiver` goes to the relay.
//!
//! `publish` is callable from any thread or task. It validates the topic,
//! stamps the event and hands it to a bounded `broadcast` channel, then
//! returns. Delivery happens later on the relay loop. If the relay falls
//! behind, the oldest events are overwritten and the relay's next `recv`
//! reports how many it missed.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tracing::{debug, warn};

use crate::broker::message::{Event, Payload};
use crate::broker::topic::is_valid_topic;

/// Narrow producer interface: anything that can accept `(topic, payload)`.
pub trait Publisher: Send + Sync {
    fn publish(&self, topic: &str, payload: Payload);
}

/// Cloneable producer handle.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

/// Consumer end of the bus, owned by the relay loop.
#[derive(Debug)]
pub struct BusReceiver {
    receiver: broadcast::Receiver<Event>,
}

impl EventBus {
    /// Create a bus whose hand-off holds at most `capacity` unrelayed events.
    pub fn new(capacity: usize) -> (EventBus, BusReceiver) {
        let (sender, receiver) = broadcast::channel(capacity.max(1));
        (EventBus { sender }, BusReceiver { receiver })
    }

    /// Queue an event for delivery. Never blocks on subscriber work.
    ///
    /// Topics with empty segments are dropped with a warning.
    pub fn publish(&self, topic: impl Into<String>, payload: Payload) {
        let topic = topic.into();
        if !is_valid_topic(&topic) {
            warn!(topic = %topic, "Dropping event with malformed topic");
            return;
        }

        if self.sender.send(Event::new(topic, payload)).is_err() {
            debug!("Event bus has no relay; event discarded");
        }
    }

    /// Events currently waiting for the relay.
    pub fn pending(&self) -> usize {
        self.sender.len()
    }
}

impl Publisher for EventBus {
    fn publish(&self, topic: &str, payload: Payload) {
        EventBus::publish(self, topic, payload);
    }
}

impl BusReceiver {
    /// Wait for the next event. `Err(Lagged(n))` reports `n` events lost to
    /// overflow; `Err(Closed)` means every `EventBus` handle is gone.
    pub async fn recv(&mut self) -> Result<Event, RecvError> {
        self.receiver.recv().await
    }

    pub fn try_recv(&mut self) -> Result<Event, TryRecvError> {
        self.receiver.try_recv()
    }
}
