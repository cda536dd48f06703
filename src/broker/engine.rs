//! Relay engine
//!
//! This module contains the broadcast loop that bridges the event bus to
//! connected clients:
//! - owning the `ConnectionRegistry` (registration and subscription changes
//!   arrive as `RelayCommand`s over a channel)
//! - matching each published event against every client's patterns
//! - pushing `{"type":"event"}` frames into matching clients' outboxes
//!
//! Concurrency and usage notes:
//! - `Relay::run` is a single task. Nothing else touches the registry, so it
//!   needs no lock, and because every frame for a client is pushed from this
//!   one task, successive events reach the same client in publish order.
//! - Pending commands are drained before the next bus event. A client whose
//!   subscribe was sent before an event was published therefore sees it.
//! - A client whose outbox has gone away is dropped from the registry on
//!   the next delivery attempt, without bothering the publisher.

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::broker::bus::BusReceiver;
use crate::broker::message::Event;
use crate::broker::registry::ConnectionRegistry;
use crate::broker::topic::Pattern;
use crate::client::{Client, ClientId, Outbox};
use crate::transport::message::ServerMessage;

/// Requests serialized into the relay loop.
#[derive(Debug)]
pub enum RelayCommand {
    Register(Client),
    Subscribe {
        client_id: ClientId,
        pattern: Pattern,
    },
    Unsubscribe {
        client_id: ClientId,
        pattern: Pattern,
    },
    Unregister {
        client_id: ClientId,
    },
    Subscribers {
        topic: String,
        reply: oneshot::Sender<Vec<ClientId>>,
    },
    Subscriptions {
        client_id: ClientId,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    ClientCount {
        reply: oneshot::Sender<usize>,
    },
}

enum Next {
    Command(Option<RelayCommand>),
    Bus(Result<Event, RecvError>),
}

#[derive(Debug)]
pub struct Relay {
    registry: ConnectionRegistry,
    bus: BusReceiver,
    commands: mpsc::UnboundedReceiver<RelayCommand>,
}

impl Relay {
    /// Build a relay fed by `bus`, plus the handle used to talk to it.
    pub fn new(bus: BusReceiver) -> (Relay, RelayHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Relay {
                registry: ConnectionRegistry::new(),
                bus,
                commands: rx,
            },
            RelayHandle { commands: tx },
        )
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    /// Run until the bus is closed or every `RelayHandle` is dropped.
    pub async fn run(mut self) {
        info!("Relay loop started");
        loop {
            let next = tokio::select! {
                biased;
                cmd = self.commands.recv() => Next::Command(cmd),
                received = self.bus.recv() => Next::Bus(received),
            };

            match next {
                Next::Command(Some(cmd)) => self.apply(cmd),
                Next::Bus(Ok(event)) => self.dispatch(&event),
                Next::Bus(Err(RecvError::Lagged(dropped))) => self.broadcast_backlog_dropped(dropped),
                Next::Command(None) | Next::Bus(Err(RecvError::Closed)) => break,
            }
        }

        // Dropping the registry ends every outbox.
        info!(clients = self.registry.len(), "Relay loop stopped");
    }

    /// Apply one registration or subscription change.
    pub fn apply(&mut self, cmd: RelayCommand) {
        match cmd {
            RelayCommand::Register(client) => {
                debug!(client_id = %client.id, "Client registered");
                self.registry.register(client);
            }
            RelayCommand::Subscribe { client_id, pattern } => {
                match self.registry.subscribe(&client_id, pattern.clone()) {
                    Ok(true) => info!(client_id = %client_id, pattern = %pattern, "Subscribed"),
                    Ok(false) => debug!(client_id = %client_id, pattern = %pattern, "Already subscribed"),
                    Err(e) => debug!("Ignoring subscribe: {e}"),
                }
            }
            RelayCommand::Unsubscribe { client_id, pattern } => {
                match self.registry.unsubscribe(&client_id, &pattern) {
                    Ok(true) => info!(client_id = %client_id, pattern = %pattern, "Unsubscribed"),
                    Ok(false) => debug!(client_id = %client_id, pattern = %pattern, "Not subscribed"),
                    Err(e) => debug!("Ignoring unsubscribe: {e}"),
                }
            }
            RelayCommand::Unregister { client_id } => {
                if self.registry.unregister(&client_id).is_some() {
                    info!(client_id = %client_id, "Client unregistered");
                }
            }
            RelayCommand::Subscribers { topic, reply } => {
                let _ = reply.send(self.registry.snapshot_subscribers(&topic));
            }
            RelayCommand::Subscriptions { client_id, reply } => {
                let _ = reply.send(self.registry.subscriptions(&client_id));
            }
            RelayCommand::ClientCount { reply } => {
                let _ = reply.send(self.registry.len());
            }
        }
    }

    /// Deliver `event` to every client with a matching pattern.
    pub fn dispatch(&mut self, event: &Event) {
        let targets = self.registry.snapshot_subscribers(&event.topic);
        if targets.is_empty() {
            debug!(topic = %event.topic, "No subscribers");
            return;
        }

        let frame = ServerMessage::event(event);
        let mut gone = Vec::new();
        for client_id in targets {
            let Some(client) = self.registry.client(&client_id) else {
                continue;
            };
            if !client.send(frame.clone()) {
                gone.push(client_id);
            }
        }
        self.drop_gone(gone);
        debug!(topic = %event.topic, "Event relayed");
    }

    /// The bus hand-off lost `dropped` events; tell every client once.
    pub fn broadcast_backlog_dropped(&mut self, dropped: u64) {
        warn!(dropped, "Event bus overflowed; notifying clients");
        let gone = self
            .registry
            .clients()
            .filter(|client| !client.send(ServerMessage::backlog_dropped()))
            .map(|client| client.id.clone())
            .collect();
        self.drop_gone(gone);
    }

    fn drop_gone(&mut self, gone: Vec<ClientId>) {
        for client_id in gone {
            debug!(client_id = %client_id, "Outbox gone; unregistering client");
            self.registry.unregister(&client_id);
        }
    }
}

/// Cloneable handle for sending requests into the relay loop.
///
/// Sends never block. If the relay has stopped they are dropped.
#[derive(Debug, Clone)]
pub struct RelayHandle {
    commands: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    fn send(&self, cmd: RelayCommand) {
        if self.commands.send(cmd).is_err() {
            debug!("Relay stopped; command dropped");
        }
    }

    pub fn register(&self, client: Client) {
        self.send(RelayCommand::Register(client));
    }

    pub fn subscribe(&self, client_id: &str, pattern: Pattern) {
        self.send(RelayCommand::Subscribe {
            client_id: client_id.to_string(),
            pattern,
        });
    }

    pub fn unsubscribe(&self, client_id: &str, pattern: Pattern) {
        self.send(RelayCommand::Unsubscribe {
            client_id: client_id.to_string(),
            pattern,
        });
    }

    pub fn unregister(&self, client_id: &str) {
        self.send(RelayCommand::Unregister {
            client_id: client_id.to_string(),
        });
    }

    /// Point-in-time list of clients that would receive `topic`.
    pub async fn subscribers(&self, topic: &str) -> Vec<ClientId> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Subscribers {
            topic: topic.to_string(),
            reply,
        });
        rx.await.unwrap_or_default()
    }

    /// The client's current patterns, or `None` if it is not registered.
    pub async fn subscriptions(&self, client_id: &str) -> Option<Vec<String>> {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::Subscriptions {
            client_id: client_id.to_string(),
            reply,
        });
        rx.await.ok().flatten()
    }

    pub async fn client_count(&self) -> usize {
        let (reply, rx) = oneshot::channel();
        self.send(RelayCommand::ClientCount { reply });
        rx.await.unwrap_or_default()
    }

    /// Attach an in-process subscriber holding `patterns`.
    ///
    /// It receives exactly the frames a socket client with the same patterns
    /// would, under the same ordering and backlog rules.
    pub fn subscribe_local(&self, patterns: Vec<Pattern>, capacity: usize) -> LocalSubscriber {
        let (client, outbox) = Client::new(capacity);
        let client_id = client.id.clone();
        self.register(client);
        for pattern in patterns {
            self.subscribe(&client_id, pattern);
        }
        LocalSubscriber {
            client_id,
            outbox,
            relay: self.clone(),
        }
    }
}

/// In-process receiver of relayed frames. Unregisters when dropped.
#[derive(Debug)]
pub struct LocalSubscriber {
    client_id: ClientId,
    outbox: Outbox,
    relay: RelayHandle,
}

impl LocalSubscriber {
    pub fn id(&self) -> &str {
        &self.client_id
    }

    /// Next frame; lost backlog surfaces as a single `backlog dropped` error.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbox.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        self.outbox.try_recv()
    }
}

impl Drop for LocalSubscriber {
    fn drop(&mut self) {
        self.relay.unregister(&self.client_id);
    }
}
