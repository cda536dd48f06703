//! Connection registry
//!
//! Tracks every connected client and the set of patterns it subscribed with.
//! The registry is owned by the relay loop and mutated only there, so a scan
//! in `snapshot_subscribers` always sees a consistent view: no other task can
//! interleave a registration change with it.

use std::collections::HashMap;

use crate::broker::topic::Pattern;
use crate::client::{Client, ClientId};
use crate::utils::error::RegistryError;

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    clients: HashMap<ClientId, Client>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a client. Its pattern set starts empty.
    ///
    /// Client ids are unique per connection; registering one twice is a bug
    /// in the caller.
    pub fn register(&mut self, client: Client) {
        debug_assert!(
            !self.clients.contains_key(&client.id),
            "client {} registered twice",
            client.id
        );
        self.clients.insert(client.id.clone(), client);
    }

    /// Add `pattern` to the client's set. Returns `true` if it was not
    /// already present.
    pub fn subscribe(&mut self, client_id: &str, pattern: Pattern) -> Result<bool, RegistryError> {
        Ok(self.get(client_id)?.subscribe(pattern))
    }

    /// Remove `pattern` from the client's set. Removing an absent pattern is
    /// a no-op and returns `false`.
    pub fn unsubscribe(
        &mut self,
        client_id: &str,
        pattern: &Pattern,
    ) -> Result<bool, RegistryError> {
        Ok(self.get(client_id)?.unsubscribe(pattern))
    }

    /// Drop the client and all of its subscriptions in one step. Once the
    /// returned `Client` is dropped its outbox stops yielding frames.
    pub fn unregister(&mut self, client_id: &str) -> Option<Client> {
        self.clients.remove(client_id)
    }

    /// Every client holding at least one pattern that matches `topic`.
    pub fn snapshot_subscribers(&self, topic: &str) -> Vec<ClientId> {
        self.clients
            .values()
            .filter(|client| client.matches(topic))
            .map(|client| client.id.clone())
            .collect()
    }

    pub fn client(&self, client_id: &str) -> Option<&Client> {
        self.clients.get(client_id)
    }

    pub fn clients(&self) -> impl Iterator<Item = &Client> {
        self.clients.values()
    }

    /// The client's patterns, sorted for stable output.
    pub fn subscriptions(&self, client_id: &str) -> Option<Vec<String>> {
        self.clients.get(client_id).map(Client::patterns)
    }

    pub fn contains(&self, client_id: &str) -> bool {
        self.clients.contains_key(client_id)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    fn get(&self, client_id: &str) -> Result<&Client, RegistryError> {
        self.clients
            .get(client_id)
            .ok_or_else(|| RegistryError::UnknownClient(client_id.to_string()))
    }
}
