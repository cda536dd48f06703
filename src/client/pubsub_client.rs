//! Client representation
//!
//! A connected client is split in two halves:
//! - `Client`, held by the relay's registry: the producer side of the
//!   client's bounded frame channel plus the client's current patterns
//! - `Outbox`, held by whoever writes to the client (the socket send loop or
//!   an in-process subscriber)
//!
//! Frames travel over a `tokio::sync::broadcast` channel with a single
//! receiver. When the receiver falls behind, the oldest frames are
//! overwritten and the next `recv` reports the loss once, which the outbox
//! turns into a single `backlog dropped` frame.
//!
//! The patterns travel over a `watch` channel so the outbox can re-check an
//! event against what the client holds at delivery time. An event queued
//! before an unsubscribe is discarded instead of delivered stale.

use std::collections::HashSet;

use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, watch};
use tracing::debug;
use uuid::Uuid;

use crate::broker::topic::Pattern;
use crate::transport::message::ServerMessage;

pub type ClientId = String;

/// Extra producer handle onto a client's frame channel.
pub type FrameSender = broadcast::Sender<ServerMessage>;

#[derive(Debug)]
pub struct Client {
    pub id: ClientId,
    frames: FrameSender,
    patterns: watch::Sender<HashSet<Pattern>>,
}

impl Client {
    /// Create a client with a fresh `client-<uuid>` id whose outbox holds
    /// at most `capacity` frames.
    pub fn new(capacity: usize) -> (Self, Outbox) {
        Self::with_id(format!("client-{}", Uuid::new_v4()), capacity)
    }

    pub fn with_id(id: impl Into<ClientId>, capacity: usize) -> (Self, Outbox) {
        let (frames, frames_rx) = broadcast::channel(capacity.max(1));
        let (patterns, patterns_rx) = watch::channel(HashSet::new());
        let client = Self {
            id: id.into(),
            frames,
            patterns,
        };
        let outbox = Outbox {
            frames: frames_rx,
            patterns: patterns_rx,
        };
        (client, outbox)
    }

    /// Queue a frame for this client. Returns `false` once its outbox is gone.
    pub fn send(&self, frame: ServerMessage) -> bool {
        self.frames.send(frame).is_ok()
    }

    pub fn is_connected(&self) -> bool {
        self.frames.receiver_count() > 0
    }

    /// A second producer for frames that do not come from the relay, such
    /// as error replies to the client's own requests.
    pub fn sender(&self) -> FrameSender {
        self.frames.clone()
    }

    /// Add `pattern`. Returns `true` if it was not already held.
    pub fn subscribe(&self, pattern: Pattern) -> bool {
        self.patterns.send_if_modified(|set| set.insert(pattern))
    }

    /// Remove `pattern`. Returns `true` if it was held.
    pub fn unsubscribe(&self, pattern: &Pattern) -> bool {
        self.patterns.send_if_modified(|set| set.remove(pattern))
    }

    /// Whether any held pattern matches `topic`.
    pub fn matches(&self, topic: &str) -> bool {
        self.patterns.borrow().iter().any(|p| p.matches(topic))
    }

    /// Held patterns, sorted for stable output.
    pub fn patterns(&self) -> Vec<String> {
        let mut patterns: Vec<String> = self
            .patterns
            .borrow()
            .iter()
            .map(|p| p.as_str().to_string())
            .collect();
        patterns.sort();
        patterns
    }
}

/// Consumer side of one client's frames.
///
/// Yields `None` once the client has been unregistered.
#[derive(Debug)]
pub struct Outbox {
    frames: broadcast::Receiver<ServerMessage>,
    patterns: watch::Receiver<HashSet<Pattern>>,
}

impl Outbox {
    /// Wait for the next deliverable frame.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.frames.recv().await {
                Ok(frame) => match self.admit(frame) {
                    Admit::Deliver(frame) => return Some(frame),
                    Admit::Stale => continue,
                    Admit::Gone => return None,
                },
                Err(RecvError::Lagged(dropped)) => return Some(backlog_dropped(dropped)),
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Next deliverable frame if one is already queued.
    pub fn try_recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.frames.try_recv() {
                Ok(frame) => match self.admit(frame) {
                    Admit::Deliver(frame) => return Some(frame),
                    Admit::Stale => continue,
                    Admit::Gone => return None,
                },
                Err(TryRecvError::Lagged(dropped)) => return Some(backlog_dropped(dropped)),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }

    fn admit(&self, frame: ServerMessage) -> Admit {
        // The registry drops the patterns sender on unregister.
        if self.patterns.has_changed().is_err() {
            return Admit::Gone;
        }
        let stale = matches!(
            &frame,
            ServerMessage::Event { topic, .. } if !self.patterns.borrow().iter().any(|p| p.matches(topic))
        );
        if stale {
            debug!("Discarding event the client no longer subscribes to");
            return Admit::Stale;
        }
        Admit::Deliver(frame)
    }
}

enum Admit {
    Deliver(ServerMessage),
    Stale,
    Gone,
}

fn backlog_dropped(dropped: u64) -> ServerMessage {
    debug!(dropped, "Backlog dropped");
    ServerMessage::backlog_dropped()
}
