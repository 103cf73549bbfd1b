//! Session registry: identity → live connection.
//!
//! The registry is the single source of truth for reachability. Each
//! identity has at most one live session; registering again replaces the
//! previous one (last writer wins). Every session carries a unique handle so
//! a replaced connection's late disconnect cannot remove its successor.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_core::protocol::ServerMessage;
use tokio::sync::mpsc;
use uuid::Uuid;

/// A connected client's sender channel.
pub type ClientSender = mpsc::UnboundedSender<ServerMessage>;

/// One live connection.
#[derive(Debug, Clone)]
pub struct Session {
    pub handle: Uuid,
    pub sender: ClientSender,
    pub connected_at: DateTime<Utc>,
}

#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns the new handle and the session it
    /// replaced, if any.
    pub fn register(&self, identity: &str, sender: ClientSender) -> (Uuid, Option<Session>) {
        let session = Session {
            handle: Uuid::new_v4(),
            sender,
            connected_at: Utc::now(),
        };
        let handle = session.handle;
        let previous = self.sessions.insert(identity.to_string(), session);
        tracing::info!(
            identity = identity,
            replaced = previous.is_some(),
            "Session registered"
        );
        (handle, previous)
    }

    /// Remove the session for `identity` if it is still `handle`.
    pub fn unregister(&self, identity: &str, handle: Uuid) -> bool {
        match self
            .sessions
            .remove_if(identity, |_, session| session.handle == handle)
        {
            Some((_, session)) => {
                let duration = Utc::now() - session.connected_at;
                tracing::info!(
                    identity = identity,
                    duration_secs = duration.num_seconds(),
                    "Session unregistered"
                );
                true
            }
            None => false,
        }
    }

    pub fn resolve(&self, identity: &str) -> Option<ClientSender> {
        self.sessions.get(identity).map(|s| s.sender.clone())
    }

    /// Whether `handle` is still the live session for `identity`.
    pub fn is_current(&self, identity: &str, handle: Uuid) -> bool {
        self.sessions
            .get(identity)
            .is_some_and(|s| s.handle == handle)
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.sessions.contains_key(identity)
    }

    /// Send to an online identity. Returns true if the message was queued.
    pub fn send(&self, identity: &str, message: ServerMessage) -> bool {
        // Clone the sender so no map guard is held while sending.
        match self.resolve(identity) {
            Some(sender) => sender.send(message).is_ok(),
            None => false,
        }
    }

    /// Send to every live session. Returns how many accepted it.
    pub fn broadcast(&self, message: &ServerMessage) -> usize {
        let senders: Vec<ClientSender> = self
            .sessions
            .iter()
            .map(|entry| entry.value().sender.clone())
            .collect();
        senders
            .into_iter()
            .filter(|sender| sender.send(message.clone()).is_ok())
            .count()
    }

    pub fn online_count(&self) -> usize {
        self.sessions.len()
    }
}
