//! Presence tracking on top of the session registry.
//!
//! Online/offline transitions are broadcast to every connected session and
//! written through to the user store in the background. Writes for one
//! identity are applied in the order the transitions happened; one that is
//! overtaken by a newer write is skipped. A failed write is logged and not
//! retried; the registry stays authoritative.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_core::protocol::{PresenceInfo, ServerMessage};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::registry::{ClientSender, SessionRegistry};
use crate::state::Delivery;
use crate::store::UserStore;

#[derive(Clone)]
pub struct PresenceTracker {
    registry: SessionRegistry,
    users: Arc<dyn UserStore>,
    /// Last disconnect time seen by this relay.
    last_seen: Arc<DashMap<String, DateTime<Utc>>>,
    /// Per-identity write slot holding the sequence of the last write applied.
    writes: Arc<DashMap<String, Arc<Mutex<u64>>>>,
    sequence: Arc<AtomicU64>,
}

impl PresenceTracker {
    pub fn new(registry: SessionRegistry, users: Arc<dyn UserStore>) -> Self {
        Self {
            registry,
            users,
            last_seen: Arc::new(DashMap::new()),
            writes: Arc::new(DashMap::new()),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Bring `identity` online on a new connection.
    ///
    /// A connection it replaces is told so and loses its outbound channel.
    pub fn connect(&self, identity: &str, sender: ClientSender) -> (Uuid, Vec<Delivery>) {
        let (handle, previous) = self.registry.register(identity, sender);
        if let Some(previous) = previous {
            tracing::info!(identity = identity, "Replacing existing session");
            let _ = previous.sender.send(ServerMessage::SessionReplaced);
        }

        self.write_through(identity, true, Utc::now());
        let deliveries = vec![Delivery::Broadcast(ServerMessage::PresenceChanged {
            identity: identity.to_string(),
            is_online: true,
            last_seen_at: None,
        })];
        (handle, deliveries)
    }

    /// Take `identity` offline if `handle` is still its live connection.
    pub fn disconnect(&self, identity: &str, handle: Uuid) -> Vec<Delivery> {
        if !self.registry.unregister(identity, handle) {
            tracing::debug!(identity = identity, "Replaced session closed");
            return Vec::new();
        }

        let now = Utc::now();
        self.last_seen.insert(identity.to_string(), now);
        self.write_through(identity, false, now);
        vec![Delivery::Broadcast(ServerMessage::PresenceChanged {
            identity: identity.to_string(),
            is_online: false,
            last_seen_at: Some(now),
        })]
    }

    /// Current presence of `identity`.
    ///
    /// Online identities report "now"; offline ones the last disconnect this
    /// relay saw, falling back to the user store.
    pub async fn query(&self, identity: &str) -> PresenceInfo {
        if self.registry.is_online(identity) {
            return PresenceInfo {
                identity: identity.to_string(),
                is_online: true,
                last_seen_at: Some(Utc::now()),
            };
        }

        let mut last_seen_at = self.last_seen.get(identity).map(|t| *t);
        if last_seen_at.is_none() {
            last_seen_at = match self.users.last_seen(identity).await {
                Ok(seen) => seen,
                Err(e) => {
                    tracing::warn!(identity = identity, error = %e, "Failed to read last seen");
                    None
                }
            };
        }

        PresenceInfo {
            identity: identity.to_string(),
            is_online: false,
            last_seen_at,
        }
    }

    fn write_through(&self, identity: &str, is_online: bool, at: DateTime<Utc>) {
        // Sequenced now, in transition order, whatever order the tasks run in.
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let slot = self.writes.entry(identity.to_string()).or_default().clone();
        let writes = Arc::clone(&self.writes);
        let users = Arc::clone(&self.users);
        let identity = identity.to_string();

        tokio::spawn(async move {
            {
                let mut applied = slot.lock().await;
                if *applied > sequence {
                    tracing::debug!(
                        identity = identity.as_str(),
                        is_online = is_online,
                        "Skipping overtaken presence write"
                    );
                } else {
                    if let Err(e) = users.set_presence(&identity, is_online, at).await {
                        tracing::warn!(
                            identity = identity.as_str(),
                            is_online = is_online,
                            error = %e,
                            "Failed to persist presence"
                        );
                    }
                    *applied = sequence;
                }
            }

            drop(slot);
            writes.remove_if(&identity, |_, slot| Arc::strong_count(slot) == 1);
        });
    }
}
