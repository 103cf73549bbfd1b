//! Server state management.
//!
//! Wires the session registry, presence, typing, message and signaling
//! components together. Handlers return [`Delivery`] descriptions; the state
//! resolves recipients and sends at dispatch time.

use std::sync::Arc;
use std::time::Duration;

use murmur_core::protocol::ServerMessage;

use crate::auth::IdentityVerifier;
use crate::presence::PresenceTracker;
use crate::registry::SessionRegistry;
use crate::relay::MessageRelay;
use crate::signaling::SignalingRelay;
use crate::store::{MessageStore, UserStore};
use crate::typing::{TypingCoordinator, DEFAULT_TYPING_TIMEOUT};

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8080;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub port: u16,
    /// How long a typing indicator lives without renewal.
    pub typing_timeout: Duration,
    /// Directory for the memory store's JSON files. None keeps everything
    /// in memory.
    pub data_dir: Option<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            typing_timeout: DEFAULT_TYPING_TIMEOUT,
            data_dir: None,
        }
    }
}

/// A message a handler wants sent.
#[derive(Debug, Clone, PartialEq)]
pub enum Delivery {
    /// To one identity, if it is online when dispatched.
    To {
        identity: String,
        message: ServerMessage,
    },
    /// To every live session.
    Broadcast(ServerMessage),
}

impl Delivery {
    #[cfg(test)]
    pub fn to(identity: impl Into<String>, message: ServerMessage) -> Self {
        Self::To {
            identity: identity.into(),
            message,
        }
    }
}

/// Shared server state.
#[derive(Clone)]
pub struct RelayState {
    pub registry: SessionRegistry,
    pub presence: PresenceTracker,
    pub typing: TypingCoordinator,
    pub messages: MessageRelay,
    pub signaling: SignalingRelay,
    /// Authorises WebSocket upgrades.
    pub verifier: Arc<dyn IdentityVerifier>,
    pub config: RelayConfig,
}

impl RelayState {
    pub fn new(
        config: RelayConfig,
        message_store: Arc<dyn MessageStore>,
        user_store: Arc<dyn UserStore>,
        verifier: Arc<dyn IdentityVerifier>,
    ) -> Self {
        let registry = SessionRegistry::new();
        Self {
            presence: PresenceTracker::new(registry.clone(), user_store),
            typing: TypingCoordinator::new(registry.clone(), config.typing_timeout),
            messages: MessageRelay::new(message_store),
            signaling: SignalingRelay::new(registry.clone()),
            registry,
            verifier,
            config,
        }
    }

    /// Send every delivery. Recipients are resolved now, so anyone who went
    /// offline since the handler ran is skipped.
    ///
    /// Returns how many sends were queued.
    pub fn dispatch(&self, deliveries: Vec<Delivery>) -> usize {
        let mut sent = 0;
        for delivery in deliveries {
            match delivery {
                Delivery::To { identity, message } => {
                    if self.registry.send(&identity, message) {
                        sent += 1;
                    } else {
                        tracing::debug!(identity = identity.as_str(), "Recipient offline, not delivered");
                    }
                }
                Delivery::Broadcast(message) => {
                    sent += self.registry.broadcast(&message);
                }
            }
        }
        sent
    }

    /// Send a message to an online client. Returns true if sent successfully.
    pub fn send_to_client(&self, identity: &str, message: ServerMessage) -> bool {
        self.registry.send(identity, message)
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.registry.is_online(identity)
    }

    /// Get the number of currently connected clients.
    pub fn online_count(&self) -> usize {
        self.registry.online_count()
    }
}
