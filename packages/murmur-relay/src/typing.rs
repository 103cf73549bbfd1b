//! Typing indicators with automatic expiry.
//!
//! One entry per (identity, conversation). Each entry owns exactly one
//! expiry task; re-arming aborts the previous task before the new one takes
//! over, and an expiry only clears the entry it was armed for.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use murmur_core::protocol::ServerMessage;
use tokio::task::AbortHandle;

use crate::registry::SessionRegistry;
use crate::state::Delivery;

/// Default expiry of a typing indicator.
pub const DEFAULT_TYPING_TIMEOUT: Duration = Duration::from_secs(3);

type TypingKey = (String, String);

struct TypingEntry {
    recipient_id: String,
    generation: u64,
    expiry: AbortHandle,
}

#[derive(Clone)]
pub struct TypingCoordinator {
    registry: SessionRegistry,
    entries: Arc<DashMap<TypingKey, TypingEntry>>,
    generation: Arc<AtomicU64>,
    timeout: Duration,
}

impl TypingCoordinator {
    pub fn new(registry: SessionRegistry, timeout: Duration) -> Self {
        Self {
            registry,
            entries: Arc::new(DashMap::new()),
            generation: Arc::new(AtomicU64::new(0)),
            timeout,
        }
    }

    /// Set or refresh the indicator and re-arm its expiry.
    pub fn start(&self, identity: &str, conversation_id: &str, recipient_id: &str) -> Vec<Delivery> {
        let key = (identity.to_string(), conversation_id.to_string());
        let generation = self.generation.fetch_add(1, Ordering::Relaxed);

        let expiry = self.arm(key.clone(), recipient_id.to_string(), generation);
        let previous = self.entries.insert(
            key,
            TypingEntry {
                recipient_id: recipient_id.to_string(),
                generation,
                expiry,
            },
        );
        // The replaced timer may still wake, but its generation no longer
        // matches; abort it anyway so it never runs.
        if let Some(previous) = previous {
            previous.expiry.abort();
        }

        vec![is_typing(identity, conversation_id, recipient_id, true)]
    }

    /// Clear the indicator now.
    pub fn stop(&self, identity: &str, conversation_id: &str, recipient_id: &str) -> Vec<Delivery> {
        let key = (identity.to_string(), conversation_id.to_string());
        if let Some((_, entry)) = self.entries.remove(&key) {
            entry.expiry.abort();
        }
        vec![is_typing(identity, conversation_id, recipient_id, false)]
    }

    /// Clear every indicator of a disconnecting identity.
    pub fn clear_identity(&self, identity: &str) -> Vec<Delivery> {
        let keys: Vec<TypingKey> = self
            .entries
            .iter()
            .filter(|entry| entry.key().0 == identity)
            .map(|entry| entry.key().clone())
            .collect();

        let mut deliveries = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(((_, conversation_id), entry)) = self.entries.remove(&key) {
                entry.expiry.abort();
                deliveries.push(is_typing(
                    identity,
                    &conversation_id,
                    &entry.recipient_id,
                    false,
                ));
            }
        }
        if !deliveries.is_empty() {
            tracing::debug!(
                identity = identity,
                cleared = deliveries.len(),
                "Cleared typing indicators"
            );
        }
        deliveries
    }

    #[cfg(test)]
    pub fn is_typing(&self, identity: &str, conversation_id: &str) -> bool {
        self.entries
            .contains_key(&(identity.to_string(), conversation_id.to_string()))
    }

    /// Number of armed indicators.
    pub fn armed_count(&self) -> usize {
        self.entries.len()
    }

    fn arm(&self, key: TypingKey, recipient_id: String, generation: u64) -> AbortHandle {
        let entries = Arc::clone(&self.entries);
        let registry = self.registry.clone();
        let timeout = self.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let expired = entries
                .remove_if(&key, |_, entry| entry.generation == generation)
                .is_some();
            if expired {
                let (identity, conversation_id) = key;
                // No-op if the recipient has gone away meanwhile.
                registry.send(
                    &recipient_id,
                    ServerMessage::IsTyping {
                        identity,
                        conversation_id,
                        is_typing: false,
                    },
                );
            }
        })
        .abort_handle()
    }
}

fn is_typing(identity: &str, conversation_id: &str, recipient_id: &str, typing: bool) -> Delivery {
    Delivery::To {
        identity: recipient_id.to_string(),
        message: ServerMessage::IsTyping {
            identity: identity.to_string(),
            conversation_id: conversation_id.to_string(),
            is_typing: typing,
        },
    }
}
