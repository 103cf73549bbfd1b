//! Message, read-receipt and reaction fan-out.
//!
//! Messages are normally persisted by the API before they reach the relay;
//! this module tells the other participant and records only what the store
//! has never seen. Reaction edits on one message are
//! serialised through a per-message lock so two concurrent edits never lose
//! each other's update.

use std::sync::Arc;

use dashmap::DashMap;
use murmur_core::protocol::{ChatMessage, MessageStatus, ServerMessage};
use tokio::sync::Mutex;

use crate::error::{RelayError, RelayResult};
use crate::reactions;
use crate::state::Delivery;
use crate::store::MessageStore;

#[derive(Clone)]
pub struct MessageRelay {
    store: Arc<dyn MessageStore>,
    edit_locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl MessageRelay {
    pub fn new(store: Arc<dyn MessageStore>) -> Self {
        Self {
            store,
            edit_locks: Arc::new(DashMap::new()),
        }
    }

    /// Forward a message from `sender` to its recipient.
    ///
    /// A message the store does not know yet is recorded, so receipts and
    /// reactions have something to work on when no API wrote it first. A
    /// stored message is never overwritten.
    pub async fn deliver(&self, sender: &str, message: ChatMessage) -> RelayResult<Vec<Delivery>> {
        if message.sender_id != sender {
            return Err(RelayError::SenderMismatch);
        }

        match self.store.find_by_id(&message.id).await {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.store.create(message.clone()).await {
                    tracing::warn!(message_id = message.id.as_str(), error = %e, "Failed to store relayed message");
                }
            }
            Err(e) => {
                tracing::warn!(message_id = message.id.as_str(), error = %e, "Failed to look up relayed message");
            }
        }

        tracing::debug!(
            message_id = message.id.as_str(),
            recipient = message.recipient_id.as_str(),
            "Relaying message"
        );
        Ok(vec![Delivery::To {
            identity: message.recipient_id.clone(),
            message: ServerMessage::MessageReceived { message },
        }])
    }

    /// Mark messages addressed to `reader` as read and tell their senders.
    ///
    /// Only messages whose status actually changed produce a notification.
    pub async fn mark_read(&self, reader: &str, message_ids: &[String]) -> RelayResult<Vec<Delivery>> {
        if message_ids.is_empty() {
            return Ok(Vec::new());
        }

        let changed = self
            .store
            .update_status(message_ids, reader, MessageStatus::Read)
            .await?;

        Ok(changed
            .into_iter()
            .map(|message| Delivery::To {
                identity: message.sender_id,
                message: ServerMessage::StatusChanged {
                    message_id: message.id,
                    status: message.status,
                },
            })
            .collect())
    }

    /// Toggle or replace `user`'s reaction and broadcast the full list to
    /// both participants.
    pub async fn apply_reaction(
        &self,
        user: &str,
        message_id: &str,
        emoji: &str,
    ) -> RelayResult<Vec<Delivery>> {
        let lock = self
            .edit_locks
            .entry(message_id.to_string())
            .or_default()
            .clone();

        let result = {
            let _guard = lock.lock().await;
            self.edit_reactions(user, message_id, emoji).await
        };

        drop(lock);
        self.edit_locks
            .remove_if(message_id, |_, lock| Arc::strong_count(lock) == 1);

        result
    }

    async fn edit_reactions(
        &self,
        user: &str,
        message_id: &str,
        emoji: &str,
    ) -> RelayResult<Vec<Delivery>> {
        let mut message = self
            .store
            .find_by_id(message_id)
            .await?
            .ok_or_else(|| RelayError::MessageNotFound(message_id.to_string()))?;

        if user != message.sender_id && user != message.recipient_id {
            return Err(RelayError::NotParticipant(message_id.to_string()));
        }

        let outcome = reactions::apply(&mut message.reactions, user, emoji);
        self.store
            .update_reactions(message_id, message.reactions.clone())
            .await?;
        tracing::debug!(message_id = message_id, user = user, outcome = ?outcome, "Reaction applied");

        let changed = ServerMessage::ReactionChanged {
            message_id: message_id.to_string(),
            reactions: message.reactions,
        };
        let mut deliveries = vec![Delivery::To {
            identity: message.sender_id.clone(),
            message: changed.clone(),
        }];
        if message.recipient_id != message.sender_id {
            deliveries.push(Delivery::To {
                identity: message.recipient_id,
                message: changed,
            });
        }
        Ok(deliveries)
    }

    /// Tell the recipient that `sender` deleted a message.
    ///
    /// A message the store still has must belong to `sender` and goes to its
    /// stored recipient. One the API already removed goes to `recipient_id`.
    pub async fn delete(
        &self,
        sender: &str,
        message_id: &str,
        recipient_id: &str,
    ) -> RelayResult<Vec<Delivery>> {
        let recipient = match self.store.find_by_id(message_id).await? {
            Some(message) if message.sender_id != sender => {
                return Err(RelayError::NotMessageSender(message_id.to_string()));
            }
            Some(message) => message.recipient_id,
            None => recipient_id.to_string(),
        };

        Ok(vec![Delivery::To {
            identity: recipient,
            message: ServerMessage::MessageDeleted {
                message_id: message_id.to_string(),
            },
        }])
    }

    /// Number of messages with an edit in flight.
    pub fn pending_edits(&self) -> usize {
        self.edit_locks.len()
    }
}
