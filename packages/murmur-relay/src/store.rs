//! Storage collaborators.
//!
//! The relay never owns message or user records; it reads and writes them
//! through [`MessageStore`] and [`UserStore`]. [`MemoryStore`] implements
//! both with an in-memory cache and optional JSON files under the data
//! directory: `{data_dir}/messages/{id}.json` and
//! `{data_dir}/presence/{identity}.json`. Writes are atomic (write to
//! `.tmp`, then rename).

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use murmur_core::protocol::{ChatMessage, MessageStatus, Reaction};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Record '{0}' not found")]
    NotFound(String),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ── Collaborator Traits ───────────────────────────────────────────────────────

/// An `Err` from any method means the change did not happen. A change that
/// is already visible to readers must be reported as `Ok`.
#[async_trait]
pub trait MessageStore: Send + Sync + 'static {
    /// Persist a message. An id that already exists is left untouched and
    /// the stored copy is returned.
    async fn create(&self, message: ChatMessage) -> Result<ChatMessage, StoreError>;

    async fn find_by_id(&self, id: &str) -> Result<Option<ChatMessage>, StoreError>;

    /// Advance `status` on every listed message addressed to `recipient_id`.
    ///
    /// Returns only the messages whose status actually changed. Status never
    /// moves backwards.
    async fn update_status(
        &self,
        ids: &[String],
        recipient_id: &str,
        status: MessageStatus,
    ) -> Result<Vec<ChatMessage>, StoreError>;

    async fn update_reactions(&self, id: &str, reactions: Vec<Reaction>)
        -> Result<(), StoreError>;
}

#[async_trait]
pub trait UserStore: Send + Sync + 'static {
    async fn set_presence(
        &self,
        identity: &str,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Last recorded presence change for an identity.
    async fn last_seen(&self, identity: &str) -> Result<Option<DateTime<Utc>>, StoreError>;
}

// ── Memory Store ──────────────────────────────────────────────────────────────

/// Durable presence record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub identity: String,
    pub is_online: bool,
    pub last_seen_at: DateTime<Utc>,
}

/// DashMap-backed store with optional file persistence.
#[derive(Clone, Default)]
pub struct MemoryStore {
    messages: Arc<DashMap<String, ChatMessage>>,
    presence: Arc<DashMap<String, PresenceRecord>>,
    data_dir: Option<PathBuf>,
}

impl MemoryStore {
    /// Create a store. With no `data_dir` everything stays in memory.
    pub fn new(data_dir: Option<&str>) -> Self {
        Self {
            messages: Arc::new(DashMap::new()),
            presence: Arc::new(DashMap::new()),
            data_dir: data_dir.map(PathBuf::from),
        }
    }

    /// Load persisted records into memory. Called once at startup.
    ///
    /// Returns `(messages, presence records)` loaded.
    pub fn load_from_disk(&self) -> (usize, usize) {
        let Some(dir) = &self.data_dir else {
            tracing::info!("No data_dir configured, running in-memory only");
            return (0, 0);
        };

        let messages: Vec<ChatMessage> = load_dir(&dir.join("messages"));
        let message_count = messages.len();
        for message in messages {
            self.messages.insert(message.id.clone(), message);
        }

        // Nobody is connected to a relay that just started.
        let records: Vec<PresenceRecord> = load_dir(&dir.join("presence"));
        let presence_count = records.len();
        for mut record in records {
            record.is_online = false;
            self.presence.insert(record.identity.clone(), record);
        }

        tracing::info!(
            messages = message_count,
            presence = presence_count,
            "Store loaded from disk"
        );
        (message_count, presence_count)
    }

    #[cfg(test)]
    pub fn message_count(&self) -> usize {
        self.messages.len()
    }

    /// The in-memory record stays authoritative: a failed write is logged
    /// and not retried.
    fn persist_message(&self, message: &ChatMessage) {
        if let Some(dir) = &self.data_dir {
            if let Err(e) = write_atomic(&dir.join("messages"), &message.id, message) {
                tracing::warn!(error = %e, message_id = message.id.as_str(), "Failed to persist message");
            }
        }
    }

    fn persist_presence(&self, record: &PresenceRecord) {
        if let Some(dir) = &self.data_dir {
            if let Err(e) = write_atomic(&dir.join("presence"), &record.identity, record) {
                tracing::warn!(error = %e, identity = record.identity.as_str(), "Failed to persist presence");
            }
        }
    }
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create(&self, message: ChatMessage) -> Result<ChatMessage, StoreError> {
        let stored = self
            .messages
            .entry(message.id.clone())
            .or_insert(message)
            .clone();
        self.persist_message(&stored);
        Ok(stored)
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ChatMessage>, StoreError> {
        Ok(self.messages.get(id).map(|m| m.clone()))
    }

    async fn update_status(
        &self,
        ids: &[String],
        recipient_id: &str,
        status: MessageStatus,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        let mut changed = Vec::new();
        for id in ids {
            let Some(mut message) = self.messages.get_mut(id) else {
                continue;
            };
            if message.recipient_id != recipient_id || rank(message.status) >= rank(status) {
                continue;
            }
            message.status = status;
            changed.push(message.clone());
        }

        // Release every map guard before touching the disk.
        for message in &changed {
            self.persist_message(message);
        }
        Ok(changed)
    }

    async fn update_reactions(
        &self,
        id: &str,
        reactions: Vec<Reaction>,
    ) -> Result<(), StoreError> {
        let snapshot = {
            let mut message = self
                .messages
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
            message.reactions = reactions;
            message.clone()
        };
        self.persist_message(&snapshot);
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn set_presence(
        &self,
        identity: &str,
        is_online: bool,
        last_seen_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let record = PresenceRecord {
            identity: identity.to_string(),
            is_online,
            last_seen_at,
        };
        self.persist_presence(&record);
        self.presence.insert(identity.to_string(), record);
        Ok(())
    }

    async fn last_seen(&self, identity: &str) -> Result<Option<DateTime<Utc>>, StoreError> {
        Ok(self.presence.get(identity).map(|r| r.last_seen_at))
    }
}

fn rank(status: MessageStatus) -> u8 {
    match status {
        MessageStatus::Sent => 0,
        MessageStatus::Delivered => 1,
        MessageStatus::Read => 2,
    }
}

// ── File Helpers ──────────────────────────────────────────────────────────────

/// Keys are identities and message ids; escape anything that is not safe in
/// a file name.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len() + 5);
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_' {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{:02X}", byte));
        }
    }
    name.push_str(".json");
    name
}

fn write_atomic<T: Serialize>(dir: &Path, key: &str, value: &T) -> Result<(), StoreError> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(file_name(key));
    let json = serde_json::to_string_pretty(value)?;

    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, json)?;
    if let Err(e) = std::fs::rename(&tmp_path, &path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(e.into());
    }
    Ok(())
}

fn load_dir<T: DeserializeOwned>(dir: &Path) -> Vec<T> {
    if !dir.exists() {
        tracing::info!(path = %dir.display(), "No store directory, starting fresh");
        return Vec::new();
    }

    let entries = match std::fs::read_dir(dir) {
        Ok(e) => e,
        Err(e) => {
            tracing::warn!(error = %e, path = %dir.display(), "Failed to read store directory");
            return Vec::new();
        }
    };

    let mut records = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<T>(&contents) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(
                        error = %e,
                        path = %path.display(),
                        "Failed to parse stored record, skipping"
                    );
                }
            },
            Err(e) => {
                tracing::warn!(error = %e, path = %path.display(), "Failed to read stored record");
            }
        }
    }
    records
}

// ── Tests ─────────────────────────────────────────────────────────────────────
