//! Conversation memory: an append-only, size-capped, TTL-backed message log
//! per logical thread, stored as JSON in the key-value store.

use crate::error::KvError;
use crate::kv::{self, KeyValueStore};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of turns kept per conversation.
pub const DEFAULT_LIMIT: usize = 10;

/// Default retention for a conversation log.
pub const DEFAULT_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Who produced a memory turn.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

/// One remembered turn of a conversation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MemoryMessage {
    pub role: Role,
    pub content: String,
    /// Epoch milliseconds.
    pub ts: i64,
}

impl MemoryMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self { role: Role::User, content: content.into(), ts: crate::now_ms() }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self { role: Role::Assistant, content: content.into(), ts: crate::now_ms() }
    }
}

/// The most recent `limit` turns for a conversation, oldest first.
pub async fn get(
    kv: &dyn KeyValueStore,
    conversation_key: &str,
    limit: usize,
) -> Result<Vec<MemoryMessage>, KvError> {
    let messages = kv::get_json::<Vec<MemoryMessage>>(kv, conversation_key)
        .await?
        .unwrap_or_default();
    let skip = messages.len().saturating_sub(limit);
    Ok(messages.into_iter().skip(skip).collect())
}

/// Append one turn, dropping the oldest beyond `limit`, and refresh the TTL.
///
/// Read-modify-write without a lock: concurrent deliveries for the same
/// thread are last-write-wins, an accepted tradeoff at this traffic level.
pub async fn append(
    kv: &dyn KeyValueStore,
    conversation_key: &str,
    message: MemoryMessage,
    limit: usize,
    ttl: Duration,
) -> Result<Vec<MemoryMessage>, KvError> {
    let mut messages = kv::get_json::<Vec<MemoryMessage>>(kv, conversation_key)
        .await?
        .unwrap_or_default();
    messages.push(message);
    let skip = messages.len().saturating_sub(limit);
    let trimmed: Vec<MemoryMessage> = messages.into_iter().skip(skip).collect();
    kv::put_json(kv, conversation_key, &trimmed, Some(ttl)).await?;
    Ok(trimmed)
}
