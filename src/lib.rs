//! Campbot: a webhook-driven auto-responder that comments on camp community
//! posts with a fixed persona voice.
//!
//! Two platform adapters (VK group wall, Telegram discussion group) share one
//! pipeline: dedup the delivery, resolve the conversation thread, pick a badge
//! recommendation, assemble a persona prompt, generate a reply, normalize it,
//! and send it back through the platform's write API. All cross-request state
//! lives in an embedded TTL-aware key-value store.

pub mod badges;
pub mod config;
pub mod cta;
pub mod error;
pub mod kv;
pub mod llm;
pub mod memory;
pub mod platform;
pub mod prompts;
pub mod server;
pub mod text;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// The platform an event arrived from. Used as the prefix of every store key
/// so the two adapters never collide.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Vk,
    Telegram,
}

impl Platform {
    /// Short key prefix (`vk` / `tg`) used in store keys.
    pub fn key_prefix(self) -> &'static str {
        match self {
            Platform::Vk => "vk",
            Platform::Telegram => "tg",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key_prefix())
    }
}

/// Current wall-clock time in epoch milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Conversation key identifying one logical thread:
/// `{platform}:conv:{owner_or_chat}:{root_id}`.
pub fn conversation_key(platform: Platform, owner_or_chat: i64, root_id: i64) -> String {
    format!("{}:conv:{}:{}", platform.key_prefix(), owner_or_chat, root_id)
}
