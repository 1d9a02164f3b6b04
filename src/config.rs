//! Configuration loading and validation.

use crate::error::{ConfigError, Result};
use anyhow::Context as _;
use std::path::PathBuf;

/// Campbot configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory (key-value store lives here).
    pub data_dir: PathBuf,

    /// Path to the badge index JSON asset.
    pub badge_index_path: PathBuf,

    /// Chat-completion provider settings.
    pub llm: LlmConfig,

    /// VK Callback API settings.
    pub vk: VkConfig,

    /// Telegram webhook settings.
    pub telegram: TelegramConfig,
}

/// Chat-completion provider settings.
#[derive(Debug, Clone)]
pub struct LlmConfig {
    /// Model name sent to the chat-completion endpoint.
    pub model: String,

    /// API key. When absent every generation falls back to deterministic text.
    pub api_key: Option<String>,

    /// Optional proxy base URL for the chat-completion endpoint.
    pub proxy_base_url: Option<String>,

    /// Optional bearer token for the proxy.
    pub proxy_token: Option<String>,
}

/// VK Callback API settings.
#[derive(Debug, Clone, Default)]
pub struct VkConfig {
    /// Community access token for wall.createComment / wall.getById.
    pub access_token: Option<String>,

    /// Callback secret; when set, events with a different secret are rejected.
    pub secret: Option<String>,

    /// Plain-text code returned on `type = "confirmation"`.
    pub confirmation_code: Option<String>,

    /// Community id; when set, events from other groups are rejected.
    pub group_id: Option<i64>,
}

/// Telegram webhook settings.
#[derive(Debug, Clone, Default)]
pub struct TelegramConfig {
    /// Bot token for sendMessage / getFile.
    pub bot_token: Option<String>,

    /// Value compared against `X-Telegram-Bot-Api-Secret-Token`.
    pub webhook_secret: Option<String>,

    /// When set, only updates from this discussion group chat are processed.
    pub discussion_group_id: Option<i64>,

    /// When set, only auto-forwards from this channel id are processed.
    pub channel_id: Option<i64>,

    /// When set, only auto-forwards from this channel username are processed.
    pub channel_username: Option<String>,
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_opt_i64(key: &str) -> Option<i64> {
    env_opt(key).and_then(|v| v.trim().parse().ok())
}

impl Config {
    /// Load configuration from the environment.
    ///
    /// Platform tokens are all optional: an adapter whose token is missing
    /// writes a breadcrumb and skips sending instead of failing startup, so a
    /// half-configured deployment still acknowledges webhooks.
    pub fn load() -> Result<Self> {
        let data_dir = env_opt("CAMPBOT_DATA_DIR")
            .map(PathBuf::from)
            .or_else(|| dirs::data_dir().map(|d| d.join("campbot")))
            .unwrap_or_else(|| PathBuf::from("./data"));

        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data directory: {}", data_dir.display()))
            .map_err(ConfigError::Other)?;

        let badge_index_path = env_opt("CAMPBOT_BADGE_INDEX")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("badges-index.json"));

        let llm = LlmConfig {
            model: env_opt("CAMPBOT_MODEL").unwrap_or_else(|| "gpt-4o".into()),
            api_key: env_opt("OPENAI_API_KEY"),
            proxy_base_url: env_opt("OPENAI_PROXY_BASE_URL"),
            proxy_token: env_opt("OPENAI_PROXY_TOKEN"),
        };

        let vk = VkConfig {
            access_token: env_opt("VK_ACCESS_TOKEN"),
            secret: env_opt("VK_SECRET"),
            confirmation_code: env_opt("VK_CONFIRMATION_CODE"),
            group_id: env_opt_i64("VK_GROUP_ID"),
        };

        let telegram = TelegramConfig {
            bot_token: env_opt("TELEGRAM_BOT_TOKEN"),
            webhook_secret: env_opt("TELEGRAM_WEBHOOK_SECRET"),
            // Older deployments used DISCUSSION_GROUP_ID; accept both.
            discussion_group_id: env_opt_i64("TELEGRAM_DISCUSSION_GROUP_ID")
                .or_else(|| env_opt_i64("DISCUSSION_GROUP_ID")),
            channel_id: env_opt_i64("TELEGRAM_CHANNEL_ID"),
            channel_username: env_opt("TELEGRAM_CHANNEL_ID_USERNAME"),
        };

        Ok(Self { data_dir, badge_index_path, llm, vk, telegram })
    }

    /// Path of the embedded key-value store.
    pub fn kv_path(&self) -> PathBuf {
        self.data_dir.join("campbot.redb")
    }
}
