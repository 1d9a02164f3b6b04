//! Top-level error types for campbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Kv(#[from] KvError),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Platform(#[from] PlatformError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("missing required config key: {0}")]
    MissingKey(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Key-value store errors.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("failed to open store: {0}")]
    Open(String),

    #[error("store read failed: {0}")]
    Read(String),

    #[error("store write failed: {0}")]
    Write(String),

    #[error("stored value is not valid JSON: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Chat-completion provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("no API key configured")]
    MissingApiKey,

    #[error("provider request failed: {0}")]
    Request(String),

    #[error("provider returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("provider response had no content")]
    EmptyCompletion,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Platform (VK / Telegram) adapter errors.
#[derive(Debug, thiserror::Error)]
pub enum PlatformError {
    #[error("event is missing required field: {0}")]
    MissingField(&'static str),

    #[error("platform send failed: {0}")]
    SendFailed(String),

    #[error("platform fetch failed: {0}")]
    FetchFailed(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
