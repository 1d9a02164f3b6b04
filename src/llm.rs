//! Chat-completion client and the reply engine that wraps it with
//! deterministic fallbacks.

use crate::error::LlmError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Message role on the chat-completion wire.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

/// One part of a multi-part user message (text or image reference).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ImageUrl {
    pub url: String,
}

/// Message content: plain text or a list of parts when an image is attached.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl ChatContent {
    /// Text rendering used for logging previews and memory search.
    pub fn as_text(&self) -> String {
        match self {
            ChatContent::Text(text) => text.clone(),
            ChatContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// One chat-completion message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: ChatContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: ChatRole::System, content: ChatContent::Text(text.into()) }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self { role: ChatRole::User, content: ChatContent::Text(text.into()) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: ChatRole::Assistant, content: ChatContent::Text(text.into()) }
    }

    pub fn user_parts(parts: Vec<ContentPart>) -> Self {
        Self { role: ChatRole::User, content: ChatContent::Parts(parts) }
    }
}

/// Sampling options for one generation call.
#[derive(Debug, Clone, Copy)]
pub struct GenOptions {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenOptions {
    fn default() -> Self {
        Self { temperature: 0.75, max_tokens: 450 }
    }
}

/// Anything that can turn a message list into completion text.
#[async_trait]
pub trait ChatGenerator: Send + Sync {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: GenOptions,
    ) -> Result<String, LlmError>;
}

#[derive(Serialize)]
struct CompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// OpenAI-compatible chat-completion client.
pub struct OpenAiChat {
    http: reqwest::Client,
    api_key: String,
    model: String,
    base_url: String,
    proxy_token: Option<String>,
}

impl OpenAiChat {
    pub const DEFAULT_BASE_URL: &'static str = "https://api.openai.com/v1";

    pub fn new(
        api_key: String,
        model: String,
        base_url: Option<String>,
        proxy_token: Option<String>,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            model,
            base_url: base_url.unwrap_or_else(|| Self::DEFAULT_BASE_URL.to_string()),
            proxy_token,
        }
    }
}

#[async_trait]
impl ChatGenerator for OpenAiChat {
    async fn complete(
        &self,
        messages: &[ChatMessage],
        options: GenOptions,
    ) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        let body = CompletionRequest {
            model: &self.model,
            messages,
            temperature: options.temperature,
            max_tokens: options.max_tokens,
        };

        let mut request = self.http.post(&url).bearer_auth(&self.api_key).json(&body);
        if let Some(token) = &self.proxy_token {
            request = request.header("x-proxy-authorization", format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|error| LlmError::Request(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body: body.chars().take(500).collect(),
            });
        }

        let parsed: CompletionResponse = response
            .json()
            .await
            .map_err(|error| LlmError::Request(error.to_string()))?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .map(|text| text.trim().to_string())
            .filter(|text| !text.is_empty())
            .ok_or(LlmError::EmptyCompletion)?;

        Ok(content)
    }
}

/// Reply engine: generation that never fails from the caller's point of view.
///
/// Webhook processing must always end with either a safe reply or silence, so
/// upstream failures (missing key, network error, non-success status, empty
/// completion) are swallowed here and replaced with the persona's fixed
/// fallback texts.
pub struct ReplyEngine {
    generator: Option<Arc<dyn ChatGenerator>>,
    /// Returned when no API key is configured.
    fallback_unconfigured: String,
    /// Returned when the provider call fails or comes back empty.
    fallback_error: String,
}

impl ReplyEngine {
    pub fn new(
        generator: Option<Arc<dyn ChatGenerator>>,
        fallback_unconfigured: String,
        fallback_error: String,
    ) -> Self {
        Self { generator, fallback_unconfigured, fallback_error }
    }

    /// Whether a real generator is configured.
    pub fn is_configured(&self) -> bool {
        self.generator.is_some()
    }

    /// Generate persona text; on any failure return the deterministic
    /// fallback instead of an error.
    pub async fn generate(&self, messages: &[ChatMessage], options: GenOptions) -> String {
        let Some(generator) = &self.generator else {
            return self.fallback_unconfigured.clone();
        };
        match generator.complete(messages, options).await {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%error, "generation failed, using fallback text");
                self.fallback_error.clone()
            }
        }
    }

    /// Generate and surface the error to the caller. Used by callers that
    /// validate candidates and have their own fallback (the CTA step).
    pub async fn try_generate(
        &self,
        messages: &[ChatMessage],
        options: GenOptions,
    ) -> Result<String, LlmError> {
        let generator = self.generator.as_ref().ok_or(LlmError::MissingApiKey)?;
        generator.complete(messages, options).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::ScriptedChat;
    use super::*;

    fn engine(generator: Option<Arc<dyn ChatGenerator>>) -> ReplyEngine {
        ReplyEngine::new(generator, "нет ключа".into(), "ошибка".into())
    }

    #[tokio::test]
    async fn test_generate_without_key_returns_fixed_fallback() {
        let engine = engine(None);
        let text = engine
            .generate(&[ChatMessage::user("привет")], GenOptions::default())
            .await;
        assert_eq!(text, "нет ключа");
    }

    #[tokio::test]
    async fn test_generate_swallows_provider_errors() {
        let scripted = Arc::new(ScriptedChat::new(vec![Err(LlmError::Status {
            status: 500,
            body: "boom".into(),
        })]));
        let engine = engine(Some(scripted.clone()));
        let text = engine
            .generate(&[ChatMessage::user("привет")], GenOptions::default())
            .await;
        assert_eq!(text, "ошибка");
        assert_eq!(scripted.calls.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_try_generate_surfaces_errors() {
        let engine = engine(None);
        let result = engine
            .try_generate(&[ChatMessage::user("x")], GenOptions::default())
            .await;
        assert!(matches!(result, Err(LlmError::MissingApiKey)));
    }

    #[test]
    fn test_message_content_serializes_like_the_wire_format() {
        let plain = ChatMessage::user("привет");
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            serde_json::json!({"role": "user", "content": "привет"})
        );

        let parts = ChatMessage::user_parts(vec![
            ContentPart::Text { text: "Текст".into() },
            ContentPart::ImageUrl { image_url: ImageUrl { url: "http://x/1.jpg".into() } },
        ]);
        assert_eq!(
            serde_json::to_value(&parts).unwrap(),
            serde_json::json!({
                "role": "user",
                "content": [
                    {"type": "text", "text": "Текст"},
                    {"type": "image_url", "image_url": {"url": "http://x/1.jpg"}},
                ]
            })
        );
    }
}
