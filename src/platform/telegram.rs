//! Telegram discussion-group adapter: comments under channel posts
//! auto-forwarded into the linked group, and answers replies in those
//! threads through the Bot API.

use crate::config::TelegramConfig;
use crate::error::{PlatformError, Result};
use crate::kv;
use crate::llm::{ChatContent, ContentPart, GenOptions, ImageUrl};
use crate::memory::{self, MemoryMessage};
use crate::platform::{
    self, AdapterDeps, AUTHORSHIP_TTL, DEDUPE_TTL, should_reply_to_text, write_breadcrumb,
};
use crate::prompts::{PromptBuilder, new_post_task, reply_task};
use crate::text::normalize_outgoing;
use crate::{Platform, badges, conversation_key, cta};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Comment budget under a fresh channel post (body plus CTA).
const NEW_POST_MAX_CHARS: usize = 900;

/// Budget for a threaded reply.
const REPLY_MAX_CHARS: usize = 700;

/// How long the shared album context is kept while parts trickle in.
const MEDIA_CTX_TTL: Duration = Duration::from_secs(30 * 60);

/// Settle delay before an album part proceeds, so sibling parts can land
/// their captions and photos first.
const ALBUM_SETTLE: Duration = Duration::from_millis(900);

/// One Bot API update.
#[derive(Debug, Clone, Deserialize)]
pub struct TgUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TgMessage>,
    #[serde(default)]
    pub edited_message: Option<TgMessage>,
    #[serde(default)]
    pub channel_post: Option<TgMessage>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgChat {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgUser {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgPhotoSize {
    pub file_id: String,
    #[serde(default)]
    pub file_size: Option<i64>,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TgMessage {
    pub message_id: i64,
    pub chat: TgChat,
    #[serde(default)]
    pub from: Option<TgUser>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub caption: Option<String>,
    #[serde(default)]
    pub media_group_id: Option<String>,
    #[serde(default)]
    pub photo: Vec<TgPhotoSize>,
    #[serde(default)]
    pub is_automatic_forward: bool,
    #[serde(default)]
    pub forward_from_chat: Option<TgChat>,
    #[serde(default)]
    pub forward_from_message_id: Option<i64>,
    #[serde(default)]
    pub reply_to_message: Option<Box<TgMessage>>,
}

impl TgMessage {
    fn content_text(&self) -> &str {
        self.text
            .as_deref()
            .or(self.caption.as_deref())
            .unwrap_or("")
    }

    /// Largest attached photo, preferring `file_size` and falling back to
    /// pixel area when sizes are not reported.
    fn best_photo(&self) -> Option<&TgPhotoSize> {
        self.photo.iter().max_by_key(|size| {
            size.file_size
                .unwrap_or(i64::from(size.width) * i64::from(size.height))
        })
    }
}

/// Write surface of the Bot API used by the adapter.
#[async_trait]
pub trait BotApi: Send + Sync {
    /// Send a message into a chat; returns the sent message id.
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> std::result::Result<i64, PlatformError>;

    /// Resolve a `file_id` into a downloadable URL.
    async fn file_url(
        &self,
        file_id: &str,
    ) -> std::result::Result<Option<String>, PlatformError>;
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_to_message_id: Option<i64>,
    /// Comment anyway if the root message vanished.
    allow_sending_without_reply: bool,
}

#[derive(Deserialize)]
struct TgApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Deserialize)]
struct SentMessage {
    message_id: i64,
}

#[derive(Deserialize)]
struct TgFile {
    #[serde(default)]
    file_path: Option<String>,
}

/// Production Bot API client.
pub struct TelegramClient {
    http: reqwest::Client,
    bot_token: String,
}

impl TelegramClient {
    pub fn new(bot_token: String) -> Self {
        Self { http: reqwest::Client::new(), bot_token }
    }

    fn method_url(&self, method: &str) -> String {
        format!("https://api.telegram.org/bot{}/{}", self.bot_token, method)
    }
}

#[async_trait]
impl BotApi for TelegramClient {
    async fn send_message(
        &self,
        chat_id: i64,
        text: &str,
        reply_to_message_id: Option<i64>,
    ) -> std::result::Result<i64, PlatformError> {
        let response = self
            .http
            .post(self.method_url("sendMessage"))
            .json(&SendMessageRequest {
                chat_id,
                text,
                reply_to_message_id,
                allow_sending_without_reply: true,
            })
            .send()
            .await
            .map_err(|error| PlatformError::SendFailed(error.to_string()))?;

        let parsed: TgApiResponse<SentMessage> = response
            .json()
            .await
            .map_err(|error| PlatformError::SendFailed(error.to_string()))?;

        if !parsed.ok {
            return Err(PlatformError::SendFailed(
                parsed.description.unwrap_or_else(|| "sendMessage failed".into()),
            ));
        }
        parsed
            .result
            .map(|m| m.message_id)
            .ok_or(PlatformError::MissingField("result.message_id"))
    }

    async fn file_url(
        &self,
        file_id: &str,
    ) -> std::result::Result<Option<String>, PlatformError> {
        let response = self
            .http
            .post(self.method_url("getFile"))
            .json(&serde_json::json!({ "file_id": file_id }))
            .send()
            .await
            .map_err(|error| PlatformError::FetchFailed(error.to_string()))?;

        let parsed: TgApiResponse<TgFile> = response
            .json()
            .await
            .map_err(|error| PlatformError::FetchFailed(error.to_string()))?;

        Ok(parsed
            .result
            .and_then(|f| f.file_path)
            .map(|path| format!("https://api.telegram.org/file/bot{}/{}", self.bot_token, path)))
    }
}

/// Shared context of one post (single message or album) assembled from all
/// its parts: the longest caption seen and the best photo seen.
#[derive(Debug, Default, Serialize, Deserialize)]
struct MediaContext {
    caption: String,
    photo_file_id: Option<String>,
    photo_weight: i64,
}

#[derive(Serialize)]
struct SendErrorCrumb {
    context: &'static str,
    error: String,
    ts: i64,
}

/// Telegram discussion-group adapter.
pub struct TelegramAdapter {
    deps: AdapterDeps,
    config: TelegramConfig,
    api: Option<Arc<dyn BotApi>>,
}

impl TelegramAdapter {
    pub fn new(deps: AdapterDeps, config: TelegramConfig, api: Option<Arc<dyn BotApi>>) -> Self {
        Self { deps, config, api }
    }

    /// Expected `X-Telegram-Bot-Api-Secret-Token` value, when configured.
    pub fn webhook_secret(&self) -> Option<&str> {
        self.config.webhook_secret.as_deref()
    }

    /// Process one update. Every outcome is terminal: failures are logged
    /// and breadcrumbed, never surfaced to the webhook response.
    pub async fn process(&self, update: TgUpdate) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        write_breadcrumb(
            kv,
            "tg:lastUpdate",
            &serde_json::json!({ "updateId": update.update_id, "ts": crate::now_ms() }),
        )
        .await;

        let duplicate = kv
            .mark_if_absent(&format!("tg:dedupe:{}", update.update_id), DEDUPE_TTL)
            .await?;
        if duplicate {
            tracing::debug!(update_id = update.update_id, "duplicate tg update skipped");
            return Ok(());
        }

        // Edits and raw channel posts carry no new work: the discussion-group
        // copy is what gets commented.
        let Some(message) = update.message else {
            return Ok(());
        };

        if let Some(expected) = self.config.discussion_group_id
            && message.chat.id != expected
        {
            tracing::debug!(chat_id = message.chat.id, "update from a foreign chat, skipping");
            return Ok(());
        }

        if message.is_automatic_forward {
            self.handle_auto_forward(message).await
        } else {
            self.handle_discussion_reply(message).await
        }
    }

    /// Does the auto-forward originate from the configured channel?
    fn is_allowed_channel(&self, message: &TgMessage) -> bool {
        let Some(source) = &message.forward_from_chat else {
            // No origin info and no allow-list configured: let it through.
            return self.config.channel_id.is_none() && self.config.channel_username.is_none();
        };
        if let Some(expected) = self.config.channel_id
            && source.id == expected
        {
            return true;
        }
        if let Some(expected) = &self.config.channel_username
            && let Some(username) = &source.username
        {
            let expected = expected.trim_start_matches('@');
            if username.eq_ignore_ascii_case(expected) {
                return true;
            }
        }
        self.config.channel_id.is_none() && self.config.channel_username.is_none()
    }

    /// Stable identity of the underlying channel post, shared by all parts
    /// of an album.
    fn post_identity(message: &TgMessage) -> String {
        if let Some(mg) = &message.media_group_id {
            return format!("mg:{mg}");
        }
        if let (Some(chat), Some(id)) =
            (&message.forward_from_chat, message.forward_from_message_id)
        {
            return format!("fwd:{}:{}", chat.id, id);
        }
        format!("msg:{}", message.message_id)
    }

    async fn handle_auto_forward(&self, message: TgMessage) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        if !self.is_allowed_channel(&message) {
            tracing::debug!(
                message_id = message.message_id,
                "auto-forward from a foreign channel, skipping"
            );
            return Ok(());
        }

        let chat_id = message.chat.id;
        let identity = Self::post_identity(&message);
        let is_album = message.media_group_id.is_some();

        // For albums the thread root is the smallest forwarded message id;
        // converge on it as parts arrive.
        let root = if let Some(mg) = &message.media_group_id {
            let root_key = format!("tg:mediaRoot:{chat_id}:{mg}");
            let root = kv::get_json::<i64>(kv, &root_key)
                .await?
                .map_or(message.message_id, |seen| seen.min(message.message_id));
            kv::put_json(kv, &root_key, &root, Some(AUTHORSHIP_TTL)).await?;
            root
        } else {
            message.message_id
        };
        kv.put_text(
            &format!("tg:root:{chat_id}:{}", message.message_id),
            &root.to_string(),
            Some(AUTHORSHIP_TTL),
        )
        .await?;

        self.upsert_media_context(chat_id, &identity, &message).await?;

        if is_album {
            // Let sibling parts land their captions and photos, then re-read
            // the converged root and context.
            tokio::time::sleep(ALBUM_SETTLE).await;
        }
        let root = if let Some(mg) = &message.media_group_id {
            let converged = kv::get_json::<i64>(kv, &format!("tg:mediaRoot:{chat_id}:{mg}"))
                .await?
                .unwrap_or(root);
            // The pre-sleep mapping may carry a stale min; refresh it.
            kv.put_text(
                &format!("tg:root:{chat_id}:{}", message.message_id),
                &converged.to_string(),
                Some(AUTHORSHIP_TTL),
            )
            .await?;
            converged
        } else {
            root
        };
        let ctx = kv::get_json::<MediaContext>(kv, &format!("tg:mediaCtx:{chat_id}:{identity}"))
            .await?
            .unwrap_or_default();

        write_breadcrumb(
            kv,
            "tg:lastAutoForward",
            &serde_json::json!({
                "chatId": chat_id,
                "messageId": message.message_id,
                "identity": identity,
                "root": root,
                "ts": crate::now_ms(),
            }),
        )
        .await;

        if ctx.caption.trim().is_empty() && ctx.photo_file_id.is_none() {
            tracing::info!(%identity, "channel post has no caption or photo, skipping");
            return Ok(());
        }

        let post_key = format!("tg:post:{chat_id}:{identity}");
        if !platform::try_lock_post(kv, &post_key, crate::now_ms()).await? {
            tracing::debug!(%identity, "post already locked or commented");
            return Ok(());
        }

        let photo_url = match &ctx.photo_file_id {
            Some(file_id) => self.resolve_file_url(file_id).await,
            None => None,
        };

        let conv_key = conversation_key(Platform::Telegram, chat_id, root);
        memory::append(
            kv,
            &conv_key,
            MemoryMessage::user(ctx.caption.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let index = self.deps.badges.load(crate::now_ms()).await;
        let badge =
            badges::select_for_reply(kv, Platform::Telegram, &index, &ctx.caption, None).await?;

        let persona = &self.deps.persona;
        let user_content = match &photo_url {
            Some(url) => ChatContent::Parts(vec![
                ContentPart::Text { text: format!("Текст поста:\n{}", ctx.caption) },
                ContentPart::ImageUrl { image_url: ImageUrl { url: url.clone() } },
            ]),
            None => ChatContent::Text(format!("Текст поста:\n{}", ctx.caption)),
        };
        let messages = PromptBuilder::new()
            .persona(persona)
            .task(new_post_task(Platform::Telegram, photo_url.is_some(), persona))
            .badge_directive(badge.clone(), true)
            .user_content(user_content)
            .build();

        let reply = cta::generate_with_cta(
            &self.deps.engine,
            persona,
            &ctx.caption,
            &messages,
            NEW_POST_MAX_CHARS,
        )
        .await;

        memory::append(
            kv,
            &conv_key,
            MemoryMessage::assistant(reply.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let Some(sent_id) = self.send(chat_id, &reply, Some(root)).await else {
            return Ok(());
        };

        platform::mark_commented(kv, &post_key, &sent_id.to_string()).await?;
        self.mark_own_message(chat_id, sent_id, root).await?;
        self.record_badge_use(badge.as_ref(), &reply).await?;

        tracing::info!(chat_id, root, sent_id, "channel post commented");
        Ok(())
    }

    async fn handle_discussion_reply(&self, message: TgMessage) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        let Some(from) = &message.from else {
            return Ok(());
        };
        if from.is_bot {
            return Ok(());
        }
        let text = message.content_text().trim().to_string();
        if text.is_empty() {
            return Ok(());
        }
        // Only thread replies are answered; free-floating group chatter is
        // outside the bot's job.
        let Some(parent) = &message.reply_to_message else {
            return Ok(());
        };

        let chat_id = message.chat.id;
        let root = self.resolve_thread_root(chat_id, parent).await?;

        let replied_to_us = kv
            .get_text(&format!("tg:myMessage:{chat_id}:{}", parent.message_id))
            .await?
            .is_some();
        if !replied_to_us && !should_reply_to_text(&text) {
            tracing::debug!(
                message_id = message.message_id,
                "reply below engagement bar, skipping"
            );
            return Ok(());
        }

        let comment_key = format!("tg:comment:{chat_id}:{}", message.message_id);
        if !platform::try_lock_post(kv, &comment_key, crate::now_ms()).await? {
            return Ok(());
        }

        write_breadcrumb(
            kv,
            "tg:lastReply",
            &serde_json::json!({
                "chatId": chat_id,
                "messageId": message.message_id,
                "root": root,
                "repliedToUs": replied_to_us,
                "ts": crate::now_ms(),
            }),
        )
        .await;

        let conv_key = conversation_key(Platform::Telegram, chat_id, root);
        let history = memory::get(kv, &conv_key, memory::DEFAULT_LIMIT).await?;
        memory::append(
            kv,
            &conv_key,
            MemoryMessage::user(text.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let index = self.deps.badges.load(crate::now_ms()).await;
        // Search over the whole thread so far, not just the new reply.
        let search_text = history
            .iter()
            .map(|m| m.content.as_str())
            .chain([text.as_str()])
            .collect::<Vec<_>>()
            .join("\n");
        let badge = badges::select_for_reply(
            kv,
            Platform::Telegram,
            &index,
            &search_text,
            Some(&history),
        )
        .await?;

        let persona = &self.deps.persona;
        let messages = PromptBuilder::new()
            .persona(persona)
            .task(reply_task(Platform::Telegram, persona))
            .badge_directive(badge.clone(), false)
            .memory_turns(history)
            .user_content(ChatContent::Text(text.clone()))
            .build();

        let generated = self
            .deps
            .engine
            .generate(&messages, GenOptions::default())
            .await;
        let forbidden: Vec<&str> =
            persona.forbidden_emoji.iter().map(String::as_str).collect();
        let outgoing = normalize_outgoing(&generated, REPLY_MAX_CHARS, &forbidden);

        memory::append(
            kv,
            &conv_key,
            MemoryMessage::assistant(outgoing.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let Some(sent_id) = self.send(chat_id, &outgoing, Some(message.message_id)).await else {
            return Ok(());
        };

        platform::mark_commented(kv, &comment_key, &sent_id.to_string()).await?;
        self.mark_own_message(chat_id, sent_id, root).await?;
        self.record_badge_use(badge.as_ref(), &outgoing).await?;

        tracing::info!(chat_id, message_id = message.message_id, sent_id, "tg reply answered");
        Ok(())
    }

    /// Resolve the thread root for a reply's parent message.
    ///
    /// Album parents carry a `media_group_id`; for those the converged
    /// media-group minimum is authoritative, because the per-message mapping
    /// written while parts were still arriving may hold a stale min. Other
    /// parents use the stored child-to-root mapping, falling back to the
    /// parent itself.
    async fn resolve_thread_root(&self, chat_id: i64, parent: &TgMessage) -> Result<i64> {
        let kv = self.deps.kv.as_ref();
        if parent.is_automatic_forward
            && let Some(mg) = &parent.media_group_id
            && let Some(root) =
                kv::get_json::<i64>(kv, &format!("tg:mediaRoot:{chat_id}:{mg}")).await?
        {
            return Ok(root);
        }
        Ok(kv
            .get_text(&format!("tg:root:{chat_id}:{}", parent.message_id))
            .await?
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(parent.message_id))
    }

    /// Merge one message's caption and photo into the shared post context.
    /// The longest caption wins; the heaviest photo wins.
    async fn upsert_media_context(
        &self,
        chat_id: i64,
        identity: &str,
        message: &TgMessage,
    ) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        let key = format!("tg:mediaCtx:{chat_id}:{identity}");
        let mut ctx = kv::get_json::<MediaContext>(kv, &key).await?.unwrap_or_default();

        let caption = message.content_text();
        if caption.chars().count() > ctx.caption.chars().count() {
            ctx.caption = caption.to_string();
        }
        if let Some(photo) = message.best_photo() {
            let weight = photo
                .file_size
                .unwrap_or(i64::from(photo.width) * i64::from(photo.height));
            if ctx.photo_file_id.is_none() || weight > ctx.photo_weight {
                ctx.photo_file_id = Some(photo.file_id.clone());
                ctx.photo_weight = weight;
            }
        }

        kv::put_json(kv, &key, &ctx, Some(MEDIA_CTX_TTL)).await?;
        Ok(())
    }

    async fn resolve_file_url(&self, file_id: &str) -> Option<String> {
        let api = self.api.as_ref()?;
        match api.file_url(file_id).await {
            Ok(url) => url,
            Err(error) => {
                tracing::warn!(%error, "getFile failed, generating without the image");
                None
            }
        }
    }

    async fn send(&self, chat_id: i64, text: &str, reply_to: Option<i64>) -> Option<i64> {
        let kv = self.deps.kv.as_ref();
        let Some(api) = &self.api else {
            write_breadcrumb(
                kv,
                "tg:lastSendError",
                &SendErrorCrumb {
                    context: "unconfigured",
                    error: "Telegram bot token is not set".into(),
                    ts: crate::now_ms(),
                },
            )
            .await;
            tracing::warn!("tg send skipped: bot token is not configured");
            return None;
        };

        match api.send_message(chat_id, text, reply_to).await {
            Ok(message_id) => Some(message_id),
            Err(error) => {
                write_breadcrumb(
                    kv,
                    "tg:lastSendError",
                    &SendErrorCrumb {
                        context: "send_message",
                        error: error.to_string(),
                        ts: crate::now_ms(),
                    },
                )
                .await;
                tracing::warn!(%error, chat_id, "tg sendMessage failed");
                None
            }
        }
    }

    /// Mark a sent message as ours and map it to its thread root, so replies
    /// to it resolve the same conversation.
    async fn mark_own_message(&self, chat_id: i64, message_id: i64, root: i64) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        kv.put_text(
            &format!("tg:myMessage:{chat_id}:{message_id}"),
            "1",
            Some(AUTHORSHIP_TTL),
        )
        .await?;
        kv.put_text(
            &format!("tg:root:{chat_id}:{message_id}"),
            &root.to_string(),
            Some(AUTHORSHIP_TTL),
        )
        .await?;
        Ok(())
    }

    async fn record_badge_use(
        &self,
        badge: Option<&badges::BadgeEntry>,
        sent_text: &str,
    ) -> Result<()> {
        if let Some(badge) = badge
            && sent_text.contains(&badge.id)
        {
            badges::push_recent_badge_id(
                self.deps.kv.as_ref(),
                Platform::Telegram,
                &badge.id,
            )
            .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::badges::BadgeCache;
    use crate::error::LlmError;
    use crate::kv::{KeyValueStore as _, MemoryKv};
    use crate::llm::ReplyEngine;
    use crate::llm::testing::ScriptedChat;
    use crate::platform::PostState;
    use crate::prompts::PersonaBundle;
    use std::sync::Mutex;

    struct RecordingBot {
        calls: Mutex<Vec<(i64, String, Option<i64>)>>,
        next_id: Mutex<i64>,
    }

    impl RecordingBot {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()), next_id: Mutex::new(9000) }
        }

        fn sent(&self) -> Vec<(i64, String, Option<i64>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BotApi for RecordingBot {
        async fn send_message(
            &self,
            chat_id: i64,
            text: &str,
            reply_to_message_id: Option<i64>,
        ) -> std::result::Result<i64, PlatformError> {
            self.calls
                .lock()
                .unwrap()
                .push((chat_id, text.to_string(), reply_to_message_id));
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(*next)
        }

        async fn file_url(
            &self,
            file_id: &str,
        ) -> std::result::Result<Option<String>, PlatformError> {
            Ok(Some(format!("http://files/{file_id}")))
        }
    }

    const CTA: &str = "Какой инструмент вы бы попробовали первым в своём проекте?";
    const GROUP: i64 = -1001234;

    fn adapter(
        responses: Vec<std::result::Result<String, LlmError>>,
        api: Option<Arc<dyn BotApi>>,
    ) -> (TelegramAdapter, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let persona = PersonaBundle::default();
        let engine = ReplyEngine::new(
            Some(Arc::new(ScriptedChat::new(responses))),
            persona.fallback_unconfigured.clone(),
            persona.fallback_error.clone(),
        );
        let deps = AdapterDeps {
            kv: kv.clone(),
            engine: Arc::new(engine),
            badges: Arc::new(BadgeCache::new(
                std::env::temp_dir().join("campbot-missing-index.json"),
                BadgeCache::DEFAULT_MAX_AGE,
            )),
            persona: Arc::new(persona),
        };
        let config = TelegramConfig {
            bot_token: Some("token".into()),
            webhook_secret: Some("hook-secret".into()),
            discussion_group_id: Some(GROUP),
            channel_id: Some(-100999),
            channel_username: Some("realworldcamp".into()),
        };
        (TelegramAdapter::new(deps, config, api), kv)
    }

    fn forward_update(update_id: i64, message_id: i64, caption: &str) -> TgUpdate {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": { "id": GROUP },
                "text": caption,
                "is_automatic_forward": true,
                "forward_from_chat": { "id": -100999, "username": "realworldcamp" },
                "forward_from_message_id": message_id + 500,
            }
        }))
        .unwrap()
    }

    fn album_update(
        update_id: i64,
        message_id: i64,
        caption: Option<&str>,
        file_id: &str,
    ) -> TgUpdate {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": { "id": GROUP },
                "caption": caption,
                "media_group_id": "album-1",
                "photo": [{ "file_id": file_id, "file_size": message_id * 10 }],
                "is_automatic_forward": true,
                "forward_from_chat": { "id": -100999 },
            }
        }))
        .unwrap()
    }

    fn reply_update(update_id: i64, message_id: i64, parent_id: i64, text: &str) -> TgUpdate {
        serde_json::from_value(serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": message_id,
                "chat": { "id": GROUP },
                "from": { "id": 42, "is_bot": false },
                "text": text,
                "reply_to_message": {
                    "message_id": parent_id,
                    "chat": { "id": GROUP },
                }
            }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_auto_forward_is_commented_once() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, kv) = adapter(
            vec![Ok("Тело про смену и навыки.".into()), Ok(CTA.into())],
            Some(bot.clone()),
        );

        adapter.process(forward_update(1, 100, "Запускаем новый проект")).await.unwrap();
        // Exact redelivery with the same update_id.
        adapter.process(forward_update(1, 100, "Запускаем новый проект")).await.unwrap();

        let sent = bot.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, GROUP);
        assert_eq!(sent[0].2, Some(100), "comment threads under the forwarded post");

        let state = platform::load_post_state(
            kv.as_ref(),
            &format!("tg:post:{GROUP}:fwd:-100999:600"),
            crate::now_ms(),
        )
        .await
        .unwrap();
        assert!(matches!(state, PostState::Commented { .. }));
    }

    #[tokio::test]
    async fn test_album_parts_converge_to_min_root() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(
            vec![Ok("Тело про альбом и творчество.".into()), Ok(CTA.into())],
            Some(bot.clone()),
        );

        // Out-of-order concurrent delivery of three album parts.
        let (a, b, c) = tokio::join!(
            adapter.process(album_update(10, 102, None, "f102")),
            adapter.process(album_update(11, 101, Some("Подпись альбома"), "f101")),
            adapter.process(album_update(12, 103, None, "f103")),
        );
        a.unwrap();
        b.unwrap();
        c.unwrap();

        let sent = bot.sent();
        assert_eq!(sent.len(), 1, "one comment for the whole album");
        assert_eq!(sent[0].2, Some(101), "root is the smallest part id");
    }

    #[tokio::test]
    async fn test_album_root_lookup_converges_for_every_part() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(
            vec![Ok("Тело про альбом.".into()), Ok(CTA.into())],
            Some(bot.clone()),
        );

        // Sequential delivery with the smallest id arriving last.
        for (update_id, message_id) in [(70, 103), (71, 102), (72, 101)] {
            adapter
                .process(album_update(update_id, message_id, Some("Подпись"), "f101"))
                .await
                .unwrap();
        }

        // A reply to any part of the album must land in the same thread.
        for message_id in [101i64, 102, 103] {
            let parent: TgMessage = serde_json::from_value(serde_json::json!({
                "message_id": message_id,
                "chat": { "id": GROUP },
                "media_group_id": "album-1",
                "is_automatic_forward": true,
            }))
            .unwrap();
            let root = adapter.resolve_thread_root(GROUP, &parent).await.unwrap();
            assert_eq!(root, 101, "part {message_id} must resolve to the album minimum");
        }
    }

    #[tokio::test]
    async fn test_foreign_channel_forward_is_skipped() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(vec![], Some(bot.clone()));

        let update: TgUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 20,
            "message": {
                "message_id": 200,
                "chat": { "id": GROUP },
                "text": "Чужой пост",
                "is_automatic_forward": true,
                "forward_from_chat": { "id": -555, "username": "other" },
            }
        }))
        .unwrap();
        adapter.process(update).await.unwrap();
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_foreign_chat_update_is_skipped() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(vec![], Some(bot.clone()));

        let update: TgUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 21,
            "message": {
                "message_id": 201,
                "chat": { "id": -42 },
                "text": "Вопрос?",
                "from": { "id": 1, "is_bot": false },
                "reply_to_message": { "message_id": 1, "chat": { "id": -42 } },
            }
        }))
        .unwrap();
        adapter.process(update).await.unwrap();
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_contentless_forward_is_skipped() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(vec![], Some(bot.clone()));
        adapter.process(forward_update(30, 300, "")).await.unwrap();
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_low_signal_reply_is_ignored() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(vec![], Some(bot.clone()));
        adapter.process(reply_update(40, 400, 100, "спасибо!")).await.unwrap();
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_question_reply_is_answered_in_thread() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, kv) = adapter(
            vec![Ok("Отвечаю про навыки и смену.".into())],
            Some(bot.clone()),
        );
        // The parent is mapped to a thread root.
        kv.put_text(&format!("tg:root:{GROUP}:100"), "95", None).await.unwrap();

        adapter
            .process(reply_update(41, 401, 100, "А что за навыки вы имеете в виду?"))
            .await
            .unwrap();

        let sent = bot.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].2, Some(401), "answer is a reply to the question itself");

        // Memory landed under the root conversation, not the parent's id.
        let turns = memory::get(
            kv.as_ref(),
            &conversation_key(Platform::Telegram, GROUP, 95),
            memory::DEFAULT_LIMIT,
        )
        .await
        .unwrap();
        assert_eq!(turns.len(), 2);
    }

    #[tokio::test]
    async fn test_reply_to_our_message_bypasses_filter() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, kv) = adapter(
            vec![Ok("Спасибо!".into())],
            Some(bot.clone()),
        );
        kv.put_text(&format!("tg:myMessage:{GROUP}:100"), "1", None).await.unwrap();

        adapter.process(reply_update(42, 402, 100, "очень мило")).await.unwrap();
        assert_eq!(bot.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_bot_messages_are_ignored() {
        let bot = Arc::new(RecordingBot::new());
        let (adapter, _) = adapter(vec![], Some(bot.clone()));

        let update: TgUpdate = serde_json::from_value(serde_json::json!({
            "update_id": 50,
            "message": {
                "message_id": 500,
                "chat": { "id": GROUP },
                "from": { "id": 7, "is_bot": true },
                "text": "Вопрос от бота?",
                "reply_to_message": { "message_id": 1, "chat": { "id": GROUP } },
            }
        }))
        .unwrap();
        adapter.process(update).await.unwrap();
        assert!(bot.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unconfigured_api_writes_breadcrumb() {
        let (adapter, kv) = adapter(
            vec![Ok("Тело.".into()), Ok(CTA.into())],
            None,
        );
        adapter.process(forward_update(60, 600, "Пост про проект")).await.unwrap();

        let crumb = kv.get_text("tg:lastSendError").await.unwrap();
        assert!(crumb.is_some_and(|c| c.contains("unconfigured")));
    }
}
