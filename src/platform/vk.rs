//! VK Callback API adapter: validates group events, comments on new wall
//! posts, and replies to wall comments through `wall.createComment`.

use crate::config::VkConfig;
use crate::error::{PlatformError, Result};
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

const VK_API_VERSION: &str = "5.199";

/// Comment budget for a brand-new post (body plus the CTA question).
const NEW_POST_MAX_CHARS: usize = 900;

/// Comment budget for a threaded reply.
const REPLY_MAX_CHARS: usize = 700;

/// One VK Callback API delivery.
#[derive(Debug, Clone, Deserialize)]
pub struct VkCallback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub group_id: Option<i64>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub object: Option<serde_json::Value>,
}

/// `wall_post_new` event object.
#[derive(Debug, Clone, Deserialize)]
pub struct WallPost {
    pub id: i64,
    pub owner_id: i64,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

/// `wall_reply_new` event object.
#[derive(Debug, Clone, Deserialize)]
pub struct WallReply {
    pub id: i64,
    #[serde(alias = "post_owner_id")]
    pub owner_id: i64,
    pub post_id: i64,
    #[serde(default)]
    pub from_id: Option<i64>,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub reply_to_comment: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub photo: Option<Photo>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Photo {
    #[serde(default)]
    pub sizes: Vec<PhotoSize>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PhotoSize {
    pub url: String,
    #[serde(default)]
    pub width: u32,
    #[serde(default)]
    pub height: u32,
}

/// Largest photo URL attached to a post, by pixel area.
pub fn best_photo_url(attachments: &[Attachment]) -> Option<String> {
    attachments
        .iter()
        .filter(|a| a.kind == "photo")
        .filter_map(|a| a.photo.as_ref())
        .flat_map(|photo| photo.sizes.iter())
        .max_by_key(|size| u64::from(size.width) * u64::from(size.height))
        .map(|size| size.url.clone())
}

/// VK API surface used by the adapter.
#[async_trait]
pub trait WallApi: Send + Sync {
    /// Post a comment; returns the created comment id.
    async fn create_comment(
        &self,
        owner_id: i64,
        post_id: i64,
        message: &str,
        reply_to_comment: Option<i64>,
    ) -> std::result::Result<i64, PlatformError>;

    /// Fetch the post's best photo URL via `wall.getById`, for callbacks
    /// whose object arrives without attachments.
    async fn fetch_post_photo(
        &self,
        owner_id: i64,
        post_id: i64,
    ) -> std::result::Result<Option<String>, PlatformError>;
}

#[derive(Deserialize)]
struct VkApiResponse {
    #[serde(default)]
    response: Option<CreateCommentResponse>,
    #[serde(default)]
    error: Option<VkApiError>,
}

#[derive(Deserialize)]
struct CreateCommentResponse {
    comment_id: i64,
}

#[derive(Deserialize)]
struct VkApiError {
    #[serde(default)]
    error_code: i64,
    #[serde(default)]
    error_msg: String,
}

#[derive(Deserialize)]
struct GetByIdResponse {
    response: Option<GetByIdItems>,
}

#[derive(Deserialize)]
struct GetByIdItems {
    #[serde(default)]
    items: Vec<FetchedPost>,
}

#[derive(Deserialize)]
struct FetchedPost {
    #[serde(default)]
    attachments: Vec<Attachment>,
}

/// Production `wall.createComment` client.
pub struct VkClient {
    http: reqwest::Client,
    access_token: String,
}

impl VkClient {
    pub fn new(access_token: String) -> Self {
        Self { http: reqwest::Client::new(), access_token }
    }
}

#[async_trait]
impl WallApi for VkClient {
    async fn create_comment(
        &self,
        owner_id: i64,
        post_id: i64,
        message: &str,
        reply_to_comment: Option<i64>,
    ) -> std::result::Result<i64, PlatformError> {
        // guid makes VK-side retries of the same request idempotent.
        let guid = uuid::Uuid::new_v4().to_string();
        let owner_id = owner_id.to_string();
        let post_id = post_id.to_string();
        let mut form: Vec<(&str, &str)> = vec![
            ("owner_id", &owner_id),
            ("post_id", &post_id),
            ("from_group", "1"),
            ("message", message),
            ("guid", &guid),
            ("access_token", &self.access_token),
            ("v", VK_API_VERSION),
        ];
        let reply_to = reply_to_comment.map(|id| id.to_string());
        if let Some(reply_to) = &reply_to {
            form.push(("reply_to_comment", reply_to));
        }

        let response = self
            .http
            .post("https://api.vk.com/method/wall.createComment")
            .form(&form)
            .send()
            .await
            .map_err(|error| PlatformError::SendFailed(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::SendFailed(format!("http status {status}")));
        }

        let parsed: VkApiResponse = response
            .json()
            .await
            .map_err(|error| PlatformError::SendFailed(error.to_string()))?;

        if let Some(error) = parsed.error {
            return Err(PlatformError::SendFailed(format!(
                "vk error {}: {}",
                error.error_code, error.error_msg
            )));
        }
        parsed
            .response
            .map(|r| r.comment_id)
            .ok_or(PlatformError::MissingField("response.comment_id"))
    }

    async fn fetch_post_photo(
        &self,
        owner_id: i64,
        post_id: i64,
    ) -> std::result::Result<Option<String>, PlatformError> {
        let posts = format!("{owner_id}_{post_id}");
        let form: Vec<(&str, &str)> = vec![
            ("posts", &posts),
            ("access_token", &self.access_token),
            ("v", VK_API_VERSION),
        ];

        let response = self
            .http
            .post("https://api.vk.com/method/wall.getById")
            .form(&form)
            .send()
            .await
            .map_err(|error| PlatformError::FetchFailed(error.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlatformError::FetchFailed(format!("http status {status}")));
        }

        let parsed: GetByIdResponse = response
            .json()
            .await
            .map_err(|error| PlatformError::FetchFailed(error.to_string()))?;

        Ok(parsed.response.and_then(|r| {
            r.items
                .into_iter()
                .next()
                .and_then(|post| best_photo_url(&post.attachments))
        }))
    }
}

#[derive(Serialize)]
struct SendErrorCrumb {
    context: &'static str,
    error: String,
    ts: i64,
}

/// VK group-wall adapter.
pub struct VkAdapter {
    deps: AdapterDeps,
    config: VkConfig,
    api: Option<Arc<dyn WallApi>>,
}

impl VkAdapter {
    pub fn new(deps: AdapterDeps, config: VkConfig, api: Option<Arc<dyn WallApi>>) -> Self {
        Self { deps, config, api }
    }

    /// Plain-text body for a `confirmation` event, when configured.
    pub fn confirmation_code(&self) -> Option<&str> {
        self.config.confirmation_code.as_deref()
    }

    /// Validate a callback against the configured group id and secret.
    /// Unconfigured checks pass; a configured check must match exactly.
    pub fn is_valid_event(&self, callback: &VkCallback) -> bool {
        if let Some(expected) = self.config.group_id
            && callback.group_id != Some(expected)
        {
            return false;
        }
        if let Some(expected) = &self.config.secret
            && callback.secret.as_deref() != Some(expected.as_str())
        {
            return false;
        }
        true
    }

    fn dedupe_key(&self, callback: &VkCallback) -> String {
        match &callback.event_id {
            Some(event_id) => format!("vk:dedupe:{event_id}"),
            // Old callback versions omit event_id; fall back to a composite
            // of the event type and object ids.
            None => {
                let object_id = callback
                    .object
                    .as_ref()
                    .and_then(|o| o.get("id"))
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default();
                let owner_id = callback
                    .object
                    .as_ref()
                    .and_then(|o| o.get("owner_id").or_else(|| o.get("post_owner_id")))
                    .and_then(|v| v.as_i64())
                    .unwrap_or_default();
                format!("vk:dedupe:{}:{}:{}", callback.kind, owner_id, object_id)
            }
        }
    }

    /// Process one validated callback. Every outcome is terminal: errors are
    /// logged and breadcrumbed, never returned to the webhook response.
    pub async fn process(&self, callback: VkCallback) -> Result<()> {
        write_breadcrumb(
            self.deps.kv.as_ref(),
            "vk:lastEvent",
            &serde_json::json!({
                "type": callback.kind,
                "eventId": callback.event_id,
                "ts": crate::now_ms(),
            }),
        )
        .await;

        let duplicate = self
            .deps
            .kv
            .mark_if_absent(&self.dedupe_key(&callback), DEDUPE_TTL)
            .await?;
        if duplicate {
            tracing::debug!(kind = %callback.kind, "duplicate vk delivery skipped");
            return Ok(());
        }

        match callback.kind.as_str() {
            "wall_post_new" => {
                let Some(object) = callback.object else {
                    return Err(PlatformError::MissingField("object").into());
                };
                let post: WallPost = serde_json::from_value(object)
                    .map_err(|error| PlatformError::Other(error.into()))?;
                self.handle_wall_post(post).await
            }
            "wall_reply_new" => {
                let Some(object) = callback.object else {
                    return Err(PlatformError::MissingField("object").into());
                };
                let reply: WallReply = serde_json::from_value(object)
                    .map_err(|error| PlatformError::Other(error.into()))?;
                self.handle_wall_reply(reply).await
            }
            other => {
                tracing::debug!(kind = other, "unhandled vk event type");
                Ok(())
            }
        }
    }

    async fn handle_wall_post(&self, post: WallPost) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        write_breadcrumb(
            kv,
            "vk:lastWallPostNew",
            &serde_json::json!({
                "ownerId": post.owner_id,
                "postId": post.id,
                "hasText": !post.text.trim().is_empty(),
                "ts": crate::now_ms(),
            }),
        )
        .await;

        let mut photo_url = best_photo_url(&post.attachments);
        // The callback object often omits attachments; ask the API before
        // giving up on an image-only post.
        if photo_url.is_none()
            && let Some(api) = &self.api
        {
            match api.fetch_post_photo(post.owner_id, post.id).await {
                Ok(url) => photo_url = url,
                Err(error) => {
                    tracing::warn!(%error, post_id = post.id, "wall.getById failed, generating without the image");
                }
            }
        }
        if post.text.trim().is_empty() && photo_url.is_none() {
            tracing::info!(post_id = post.id, "vk post has no text or photo, skipping");
            return Ok(());
        }

        let post_key = format!("vk:post:{}:{}", post.owner_id, post.id);
        if !platform::try_lock_post(kv, &post_key, crate::now_ms()).await? {
            tracing::debug!(post_id = post.id, "vk post already locked or commented");
            return Ok(());
        }

        let conv_key = conversation_key(Platform::Vk, post.owner_id, post.id);
        memory::append(
            kv,
            &conv_key,
            MemoryMessage::user(post.text.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let index = self.deps.badges.load(crate::now_ms()).await;
        let badge =
            badges::select_for_reply(kv, Platform::Vk, &index, &post.text, None).await?;

        let persona = &self.deps.persona;
        let user_content = match &photo_url {
            Some(url) => ChatContent::Parts(vec![
                ContentPart::Text { text: format!("Текст поста:\n{}", post.text) },
                ContentPart::ImageUrl { image_url: ImageUrl { url: url.clone() } },
            ]),
            None => ChatContent::Text(format!("Текст поста:\n{}", post.text)),
        };
        let messages = PromptBuilder::new()
            .persona(persona)
            .task(new_post_task(Platform::Vk, photo_url.is_some(), persona))
            .badge_directive(badge.clone(), true)
            .user_content(user_content)
            .build();

        let reply = cta::generate_with_cta(
            &self.deps.engine,
            persona,
            &post.text,
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

        let sent = self
            .send_comment(post.owner_id, post.id, &with_prefix(persona, &reply), None)
            .await;
        let Some(comment_id) = sent else {
            return Ok(());
        };

        platform::mark_commented(kv, &post_key, &comment_id.to_string()).await?;
        kv.put_text(
            &format!("vk:myComment:{}:{}", post.owner_id, comment_id),
            "1",
            Some(AUTHORSHIP_TTL),
        )
        .await?;
        self.record_badge_use(badge.as_ref(), &reply).await?;

        tracing::info!(post_id = post.id, comment_id, "vk post commented");
        Ok(())
    }

    async fn handle_wall_reply(&self, reply: WallReply) -> Result<()> {
        let kv = self.deps.kv.as_ref();
        write_breadcrumb(
            kv,
            "vk:lastWallReplyNew",
            &serde_json::json!({
                "ownerId": reply.owner_id,
                "postId": reply.post_id,
                "commentId": reply.id,
                "fromId": reply.from_id,
                "ts": crate::now_ms(),
            }),
        )
        .await;

        // The group's own comments come back through the callback too.
        if let Some(group_id) = self.config.group_id
            && reply.from_id == Some(-group_id)
        {
            tracing::debug!(comment_id = reply.id, "own comment echoed back, skipping");
            return Ok(());
        }
        if reply.text.trim().is_empty() {
            return Ok(());
        }

        let replied_to_us = match reply.reply_to_comment {
            Some(parent_id) => {
                let marker = format!("vk:myComment:{}:{}", reply.owner_id, parent_id);
                kv.get_text(&marker).await?.is_some()
            }
            None => false,
        };
        if !replied_to_us && !should_reply_to_text(&reply.text) {
            tracing::debug!(comment_id = reply.id, "comment below engagement bar, skipping");
            return Ok(());
        }

        let comment_key = format!("vk:comment:{}:{}", reply.owner_id, reply.id);
        if !platform::try_lock_post(kv, &comment_key, crate::now_ms()).await? {
            return Ok(());
        }

        let conv_key = conversation_key(Platform::Vk, reply.owner_id, reply.post_id);
        let history = memory::get(kv, &conv_key, memory::DEFAULT_LIMIT).await?;
        memory::append(
            kv,
            &conv_key,
            MemoryMessage::user(reply.text.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let index = self.deps.badges.load(crate::now_ms()).await;
        // Search over the whole thread so far, not just the new comment.
        let search_text = history
            .iter()
            .map(|m| m.content.as_str())
            .chain([reply.text.as_str()])
            .collect::<Vec<_>>()
            .join("\n");
        let badge = badges::select_for_reply(
            kv,
            Platform::Vk,
            &index,
            &search_text,
            Some(&history),
        )
        .await?;

        let persona = &self.deps.persona;
        let messages = PromptBuilder::new()
            .persona(persona)
            .task(reply_task(Platform::Vk, persona))
            .badge_directive(badge.clone(), false)
            .memory_turns(history)
            .user_content(ChatContent::Text(reply.text.clone()))
            .build();

        let generated = self
            .deps
            .engine
            .generate(&messages, GenOptions::default())
            .await;
        let forbidden: Vec<&str> =
            persona.forbidden_emoji.iter().map(String::as_str).collect();
        let text = normalize_outgoing(&generated, REPLY_MAX_CHARS, &forbidden);

        memory::append(
            kv,
            &conv_key,
            MemoryMessage::assistant(text.clone()),
            memory::DEFAULT_LIMIT,
            memory::DEFAULT_TTL,
        )
        .await?;

        let sent = self
            .send_comment(
                reply.owner_id,
                reply.post_id,
                &with_prefix(persona, &text),
                Some(reply.id),
            )
            .await;
        let Some(comment_id) = sent else {
            return Ok(());
        };

        platform::mark_commented(kv, &comment_key, &comment_id.to_string()).await?;
        kv.put_text(
            &format!("vk:myComment:{}:{}", reply.owner_id, comment_id),
            "1",
            Some(AUTHORSHIP_TTL),
        )
        .await?;
        self.record_badge_use(badge.as_ref(), &text).await?;

        tracing::info!(comment_id = reply.id, sent = comment_id, "vk comment answered");
        Ok(())
    }

    /// Send a comment; on failure write the error breadcrumb and return
    /// `None`, leaving the advisory lock to expire for a later retry.
    async fn send_comment(
        &self,
        owner_id: i64,
        post_id: i64,
        message: &str,
        reply_to_comment: Option<i64>,
    ) -> Option<i64> {
        let kv = self.deps.kv.as_ref();
        let Some(api) = &self.api else {
            write_breadcrumb(
                kv,
                "vk:lastCreateCommentError",
                &SendErrorCrumb {
                    context: "unconfigured",
                    error: "VK access token is not set".into(),
                    ts: crate::now_ms(),
                },
            )
            .await;
            tracing::warn!("vk send skipped: access token is not configured");
            return None;
        };

        match api
            .create_comment(owner_id, post_id, message, reply_to_comment)
            .await
        {
            Ok(comment_id) => Some(comment_id),
            Err(error) => {
                write_breadcrumb(
                    kv,
                    "vk:lastCreateCommentError",
                    &SendErrorCrumb {
                        context: "create_comment",
                        error: error.to_string(),
                        ts: crate::now_ms(),
                    },
                )
                .await;
                tracing::warn!(%error, post_id, "vk create_comment failed");
                None
            }
        }
    }

    async fn record_badge_use(
        &self,
        badge: Option<&badges::BadgeEntry>,
        sent_text: &str,
    ) -> Result<()> {
        if let Some(badge) = badge
            && sent_text.contains(&badge.id)
        {
            badges::push_recent_badge_id(self.deps.kv.as_ref(), Platform::Vk, &badge.id)
                .await?;
        }
        Ok(())
    }
}

fn with_prefix(persona: &crate::prompts::PersonaBundle, text: &str) -> String {
    match &persona.message_prefix {
        Some(prefix) => format!("{prefix}\n{text}"),
        None => text.to_string(),
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

    struct RecordingWall {
        calls: Mutex<Vec<(i64, i64, String, Option<i64>)>>,
        next_id: Mutex<i64>,
        post_photo: Option<String>,
    }

    impl RecordingWall {
        fn new() -> Self {
            Self { calls: Mutex::new(Vec::new()), next_id: Mutex::new(1000), post_photo: None }
        }

        fn with_photo(url: &str) -> Self {
            Self { post_photo: Some(url.to_string()), ..Self::new() }
        }

        fn sent(&self) -> Vec<(i64, i64, String, Option<i64>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl WallApi for RecordingWall {
        async fn create_comment(
            &self,
            owner_id: i64,
            post_id: i64,
            message: &str,
            reply_to_comment: Option<i64>,
        ) -> std::result::Result<i64, PlatformError> {
            self.calls
                .lock()
                .unwrap()
                .push((owner_id, post_id, message.to_string(), reply_to_comment));
            let mut next = self.next_id.lock().unwrap();
            *next += 1;
            Ok(*next)
        }

        async fn fetch_post_photo(
            &self,
            _owner_id: i64,
            _post_id: i64,
        ) -> std::result::Result<Option<String>, PlatformError> {
            Ok(self.post_photo.clone())
        }
    }

    const CTA: &str = "Какой инструмент вы бы попробовали первым в своём проекте?";

    fn adapter(
        responses: Vec<std::result::Result<String, LlmError>>,
        api: Option<Arc<dyn WallApi>>,
    ) -> (VkAdapter, Arc<MemoryKv>) {
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
        let config = VkConfig {
            access_token: Some("token".into()),
            secret: Some("s3cret".into()),
            confirmation_code: Some("confirm123".into()),
            group_id: Some(222),
        };
        (VkAdapter::new(deps, config, api), kv)
    }

    fn post_event(event_id: &str, post_id: i64, text: &str) -> VkCallback {
        VkCallback {
            kind: "wall_post_new".into(),
            group_id: Some(222),
            secret: Some("s3cret".into()),
            event_id: Some(event_id.into()),
            object: Some(serde_json::json!({
                "id": post_id,
                "owner_id": -222,
                "text": text,
            })),
        }
    }

    fn reply_event(comment_id: i64, text: &str, from_id: i64) -> VkCallback {
        VkCallback {
            kind: "wall_reply_new".into(),
            group_id: Some(222),
            secret: Some("s3cret".into()),
            event_id: Some(format!("reply-{comment_id}")),
            object: Some(serde_json::json!({
                "id": comment_id,
                "owner_id": -222,
                "post_id": 5,
                "from_id": from_id,
                "text": text,
            })),
        }
    }

    #[test]
    fn test_event_validation() {
        let (adapter, _) = adapter(vec![], None);
        assert!(adapter.is_valid_event(&post_event("e1", 1, "x")));

        let mut wrong_secret = post_event("e2", 1, "x");
        wrong_secret.secret = Some("nope".into());
        assert!(!adapter.is_valid_event(&wrong_secret));

        let mut wrong_group = post_event("e3", 1, "x");
        wrong_group.group_id = Some(999);
        assert!(!adapter.is_valid_event(&wrong_group));
    }

    #[test]
    fn test_best_photo_url_prefers_largest() {
        let attachments: Vec<Attachment> = serde_json::from_value(serde_json::json!([
            {"type": "photo", "photo": {"sizes": [
                {"url": "http://x/s.jpg", "width": 100, "height": 100},
                {"url": "http://x/l.jpg", "width": 800, "height": 600},
            ]}},
            {"type": "audio"},
        ]))
        .unwrap();
        assert_eq!(best_photo_url(&attachments).as_deref(), Some("http://x/l.jpg"));
    }

    #[tokio::test]
    async fn test_wall_post_is_commented_once() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, kv) = adapter(
            vec![
                Ok("Тело ответа про творчество и навыки.".into()),
                Ok(CTA.into()),
            ],
            Some(wall.clone()),
        );

        adapter.process(post_event("e1", 10, "Сегодня мастер-класс")).await.unwrap();
        // Exact redelivery of the same event.
        adapter.process(post_event("e1", 10, "Сегодня мастер-класс")).await.unwrap();

        let sent = wall.sent();
        assert_eq!(sent.len(), 1, "duplicate delivery must not send twice");
        assert_eq!(sent[0].0, -222);
        assert_eq!(sent[0].1, 10);
        assert!(sent[0].2.starts_with("Сообщение от Валюши:"));
        assert_eq!(sent[0].3, None);

        let state = platform::load_post_state(kv.as_ref(), "vk:post:-222:10", crate::now_ms())
            .await
            .unwrap();
        assert!(matches!(state, PostState::Commented { .. }));

        // Authorship marker set for the created comment.
        let marker = kv.get_text("vk:myComment:-222:1001").await.unwrap();
        assert!(marker.is_some());
    }

    #[tokio::test]
    async fn test_same_post_in_two_events_is_commented_once() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, _) = adapter(
            vec![
                Ok("Тело ответа про проект.".into()),
                Ok(CTA.into()),
                Ok("Второе тело.".into()),
                Ok(CTA.into()),
            ],
            Some(wall.clone()),
        );

        // Different event ids, same post: the post state machine dedupes.
        adapter.process(post_event("e1", 10, "Пост")).await.unwrap();
        adapter.process(post_event("e2", 10, "Пост")).await.unwrap();

        assert_eq!(wall.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_post_is_skipped() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, _) = adapter(vec![], Some(wall.clone()));
        adapter.process(post_event("e1", 11, "   ")).await.unwrap();
        assert!(wall.sent().is_empty());
    }

    #[tokio::test]
    async fn test_image_only_post_uses_fetched_photo() {
        let wall = Arc::new(RecordingWall::with_photo("http://x/photo.jpg"));
        let (adapter, _) = adapter(
            vec![Ok("Тело про фото и творчество.".into()), Ok(CTA.into())],
            Some(wall.clone()),
        );
        // Callback object carries neither text nor attachments; the photo
        // comes back from wall.getById.
        adapter.process(post_event("e8", 30, "")).await.unwrap();
        assert_eq!(wall.sent().len(), 1, "image-only post still gets a comment");
    }

    #[tokio::test]
    async fn test_own_comment_is_ignored() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, _) = adapter(vec![], Some(wall.clone()));
        adapter
            .process(reply_event(50, "Сообщение от Валюши: привет?", -222))
            .await
            .unwrap();
        assert!(wall.sent().is_empty());
    }

    #[tokio::test]
    async fn test_low_signal_comment_is_ignored() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, _) = adapter(vec![], Some(wall.clone()));
        adapter.process(reply_event(51, "спасибо, класс", 333)).await.unwrap();
        assert!(wall.sent().is_empty());
    }

    #[tokio::test]
    async fn test_question_comment_gets_a_reply() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, _) = adapter(
            vec![Ok("Отвечаю на вопрос про смену и навыки.".into())],
            Some(wall.clone()),
        );
        adapter
            .process(reply_event(52, "А когда следующая смена?", 333))
            .await
            .unwrap();

        let sent = wall.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].3, Some(52), "reply threads under the comment");
    }

    #[tokio::test]
    async fn test_reply_to_our_comment_bypasses_filter() {
        let wall = Arc::new(RecordingWall::new());
        let (adapter, kv) = adapter(
            vec![Ok("Спасибо за тёплые слова!".into())],
            Some(wall.clone()),
        );
        kv.put_text("vk:myComment:-222:40", "1", None).await.unwrap();

        let mut event = reply_event(53, "очень мило", 333);
        event.object.as_mut().unwrap()["reply_to_comment"] = serde_json::json!(40);
        adapter.process(event).await.unwrap();

        assert_eq!(wall.sent().len(), 1, "low-signal text still answered when it replies to us");
    }

    #[tokio::test]
    async fn test_unconfigured_api_writes_breadcrumb() {
        let (adapter, kv) = adapter(
            vec![Ok("Тело.".into()), Ok(CTA.into())],
            None,
        );
        adapter.process(post_event("e1", 12, "Новый пост про проект")).await.unwrap();

        let crumb = kv.get_text("vk:lastCreateCommentError").await.unwrap();
        assert!(crumb.is_some_and(|c| c.contains("unconfigured")));
    }
}
