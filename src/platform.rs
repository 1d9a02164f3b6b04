//! Platform adapters and the state shared between them: the per-post state
//! machine, the engagement filter, and diagnostic breadcrumbs.

pub mod telegram;
pub mod vk;

use crate::badges::BadgeCache;
use crate::error::KvError;
use crate::kv::{self, KeyValueStore};
use crate::llm::ReplyEngine;
use crate::prompts::PersonaBundle;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Short advisory lock suppressing duplicate sends from bursty delivery
/// (album parts, webhook retries) before the real commented marker lands.
pub const LOCK_TTL: Duration = Duration::from_secs(120);

/// Retention for the commented marker: one auto-reply per post.
pub const COMMENTED_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 30);

/// Retention for bot-authorship markers and thread-root mappings.
pub const AUTHORSHIP_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 60);

/// Exact-duplicate redelivery window.
pub const DEDUPE_TTL: Duration = Duration::from_secs(60 * 60 * 24);

/// Retention for operator breadcrumbs.
pub const BREADCRUMB_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 14);

/// Dependencies one adapter invocation needs. Both adapters share the same
/// bundle; only the persona wiring and platform client differ.
#[derive(Clone)]
pub struct AdapterDeps {
    pub kv: Arc<dyn KeyValueStore>,
    pub engine: Arc<ReplyEngine>,
    pub badges: Arc<BadgeCache>,
    pub persona: Arc<PersonaBundle>,
}

/// Per-post reply state, stored as a tagged JSON record.
///
/// `Unseen` is the absence of a record (or an expired lock). The lifecycle is
/// `Unseen → Locked → Commented`; a failed send leaves the lock to expire so
/// a later retry gets another chance. The lock is advisory: truly concurrent
/// deliveries of the same post can still race, an accepted tradeoff over a
/// distributed lock.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum PostState {
    Unseen,
    Locked { since_ms: i64 },
    Commented { reply_id: String },
}

/// Load the current state of a post key at `now_ms`.
pub async fn load_post_state(
    kv: &dyn KeyValueStore,
    post_key: &str,
    now_ms: i64,
) -> Result<PostState, KvError> {
    let Some(state) = kv::get_json::<PostState>(kv, post_key).await? else {
        return Ok(PostState::Unseen);
    };
    Ok(match state {
        PostState::Locked { since_ms }
            if now_ms.saturating_sub(since_ms) >= LOCK_TTL.as_millis() as i64 =>
        {
            PostState::Unseen
        }
        other => other,
    })
}

/// Try to move a post from `Unseen` to `Locked`. Returns `false` when the
/// post is already locked or commented.
pub async fn try_lock_post(
    kv: &dyn KeyValueStore,
    post_key: &str,
    now_ms: i64,
) -> Result<bool, KvError> {
    match load_post_state(kv, post_key, now_ms).await? {
        PostState::Unseen => {
            kv::put_json(kv, post_key, &PostState::Locked { since_ms: now_ms }, Some(LOCK_TTL))
                .await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Record a successful send: the lock (or anything else) is overwritten with
/// the long-lived commented marker carrying the sent reply id.
pub async fn mark_commented(
    kv: &dyn KeyValueStore,
    post_key: &str,
    reply_id: &str,
) -> Result<(), KvError> {
    kv::put_json(
        kv,
        post_key,
        &PostState::Commented { reply_id: reply_id.to_string() },
        Some(COMMENTED_TTL),
    )
    .await
}

// Persona-domain trigger stems: a comment touching any of these is worth
// engaging with even when it is not a reply to the bot.
const ENGAGEMENT_KEYWORDS: &[&str] = &[
    "лагер", "вожат", "4к", "soft", "софт", "навык", "ии", "нейро", "проект", "кружок",
    "обуч", "творч", "команд", "лидер",
];

/// Admission control for replies to third-party comments: engage on a
/// question or on persona-domain keywords, stay silent otherwise.
pub fn should_reply_to_text(text: &str) -> bool {
    let lowered = text.to_lowercase();
    if lowered.contains('?') || lowered.contains('？') {
        return true;
    }
    ENGAGEMENT_KEYWORDS.iter().any(|k| lowered.contains(k))
}

/// Write an operator breadcrumb at a fixed debug key. Breadcrumb failures are
/// logged, never propagated: diagnostics must not break the pipeline.
pub async fn write_breadcrumb<T: Serialize>(kv: &dyn KeyValueStore, key: &str, value: &T) {
    if let Err(error) = kv::put_json(kv, key, value, Some(BREADCRUMB_TTL)).await {
        tracing::warn!(%error, key, "failed to write breadcrumb");
    }
}
