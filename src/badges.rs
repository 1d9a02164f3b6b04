//! Badge recommendation index: token scoring over the guidebook badge asset,
//! candidate selection with anti-repetition, and the staleness-windowed cache.

use crate::Platform;
use crate::error::KvError;
use crate::kv::{self, KeyValueStore};
use crate::memory::{MemoryMessage, Role};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::sync::RwLock;

/// One recommendable badge from the guidebook index asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BadgeEntry {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub emoji: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub category_title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub skill_tips: Option<String>,
}

/// A badge with its relevance score against some search text.
#[derive(Debug, Clone)]
pub struct ScoredBadge<'a> {
    pub badge: &'a BadgeEntry,
    pub score: u32,
    pub title_hits: u32,
}

/// Rotation list length: ids older than the 50 most recent rotate back in.
const ROTATION_LIMIT: usize = 50;
const ROTATION_TTL: Duration = Duration::from_secs(60 * 60 * 24 * 45);

/// Badge ids look like `12.3` or `12.3.4`; used to spot badges already
/// mentioned earlier in a thread.
static BADGE_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b\d{1,2}\.\d{1,2}(?:\.\d{1,2})?\b").expect("static regex"));

// RU function words plus camp-generic terms too common to pick a badge by.
const STOPWORDS: &[&str] = &[
    "или", "что", "как", "это", "этот", "эта", "эти", "так", "тоже", "ещё", "уже", "очень",
    "просто", "сейчас", "сегодня", "вчера", "завтра", "если", "когда", "тогда", "для", "без",
    "из", "от", "до", "при", "над", "под", "про", "они", "она", "оно", "мы", "вы",
    // common social noise
    "пост", "поста", "посты", "коммент", "комментари", "комментарий", "комментарии",
    // camp common words
    "лагерь", "лагеря", "смена", "смены", "дети", "ребята", "подростки",
];

static STOPWORD_SET: LazyLock<HashSet<&'static str>> =
    LazyLock::new(|| STOPWORDS.iter().copied().collect());

/// Lowercase, strip everything that is not a letter or digit to spaces, and
/// collapse whitespace.
fn normalize_search(text: &str) -> String {
    let lowered = text.to_lowercase();
    let mut out = String::with_capacity(lowered.len());
    let mut last_space = true;
    for ch in lowered.chars() {
        if ch.is_alphanumeric() {
            out.push(ch);
            last_space = false;
        } else if !last_space {
            out.push(' ');
            last_space = true;
        }
    }
    out.trim_end().to_string()
}

/// Tokenize free text for badge matching: ≥3 chars, no stopwords, no pure
/// digits, de-duplicated in first-seen order, capped at 40 tokens.
pub fn search_tokens(text: &str) -> Vec<String> {
    let normalized = normalize_search(text);
    let mut seen = HashSet::new();
    let mut tokens = Vec::new();
    for token in normalized.split_whitespace() {
        if token.chars().count() < 3 {
            continue;
        }
        if STOPWORD_SET.contains(token) {
            continue;
        }
        if token.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        if seen.insert(token.to_string()) {
            tokens.push(token.to_string());
        }
        if tokens.len() >= 40 {
            break;
        }
    }
    tokens
}

/// Category ids that get a thematic boost when the text carries their
/// hand-mapped keywords. Favors the AI, soft-skill, and reflection categories
/// even when individual badge haystacks match weakly.
fn boosted_category_ids(tokens: &[String]) -> HashSet<&'static str> {
    let set: HashSet<&str> = tokens.iter().map(String::as_str).collect();
    let mut boosted = HashSet::new();

    // 12 — AI / neural networks
    if ["нейросети", "нейросеть", "gpt", "чатгпт"]
        .iter()
        .any(|k| set.contains(k))
        || set.contains("ии")
    {
        boosted.insert("12");
    }
    // 13 — soft skills / teamwork
    if ["софт", "soft", "команда", "команд", "коммуникация", "общение"]
        .iter()
        .any(|k| set.contains(k))
    {
        boosted.insert("13");
    }
    // 11 — mindfulness / reflection
    if ["осознанность", "рефлексия", "эмоции", "эмпатия"]
        .iter()
        .any(|k| set.contains(k))
    {
        boosted.insert("11");
    }

    boosted
}

/// Score every badge against the text, sorted descending by score.
///
/// Each token adds +1 when found in the combined haystack
/// (title/description/skill tips/category title) and +2 more (plus a
/// `title_hits` increment) when found in the title alone.
pub fn score_badges<'a>(index: &'a [BadgeEntry], text: &str) -> Vec<ScoredBadge<'a>> {
    let tokens = search_tokens(text);
    if tokens.is_empty() {
        return Vec::new();
    }

    let boosted = boosted_category_ids(&tokens);

    let mut scored: Vec<ScoredBadge<'a>> = index
        .iter()
        .map(|badge| {
            let hay = normalize_search(
                &[
                    Some(badge.title.as_str()),
                    badge.description.as_deref(),
                    badge.skill_tips.as_deref(),
                    badge.category_title.as_deref(),
                ]
                .into_iter()
                .flatten()
                .collect::<Vec<_>>()
                .join(" "),
            );
            let title_hay = normalize_search(&badge.title);

            let mut score = 0u32;
            let mut title_hits = 0u32;
            for token in &tokens {
                if hay.contains(token.as_str()) {
                    score += 1;
                }
                if title_hay.contains(token.as_str()) {
                    score += 2;
                    title_hits += 1;
                }
            }

            if let Some(category_id) = &badge.category_id
                && boosted.contains(category_id.as_str())
            {
                score += 3;
            }

            ScoredBadge { badge, score, title_hits }
        })
        .collect();

    scored.sort_by(|a, b| b.score.cmp(&a.score));
    scored
}

/// Top `limit` badges with a positive score.
pub fn pick_relevant<'a>(index: &'a [BadgeEntry], text: &str, limit: usize) -> Vec<&'a BadgeEntry> {
    score_badges(index, text)
        .into_iter()
        .filter(|s| s.score > 0)
        .take(limit)
        .map(|s| s.badge)
        .collect()
}

/// Extract badge ids (`N.N` / `N.N.N`) mentioned in a text, de-duplicated.
pub fn extract_badge_ids(text: &str) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for m in BADGE_ID_RE.find_iter(text) {
        if seen.insert(m.as_str().to_string()) {
            ids.push(m.as_str().to_string());
        }
    }
    ids
}

/// Badge ids mentioned in the thread's assistant turns so far.
fn badge_ids_from_memory(memory: &[MemoryMessage]) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut ids = Vec::new();
    for message in memory {
        if message.role != Role::Assistant {
            continue;
        }
        for id in extract_badge_ids(&message.content) {
            if seen.insert(id.clone()) {
                ids.push(id);
            }
        }
    }
    ids
}

/// Pure candidate selection against an avoid-set.
///
/// A badge is recommended only when it really fits: top score ≥ 8, or ≥ 6
/// with at least one title hit. From the top 12 candidates, only those within
/// 2 points of the top score (never below 5) are considered; the first not in
/// the avoid-set wins, falling back to the unfiltered top candidate.
pub fn select_badge_candidate<'a>(
    index: &'a [BadgeEntry],
    search_text: &str,
    avoid: &HashSet<String>,
) -> Option<&'a BadgeEntry> {
    let scored = score_badges(index, search_text);
    let top = scored.first()?;
    if top.score == 0 {
        return None;
    }

    let is_strong = top.score >= 8 || (top.score >= 6 && top.title_hits > 0);
    if !is_strong {
        return None;
    }

    let min_score = (top.score.saturating_sub(2)).max(5);
    let top_slice = &scored[..scored.len().min(12)];
    let strong: Vec<&ScoredBadge<'a>> =
        top_slice.iter().filter(|s| s.score >= min_score).collect();
    let pool: Vec<&ScoredBadge<'a>> = if strong.is_empty() {
        top_slice.iter().collect()
    } else {
        strong
    };

    Some(
        pool.iter()
            .find(|s| !avoid.contains(&s.badge.id))
            .map(|s| s.badge)
            .unwrap_or(top.badge),
    )
}

fn rotation_key(platform: Platform) -> String {
    format!("{}:recentBadges", platform.key_prefix())
}

/// Recently recommended badge ids for a platform, most recent first.
pub async fn recent_badge_ids(
    kv: &dyn KeyValueStore,
    platform: Platform,
) -> Result<Vec<String>, KvError> {
    Ok(kv::get_json::<Vec<String>>(kv, &rotation_key(platform))
        .await?
        .unwrap_or_default())
}

/// Move a badge id to the front of the platform rotation list.
pub async fn push_recent_badge_id(
    kv: &dyn KeyValueStore,
    platform: Platform,
    badge_id: &str,
) -> Result<(), KvError> {
    if badge_id.is_empty() {
        return Ok(());
    }
    let mut list = recent_badge_ids(kv, platform).await?;
    list.retain(|id| id != badge_id);
    list.insert(0, badge_id.to_string());
    list.truncate(ROTATION_LIMIT);
    kv::put_json(kv, &rotation_key(platform), &list, Some(ROTATION_TTL)).await
}

/// Select a badge for a reply: scoring plus the anti-repetition avoid-set
/// built from the platform rotation and the thread's own assistant turns.
pub async fn select_for_reply(
    kv: &dyn KeyValueStore,
    platform: Platform,
    index: &[BadgeEntry],
    search_text: &str,
    thread_memory: Option<&[MemoryMessage]>,
) -> Result<Option<BadgeEntry>, KvError> {
    if index.is_empty() {
        return Ok(None);
    }

    let mut avoid: HashSet<String> = recent_badge_ids(kv, platform).await?.into_iter().collect();
    if let Some(memory) = thread_memory {
        avoid.extend(badge_ids_from_memory(memory));
    }

    Ok(select_badge_candidate(index, search_text, &avoid).cloned())
}

/// Whether a cached index loaded at `loaded_at_ms` is stale at `now_ms`.
pub fn is_stale(now_ms: i64, loaded_at_ms: Option<i64>, max_age: Duration) -> bool {
    match loaded_at_ms {
        None => true,
        Some(loaded_at) => now_ms.saturating_sub(loaded_at) >= max_age.as_millis() as i64,
    }
}

#[derive(Default)]
struct CacheState {
    entries: Arc<Vec<BadgeEntry>>,
    loaded_at_ms: Option<i64>,
}

/// In-process cache of the badge index asset with a freshness window.
///
/// The clock is passed in by the caller so staleness is testable without
/// wall-clock dependence. A failed reload keeps the previous entries.
pub struct BadgeCache {
    path: PathBuf,
    max_age: Duration,
    state: RwLock<CacheState>,
}

impl BadgeCache {
    /// Default freshness window: 10 minutes.
    pub const DEFAULT_MAX_AGE: Duration = Duration::from_secs(10 * 60);

    pub fn new(path: PathBuf, max_age: Duration) -> Self {
        Self { path, max_age, state: RwLock::new(CacheState::default()) }
    }

    /// Current index entries, reloading from the asset when stale.
    pub async fn load(&self, now_ms: i64) -> Arc<Vec<BadgeEntry>> {
        {
            let state = self.state.read().await;
            if !is_stale(now_ms, state.loaded_at_ms, self.max_age) {
                return state.entries.clone();
            }
        }

        let mut state = self.state.write().await;
        // Another task may have refreshed while we waited for the write lock.
        if !is_stale(now_ms, state.loaded_at_ms, self.max_age) {
            return state.entries.clone();
        }

        // A failed reload keeps the previous entries and leaves the cache
        // stale, so the next call retries instead of waiting out a window.
        match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => match serde_json::from_str::<Vec<BadgeEntry>>(&raw) {
                Ok(entries) => {
                    tracing::debug!(count = entries.len(), "badge index reloaded");
                    state.entries = Arc::new(entries);
                    state.loaded_at_ms = Some(now_ms);
                }
                Err(error) => {
                    tracing::warn!(%error, path = %self.path.display(), "badge index is not valid JSON, keeping previous entries");
                }
            },
            Err(error) => {
                tracing::warn!(%error, path = %self.path.display(), "failed to read badge index, keeping previous entries");
            }
        }

        state.entries.clone()
    }
}
