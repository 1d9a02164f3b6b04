//! Prompt assembly: the persona bundle and an ordered builder of typed
//! fragments, so presence and ordering of each piece stays testable.

use crate::Platform;
use crate::badges::BadgeEntry;
use crate::llm::{ChatContent, ChatMessage};
use crate::memory::{MemoryMessage, Role};

/// Everything persona-specific an adapter needs: the voice, the per-call
/// guides, the deterministic fallbacks, and the platform signature prefix.
#[derive(Debug, Clone)]
pub struct PersonaBundle {
    /// Persona system message (who is speaking).
    pub system_prompt: String,
    /// Content-quality guide appended to new-post instructions.
    pub quality_guide: String,
    /// Persona speech bans (constructions the voice never uses).
    pub style_bans: String,
    /// How to pose the single trailing question, when one is posed.
    pub cta_playbook: String,
    /// Returned when no API key is configured.
    pub fallback_unconfigured: String,
    /// Returned when the provider call fails.
    pub fallback_error: String,
    /// Signature prefix prepended to VK comments.
    pub message_prefix: Option<String>,
    /// Emoji stripped from every outgoing text.
    pub forbidden_emoji: Vec<String>,
}

impl Default for PersonaBundle {
    fn default() -> Self {
        Self {
            system_prompt: "Ты — Валюша, виртуальная вожатая лагеря «Реальный мир». \
                Ты тепло и по делу комментируешь посты и отвечаешь участникам. \
                Тон дружелюбный, без пафоса и канцелярита. Пишешь по-русски, \
                короткими абзацами. Хорошо разбираешься в 4K-навыках \
                (критическое мышление, креативность, коммуникация, командная работа), \
                софт-скиллах и применении нейросетей для учёбы и творчества. \
                Любимый эмодзи — 💜, используешь эмодзи умеренно."
                .into(),
            quality_guide: "Качество: добавь 1 конкретную мысль/пример по теме. \
                Свяжи с 4K-навыками/софт-скиллами/ИИ (если уместно). Без воды."
                .into(),
            style_bans: "Речь: НЕ используй конструкцию «не только …, но и …». \
                Старайся не строить текст на постоянных противопоставлениях."
                .into(),
            cta_playbook: "CTA: если задаёшь вопрос (максимум 1), сделай его умным и \
                конкретным. Выбери один тип: вопрос-выбор (2 варианта); мини-кейс \
                «как бы вы поступили»; микрозадание на день; просьба поделиться \
                практикой/инструментом; вопрос через призму 4K-навыков. Не задавай \
                банальные «что запомнилось/как вам»."
                .into(),
            fallback_unconfigured: "Спасибо за тему! 💜 Давайте развернём её в сторону \
                4K-навыков: что здесь про критическое мышление, креатив или команду?"
                .into(),
            fallback_error: "Классная мысль! 💜 Какой 4K-навык тут прокачивается сильнее всего?"
                .into(),
            message_prefix: Some("Сообщение от Валюши:".into()),
            forbidden_emoji: crate::text::DEFAULT_FORBIDDEN_EMOJI
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

fn platform_label(platform: Platform) -> &'static str {
    match platform {
        Platform::Vk => "ВК",
        Platform::Telegram => "Telegram",
    }
}

/// Task instruction for commenting a brand-new post.
pub fn new_post_task(platform: Platform, has_image: bool, persona: &PersonaBundle) -> String {
    let image_note = if has_image {
        " Учитывай изображение; если текста нет — опирайся на изображение."
    } else {
        ""
    };
    format!(
        "СЕЙЧАС: напиши один комментарий к новому посту в {} (1–3 коротких абзаца, \
         300–700 знаков, 0–3 эмодзи, без markdown).{} В конце можно 1 вопрос. {} {} {}",
        platform_label(platform),
        image_note,
        persona.quality_guide,
        persona.style_bans,
        persona.cta_playbook,
    )
}

/// Task instruction for replying inside an existing thread.
pub fn reply_task(platform: Platform, persona: &PersonaBundle) -> String {
    format!(
        "СЕЙЧАС: ответь как комментарий в {}, учитывая контекст переписки выше. \
         1–3 коротких абзаца, 150–700 знаков, 0–3 эмодзи, без markdown. \
         Не повторяй дословно чужие слова. {} Если задаёшь вопрос — максимум 1, \
         конкретный, не шаблонный.",
        platform_label(platform),
        persona.style_bans,
    )
}

/// One typed piece of the prompt. The builder renders fragments in push
/// order; the badge directive is always unambiguous (exactly this badge, or
/// none at all).
#[derive(Debug, Clone)]
pub enum PromptFragment {
    /// Persona system message.
    Persona(String),
    /// Task-specific instruction (system message).
    Task(String),
    /// Badge directive: `Some` ⇒ mention exactly this badge, `None` ⇒ mention
    /// no badge. `strict` picks the new-post wording over the reply wording.
    BadgeDirective { badge: Option<BadgeEntry>, strict: bool },
    /// Remembered conversation turns, oldest first.
    MemoryTurns(Vec<MemoryMessage>),
    /// The user-visible content being responded to.
    User(ChatContent),
}

fn badge_directive_text(badge: Option<&BadgeEntry>, strict: bool) -> String {
    match (badge, strict) {
        (Some(badge), true) => format!(
            "В этом комментарии упомяни ровно один значок Путеводителя (ID + название), \
             он хорошо подходит к теме поста:\n- {} «{}»\nНе упоминай другие значки.",
            badge.id, badge.title
        ),
        (Some(badge), false) => format!(
            "Если это реально уместно в ответе, можешь упомянуть один значок (ID + название):\n\
             - {} «{}»\nЕсли не уместно — не упоминай значки вообще.",
            badge.id, badge.title
        ),
        (None, true) => {
            "Для этого комментария значок не подходит — НЕ упоминай значки Путеводителя.".into()
        }
        (None, false) => {
            "Значок к этой реплике не подходит — НЕ упоминай значки Путеводителя.".into()
        }
    }
}

/// Ordered prompt builder.
#[derive(Debug, Default)]
pub struct PromptBuilder {
    fragments: Vec<PromptFragment>,
}

impl PromptBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn persona(mut self, persona: &PersonaBundle) -> Self {
        self.fragments
            .push(PromptFragment::Persona(persona.system_prompt.clone()));
        self
    }

    pub fn task(mut self, instruction: String) -> Self {
        self.fragments.push(PromptFragment::Task(instruction));
        self
    }

    pub fn badge_directive(mut self, badge: Option<BadgeEntry>, strict: bool) -> Self {
        self.fragments
            .push(PromptFragment::BadgeDirective { badge, strict });
        self
    }

    pub fn memory_turns(mut self, turns: Vec<MemoryMessage>) -> Self {
        self.fragments.push(PromptFragment::MemoryTurns(turns));
        self
    }

    pub fn user_content(mut self, content: ChatContent) -> Self {
        self.fragments.push(PromptFragment::User(content));
        self
    }

    /// Render the fragments into wire messages, preserving push order.
    pub fn build(self) -> Vec<ChatMessage> {
        let mut messages = Vec::new();
        for fragment in self.fragments {
            match fragment {
                PromptFragment::Persona(text) | PromptFragment::Task(text) => {
                    messages.push(ChatMessage::system(text));
                }
                PromptFragment::BadgeDirective { badge, strict } => {
                    messages.push(ChatMessage::system(badge_directive_text(
                        badge.as_ref(),
                        strict,
                    )));
                }
                PromptFragment::MemoryTurns(turns) => {
                    for turn in turns {
                        messages.push(match turn.role {
                            Role::User => ChatMessage::user(turn.content),
                            Role::Assistant => ChatMessage::assistant(turn.content),
                        });
                    }
                }
                PromptFragment::User(content) => {
                    messages.push(ChatMessage { role: crate::llm::ChatRole::User, content });
                }
            }
        }
        messages
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ChatRole;

    fn sample_badge() -> BadgeEntry {
        BadgeEntry {
            id: "12.1".into(),
            title: "Нейросети для творчества".into(),
            emoji: None,
            category_id: Some("12".into()),
            category_title: None,
            description: None,
            skill_tips: None,
        }
    }

    #[test]
    fn test_builder_preserves_order() {
        let persona = PersonaBundle::default();
        let messages = PromptBuilder::new()
            .persona(&persona)
            .task(new_post_task(Platform::Vk, false, &persona))
            .badge_directive(None, true)
            .user_content(ChatContent::Text("Текст поста:\nпривет".into()))
            .build();

        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0].role, ChatRole::System);
        assert_eq!(messages[1].role, ChatRole::System);
        assert!(messages[1].content.as_text().contains("СЕЙЧАС"));
        assert!(messages[2].content.as_text().contains("НЕ упоминай"));
        assert_eq!(messages[3].role, ChatRole::User);
    }

    #[test]
    fn test_badge_directive_is_never_ambiguous() {
        let with_badge = badge_directive_text(Some(&sample_badge()), true);
        assert!(with_badge.contains("ровно один"));
        assert!(with_badge.contains("12.1"));

        let without = badge_directive_text(None, true);
        assert!(without.contains("НЕ упоминай"));
        assert!(!without.contains("12.1"));
    }

    #[test]
    fn test_memory_turns_map_to_roles() {
        let messages = PromptBuilder::new()
            .memory_turns(vec![
                MemoryMessage::user("вопрос"),
                MemoryMessage::assistant("ответ"),
            ])
            .build();
        assert_eq!(messages[0].role, ChatRole::User);
        assert_eq!(messages[1].role, ChatRole::Assistant);
    }

    #[test]
    fn test_new_post_task_mentions_image_only_when_present() {
        let persona = PersonaBundle::default();
        assert!(new_post_task(Platform::Telegram, true, &persona).contains("изображение"));
        assert!(!new_post_task(Platform::Telegram, false, &persona).contains("изображение"));
    }
}
