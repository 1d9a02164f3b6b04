//! Outgoing-text normalization: formatting cleanup, persona style bans, and
//! sentence-boundary truncation.

use regex::Regex;
use std::sync::LazyLock;

/// Emoji the persona never uses. Stripped from every outgoing text; adapters
/// may override the set through their persona bundle.
pub const DEFAULT_FORBIDDEN_EMOJI: &[&str] = &["🔥", "🚀", "🙏", "😎", "✨"];

/// The persona style guide bans the rhetorical "не только X, но и Y"
/// construction; it is rewritten into a flat "и X, и Y" enumeration without an
/// extra model call.
static NOT_ONLY_BUT_ALSO: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bне\s+только\b([^\n]{0,220}?)\bно\s+и\b").expect("static regex")
});

/// Clean generated text for sending: no markdown markers, no runs of blank
/// lines, no forbidden emoji, no banned constructions, and at most
/// `max_chars` characters (cut at a sentence boundary where possible).
pub fn normalize_outgoing(text: &str, max_chars: usize, forbidden_emoji: &[&str]) -> String {
    let mut cleaned = text
        .replace("\r\n", "\n")
        .replace("**", "")
        .replace("__", "");

    cleaned = collapse_blank_lines(&cleaned);

    for emoji in forbidden_emoji {
        cleaned = cleaned.replace(emoji, "");
    }

    cleaned = NOT_ONLY_BUT_ALSO
        .replace_all(&cleaned, |caps: &regex::Captures<'_>| {
            let mid = caps.get(1).map_or("", |m| m.as_str()).trim_end();
            format!("и{mid} и")
        })
        .into_owned();

    truncate(cleaned.trim(), max_chars)
}

/// Collapse 3+ consecutive newlines down to exactly 2.
fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut run = 0usize;
    for ch in text.chars() {
        if ch == '\n' {
            run += 1;
            if run <= 2 {
                out.push(ch);
            }
        } else {
            run = 0;
            out.push(ch);
        }
    }
    out
}

/// Truncate to at most `max_chars` characters.
///
/// Text that already fits is returned unchanged. Otherwise the cut lands on
/// the last sentence terminator (`.` `!` `?`) found after character 120; a
/// text with no usable terminator is hard-cut and trimmed. Counts characters,
/// not bytes, so Cyrillic text is measured the way the platforms measure it.
pub fn truncate(text: &str, max_chars: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    if chars.len() <= max_chars {
        return text.to_string();
    }

    let sliced = &chars[..max_chars];
    if let Some(stop) = sliced
        .iter()
        .rposition(|c| matches!(c, '.' | '!' | '?'))
        && stop > 120
    {
        return sliced[..=stop].iter().collect::<String>().trim().to_string();
    }

    sliced.iter().collect::<String>().trim().to_string()
}

/// Replace every question mark (including fullwidth `？`) with a period.
///
/// Used on body text when the trailing question is generated separately, so
/// the body never competes with the call-to-action.
pub fn strip_question_marks(text: &str) -> String {
    text.chars()
        .map(|c| if c == '?' || c == '？' { '.' } else { c })
        .collect()
}
