//! Conversation summarization for history compression

use super::models::{ConversationMessage, Role};
use serde::{Deserialize, Serialize};

const MAX_QUESTIONS: usize = 3;
const QUESTION_CHARS: usize = 100;
const MAX_ANSWERS: usize = 3;
const ANSWER_CHARS: usize = 150;

/// When and how aggressively a conversation is compressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummarizationStrategy {
    pub name: String,
    /// History size at which [`super::ContextManager::summarize_if_needed`] acts
    pub trigger_tokens: usize,
    /// Size the compressed history should settle near; the preserved tail may exceed it
    pub target_tokens: usize,
    /// Most recent messages kept verbatim
    pub preserve_recent_messages: usize,
}

impl SummarizationStrategy {
    fn preset(name: &str, trigger_tokens: usize, target_tokens: usize, preserve: usize) -> Self {
        Self {
            name: name.to_string(),
            trigger_tokens,
            target_tokens,
            preserve_recent_messages: preserve,
        }
    }

    pub fn conservative() -> Self {
        Self::preset("conservative", 12_000, 10_000, 20)
    }

    pub fn balanced() -> Self {
        Self::preset("balanced", 10_000, 8_000, 10)
    }

    pub fn aggressive() -> Self {
        Self::preset("aggressive", 8_000, 5_000, 6)
    }

    pub fn minimal() -> Self {
        Self::preset("minimal", 6_000, 3_000, 4)
    }

    /// Look up a preset by name
    pub fn named(name: &str) -> Option<Self> {
        match name {
            "conservative" => Some(Self::conservative()),
            "balanced" => Some(Self::balanced()),
            "aggressive" => Some(Self::aggressive()),
            "minimal" => Some(Self::minimal()),
            _ => None,
        }
    }
}

impl Default for SummarizationStrategy {
    fn default() -> Self {
        Self::balanced()
    }
}

/// Summarizer trait for different summarization strategies
pub trait Summarizer: Send + Sync {
    /// Collapse a run of messages into a short summary
    fn summarize(&self, messages: &[ConversationMessage]) -> String;
}

/// Extractive summarizer: turn counts, leading user questions and the first
/// sentence of assistant replies
#[derive(Debug, Default, Clone)]
pub struct HeuristicSummarizer;

impl Summarizer for HeuristicSummarizer {
    fn summarize(&self, messages: &[ConversationMessage]) -> String {
        if messages.is_empty() {
            return String::new();
        }

        let user_turns = messages.iter().filter(|m| m.role == Role::User).count();
        let assistant_turns = messages.iter().filter(|m| m.role == Role::Assistant).count();

        let questions: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::User)
            .map(|m| m.text())
            .filter(|text| !text.trim().is_empty())
            .take(MAX_QUESTIONS)
            .map(|text| truncate_chars(text.trim(), QUESTION_CHARS))
            .collect();

        let answers: Vec<String> = messages
            .iter()
            .filter(|m| m.role == Role::Assistant)
            .filter_map(|m| first_sentence(&m.text()))
            .take(MAX_ANSWERS)
            .map(|sentence| truncate_chars(&sentence, ANSWER_CHARS))
            .collect();

        let mut summary = format!(
            "Earlier conversation: {} user message(s) and {} assistant response(s).",
            user_turns, assistant_turns
        );
        if !questions.is_empty() {
            summary.push_str(" User asked about: ");
            summary.push_str(&questions.join("; "));
            summary.push('.');
        }
        if !answers.is_empty() {
            summary.push_str(" Key points: ");
            summary.push_str(&answers.join(" "));
        }
        summary
    }
}

/// Simple concatenation-based summarizer (fallback)
#[derive(Debug, Default, Clone)]
pub struct ConcatenationSummarizer;

impl Summarizer for ConcatenationSummarizer {
    fn summarize(&self, messages: &[ConversationMessage]) -> String {
        messages
            .iter()
            .map(|m| format!("{}: {}", m.role, truncate_chars(m.text().trim(), QUESTION_CHARS)))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

fn first_sentence(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    let end = trimmed
        .char_indices()
        .find(|(_, c)| matches!(c, '.' | '!' | '?' | '\n'))
        .map(|(i, c)| i + c.len_utf8())
        .unwrap_or(trimmed.len());
    Some(trimmed[..end].trim().to_string())
}

pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let truncated: String = text.chars().take(max_chars).collect();
    format!("{}...", truncated.trim_end())
}
