//! Heuristic importance scoring for conversation messages

use crate::cache::TtlCache;
use crate::context::{ConversationMessage, Role};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

const MEMO_TTL: Duration = Duration::from_secs(600);
const MEMO_CAPACITY: usize = 2_000;
const MEMO_PREFIX_CHARS: usize = 50;

static IMPORTANT_KEYWORDS: Lazy<Vec<&'static str>> = Lazy::new(|| {
    vec![
        "error", "important", "remember", "explain", "must", "critical", "required", "never",
        "always", "bug", "fix", "decision", "deadline", "password", "config",
    ]
});

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "the", "a", "an", "and", "or", "but", "is", "are", "was", "were", "be", "been", "to", "of",
        "in", "on", "for", "with", "at", "by", "from", "it", "this", "that", "these", "those", "i",
        "you", "he", "she", "we", "they", "me", "my", "your", "our", "can", "could", "would",
        "should", "will", "do", "does", "did", "have", "has", "had", "not", "what", "how", "why",
        "when", "where", "which", "who", "there", "here", "about", "into", "just", "also", "some",
        "any", "all", "so", "if", "then", "than", "as", "please", "thanks",
    ]
    .into_iter()
    .collect()
});

/// Importance of one candidate message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageImportance {
    pub index: usize,
    pub message: ConversationMessage,
    pub token_count: usize,
    /// Score in `[0, 1]`
    pub importance: f64,
    pub reasons: Vec<String>,
}

#[derive(Debug, Clone)]
struct ContentScore {
    score: f64,
    reasons: Vec<String>,
}

/// Scores messages, memoizing the content-dependent part by role and prefix
pub struct ImportanceScorer {
    memo: TtlCache<ContentScore>,
}

impl Default for ImportanceScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl ImportanceScorer {
    pub fn new() -> Self {
        Self::with_limits(MEMO_TTL, MEMO_CAPACITY)
    }

    /// Scorer whose memo keeps at most `max_size` entries for `ttl`
    pub fn with_limits(ttl: Duration, max_size: usize) -> Self {
        Self {
            memo: TtlCache::named("importance", ttl, max_size),
        }
    }

    /// Score a message at `index` of a conversation of `total` messages
    pub fn score(
        &self,
        message: &ConversationMessage,
        index: usize,
        total: usize,
        token_count: usize,
    ) -> MessageImportance {
        let text = message.text();
        let key = memo_key(message.role, &text);
        let content = self
            .memo
            .get_or_insert_with(&key, || content_score(message.role, &text));

        let mut reasons = content.reasons;
        let recency = if total > 1 {
            0.2 * index as f64 / (total - 1) as f64
        } else {
            0.2
        };
        if recency >= 0.15 {
            reasons.push("recent".to_string());
        }

        MessageImportance {
            index,
            message: message.clone(),
            token_count,
            importance: (content.score + recency).clamp(0.0, 1.0),
            reasons,
        }
    }

    pub fn memoized(&self) -> usize {
        self.memo.len()
    }

    pub fn clear(&self) {
        self.memo.clear();
    }
}

fn memo_key(role: Role, text: &str) -> String {
    let prefix: String = text.chars().take(MEMO_PREFIX_CHARS).collect();
    format!("{}:{}", role, prefix)
}

fn content_score(role: Role, text: &str) -> ContentScore {
    let mut reasons = Vec::new();
    let mut score = match role {
        Role::System => 0.5,
        Role::Assistant => 0.3,
        Role::User => 0.25,
    };

    let length = text.chars().count();
    if length > 0 {
        score += 0.15 * (length as f64 / 500.0).min(1.0);
        if length >= 200 {
            reasons.push("detailed".to_string());
        }
    }

    let lowered = text.to_lowercase();
    let hits: Vec<&str> = IMPORTANT_KEYWORDS
        .iter()
        .copied()
        .filter(|keyword| lowered.contains(keyword))
        .collect();
    if !hits.is_empty() {
        score += (0.05 * hits.len() as f64).min(0.2);
        reasons.extend(hits.iter().map(|keyword| format!("keyword:{}", keyword)));
    }

    if text.contains('?') {
        score += 0.05;
        reasons.push("question".to_string());
    }
    if text.contains("```") {
        score += 0.05;
        reasons.push("code".to_string());
    }

    let trimmed = text.trim_end();
    if trimmed.ends_with(&['.', '!', '?'][..]) {
        score += 0.05;
        reasons.push("complete".to_string());
    }

    ContentScore { score, reasons }
}

/// Most frequent non-stop-words of the given messages
pub fn top_keywords(messages: &[ConversationMessage], limit: usize) -> Vec<String> {
    let mut counts: HashMap<String, (usize, usize)> = HashMap::new();
    let mut order = 0usize;
    for message in messages {
        for word in message
            .text()
            .split(|c: char| !c.is_alphanumeric())
            .map(str::to_lowercase)
            .filter(|w| w.chars().count() > 2 && !STOP_WORDS.contains(w.as_str()))
        {
            let entry = counts.entry(word).or_insert((0, order));
            entry.0 += 1;
            order += 1;
        }
    }

    let mut ranked: Vec<(String, (usize, usize))> = counts.into_iter().collect();
    // ties go to the word seen first
    ranked.sort_by(|a, b| b.1 .0.cmp(&a.1 .0).then(a.1 .1.cmp(&b.1 .1)));
    ranked.into_iter().take(limit).map(|(word, _)| word).collect()
}
