//! Token-budget-aware message selection
//!
//! Keeps system messages and the most recent turns, then fills the remaining
//! budget with the highest-scoring older messages. Survivors are returned in
//! timestamp order, optionally with a synthetic summary of what was dropped.

use super::config::{WindowConfig, WindowProfile};
use super::importance::{top_keywords, ImportanceScorer, MessageImportance};
use crate::context::{ConversationMessage, HeuristicEstimator, Role, TokenEstimator};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) const WINDOW_SUMMARY_ID: &str = "window-summary";
const SUMMARY_KEYWORDS: usize = 5;
const MIN_DROPPED_FOR_SUMMARY: usize = 2;

/// Result of one optimization pass
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSlice {
    pub messages: Vec<ConversationMessage>,
    pub token_count: usize,
    pub compression_applied: bool,
    pub removed_message_count: usize,
    pub summary_added: bool,
    /// Protected messages alone exceed `max_tokens`, so `token_count` does too
    pub over_budget: bool,
}

/// Indices split into always-kept and removable messages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageCategories {
    pub preserved: Vec<usize>,
    pub removable: Vec<usize>,
}

/// Sliding window optimizer
pub struct SlidingWindowOptimizer {
    estimator: Arc<dyn TokenEstimator>,
    scorer: ImportanceScorer,
}

impl Default for SlidingWindowOptimizer {
    fn default() -> Self {
        Self::new(Arc::new(HeuristicEstimator::default()))
    }
}

impl SlidingWindowOptimizer {
    pub fn new(estimator: Arc<dyn TokenEstimator>) -> Self {
        Self {
            estimator,
            scorer: ImportanceScorer::new(),
        }
    }

    pub fn with_scorer(mut self, scorer: ImportanceScorer) -> Self {
        self.scorer = scorer;
        self
    }

    pub fn scorer(&self) -> &ImportanceScorer {
        &self.scorer
    }

    /// Optimize with a named profile sized for `model_id`
    pub fn optimize_for_profile(
        &self,
        messages: &[ConversationMessage],
        profile: WindowProfile,
        model_id: &str,
    ) -> WindowSlice {
        self.optimize_messages(messages, &WindowConfig::for_model(profile, model_id))
    }

    /// Split message indices into preserved and removable sets
    pub fn categorize_messages(
        &self,
        messages: &[ConversationMessage],
        config: &WindowConfig,
    ) -> MessageCategories {
        let tail_start = messages.len().saturating_sub(config.preserve_last_n);
        let (preserved, removable): (Vec<usize>, Vec<usize>) = (0..messages.len()).partition(|&i| {
            i >= tail_start || (config.preserve_system && messages[i].role == Role::System)
        });
        MessageCategories {
            preserved,
            removable,
        }
    }

    /// Score the messages at `indices`
    pub fn calculate_message_importance(
        &self,
        messages: &[ConversationMessage],
        indices: &[usize],
    ) -> Vec<MessageImportance> {
        indices
            .iter()
            .filter_map(|&i| messages.get(i).map(|m| (i, m)))
            .map(|(i, message)| {
                self.scorer
                    .score(message, i, messages.len(), self.tokens(message))
            })
            .collect()
    }

    /// Select a subset of `messages` that fits `config.max_tokens`
    pub fn optimize_messages(
        &self,
        messages: &[ConversationMessage],
        config: &WindowConfig,
    ) -> WindowSlice {
        let counted: Vec<ConversationMessage> = messages
            .iter()
            .map(|m| {
                let mut m = m.clone();
                m.token_count = self.tokens(&m);
                m
            })
            .collect();
        let total: usize = counted.iter().map(|m| m.token_count).sum();

        if total <= config.max_tokens {
            return WindowSlice {
                messages: counted,
                token_count: total,
                compression_applied: false,
                removed_message_count: 0,
                summary_added: false,
                over_budget: false,
            };
        }

        let categories = self.categorize_messages(&counted, config);
        let mut preserved = categories.preserved;
        let mut used: usize = preserved.iter().map(|&i| counted[i].token_count).sum();
        let mut dropped: Vec<usize> = Vec::new();

        // The preserved set alone may not fit: give up the oldest recent turns,
        // never the final message or a protected system message.
        let last = counted.len() - 1;
        let mut over_budget = false;
        while used > config.max_tokens {
            let victim = preserved.iter().position(|&i| {
                i != last && !(config.preserve_system && counted[i].role == Role::System)
            });
            let Some(position) = victim else {
                warn!(
                    used,
                    max_tokens = config.max_tokens,
                    "Protected messages exceed the window budget"
                );
                over_budget = true;
                break;
            };
            let index = preserved.remove(position);
            used -= counted[index].token_count;
            dropped.push(index);
        }

        let target = config.target_tokens();
        let mut scored = self.calculate_message_importance(&counted, &categories.removable);
        scored.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(Ordering::Equal)
        });

        let mut kept = preserved;
        for candidate in scored {
            if used + candidate.token_count <= target {
                used += candidate.token_count;
                kept.push(candidate.index);
            } else {
                dropped.push(candidate.index);
            }
        }

        kept.sort_unstable();
        let mut survivors: Vec<ConversationMessage> =
            kept.iter().map(|&i| counted[i].clone()).collect();
        survivors.sort_by_key(|m| m.timestamp);

        let mut summary_added = false;
        if config.enable_smart_summarization && dropped.len() > MIN_DROPPED_FOR_SUMMARY {
            dropped.sort_unstable();
            let removed: Vec<ConversationMessage> =
                dropped.iter().map(|&i| counted[i].clone()).collect();
            let summary = self.summary_message(&removed);
            if used + summary.token_count <= config.max_tokens {
                let position = survivors
                    .iter()
                    .position(|m| m.role != Role::System)
                    .unwrap_or(survivors.len());
                used += summary.token_count;
                survivors.insert(position, summary);
                summary_added = true;
            }
        }

        debug!(
            input = counted.len(),
            output = survivors.len(),
            tokens_before = total,
            tokens_after = used,
            summary_added,
            over_budget,
            "Compressed message window"
        );

        WindowSlice {
            messages: survivors,
            token_count: used,
            compression_applied: true,
            removed_message_count: dropped.len(),
            summary_added,
            over_budget,
        }
    }

    fn tokens(&self, message: &ConversationMessage) -> usize {
        if message.token_count > 0 {
            message.token_count
        } else {
            self.estimator.estimate_message(message)
        }
    }

    fn summary_message(&self, removed: &[ConversationMessage]) -> ConversationMessage {
        let user = removed.iter().filter(|m| m.role == Role::User).count();
        let assistant = removed.iter().filter(|m| m.role == Role::Assistant).count();
        let keywords = top_keywords(removed, SUMMARY_KEYWORDS);

        let mut text = format!(
            "[{} earlier messages omitted: {} from the user, {} from the assistant.",
            removed.len(),
            user,
            assistant
        );
        if !keywords.is_empty() {
            text.push_str(&format!(" Topics: {}.", keywords.join(", ")));
        }
        text.push(']');

        let mut message = ConversationMessage::system(text).with_id(WINDOW_SUMMARY_ID);
        if let Some(first) = removed.first() {
            message.timestamp = first.timestamp;
        }
        message.token_count = self.estimator.estimate_message(&message);
        message
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn conversation(turns: usize, chars: usize) -> Vec<ConversationMessage> {
        let base = Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap();
        let mut messages =
            vec![ConversationMessage::system("You are helpful.").with_id("sys").with_timestamp(base)];
        for i in 0..turns {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            let body = format!("turn{} {}", i, "w".repeat(chars));
            messages.push(
                ConversationMessage::new(role, body)
                    .with_id(format!("m{}", i))
                    .with_timestamp(base + ChronoDuration::seconds(i as i64 + 1)),
            );
        }
        messages
    }

    fn config(max_tokens: usize) -> WindowConfig {
        WindowConfig {
            max_tokens,
            preserve_last_n: 4,
            preserve_system: true,
            compression_ratio: 0.8,
            enable_smart_summarization: true,
        }
    }

    #[test]
    fn test_under_budget_is_untouched() {
        let optimizer = SlidingWindowOptimizer::default();
        let messages = conversation(4, 20);
        let slice = optimizer.optimize_messages(&messages, &config(10_000));
        assert!(!slice.compression_applied);
        assert_eq!(slice.messages.len(), messages.len());
        assert_eq!(slice.removed_message_count, 0);
    }

    #[test]
    fn test_categorize_preserves_system_and_tail() {
        let optimizer = SlidingWindowOptimizer::default();
        let messages = conversation(6, 10);
        let categories = optimizer.categorize_messages(&messages, &config(100));
        assert_eq!(categories.preserved, vec![0, 3, 4, 5, 6]);
        assert_eq!(categories.removable, vec![1, 2]);
    }

    #[test]
    fn test_compression_fits_budget_and_keeps_protected() {
        let optimizer = SlidingWindowOptimizer::default();
        let messages = conversation(20, 400);
        let slice = optimizer.optimize_messages(&messages, &config(1_000));

        assert!(slice.compression_applied);
        assert!(slice.token_count <= 1_000);
        assert_eq!(
            slice.token_count,
            slice.messages.iter().map(|m| m.token_count).sum::<usize>()
        );

        let ids: Vec<&str> = slice.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids[0], "sys");
        for id in ["m16", "m17", "m18", "m19"] {
            assert!(ids.contains(&id), "missing {}", id);
        }
        assert!(slice.removed_message_count > 2);
        assert!(slice.summary_added);
        assert_eq!(ids[1], WINDOW_SUMMARY_ID);
        assert!(slice.messages[1].text().contains("omitted"));
    }

    #[test]
    fn test_survivors_sorted_by_timestamp() {
        let optimizer = SlidingWindowOptimizer::default();
        let mut messages = conversation(12, 400);
        // stored out of order
        messages.swap(2, 5);
        let slice = optimizer.optimize_messages(&messages, &config(1_000));

        let stamps: Vec<_> = slice
            .messages
            .iter()
            .filter(|m| m.id != WINDOW_SUMMARY_ID)
            .map(|m| m.timestamp)
            .collect();
        assert!(stamps.windows(2).all(|pair| pair[0] <= pair[1]));
    }

    #[test]
    fn test_preserved_overflow_drops_oldest_recent_turns() {
        let optimizer = SlidingWindowOptimizer::default();
        let messages = conversation(6, 400);
        let slice = optimizer.optimize_messages(&messages, &config(300));

        assert!(slice.token_count <= 300);
        assert!(!slice.over_budget);
        let ids: Vec<&str> = slice.messages.iter().map(|m| m.id.as_str()).collect();
        assert!(ids.contains(&"sys"));
        assert!(ids.contains(&"m5"));
        assert!(!ids.contains(&"m2"));
    }

    #[test]
    fn test_protected_overflow_is_flagged() {
        let optimizer = SlidingWindowOptimizer::default();
        // the final message alone is over 100 tokens
        let messages = conversation(3, 400);
        let slice = optimizer.optimize_messages(&messages, &config(50));

        assert!(slice.compression_applied);
        assert!(slice.over_budget);
        assert!(slice.token_count > 50);
        let ids: Vec<&str> = slice.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["sys", "m2"]);
        assert_eq!(slice.removed_message_count, 2);
    }

    #[test]
    fn test_speed_profile_skips_summary() {
        let optimizer = SlidingWindowOptimizer::default();
        let messages = conversation(40, 4_000);
        let slice = optimizer.optimize_for_profile(&messages, WindowProfile::Speed, "gpt-3.5-turbo");

        assert!(slice.compression_applied);
        assert!(!slice.summary_added);
        assert!(slice.token_count <= WindowConfig::for_model(WindowProfile::Speed, "gpt-3.5-turbo").max_tokens);
        assert_eq!(slice.messages.last().unwrap().id, "m39");
    }
}
