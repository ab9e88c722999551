//! Conversation context manager with token accounting
//!
//! Implements per-conversation history with:
//! - Token accounting on every append
//! - Summarize-on-threshold using the model's warning threshold
//! - Budget-fitting reconstruction of request payloads

use super::model_limits::limits_for;
use super::models::{ConversationContext, ConversationMessage, MessageContent, Role};
use super::summarizer::{HeuristicSummarizer, SummarizationStrategy, Summarizer};
use super::token_estimator::{HeuristicEstimator, TokenEstimator};
use crate::cache::{Sweepable, TtlCache};
use crate::config::ContextConfig;
use crate::error::{Result, RuntimeError};
use crate::metrics::Metrics;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info};

pub(crate) const SUMMARY_MESSAGE_ID: &str = "conversation-summary";

type SharedContext = Arc<Mutex<ConversationContext>>;

/// Messages selected for a backend request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestMessages {
    pub messages: Vec<ConversationMessage>,
    pub total_tokens: usize,
    /// True when history (or the summary) had to be left out
    pub truncated: bool,
    pub budget: usize,
}

/// Aggregate statistics over live conversations
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextStats {
    pub conversations: usize,
    pub total_messages: usize,
    pub total_tokens: usize,
    pub summarized_conversations: usize,
}

/// Conversation context manager
pub struct ContextManager {
    contexts: Arc<TtlCache<SharedContext>>,
    estimator: Arc<dyn TokenEstimator>,
    summarizer: Arc<dyn Summarizer>,
    strategy: SummarizationStrategy,
    metrics: Option<Arc<Metrics>>,
}

impl ContextManager {
    /// Create a manager using the heuristic estimator and summarizer
    pub fn new(config: &ContextConfig) -> Result<Self> {
        let strategy = SummarizationStrategy::named(&config.summarization_strategy).ok_or_else(|| {
            RuntimeError::Configuration(format!(
                "unknown summarization strategy: {}",
                config.summarization_strategy
            ))
        })?;

        Ok(Self {
            contexts: Arc::new(TtlCache::named(
                "contexts",
                config.ttl(),
                config.max_conversations,
            )),
            estimator: Arc::new(HeuristicEstimator::default()),
            summarizer: Arc::new(HeuristicSummarizer),
            strategy,
            metrics: None,
        })
    }

    /// Swap the token estimator (e.g. for [`super::TiktokenEstimator`])
    pub fn with_estimator(mut self, estimator: Arc<dyn TokenEstimator>) -> Self {
        self.estimator = estimator;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn estimator(&self) -> Arc<dyn TokenEstimator> {
        Arc::clone(&self.estimator)
    }

    pub fn strategy(&self) -> &SummarizationStrategy {
        &self.strategy
    }

    /// Conversation storage, for registration with a sweeper
    pub fn sweep_target(&self) -> Arc<dyn Sweepable> {
        self.contexts.clone()
    }

    /// Live conversation; using it restarts its idle TTL
    fn shared(&self, conversation_id: &str) -> Result<SharedContext> {
        self.contexts
            .touch(conversation_id)
            .ok_or_else(|| RuntimeError::ConversationNotFound(conversation_id.to_string()))
    }

    /// Start an empty conversation, replacing any existing one with the same id
    pub fn create_context(&self, id: &str, user_id: &str, model_id: &str) -> ConversationContext {
        let context = ConversationContext::new(id, user_id, model_id);
        self.contexts
            .set(id.to_string(), Arc::new(Mutex::new(context.clone())));
        debug!(conversation_id = id, user_id, model_id, "Created conversation context");
        context
    }

    /// Return the conversation, creating it when absent.
    ///
    /// An existing conversation follows the model of the latest request.
    pub fn ensure_context(&self, id: &str, user_id: &str, model_id: &str) -> ConversationContext {
        let shared = self.contexts.get_or_insert_touched(id, || {
            debug!(conversation_id = id, user_id, model_id, "Created conversation context");
            Arc::new(Mutex::new(ConversationContext::new(id, user_id, model_id)))
        });
        let mut context = lock(&shared);
        if context.model_id != model_id {
            context.model_id = model_id.to_string();
        }
        context.clone()
    }

    /// Snapshot of a conversation
    pub fn get_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.contexts
            .get(conversation_id)
            .map(|shared| lock(&shared).clone())
    }

    /// Append a message, summarizing when the model's warning threshold is crossed
    pub fn add_message(
        &self,
        conversation_id: &str,
        role: Role,
        content: impl Into<MessageContent>,
        message_id: Option<String>,
    ) -> Result<ConversationMessage> {
        let shared = self.shared(conversation_id)?;
        let mut context = lock(&shared);

        let mut message = ConversationMessage::new(role, content);
        if let Some(id) = message_id {
            message.id = id;
        }
        message.token_count = self.estimator.estimate_message(&message);

        context.messages.push(message.clone());
        context.updated_at = Utc::now();
        self.recompute_total(&mut context);

        let limits = limits_for(&context.model_id);
        if context.total_tokens > limits.warning_threshold {
            info!(
                conversation_id,
                total_tokens = context.total_tokens,
                warning_threshold = limits.warning_threshold,
                "Context crossed warning threshold"
            );
            let strategy = self.strategy.clone();
            self.summarize_context(&mut context, &strategy);
        }

        Ok(message)
    }

    /// Collapse all but the `preserve_recent_messages` newest messages into
    /// the running summary.
    ///
    /// Returns true when anything was summarized. The new summary section is
    /// appended to any existing summary. The preserved tail is kept verbatim
    /// even when it alone exceeds `target_tokens`.
    pub fn summarize_context(
        &self,
        context: &mut ConversationContext,
        strategy: &SummarizationStrategy,
    ) -> bool {
        let count = context.messages.len();
        if count <= strategy.preserve_recent_messages {
            return false;
        }

        let split = count - strategy.preserve_recent_messages;
        let before = context.total_tokens;
        let collapsed: Vec<ConversationMessage> = context.messages.drain(..split).collect();
        let section = self.summarizer.summarize(&collapsed);

        context.summary = match context.summary.take() {
            Some(existing) if !existing.is_empty() => Some(format!("{}\n\n{}", existing, section)),
            _ => Some(section),
        };
        context.updated_at = Utc::now();
        self.recompute_total(context);

        if let Some(metrics) = &self.metrics {
            metrics.record_summarization();
        }
        info!(
            conversation_id = %context.id,
            strategy = %strategy.name,
            collapsed = collapsed.len(),
            kept = context.messages.len(),
            tokens_before = before,
            tokens_after = context.total_tokens,
            target_tokens = strategy.target_tokens,
            "Summarized conversation"
        );
        true
    }

    /// Summarize a stored conversation with an explicit strategy
    pub fn summarize_conversation(
        &self,
        conversation_id: &str,
        strategy: &SummarizationStrategy,
    ) -> Result<bool> {
        let shared = self.shared(conversation_id)?;
        let mut context = lock(&shared);
        Ok(self.summarize_context(&mut context, strategy))
    }

    /// Summarize only when the conversation exceeds the strategy's trigger
    pub fn summarize_if_needed(
        &self,
        conversation_id: &str,
        strategy: &SummarizationStrategy,
    ) -> Result<bool> {
        let shared = self.shared(conversation_id)?;
        let mut context = lock(&shared);
        if context.total_tokens <= strategy.trigger_tokens {
            return Ok(false);
        }
        Ok(self.summarize_context(&mut context, strategy))
    }

    /// Build the payload for a request: the summary first when it fits, then
    /// as many of the newest messages as the model's budget allows, in
    /// chronological order.
    pub fn get_messages_for_request(
        &self,
        conversation_id: &str,
        model_id: &str,
    ) -> Result<RequestMessages> {
        let context = lock(&self.shared(conversation_id)?).clone();

        let budget = limits_for(model_id).budget();
        let mut used = 0usize;
        let mut truncated = false;

        let mut selected: Vec<ConversationMessage> = Vec::new();
        if let Some(summary) = context.summary.as_deref().filter(|s| !s.is_empty()) {
            let message = summary_message(summary, &*self.estimator);
            if message.token_count <= budget {
                used += message.token_count;
                selected.push(message);
            } else {
                truncated = true;
            }
        }
        let prefix_len = selected.len();

        let mut recent: Vec<ConversationMessage> = Vec::new();
        for message in context.messages.iter().rev() {
            let tokens = self.message_tokens(message);
            if used + tokens > budget {
                truncated = true;
                break;
            }
            used += tokens;
            recent.push(message.clone());
        }
        recent.reverse();
        selected.extend(recent);

        if truncated {
            if let Some(metrics) = &self.metrics {
                metrics.record_truncation();
            }
            debug!(
                conversation_id,
                kept = selected.len() - prefix_len,
                total = context.messages.len(),
                budget,
                "Request history truncated"
            );
        }

        Ok(RequestMessages {
            messages: selected,
            total_tokens: used,
            truncated,
            budget,
        })
    }

    /// Full history with the running summary, if any, as a leading system message
    pub fn conversation_messages(&self, conversation_id: &str) -> Result<Vec<ConversationMessage>> {
        let context = self
            .get_context(conversation_id)
            .ok_or_else(|| RuntimeError::ConversationNotFound(conversation_id.to_string()))?;

        let mut messages = Vec::with_capacity(context.messages.len() + 1);
        if let Some(summary) = context.summary.as_deref().filter(|s| !s.is_empty()) {
            let mut message = summary_message(summary, &*self.estimator);
            if let Some(first) = context.messages.first() {
                message.timestamp = first.timestamp;
            }
            messages.push(message);
        }
        messages.extend(context.messages);
        Ok(messages)
    }

    /// Remove a conversation
    pub fn delete_conversation(&self, conversation_id: &str) -> bool {
        let removed = self.contexts.delete(conversation_id);
        if removed {
            debug!(conversation_id, "Deleted conversation");
        }
        removed
    }

    /// Drop expired conversations
    pub fn cleanup(&self) -> usize {
        self.contexts.cleanup()
    }

    pub fn stats(&self) -> ContextStats {
        self.contexts
            .values()
            .iter()
            .fold(ContextStats::default(), |mut stats, shared| {
                let context = lock(shared);
                stats.conversations += 1;
                stats.total_messages += context.messages.len();
                stats.total_tokens += context.total_tokens;
                if context.summary.is_some() {
                    stats.summarized_conversations += 1;
                }
                stats
            })
    }

    fn message_tokens(&self, message: &ConversationMessage) -> usize {
        if message.token_count > 0 {
            message.token_count
        } else {
            self.estimator.estimate_message(message)
        }
    }

    fn recompute_total(&self, context: &mut ConversationContext) {
        let messages: usize = context.messages.iter().map(|m| self.message_tokens(m)).sum();
        let summary = context
            .summary
            .as_deref()
            .map(|s| self.estimator.estimate(s))
            .unwrap_or(0);
        context.total_tokens = messages + summary;
    }
}

/// System message carrying a conversation summary
pub(crate) fn summary_message(summary: &str, estimator: &dyn TokenEstimator) -> ConversationMessage {
    let mut message = ConversationMessage::system(format!("Summary of earlier conversation:\n{}", summary))
        .with_id(SUMMARY_MESSAGE_ID);
    message.token_count = estimator.estimate_message(&message);
    message
}

fn lock(shared: &SharedContext) -> MutexGuard<'_, ConversationContext> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}
