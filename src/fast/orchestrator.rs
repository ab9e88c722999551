//! Deadline-bounded fast response orchestration
//!
//! Tries progressively more expensive strategies: an instant canned reply, a
//! coarse-keyed aggressive cache, then compressed and possibly downgraded
//! generation raced against precomputed replies. The whole attempt runs under
//! the configured target latency.

use super::downgrade::faster_model;
use super::instant::{instant_reply, normalize_prompt};
use super::race::{race, RaceSource};
use crate::backend::{GenerationParams, LlmBackend, TokenUsage};
use crate::cache::generate_cache_key;
use crate::config::FastConfig;
use crate::context::{ConversationMessage, Role};
use crate::context::summarizer::truncate_chars;
use crate::error::{Result, RuntimeError};
use crate::metrics::Metrics;
use crate::rate_limit::UserType;
use crate::window::{SlidingWindowOptimizer, WindowProfile};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Shortcut or transformation applied on the fast path
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Optimization {
    InstantResponse,
    AggressiveCache,
    ContextCompression,
    ModelDowngrade,
    Precomputed,
}

impl Optimization {
    pub fn as_str(&self) -> &'static str {
        match self {
            Optimization::InstantResponse => "instant_response",
            Optimization::AggressiveCache => "aggressive_cache",
            Optimization::ContextCompression => "context_compression",
            Optimization::ModelDowngrade => "model_downgrade",
            Optimization::Precomputed => "precomputed",
        }
    }
}

impl fmt::Display for Optimization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Input to the fast path
#[derive(Debug, Clone)]
pub struct FastRequest {
    pub user_type: UserType,
    pub model_id: String,
    /// Full history, oldest first, ending with the user's message
    pub messages: Vec<ConversationMessage>,
    /// Allow substituting a faster model
    pub prioritize_speed: bool,
}

/// Outcome of the fast path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastResponse {
    pub text: String,
    /// Model that produced the text
    pub model_id: String,
    pub optimizations: Vec<Optimization>,
    pub cached: bool,
    pub context_compressed: bool,
    pub response_time_ms: u64,
    pub usage: Option<TokenUsage>,
}

/// A reply that needs no backend call
#[derive(Debug, Clone, PartialEq)]
pub struct Shortcut {
    pub text: String,
    pub optimization: Optimization,
}

/// Model and messages to send once shortcuts have missed
#[derive(Debug, Clone)]
pub struct PreparedGeneration {
    pub model_id: String,
    pub messages: Vec<ConversationMessage>,
    pub optimizations: Vec<Optimization>,
    pub context_compressed: bool,
}

/// Fast path statistics
#[derive(Debug, Clone, Serialize)]
pub struct FastStats {
    pub aggressive_cache_entries: u64,
    pub precomputed_responses: usize,
}

/// Fast response orchestrator
pub struct FastResponseOrchestrator {
    config: FastConfig,
    backend: Arc<dyn LlmBackend>,
    window: Arc<SlidingWindowOptimizer>,
    params: GenerationParams,
    aggressive: Cache<String, String>,
    precomputed: DashMap<String, String>,
    metrics: Option<Arc<Metrics>>,
}

impl FastResponseOrchestrator {
    pub fn new(
        config: FastConfig,
        backend: Arc<dyn LlmBackend>,
        window: Arc<SlidingWindowOptimizer>,
        params: GenerationParams,
    ) -> Self {
        let aggressive = Cache::builder()
            .max_capacity(config.aggressive_cache_capacity)
            .time_to_live(config.aggressive_cache_ttl())
            .build();

        Self {
            config,
            backend,
            window,
            params,
            aggressive,
            precomputed: DashMap::new(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn config(&self) -> &FastConfig {
        &self.config
    }

    /// Register a ready-made reply for a prompt
    pub fn precompute(&self, prompt: &str, reply: impl Into<String>) {
        self.precomputed.insert(normalize_prompt(prompt), reply.into());
    }

    pub fn precomputed_response(&self, prompt: &str) -> Option<String> {
        self.precomputed
            .get(&normalize_prompt(prompt))
            .map(|entry| entry.value().clone())
    }

    /// Coarse key: truncated last message, model and history length
    pub fn fingerprint(&self, model_id: &str, messages: &[ConversationMessage]) -> String {
        let last = messages.last().map(|m| m.text()).unwrap_or_default();
        generate_cache_key(
            "fast",
            &json!({
                "text": truncate_chars(&normalize_prompt(&last), self.config.fingerprint_chars),
                "model": model_id,
                "count": messages.len(),
            }),
        )
    }

    /// Store a reply in the aggressive cache
    pub async fn remember(&self, model_id: &str, messages: &[ConversationMessage], text: &str) {
        if self.config.enable_aggressive_cache {
            self.aggressive
                .insert(self.fingerprint(model_id, messages), text.to_string())
                .await;
        }
    }

    /// Instant reply or aggressive cache hit, if either applies
    pub async fn shortcut(&self, model_id: &str, messages: &[ConversationMessage]) -> Option<Shortcut> {
        let last_user = messages.iter().rev().find(|m| m.role == Role::User);

        if self.config.enable_instant_responses {
            if let Some(reply) = last_user.and_then(|m| instant_reply(&m.text())) {
                debug!(model_id, "Instant reply matched");
                return Some(Shortcut {
                    text: reply.to_string(),
                    optimization: Optimization::InstantResponse,
                });
            }
        }

        if self.config.enable_aggressive_cache {
            let hit = self.aggressive.get(&self.fingerprint(model_id, messages)).await;
            if let Some(metrics) = &self.metrics {
                metrics.record_cache_lookup("aggressive", hit.is_some());
            }
            if let Some(text) = hit {
                debug!(model_id, "Aggressive cache hit");
                return Some(Shortcut {
                    text,
                    optimization: Optimization::AggressiveCache,
                });
            }
        }

        None
    }

    /// Compress the history and pick the model for a backend call
    pub fn prepare(&self, request: &FastRequest) -> PreparedGeneration {
        let mut optimizations = Vec::new();
        let mut messages = request.messages.clone();
        let mut context_compressed = false;

        if self.config.enable_compression {
            let slice = self
                .window
                .optimize_for_profile(&messages, WindowProfile::Speed, &request.model_id);
            if slice.compression_applied {
                debug!(
                    removed = slice.removed_message_count,
                    over_budget = slice.over_budget,
                    tokens = slice.token_count,
                    "Compressed context for fast path"
                );
                messages = slice.messages;
                context_compressed = true;
                optimizations.push(Optimization::ContextCompression);
            }
        }

        let mut model_id = request.model_id.clone();
        if self.config.enable_model_downgrade && request.prioritize_speed {
            if let Some(faster) = faster_model(&request.model_id, request.user_type) {
                debug!(from = %request.model_id, to = faster, "Downgrading model for speed");
                model_id = faster.to_string();
                optimizations.push(Optimization::ModelDowngrade);
            }
        }

        PreparedGeneration {
            model_id,
            messages,
            optimizations,
            context_compressed,
        }
    }

    /// Produce a reply within the target latency, or fail with
    /// [`RuntimeError::Timeout`]
    pub async fn generate_fast_response(
        &self,
        request: &FastRequest,
        cancel: &CancellationToken,
    ) -> Result<FastResponse> {
        let start = Instant::now();
        let deadline = self.config.target_latency();

        match tokio::time::timeout(deadline, self.run(request, cancel, start)).await {
            Ok(result) => {
                if let Ok(response) = &result {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_response("fast", start.elapsed());
                        for optimization in &response.optimizations {
                            metrics.record_optimization(optimization.as_str());
                        }
                    }
                }
                result
            }
            Err(_) => {
                let elapsed_ms = start.elapsed().as_millis() as u64;
                warn!(model_id = %request.model_id, elapsed_ms, "Fast response deadline exceeded");
                Err(RuntimeError::Timeout { elapsed_ms })
            }
        }
    }

    async fn run(
        &self,
        request: &FastRequest,
        cancel: &CancellationToken,
        start: Instant,
    ) -> Result<FastResponse> {
        if let Some(shortcut) = self.shortcut(&request.model_id, &request.messages).await {
            return Ok(FastResponse {
                text: shortcut.text,
                model_id: request.model_id.clone(),
                optimizations: vec![shortcut.optimization],
                cached: shortcut.optimization == Optimization::AggressiveCache,
                context_compressed: false,
                response_time_ms: start.elapsed().as_millis() as u64,
                usage: None,
            });
        }

        let prepared = self.prepare(request);
        let prompt = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.text())
            .unwrap_or_default();

        let generation = async {
            self.backend
                .generate(&prepared.model_id, &prepared.messages, &self.params)
                .await
                .map(|generation| (generation.text, generation.usage))
        };
        let lookup = async {
            if self.config.enable_precomputed {
                self.precomputed_response(&prompt).map(|text| (text, None))
            } else {
                None
            }
        };

        let ((text, usage), source) = race(cancel, generation, lookup).await?;

        let mut optimizations = prepared.optimizations;
        if source == RaceSource::Shortcut {
            optimizations.push(Optimization::Precomputed);
        } else {
            self.remember(&request.model_id, &request.messages, &text).await;
        }

        let response_time_ms = start.elapsed().as_millis() as u64;
        info!(
            model_id = %prepared.model_id,
            response_time_ms,
            optimizations = ?optimizations,
            "Fast response ready"
        );

        Ok(FastResponse {
            text,
            model_id: prepared.model_id,
            optimizations,
            cached: false,
            context_compressed: prepared.context_compressed,
            response_time_ms,
            usage,
        })
    }

    pub fn clear_cache(&self) {
        self.aggressive.invalidate_all();
    }

    pub fn stats(&self) -> FastStats {
        FastStats {
            aggressive_cache_entries: self.aggressive.entry_count(),
            precomputed_responses: self.precomputed.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use std::time::Duration;

    fn orchestrator(mock: Arc<MockBackend>, config: FastConfig) -> FastResponseOrchestrator {
        FastResponseOrchestrator::new(
            config,
            mock,
            Arc::new(SlidingWindowOptimizer::default()),
            GenerationParams::speed(256, 0.3),
        )
    }

    fn request(text: &str) -> FastRequest {
        FastRequest {
            user_type: UserType::Regular,
            model_id: "gpt-4o".to_string(),
            messages: vec![ConversationMessage::user(text)],
            prioritize_speed: false,
        }
    }

    #[tokio::test]
    async fn test_instant_reply_skips_backend() {
        let mock = Arc::new(MockBackend::new("generated"));
        let fast = orchestrator(Arc::clone(&mock), FastConfig::default());

        let response = fast
            .generate_fast_response(&request("hello!"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.optimizations, vec![Optimization::InstantResponse]);
        assert!(!response.cached);
        assert_eq!(mock.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_aggressive_cache_reuses_reply() {
        let mock = Arc::new(MockBackend::new("The answer is 42."));
        let fast = orchestrator(Arc::clone(&mock), FastConfig::default());
        let token = CancellationToken::new();

        let first = fast
            .generate_fast_response(&request("What is the answer?"), &token)
            .await
            .unwrap();
        assert!(!first.cached);

        let second = fast
            .generate_fast_response(&request("what is the answer"), &token)
            .await
            .unwrap();
        assert!(second.cached);
        assert_eq!(second.text, "The answer is 42.");
        assert_eq!(second.optimizations, vec![Optimization::AggressiveCache]);
        assert_eq!(mock.generate_calls(), 1);
    }

    #[tokio::test]
    async fn test_precomputed_reply_wins_race() {
        let mock = Arc::new(MockBackend::new("slow").with_delay(Duration::from_millis(500)));
        let fast = orchestrator(Arc::clone(&mock), FastConfig::default());
        fast.precompute("What are your opening hours?", "We are open 9 to 5.");

        let response = fast
            .generate_fast_response(&request("what are your opening hours"), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.text, "We are open 9 to 5.");
        assert!(response.optimizations.contains(&Optimization::Precomputed));
        assert!(response.response_time_ms < 500);
    }

    #[tokio::test]
    async fn test_deadline_exceeded() {
        let mock = Arc::new(MockBackend::new("late").with_delay(Duration::from_millis(300)));
        let config = FastConfig {
            target_latency_ms: 50,
            ..FastConfig::default()
        };
        let fast = orchestrator(mock, config);

        let err = fast
            .generate_fast_response(&request("Tell me a long story"), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::Timeout { .. }));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_downgrade_only_when_prioritizing_speed() {
        let mock = Arc::new(MockBackend::new("ok then"));
        let fast = orchestrator(Arc::clone(&mock), FastConfig::default());

        let mut req = request("Summarize the plot of Hamlet");
        let response = fast
            .generate_fast_response(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.model_id, "gpt-4o");

        req.prioritize_speed = true;
        req.messages = vec![ConversationMessage::user("Summarize the plot of Macbeth")];
        let response = fast
            .generate_fast_response(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(response.model_id, "gpt-4o-mini");
        assert!(response.optimizations.contains(&Optimization::ModelDowngrade));
        assert_eq!(mock.last_model().as_deref(), Some("gpt-4o-mini"));
    }

    #[tokio::test]
    async fn test_long_history_is_compressed() {
        let mock = Arc::new(MockBackend::new("done"));
        let fast = orchestrator(Arc::clone(&mock), FastConfig::default());

        let mut messages: Vec<ConversationMessage> = (0..40)
            .map(|i| ConversationMessage::user(format!("message {} {}", i, "z".repeat(4_000))))
            .collect();
        messages.push(ConversationMessage::user("And what about the last question?"));
        let req = FastRequest {
            user_type: UserType::Regular,
            model_id: "gpt-3.5-turbo".to_string(),
            messages,
            prioritize_speed: false,
        };

        let response = fast
            .generate_fast_response(&req, &CancellationToken::new())
            .await
            .unwrap();
        assert!(response.context_compressed);
        assert!(response.optimizations.contains(&Optimization::ContextCompression));
        assert!(mock.last_messages().len() < 41);
    }
}
