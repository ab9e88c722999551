//! Chat runtime facade
//!
//! Wires rate limiting, entitlement checks, conversation context, response
//! caching and the fast and streaming paths behind four entry points. Every
//! entry point records the user turn before generating, and the assistant
//! turn once a reply exists.

use super::types::{
    ChatRequest, ChatResponse, CleanupReport, ResponseMode, RuntimeStats, StreamingChatResponse,
};
use crate::backend::{CircuitBreaker, Generation, GenerationParams, GuardedBackend, LlmBackend};
use crate::cache::{generate_cache_key, AsyncCache, CacheSweeper, TtlCache};
use crate::config::RuntimeConfig;
use crate::context::{ContextManager, ConversationContext, ConversationMessage, Role};
use crate::error::{Result, RuntimeError};
use crate::fast::{FastRequest, FastResponseOrchestrator, Optimization};
use crate::metrics::Metrics;
use crate::rate_limit::{plan_for, RateLimitStatus, RateLimiter, UserType};
use crate::streaming::{CompletionHook, StreamingOptimizer};
use crate::window::{ImportanceScorer, SlidingWindowOptimizer, WindowProfile};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Chat runtime
pub struct ChatRuntime {
    config: RuntimeConfig,
    metrics: Arc<Metrics>,
    rate_limiter: Arc<RateLimiter>,
    contexts: Arc<ContextManager>,
    window: Arc<SlidingWindowOptimizer>,
    breaker: Arc<CircuitBreaker>,
    backend: Arc<dyn LlmBackend>,
    responses: AsyncCache<Generation>,
    fast: FastResponseOrchestrator,
    streaming: StreamingOptimizer,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl ChatRuntime {
    /// Build a runtime around `backend`; calls go through a per-model
    /// circuit breaker
    pub fn new(config: RuntimeConfig, backend: Arc<dyn LlmBackend>) -> Result<Self> {
        config.validate()?;

        let metrics = Arc::new(
            Metrics::new()
                .map_err(|e| RuntimeError::Internal(format!("failed to register metrics: {}", e)))?,
        );

        let breaker = Arc::new(CircuitBreaker::new(&config.breaker));
        let backend: Arc<dyn LlmBackend> = Arc::new(GuardedBackend::new(backend, Arc::clone(&breaker)));

        let contexts = Arc::new(ContextManager::new(&config.context)?.with_metrics(Arc::clone(&metrics)));
        let rate_limiter =
            Arc::new(RateLimiter::new(config.rate_limit.clone()).with_metrics(Arc::clone(&metrics)));

        let scorer = ImportanceScorer::with_limits(config.cache.default_ttl(), config.cache.max_size);
        let window = Arc::new(SlidingWindowOptimizer::new(contexts.estimator()).with_scorer(scorer));

        let responses = AsyncCache::from_cache(TtlCache::named(
            "response",
            config.response_cache.ttl(),
            config.response_cache.max_size,
        ));

        let streaming = StreamingOptimizer::with_metrics(
            config.streaming.clone(),
            Arc::clone(&backend),
            Arc::clone(&metrics),
        );
        let fast = FastResponseOrchestrator::new(
            config.fast.clone(),
            Arc::clone(&backend),
            Arc::clone(&window),
            streaming.speed_params(),
        )
        .with_metrics(Arc::clone(&metrics));

        info!(
            target_latency_ms = config.fast.target_latency_ms,
            strategy = %contexts.strategy().name,
            "Chat runtime initialized"
        );

        Ok(Self {
            config,
            metrics,
            rate_limiter,
            contexts,
            window,
            breaker,
            backend,
            responses,
            fast,
            streaming,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Start the background sweeper. Must be called inside a Tokio runtime;
    /// repeated calls are ignored.
    pub fn start(&self) {
        let mut slot = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() || self.shutdown.is_cancelled() {
            return;
        }

        let sweeper = CacheSweeper::new(self.config.cache.sweep_interval())
            .with_target(self.contexts.sweep_target())
            .with_target(self.rate_limiter.sweep_target())
            .with_target(Arc::new(self.responses.clone()))
            .with_metrics(Arc::clone(&self.metrics));

        *slot = Some(sweeper.spawn(self.shutdown.child_token()));
        info!("Chat runtime started");
    }

    /// Stop the sweeper, cancel open streams and in-flight fast requests
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let cancelled = self.streaming.cancel_all();

        let handle = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "Cache sweeper ended abnormally");
            }
        }

        info!(cancelled_streams = cancelled, "Chat runtime stopped");
    }

    /// Standard path: whole history within the model budget, cached
    /// single-flight generation
    pub async fn generate_response(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        self.admit(&request)?;
        self.record_user_turn(&request)?;

        let selected = self
            .contexts
            .get_messages_for_request(&request.conversation_id, &request.model_id)?;
        let key = response_cache_key(&request.model_id, &selected.messages);

        let backend = Arc::clone(&self.backend);
        let model_id = request.model_id.clone();
        let messages = selected.messages;
        let (generation, cached) = self
            .responses
            .get_or_set_with_hit(
                &key,
                move || async move {
                    backend
                        .generate(&model_id, &messages, &GenerationParams::default())
                        .await
                },
                None,
            )
            .await?;
        self.metrics.record_cache_lookup("response", cached);

        let stored = self.contexts.add_message(
            &request.conversation_id,
            Role::Assistant,
            generation.text.clone(),
            None,
        )?;
        self.metrics.record_response(ResponseMode::Standard.as_str(), start.elapsed());
        debug!(
            conversation_id = %request.conversation_id,
            cached,
            truncated = selected.truncated,
            "Standard response ready"
        );

        Ok(ChatResponse {
            conversation_id: request.conversation_id,
            message_id: stored.id,
            text: generation.text,
            model_id: request.model_id,
            mode: ResponseMode::Standard,
            cached,
            optimizations: Vec::new(),
            context_truncated: selected.truncated,
            context_compressed: false,
            response_time_ms: start.elapsed().as_millis() as u64,
            usage: generation.usage,
        })
    }

    /// Fast path under the target latency, falling back to a balanced-window
    /// stream collected to completion when it fails or times out
    pub async fn generate_fast_response(&self, request: ChatRequest) -> Result<ChatResponse> {
        let start = Instant::now();
        self.admit(&request)?;
        self.record_user_turn(&request)?;

        let history = self.contexts.conversation_messages(&request.conversation_id)?;
        let fast_request = FastRequest {
            user_type: request.user_type,
            model_id: request.model_id.clone(),
            messages: history,
            prioritize_speed: request.prioritize_speed,
        };

        let cancel = self.shutdown.child_token();
        let error = match self.fast.generate_fast_response(&fast_request, &cancel).await {
            Ok(fast) => {
                let stored = self.contexts.add_message(
                    &request.conversation_id,
                    Role::Assistant,
                    fast.text.clone(),
                    None,
                )?;
                return Ok(ChatResponse {
                    conversation_id: request.conversation_id,
                    message_id: stored.id,
                    text: fast.text,
                    model_id: fast.model_id,
                    mode: ResponseMode::Fast,
                    cached: fast.cached,
                    optimizations: fast.optimizations,
                    context_truncated: false,
                    context_compressed: fast.context_compressed,
                    response_time_ms: start.elapsed().as_millis() as u64,
                    usage: fast.usage,
                });
            }
            Err(e) => e,
        };

        if self.shutdown.is_cancelled() {
            return Err(error);
        }
        warn!(
            conversation_id = %request.conversation_id,
            error = %error,
            "Fast path failed, falling back to streaming"
        );
        self.metrics.record_fast_fallback();

        let slice = self.window.optimize_for_profile(
            &fast_request.messages,
            WindowProfile::Balanced,
            &request.model_id,
        );
        let handle = self
            .streaming
            .start_stream(&request.model_id, slice.messages, None)
            .await?;
        let text = handle.collect_text().await?;

        let stored = self.contexts.add_message(
            &request.conversation_id,
            Role::Assistant,
            text.clone(),
            None,
        )?;
        self.metrics.record_response(ResponseMode::FastFallback.as_str(), start.elapsed());

        let mut optimizations = Vec::new();
        if slice.compression_applied {
            optimizations.push(Optimization::ContextCompression);
        }

        Ok(ChatResponse {
            conversation_id: request.conversation_id,
            message_id: stored.id,
            text,
            model_id: request.model_id,
            mode: ResponseMode::FastFallback,
            cached: false,
            optimizations,
            context_truncated: false,
            context_compressed: slice.compression_applied,
            response_time_ms: start.elapsed().as_millis() as u64,
            usage: None,
        })
    }

    /// Streaming path over a balanced window; the reply is stored when the
    /// stream completes
    pub async fn generate_streaming_response(&self, request: ChatRequest) -> Result<StreamingChatResponse> {
        let start = Instant::now();
        self.admit(&request)?;
        self.record_user_turn(&request)?;

        let history = self.contexts.conversation_messages(&request.conversation_id)?;
        let slice = self
            .window
            .optimize_for_profile(&history, WindowProfile::Balanced, &request.model_id);

        let hook = self.store_reply_hook(&request.conversation_id, "streaming", start);
        let handle = self
            .streaming
            .stream_response(&request.model_id, slice.messages, Some(hook))
            .await?;

        let mut optimizations = Vec::new();
        if handle.instant {
            optimizations.push(Optimization::InstantResponse);
        }
        if slice.compression_applied {
            optimizations.push(Optimization::ContextCompression);
        }

        Ok(StreamingChatResponse {
            conversation_id: request.conversation_id,
            model_id: request.model_id,
            optimizations,
            handle,
        })
    }

    /// Streaming with fast-path preparation: shortcuts stream locally,
    /// otherwise speed-profile compression and optional downgrade apply
    pub async fn generate_fast_streaming_response(
        &self,
        request: ChatRequest,
    ) -> Result<StreamingChatResponse> {
        let start = Instant::now();
        self.admit(&request)?;
        self.record_user_turn(&request)?;

        let history = self.contexts.conversation_messages(&request.conversation_id)?;
        let hook = self.store_reply_hook(&request.conversation_id, "fast_streaming", start);

        if let Some(shortcut) = self.fast.shortcut(&request.model_id, &history).await {
            self.metrics.record_optimization(shortcut.optimization.as_str());
            let handle = self
                .streaming
                .instant_stream(&request.model_id, &shortcut.text, Some(hook));
            return Ok(StreamingChatResponse {
                conversation_id: request.conversation_id,
                model_id: request.model_id,
                optimizations: vec![shortcut.optimization],
                handle,
            });
        }

        let prepared = self.fast.prepare(&FastRequest {
            user_type: request.user_type,
            model_id: request.model_id.clone(),
            messages: history,
            prioritize_speed: request.prioritize_speed,
        });
        for optimization in &prepared.optimizations {
            self.metrics.record_optimization(optimization.as_str());
        }

        let handle = self
            .streaming
            .start_stream(&prepared.model_id, prepared.messages, Some(hook))
            .await?;

        Ok(StreamingChatResponse {
            conversation_id: request.conversation_id,
            model_id: prepared.model_id,
            optimizations: prepared.optimizations,
            handle,
        })
    }

    /// Register a ready-made reply served by the fast paths
    pub fn precompute(&self, prompt: &str, reply: impl Into<String>) {
        self.fast.precompute(prompt, reply);
    }

    pub fn cancel_stream(&self, stream_id: &str) -> bool {
        self.streaming.cancel_stream(stream_id)
    }

    pub fn active_streams(&self) -> Vec<String> {
        self.streaming.active_streams()
    }

    pub fn get_context(&self, conversation_id: &str) -> Option<ConversationContext> {
        self.contexts.get_context(conversation_id)
    }

    pub fn delete_conversation(&self, conversation_id: &str) -> bool {
        self.contexts.delete_conversation(conversation_id)
    }

    pub fn get_status(&self, user_id: &str, user_type: UserType) -> RateLimitStatus {
        self.rate_limiter.get_status(user_id, user_type)
    }

    pub fn clear_user_limits(&self, user_id: &str) -> bool {
        self.rate_limiter.clear_user_limits(user_id)
    }

    /// Remove expired entries from every store now
    pub fn cleanup(&self) -> CleanupReport {
        let report = CleanupReport {
            conversations: self.contexts.cleanup(),
            responses: self.responses.cleanup(),
            rate_limit_users: self.rate_limiter.cleanup(),
        };
        if report.total() > 0 {
            info!(
                conversations = report.conversations,
                responses = report.responses,
                rate_limit_users = report.rate_limit_users,
                "Manual cleanup removed expired entries"
            );
        }
        report
    }

    /// Drop cached responses from both the response cache and the fast path
    pub fn clear_response_cache(&self) {
        self.responses.clear();
        self.fast.clear_cache();
    }

    pub fn get_stats(&self) -> RuntimeStats {
        RuntimeStats {
            contexts: self.contexts.stats(),
            response_cache: self.responses.stats(),
            pending_fetches: self.responses.pending_count(),
            rate_limited_users: self.rate_limiter.tracked_users(),
            fast: self.fast.stats(),
            streaming: self.streaming.get_performance_stats(),
            circuit_breakers: self.breaker.all_stats(),
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Prometheus text exposition of this runtime's metrics
    pub fn export_metrics(&self) -> String {
        self.metrics.export()
    }

    pub fn contexts(&self) -> &ContextManager {
        &self.contexts
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Rate limit first, then the plan's model allow-list
    fn admit(&self, request: &ChatRequest) -> Result<()> {
        self.rate_limiter
            .check_rate_limit(&request.user_id, request.user_type)
            .into_result()?;

        let plan = plan_for(request.user_type);
        if !plan.allows_model(&request.model_id) {
            warn!(
                user_id = %request.user_id,
                user_type = %request.user_type,
                model_id = %request.model_id,
                "Model not available on plan"
            );
            return Err(RuntimeError::EntitlementDenied {
                model_id: request.model_id.clone(),
                user_type: request.user_type.to_string(),
                allowed: plan.allowed_model_ids(),
            });
        }
        Ok(())
    }

    fn record_user_turn(&self, request: &ChatRequest) -> Result<ConversationMessage> {
        self.contexts
            .ensure_context(&request.conversation_id, &request.user_id, &request.model_id);
        self.contexts.add_message(
            &request.conversation_id,
            Role::User,
            request.message.clone(),
            request.message_id.clone(),
        )
    }

    fn store_reply_hook(&self, conversation_id: &str, mode: &'static str, start: Instant) -> CompletionHook {
        let contexts = Arc::clone(&self.contexts);
        let metrics = Arc::clone(&self.metrics);
        let conversation_id = conversation_id.to_string();

        Box::new(move |text: String| {
            if let Err(e) = contexts.add_message(&conversation_id, Role::Assistant, text, None) {
                warn!(conversation_id = %conversation_id, error = %e, "Failed to store streamed reply");
            }
            metrics.record_response(mode, start.elapsed());
        })
    }
}

/// Key over the model and the role/content of every selected message
fn response_cache_key(model_id: &str, messages: &[ConversationMessage]) -> String {
    let turns: Vec<serde_json::Value> = messages
        .iter()
        .map(|m| json!({ "role": m.role.as_str(), "content": m.content }))
        .collect();
    generate_cache_key("response", &json!({ "model": model_id, "messages": turns }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockBackend;
    use std::time::Duration;

    fn runtime_with(backend: MockBackend) -> (ChatRuntime, Arc<MockBackend>) {
        let backend = Arc::new(backend);
        let runtime = ChatRuntime::new(RuntimeConfig::default(), backend.clone()).unwrap();
        (runtime, backend)
    }

    #[test]
    fn test_cache_key_ignores_message_ids() {
        let a = vec![ConversationMessage::user("What is Rust?")];
        let b = vec![ConversationMessage::user("What is Rust?")];
        assert_ne!(a[0].id, b[0].id);
        assert_eq!(response_cache_key("gpt-4o", &a), response_cache_key("gpt-4o", &b));
        assert_ne!(response_cache_key("gpt-4o", &a), response_cache_key("gpt-4o-mini", &a));
    }

    #[tokio::test]
    async fn test_standard_response_records_both_turns() {
        let (runtime, backend) = runtime_with(MockBackend::new("Rust is a systems language."));
        let request = ChatRequest::new("u1", UserType::Regular, "c1", "gpt-4o", "What is Rust?")
            .with_message_id("m-1");

        let response = runtime.generate_response(request).await.unwrap();
        assert_eq!(response.mode, ResponseMode::Standard);
        assert_eq!(response.text, "Rust is a systems language.");
        assert!(!response.cached);
        assert_eq!(backend.generate_calls(), 1);

        let context = runtime.get_context("c1").unwrap();
        assert_eq!(context.messages.len(), 2);
        assert_eq!(context.messages[0].id, "m-1");
        assert_eq!(context.messages[1].id, response.message_id);
        assert_eq!(context.messages[1].role, Role::Assistant);
    }

    #[tokio::test]
    async fn test_entitlement_denied_before_context_changes() {
        let (runtime, backend) = runtime_with(MockBackend::new("unused"));
        let request = ChatRequest::new("u1", UserType::Free, "c1", "claude-3-opus", "hello there friend");

        let err = runtime.generate_response(request).await.unwrap_err();
        match err {
            RuntimeError::EntitlementDenied { model_id, user_type, allowed } => {
                assert_eq!(model_id, "claude-3-opus");
                assert_eq!(user_type, "free");
                assert!(allowed.contains(&"gpt-4o-mini".to_string()));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(runtime.get_context("c1").is_none());
        assert_eq!(backend.generate_calls(), 0);
    }

    #[tokio::test]
    async fn test_fast_fallback_after_timeout() {
        let mut config = RuntimeConfig::default();
        config.fast.target_latency_ms = 20;
        let backend = Arc::new(MockBackend::new("slow but complete").with_delay(Duration::from_millis(100)));
        let runtime = ChatRuntime::new(config, backend.clone()).unwrap();

        let request = ChatRequest::new("u1", UserType::Premium, "c1", "gpt-4o", "Explain lifetimes");
        let response = runtime.generate_fast_response(request).await.unwrap();

        assert_eq!(response.mode, ResponseMode::FastFallback);
        assert_eq!(response.text, "slow but complete");
        assert_eq!(backend.stream_calls(), 1);
        assert_eq!(runtime.get_context("c1").unwrap().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_start_is_idempotent_and_shutdown_stops() {
        let (runtime, _) = runtime_with(MockBackend::new("ok"));
        runtime.start();
        runtime.start();
        runtime.shutdown().await;
        assert!(runtime.sweeper.lock().unwrap().is_none());
    }
}
