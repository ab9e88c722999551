//! Integration tests for the chat runtime
//!
//! These drive the public facade end to end against the scriptable
//! in-memory backend: caching, quotas, entitlements, the fast path with its
//! streaming fallback, and stream lifecycle.

use chat_runtime::{
    config::RuntimeConfig,
    context::Role,
    fast::Optimization,
    rate_limit::UserType,
    service::{build_runtime_with, ChatRequest, ChatRuntime, ResponseMode},
    testing::MockBackend,
    RuntimeError,
};
use futures::future::join_all;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn relaxed_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.rate_limit.per_second = 1000;
    config.rate_limit.per_minute = 1000;
    config.rate_limit.per_hour = 1000;
    config.rate_limit.global_capacity = 1000.0;
    config.rate_limit.global_refill_per_sec = 1000.0;
    config.streaming.instant_word_delay_ms = 1;
    config
}

fn runtime(backend: MockBackend) -> (ChatRuntime, Arc<MockBackend>) {
    let backend = Arc::new(backend);
    let runtime = ChatRuntime::new(relaxed_config(), backend.clone()).unwrap();
    (runtime, backend)
}

fn request(user: &str, conversation: &str, model: &str, text: &str) -> ChatRequest {
    ChatRequest::new(user, UserType::Regular, conversation, model, text)
}

#[tokio::test]
async fn test_identical_history_is_served_from_cache() -> anyhow::Result<()> {
    let (runtime, backend) = runtime(MockBackend::new("Ownership moves values."));

    let first = runtime
        .generate_response(request("u1", "c1", "gpt-4o", "Explain ownership"))
        .await?;
    let second = runtime
        .generate_response(request("u2", "c2", "gpt-4o", "Explain ownership"))
        .await?;

    assert!(!first.cached);
    assert!(second.cached);
    assert_eq!(second.text, first.text);
    assert_eq!(backend.generate_calls(), 1);

    // The cached reply is still recorded in the second conversation
    let context = runtime.get_context("c2").unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].text(), "Ownership moves values.");
    Ok(())
}

#[tokio::test]
async fn test_concurrent_requests_share_one_backend_call() -> anyhow::Result<()> {
    let (runtime, backend) =
        runtime(MockBackend::new("Borrowing lends access.").with_delay(Duration::from_millis(50)));

    let calls = (0..5).map(|i| {
        runtime.generate_response(request(&format!("u{i}"), &format!("c{i}"), "gpt-4o", "Explain borrowing"))
    });
    let responses = join_all(calls).await;

    for response in responses {
        assert_eq!(response?.text, "Borrowing lends access.");
    }
    assert_eq!(backend.generate_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_model_outside_plan_is_rejected() {
    let (runtime, backend) = runtime(MockBackend::new("unused"));
    let denied = ChatRequest::new("u1", UserType::Free, "c1", "gpt-4o", "Summarize this article");

    let err = assert_err!(runtime.generate_response(denied).await);
    assert!(matches!(err, RuntimeError::EntitlementDenied { ref model_id, .. } if model_id == "gpt-4o"));
    assert_eq!(backend.generate_calls(), 0);

    let allowed = ChatRequest::new("u1", UserType::Free, "c1", "gpt-4o-mini", "Summarize this article");
    assert_ok!(runtime.generate_response(allowed).await);
}

#[tokio::test]
async fn test_daily_quota_rejects_after_plan_limit() {
    let (runtime, _) = runtime(MockBackend::new("pong"));

    for i in 0..200 {
        let response = runtime
            .generate_response(request("quota-user", &format!("c{i}"), "gpt-4o-mini", "ping"))
            .await;
        assert_ok!(response);
    }

    let err = assert_err!(
        runtime
            .generate_response(request("quota-user", "c-final", "gpt-4o-mini", "ping"))
            .await
    );
    match err {
        RuntimeError::RateLimitExceeded { reason, .. } => assert!(reason.contains("Daily message limit")),
        other => panic!("unexpected error: {other:?}"),
    }

    let status = runtime.get_status("quota-user", UserType::Regular);
    assert_eq!(status.daily.used, 200);
    assert!(runtime.get_context("c-final").is_none());

    assert!(runtime.clear_user_limits("quota-user"));
    assert_ok!(
        runtime
            .generate_response(request("quota-user", "c-final", "gpt-4o-mini", "ping"))
            .await
    );
}

#[tokio::test]
async fn test_per_second_window_limits_bursts() {
    let backend = Arc::new(MockBackend::new("ok"));
    let runtime = ChatRuntime::new(RuntimeConfig::default(), backend).unwrap();

    for i in 0..5 {
        assert_ok!(
            runtime
                .generate_response(request("burst", &format!("c{i}"), "gpt-4o", "status?"))
                .await
        );
    }
    let err = assert_err!(runtime.generate_response(request("burst", "c5", "gpt-4o", "status?")).await);
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_fast_path_answers_greetings_without_backend() -> anyhow::Result<()> {
    let (runtime, backend) = runtime(MockBackend::new("unused"));

    let response = runtime
        .generate_fast_response(request("u1", "c1", "gpt-4o", "Hello!"))
        .await?;

    assert_eq!(response.mode, ResponseMode::Fast);
    assert_eq!(response.optimizations, vec![Optimization::InstantResponse]);
    assert_eq!(backend.generate_calls(), 0);
    assert_eq!(backend.stream_calls(), 0);

    let context = runtime.get_context("c1").unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].role, Role::Assistant);
    Ok(())
}

#[tokio::test]
async fn test_fast_path_uses_precomputed_reply() -> anyhow::Result<()> {
    let (runtime, _) = runtime(MockBackend::new("slow answer").with_delay(Duration::from_millis(200)));
    runtime.precompute("What are your opening hours?", "We are open 9 to 5.");

    let response = runtime
        .generate_fast_response(request("u1", "c1", "gpt-4o", "What are your opening hours?"))
        .await?;

    assert_eq!(response.text, "We are open 9 to 5.");
    assert!(response.optimizations.contains(&Optimization::Precomputed));
    Ok(())
}

#[tokio::test]
async fn test_fast_path_downgrades_when_prioritizing_speed() -> anyhow::Result<()> {
    let (runtime, backend) = runtime(MockBackend::new("quick"));

    let response = runtime
        .generate_fast_response(request("u1", "c1", "gpt-4o", "Compare two sorting algorithms").prioritizing_speed())
        .await?;

    assert!(response.optimizations.contains(&Optimization::ModelDowngrade));
    assert_ne!(response.model_id, "gpt-4o");
    assert_eq!(backend.last_model(), Some(response.model_id.clone()));
    Ok(())
}

#[tokio::test]
async fn test_fast_path_falls_back_to_streaming_on_deadline() -> anyhow::Result<()> {
    let mut config = relaxed_config();
    config.fast.target_latency_ms = 25;
    let backend = Arc::new(MockBackend::new("a thorough answer").with_delay(Duration::from_millis(80)));
    let runtime = ChatRuntime::new(config, backend.clone())?;

    let response = runtime
        .generate_fast_response(request("u1", "c1", "gpt-4o", "Describe the borrow checker"))
        .await?;

    assert_eq!(response.mode, ResponseMode::FastFallback);
    assert_eq!(response.text, "a thorough answer");
    assert_eq!(backend.generate_calls(), 1);
    assert_eq!(backend.stream_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn test_fast_fallback_failure_propagates() {
    let (runtime, _) = runtime(MockBackend::new("unused").with_failure("upstream unavailable"));

    let err = assert_err!(
        runtime
            .generate_fast_response(request("u1", "c1", "gpt-4o", "Describe the borrow checker"))
            .await
    );
    assert!(matches!(err, RuntimeError::Backend { .. }));

    // Only the user turn was recorded
    assert_eq!(runtime.get_context("c1").unwrap().messages.len(), 1);
}

#[tokio::test]
async fn test_streaming_reply_is_stored_on_completion() -> anyhow::Result<()> {
    let backend = MockBackend::new("unused").with_tokens(["Streams ", "arrive ", "in ", "chunks."]);
    let (runtime, _) = runtime(backend);

    let mut response = runtime
        .generate_streaming_response(request("u1", "c1", "gpt-4o", "How do streams work?"))
        .await?;
    assert!(!response.handle.instant);

    let mut text = String::new();
    let mut saw_final = false;
    while let Some(chunk) = response.handle.next().await {
        let chunk = chunk?;
        text.push_str(&chunk.content);
        saw_final |= chunk.is_final;
    }

    assert!(saw_final);
    assert_eq!(text, "Streams arrive in chunks.");

    let context = runtime.get_context("c1").unwrap();
    assert_eq!(context.messages.len(), 2);
    assert_eq!(context.messages[1].text(), "Streams arrive in chunks.");
    assert!(runtime.active_streams().is_empty());
    Ok(())
}

#[tokio::test]
async fn test_streaming_greeting_is_synthesized_locally() -> anyhow::Result<()> {
    let (runtime, backend) = runtime(MockBackend::new("unused"));

    let response = runtime
        .generate_fast_streaming_response(request("u1", "c1", "gpt-4o", "thanks"))
        .await?;
    assert!(response.handle.instant);
    assert_eq!(response.optimizations, vec![Optimization::InstantResponse]);

    let text = response.handle.collect_text().await?;
    assert!(!text.is_empty());
    assert_eq!(backend.stream_calls(), 0);
    Ok(())
}

#[tokio::test]
async fn test_cancelled_stream_stores_nothing() -> anyhow::Result<()> {
    let tokens: Vec<String> = (0..50).map(|i| format!("word{i} ")).collect();
    let backend = MockBackend::new("unused")
        .with_tokens(tokens)
        .with_token_delay(Duration::from_millis(20));
    let (runtime, _) = runtime(backend);

    let mut response = runtime
        .generate_streaming_response(request("u1", "c1", "gpt-4o", "Tell me a long story"))
        .await?;
    let stream_id = response.stream_id().to_string();
    assert!(runtime.active_streams().contains(&stream_id));

    assert!(runtime.cancel_stream(&stream_id));
    assert!(!runtime.cancel_stream("no-such-stream"));

    let mut cancelled = false;
    let mut finished = false;
    while let Some(chunk) = response.handle.next().await {
        match chunk {
            Err(RuntimeError::StreamCancelled(id)) => {
                assert_eq!(id, stream_id);
                cancelled = true;
            }
            Ok(chunk) => finished |= chunk.is_final,
            Err(other) => panic!("unexpected error: {other:?}"),
        }
    }

    assert!(cancelled);
    assert!(!finished);
    assert_eq!(runtime.get_context("c1").unwrap().messages.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_stats_cleanup_and_shutdown() -> anyhow::Result<()> {
    let runtime = build_runtime_with(relaxed_config(), Arc::new(MockBackend::new("fine")))?;

    runtime
        .generate_response(request("u1", "c1", "gpt-4o", "How are the caches doing?"))
        .await?;

    let stats = runtime.get_stats();
    assert_eq!(stats.contexts.conversations, 1);
    assert_eq!(stats.contexts.total_messages, 2);
    assert_eq!(stats.response_cache.size, 1);
    assert_eq!(stats.rate_limited_users, 1);
    assert_eq!(stats.pending_fetches, 0);

    let report = runtime.cleanup();
    assert_eq!(report.total(), 0);

    let exported = runtime.export_metrics();
    assert!(exported.contains("chat_rate_limit_decisions_total"));

    assert!(runtime.delete_conversation("c1"));
    assert!(runtime.get_context("c1").is_none());

    runtime.shutdown().await;
    Ok(())
}
