//! Circuit-breaker decorator for any backend

use super::{CircuitBreaker, Generation, GenerationParams, LlmBackend, TokenStream};
use crate::context::ConversationMessage;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;

/// Routes calls through a per-model [`CircuitBreaker`]
pub struct GuardedBackend {
    inner: Arc<dyn LlmBackend>,
    breaker: Arc<CircuitBreaker>,
}

impl GuardedBackend {
    pub fn new(inner: Arc<dyn LlmBackend>, breaker: Arc<CircuitBreaker>) -> Self {
        Self { inner, breaker }
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    fn record(&self, model_id: &str, outcome: std::result::Result<(), &RuntimeError>) {
        match outcome {
            Ok(()) => self.breaker.mark_success(model_id),
            Err(e) if trips_breaker(e) => self.breaker.mark_failure(model_id),
            Err(_) => {}
        }
    }
}

fn trips_breaker(error: &RuntimeError) -> bool {
    matches!(error, RuntimeError::Backend { .. } | RuntimeError::Timeout { .. })
}

#[async_trait]
impl LlmBackend for GuardedBackend {
    async fn generate(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<Generation> {
        self.breaker.check(model_id)?;
        let result = self.inner.generate(model_id, messages, params).await;
        self.record(model_id, result.as_ref().map(|_| ()));
        result
    }

    async fn stream(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<TokenStream> {
        self.breaker.check(model_id)?;
        let stream = match self.inner.stream(model_id, messages, params).await {
            Ok(stream) => stream,
            Err(e) => {
                self.record(model_id, Err(&e));
                return Err(e);
            }
        };
        self.record(model_id, Ok(()));

        let breaker = Arc::clone(&self.breaker);
        let model = model_id.to_string();
        Ok(stream
            .inspect(move |item| {
                if let Err(e) = item {
                    if trips_breaker(e) {
                        breaker.mark_failure(&model);
                    }
                }
            })
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BreakerState;
    use crate::config::BreakerConfig;
    use crate::testing::MockBackend;

    fn guarded(mock: Arc<MockBackend>, threshold: usize) -> GuardedBackend {
        let breaker = Arc::new(CircuitBreaker::new(&BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_secs: 60,
        }));
        GuardedBackend::new(mock, breaker)
    }

    #[tokio::test]
    async fn test_failures_open_circuit() {
        let mock = Arc::new(MockBackend::new("unused").with_failure("upstream down"));
        let backend = guarded(Arc::clone(&mock), 2);
        let messages = [ConversationMessage::user("hi")];
        let params = GenerationParams::default();

        assert!(backend.generate("gpt-4o", &messages, &params).await.is_err());
        assert!(backend.generate("gpt-4o", &messages, &params).await.is_err());
        assert_eq!(backend.breaker().state("gpt-4o"), BreakerState::Open);

        let err = backend.generate("gpt-4o", &messages, &params).await.unwrap_err();
        assert!(matches!(err, RuntimeError::CircuitOpen(_)));
        // the open circuit never reached the backend
        assert_eq!(mock.generate_calls(), 2);
    }

    #[tokio::test]
    async fn test_success_keeps_circuit_closed() {
        let mock = Arc::new(MockBackend::new("fine"));
        let backend = guarded(mock, 1);
        let generation = backend
            .generate("gpt-4o", &[ConversationMessage::user("hi")], &GenerationParams::default())
            .await
            .unwrap();
        assert_eq!(generation.text, "fine");
        assert_eq!(backend.breaker().state("gpt-4o"), BreakerState::Closed);
    }
}
