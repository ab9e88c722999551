//! Test doubles for the backend seam
//!
//! [`MockBackend`] is scriptable: a fixed reply, optional latency, forced
//! failures and a token list for streams. It counts calls so tests can assert
//! on caching and single-flight behavior.

use crate::backend::{Generation, GenerationParams, LlmBackend, TokenStream, TokenUsage};
use crate::context::ConversationMessage;
use crate::error::{Result, RuntimeError};
use async_trait::async_trait;
use futures::StreamExt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Scriptable in-memory backend
pub struct MockBackend {
    reply: String,
    tokens: Option<Vec<String>>,
    delay: Duration,
    token_delay: Duration,
    failure: Option<String>,
    fail_stream_after: Option<usize>,
    generate_calls: AtomicUsize,
    stream_calls: AtomicUsize,
    last_model: Mutex<Option<String>>,
    last_messages: Mutex<Vec<ConversationMessage>>,
}

impl MockBackend {
    pub fn new(reply: impl Into<String>) -> Self {
        Self {
            reply: reply.into(),
            tokens: None,
            delay: Duration::ZERO,
            token_delay: Duration::ZERO,
            failure: None,
            fail_stream_after: None,
            generate_calls: AtomicUsize::new(0),
            stream_calls: AtomicUsize::new(0),
            last_model: Mutex::new(None),
            last_messages: Mutex::new(Vec::new()),
        }
    }

    /// Latency before a reply (or the first token) is produced
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Gap between streamed tokens
    pub fn with_token_delay(mut self, delay: Duration) -> Self {
        self.token_delay = delay;
        self
    }

    /// Fail every call with a backend error
    pub fn with_failure(mut self, message: impl Into<String>) -> Self {
        self.failure = Some(message.into());
        self
    }

    /// Stream exactly these tokens instead of splitting the reply
    pub fn with_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tokens = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Emit a backend error after `n` streamed tokens
    pub fn with_stream_failure_after(mut self, n: usize) -> Self {
        self.fail_stream_after = Some(n);
        self
    }

    pub fn generate_calls(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn stream_calls(&self) -> usize {
        self.stream_calls.load(Ordering::SeqCst)
    }

    pub fn last_model(&self) -> Option<String> {
        self.last_model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_messages(&self) -> Vec<ConversationMessage> {
        self.last_messages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn observe(&self, model_id: &str, messages: &[ConversationMessage]) {
        *self.last_model.lock().unwrap_or_else(PoisonError::into_inner) = Some(model_id.to_string());
        *self.last_messages.lock().unwrap_or_else(PoisonError::into_inner) = messages.to_vec();
    }

    fn stream_tokens(&self) -> Vec<String> {
        match &self.tokens {
            Some(tokens) => tokens.clone(),
            None => self.reply.split_inclusive(' ').map(str::to_string).collect(),
        }
    }
}

#[async_trait]
impl LlmBackend for MockBackend {
    async fn generate(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        _params: &GenerationParams,
    ) -> Result<Generation> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        self.observe(model_id, messages);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref message) = self.failure {
            return Err(RuntimeError::backend(model_id, message));
        }

        let completion_tokens = self.reply.split_whitespace().count() as u32;
        Ok(Generation {
            text: self.reply.clone(),
            usage: Some(TokenUsage {
                prompt_tokens: messages.len() as u32,
                completion_tokens,
                total_tokens: messages.len() as u32 + completion_tokens,
            }),
            model: model_id.to_string(),
        })
    }

    async fn stream(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        _params: &GenerationParams,
    ) -> Result<TokenStream> {
        self.stream_calls.fetch_add(1, Ordering::SeqCst);
        self.observe(model_id, messages);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if let Some(ref message) = self.failure {
            return Err(RuntimeError::backend(model_id, message));
        }

        let mut items: Vec<Result<String>> = self.stream_tokens().into_iter().map(Ok).collect();
        if let Some(n) = self.fail_stream_after {
            items.truncate(n);
            items.push(Err(RuntimeError::backend(model_id, "stream interrupted")));
        }

        let token_delay = self.token_delay;
        Ok(futures::stream::iter(items)
            .then(move |item| async move {
                if !token_delay.is_zero() {
                    tokio::time::sleep(token_delay).await;
                }
                item
            })
            .boxed())
    }
}
