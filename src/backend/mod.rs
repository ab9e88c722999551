//! LLM backend seam
//!
//! Backends are addressed by an opaque model id and expose a one-shot
//! `generate` and an incremental `stream`. The runtime never talks to a
//! provider directly; it goes through [`LlmBackend`].

pub mod circuit_breaker;
pub mod guarded;
pub mod openai;

use crate::context::ConversationMessage;
use crate::error::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

pub use circuit_breaker::{BreakerState, BreakerStats, CircuitBreaker};
pub use guarded::GuardedBackend;
pub use openai::OpenAiCompatibleBackend;

/// Token deltas of a streamed completion
pub type TokenStream = BoxStream<'static, Result<String>>;

/// Sampling parameters for a backend call
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

impl GenerationParams {
    /// Parameters biased towards a fast first token
    pub fn speed(max_tokens: u32, temperature: f32) -> Self {
        Self {
            max_tokens: Some(max_tokens),
            temperature: Some(temperature),
        }
    }
}

/// Token usage reported by a backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// A completed generation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    pub text: String,
    pub usage: Option<TokenUsage>,
    /// Model that actually served the request
    pub model: String,
}

/// A chat completion provider
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Produce a full reply
    async fn generate(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<Generation>;

    /// Open a token stream; connection failures surface here, mid-stream
    /// failures as stream items
    async fn stream(
        &self,
        model_id: &str,
        messages: &[ConversationMessage],
        params: &GenerationParams,
    ) -> Result<TokenStream>;
}
