//! Request and response types of the runtime facade

use crate::backend::TokenUsage;
use crate::cache::CacheStats;
use crate::context::{ContextStats, MessageContent};
use crate::fast::{FastStats, Optimization};
use crate::rate_limit::UserType;
use crate::backend::BreakerStats;
use crate::streaming::{PerformanceStats, StreamHandle};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// A user turn to answer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub user_id: String,
    pub user_type: UserType,
    pub conversation_id: String,
    pub model_id: String,
    pub message: MessageContent,
    /// Client-supplied id for the user message
    #[serde(default)]
    pub message_id: Option<String>,
    /// Allow the fast path to substitute a faster model
    #[serde(default)]
    pub prioritize_speed: bool,
}

impl ChatRequest {
    pub fn new(
        user_id: impl Into<String>,
        user_type: UserType,
        conversation_id: impl Into<String>,
        model_id: impl Into<String>,
        message: impl Into<MessageContent>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_type,
            conversation_id: conversation_id.into(),
            model_id: model_id.into(),
            message: message.into(),
            message_id: None,
            prioritize_speed: false,
        }
    }

    pub fn with_message_id(mut self, id: impl Into<String>) -> Self {
        self.message_id = Some(id.into());
        self
    }

    pub fn prioritizing_speed(mut self) -> Self {
        self.prioritize_speed = true;
        self
    }
}

/// Path that produced a response
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseMode {
    Standard,
    Fast,
    /// Fast path failed and the streaming path answered instead
    FastFallback,
}

impl ResponseMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseMode::Standard => "standard",
            ResponseMode::Fast => "fast",
            ResponseMode::FastFallback => "fast_fallback",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A completed assistant turn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatResponse {
    pub conversation_id: String,
    /// Id of the stored assistant message
    pub message_id: String,
    pub text: String,
    /// Model that produced the text
    pub model_id: String,
    pub mode: ResponseMode,
    pub cached: bool,
    pub optimizations: Vec<Optimization>,
    pub context_truncated: bool,
    pub context_compressed: bool,
    pub response_time_ms: u64,
    pub usage: Option<TokenUsage>,
}

/// A streamed assistant turn; the reply is stored once the stream completes
#[derive(Debug)]
pub struct StreamingChatResponse {
    pub conversation_id: String,
    pub model_id: String,
    pub optimizations: Vec<Optimization>,
    pub handle: StreamHandle,
}

impl StreamingChatResponse {
    pub fn stream_id(&self) -> &str {
        &self.handle.stream_id
    }
}

/// Entries removed by a manual cleanup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub conversations: usize,
    pub responses: usize,
    pub rate_limit_users: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.conversations + self.responses + self.rate_limit_users
    }
}

/// Aggregate statistics of every component
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStats {
    pub contexts: ContextStats,
    pub response_cache: CacheStats,
    pub pending_fetches: usize,
    pub rate_limited_users: usize,
    pub fast: FastStats,
    pub streaming: PerformanceStats,
    pub circuit_breakers: HashMap<String, BreakerStats>,
}
