//! Chat runtime
//!
//! Infrastructure for serving conversational AI requests: expiring caches
//! with single-flight fetches, per-user usage quotas, conversation context
//! with token budgeting and summarization, sliding-window compression, a
//! latency-bounded fast path and buffered streaming.

pub mod backend;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod fast;
pub mod metrics;
pub mod rate_limit;
pub mod service;
pub mod streaming;
pub mod telemetry;
pub mod testing;
pub mod window;

pub use backend::{LlmBackend, OpenAiCompatibleBackend};
pub use config::RuntimeConfig;
pub use error::{Result, RuntimeError};
pub use service::{ChatRequest, ChatResponse, ChatRuntime, ResponseMode, StreamingChatResponse};
