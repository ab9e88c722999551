//! Service facade over the caching, limiting, context and response paths

pub mod bootstrap;
pub mod runtime;
pub mod types;

pub use bootstrap::{build_runtime, build_runtime_with};
pub use runtime::ChatRuntime;
pub use types::{
    ChatRequest, ChatResponse, CleanupReport, ResponseMode, RuntimeStats, StreamingChatResponse,
};
