//! Conversation context management with token accounting
//!
//! Tracks per-conversation history, estimates token usage, collapses old
//! turns into a running summary and fits histories into model budgets.

pub mod manager;
pub mod model_limits;
pub mod models;
pub mod summarizer;
pub mod token_estimator;

pub use manager::{ContextManager, ContextStats, RequestMessages};
pub use model_limits::{limits_for, ModelLimits, DEFAULT_LIMITS};
pub use models::{ContentPart, ConversationContext, ConversationMessage, MessageContent, Role};
pub use summarizer::{ConcatenationSummarizer, HeuristicSummarizer, SummarizationStrategy, Summarizer};
pub use token_estimator::{
    HeuristicEstimator, TiktokenEstimator, TokenEstimator, WordBasedEstimator, IMAGE_PART_TOKENS,
    MESSAGE_OVERHEAD_TOKENS,
};
