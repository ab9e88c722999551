//! Sliding window context compression
//!
//! Importance-ranked selection of conversation messages under a token budget,
//! used on the latency-sensitive paths.

pub mod config;
pub mod importance;
pub mod optimizer;

pub use config::{WindowConfig, WindowProfile};
pub use importance::{top_keywords, ImportanceScorer, MessageImportance};
pub use optimizer::{MessageCategories, SlidingWindowOptimizer, WindowSlice};
