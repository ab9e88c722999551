//! Streaming responses
//!
//! Buffered relay of backend token streams, locally synthesized instant
//! streams, per-stream cancellation and first-token latency tracking.

pub mod buffer;
pub mod optimizer;
pub mod stats;

pub use buffer::ChunkBuffer;
pub use optimizer::{
    CompletionHook, ModelPerformance, PerformanceStats, StreamChunk, StreamHandle, StreamingOptimizer,
};
pub use stats::{LatencyStats, LatencyTracker};
