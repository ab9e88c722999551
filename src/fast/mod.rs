//! Low-latency response path
//!
//! Instant replies, an aggressive response cache, speed-profile context
//! compression, model downgrade and a cancellable race against precomputed
//! replies, all bounded by a target latency.

pub mod downgrade;
pub mod instant;
pub mod orchestrator;
pub mod race;

pub use downgrade::faster_model;
pub use instant::{instant_reply, is_instant_match, normalize_prompt};
pub use orchestrator::{
    FastRequest, FastResponse, FastResponseOrchestrator, FastStats, Optimization, PreparedGeneration, Shortcut,
};
pub use race::{race, RaceSource};
