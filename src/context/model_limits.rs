//! Context window sizes per model

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Token limits of a model's context window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelLimits {
    pub max_tokens: usize,
    /// Tokens held back for the model's reply
    pub reserve_tokens: usize,
    /// History size that triggers summarization
    pub warning_threshold: usize,
}

impl ModelLimits {
    pub const fn new(max_tokens: usize, reserve_tokens: usize, warning_threshold: usize) -> Self {
        Self {
            max_tokens,
            reserve_tokens,
            warning_threshold,
        }
    }

    /// Tokens available for the request history
    pub fn budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserve_tokens)
    }
}

/// Fallback for unknown model ids
pub const DEFAULT_LIMITS: ModelLimits = ModelLimits::new(16_000, 2_048, 14_000);

static MODEL_LIMITS: Lazy<HashMap<&'static str, ModelLimits>> = Lazy::new(|| {
    HashMap::from([
        ("gpt-4o", ModelLimits::new(128_000, 4_096, 120_000)),
        ("gpt-4o-mini", ModelLimits::new(128_000, 4_096, 120_000)),
        ("gpt-3.5-turbo", ModelLimits::new(16_385, 2_048, 14_000)),
        ("o1-preview", ModelLimits::new(128_000, 32_768, 90_000)),
        ("claude-3-5-sonnet", ModelLimits::new(200_000, 8_192, 180_000)),
        ("claude-3-opus", ModelLimits::new(200_000, 4_096, 180_000)),
        ("claude-3-haiku", ModelLimits::new(200_000, 4_096, 180_000)),
        ("gemini-1.5-pro", ModelLimits::new(1_000_000, 8_192, 900_000)),
        ("gemini-1.5-flash", ModelLimits::new(1_000_000, 8_192, 900_000)),
    ])
});

/// Look up limits for a model id, falling back to [`DEFAULT_LIMITS`]
pub fn limits_for(model_id: &str) -> ModelLimits {
    MODEL_LIMITS.get(model_id).copied().unwrap_or(DEFAULT_LIMITS)
}
