//! Token estimation
//!
//! Counts are approximations. The default [`HeuristicEstimator`] divides the
//! character count by four; [`TiktokenEstimator`] can be swapped in where a
//! real BPE count matters.

use super::models::{ContentPart, ConversationMessage, MessageContent};
use crate::error::{Result, RuntimeError};
use std::sync::Arc;
use tiktoken_rs::{cl100k_base, CoreBPE};

/// Fixed per-message cost for role and framing tokens
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Flat cost charged for each image part
pub const IMAGE_PART_TOKENS: usize = 765;

/// Token estimator trait for different tokenization strategies
pub trait TokenEstimator: Send + Sync {
    /// Estimate the number of tokens in the given text
    fn estimate(&self, text: &str) -> usize;

    /// Estimate tokens for multiple texts
    fn estimate_batch(&self, texts: &[&str]) -> Vec<usize> {
        texts.iter().map(|t| self.estimate(t)).collect()
    }

    /// Estimate a message body, charging images a flat cost
    fn estimate_content(&self, content: &MessageContent) -> usize {
        match content {
            MessageContent::Text(text) => self.estimate(text),
            MessageContent::Parts(parts) => parts
                .iter()
                .map(|part| match part {
                    ContentPart::Text { text } => self.estimate(text),
                    ContentPart::ImageUrl { .. } => IMAGE_PART_TOKENS,
                })
                .sum(),
        }
    }

    /// Estimate a whole message including role overhead
    fn estimate_message(&self, message: &ConversationMessage) -> usize {
        MESSAGE_OVERHEAD_TOKENS + self.estimate_content(&message.content)
    }

    fn estimate_messages(&self, messages: &[ConversationMessage]) -> usize {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// Character-based estimator (~4 characters per token)
pub struct HeuristicEstimator {
    chars_per_token: usize,
}

impl HeuristicEstimator {
    pub fn new(chars_per_token: usize) -> Self {
        Self {
            chars_per_token: chars_per_token.max(1),
        }
    }
}

impl Default for HeuristicEstimator {
    fn default() -> Self {
        Self::new(4)
    }
}

impl TokenEstimator for HeuristicEstimator {
    fn estimate(&self, text: &str) -> usize {
        let chars = text.chars().count();
        (chars + self.chars_per_token - 1) / self.chars_per_token
    }
}

/// Word-based token estimator (~1.3 tokens per word)
pub struct WordBasedEstimator {
    tokens_per_word: f64,
}

impl WordBasedEstimator {
    pub fn new(tokens_per_word: f64) -> Self {
        Self { tokens_per_word }
    }
}

impl Default for WordBasedEstimator {
    fn default() -> Self {
        Self::new(1.3)
    }
}

impl TokenEstimator for WordBasedEstimator {
    fn estimate(&self, text: &str) -> usize {
        let word_count = text.split_whitespace().count();
        (word_count as f64 * self.tokens_per_word).ceil() as usize
    }
}

/// Tiktoken-based token estimator using cl100k_base (GPT-4, GPT-3.5-turbo)
pub struct TiktokenEstimator {
    bpe: Arc<CoreBPE>,
}

impl TiktokenEstimator {
    /// Create a new tiktoken estimator with cl100k_base encoding
    pub fn new() -> Result<Self> {
        let bpe = cl100k_base()
            .map_err(|e| RuntimeError::Configuration(format!("failed to load cl100k_base: {}", e)))?;
        Ok(Self { bpe: Arc::new(bpe) })
    }
}

impl TokenEstimator for TiktokenEstimator {
    fn estimate(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}
