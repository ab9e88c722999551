//! Error types for the chat runtime

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Result alias used across the crate
pub type Result<T> = std::result::Result<T, RuntimeError>;

/// Runtime errors
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("Rate limit exceeded: {reason} (resets at {reset_time})")]
    RateLimitExceeded {
        reason: String,
        reset_time: DateTime<Utc>,
    },

    #[error("Model {model_id} is not available for {user_type} users (allowed: {})", allowed.join(", "))]
    EntitlementDenied {
        model_id: String,
        user_type: String,
        allowed: Vec<String>,
    },

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Backend error for model {model_id}: {message}")]
    Backend { model_id: String, message: String },

    #[error("Response deadline exceeded after {elapsed_ms}ms")]
    Timeout { elapsed_ms: u64 },

    #[error("Stream cancelled: {0}")]
    StreamCancelled(String),

    #[error("Circuit breaker is open for model {0}")]
    CircuitOpen(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Wrap a backend failure with the model it came from
    pub fn backend(model_id: impl Into<String>, message: impl ToString) -> Self {
        Self::Backend {
            model_id: model_id.into(),
            message: message.to_string(),
        }
    }

    /// Whether the caller should retry later instead of treating this as fatal
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RateLimitExceeded { .. } | Self::Timeout { .. } | Self::CircuitOpen(_)
        )
    }
}

impl From<config::ConfigError> for RuntimeError {
    fn from(err: config::ConfigError) -> Self {
        Self::Configuration(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entitlement_message_lists_alternatives() {
        let err = RuntimeError::EntitlementDenied {
            model_id: "gpt-4o".to_string(),
            user_type: "free".to_string(),
            allowed: vec!["gpt-4o-mini".to_string(), "gemini-1.5-flash".to_string()],
        };
        let msg = err.to_string();
        assert!(msg.contains("gpt-4o"));
        assert!(msg.contains("gpt-4o-mini, gemini-1.5-flash"));
    }

    #[test]
    fn test_retryable_classification() {
        let limited = RuntimeError::RateLimitExceeded {
            reason: "Too many requests per second".to_string(),
            reset_time: Utc::now(),
        };
        assert!(limited.is_retryable());
        assert!(RuntimeError::Timeout { elapsed_ms: 3000 }.is_retryable());
        assert!(!RuntimeError::ConversationNotFound("c1".to_string()).is_retryable());
        assert!(!RuntimeError::backend("m", "boom").is_retryable());
    }
}
