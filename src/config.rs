//! Runtime configuration
//!
//! Every section carries serde defaults so a partial TOML file (or none at all)
//! yields a usable configuration. Values can be overridden through
//! `CHAT_RUNTIME__<SECTION>__<FIELD>` environment variables.

use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const ENV_PREFIX: &str = "CHAT_RUNTIME";

/// Top-level runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub response_cache: ResponseCacheConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub fast: FastConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl RuntimeConfig {
    /// Load configuration from an optional file plus environment overrides
    pub fn load(path: Option<&str>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path).required(false));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let cfg: RuntimeConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from_str(raw, config::FileFormat::Toml))
            .build()?;
        let cfg: RuntimeConfig = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Validate that the configuration is usable
    pub fn validate(&self) -> Result<()> {
        if self.cache.max_size == 0 || self.response_cache.max_size == 0 {
            return Err(RuntimeError::Configuration(
                "cache max_size must be greater than zero".to_string(),
            ));
        }
        if self.context.max_conversations == 0 {
            return Err(RuntimeError::Configuration(
                "context.max_conversations must be greater than zero".to_string(),
            ));
        }
        if self.rate_limit.global_capacity <= 0.0 || self.rate_limit.global_refill_per_sec < 0.0 {
            return Err(RuntimeError::Configuration(format!(
                "invalid global bucket: capacity={}, refill={}",
                self.rate_limit.global_capacity, self.rate_limit.global_refill_per_sec
            )));
        }
        if self.fast.target_latency_ms == 0 {
            return Err(RuntimeError::Configuration(
                "fast.target_latency_ms must be greater than zero".to_string(),
            ));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(RuntimeError::Configuration(
                "backend.base_url must not be empty".to_string(),
            ));
        }
        if self.streaming.buffer_size == 0 {
            return Err(RuntimeError::Configuration(
                "streaming.buffer_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// General purpose TTL cache settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cache_size")]
    pub max_size: usize,
    /// Interval between background sweeps
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

fn default_cache_ttl() -> u64 { 300 }
fn default_cache_size() -> usize { 1000 }
fn default_sweep_interval() -> u64 { 60 }

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            max_size: default_cache_size(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl CacheConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Cache for full (standard mode) responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseCacheConfig {
    #[serde(default = "default_response_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_response_size")]
    pub max_size: usize,
}

fn default_response_ttl() -> u64 { 600 }
fn default_response_size() -> usize { 500 }

impl Default for ResponseCacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_response_ttl(),
            max_size: default_response_size(),
        }
    }
}

impl ResponseCacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Global bucket and per-user window limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_capacity")]
    pub global_capacity: f64,
    /// Tokens added to the global bucket per second
    #[serde(default = "default_global_refill")]
    pub global_refill_per_sec: f64,
    #[serde(default = "default_per_second")]
    pub per_second: usize,
    #[serde(default = "default_per_minute")]
    pub per_minute: usize,
    #[serde(default = "default_per_hour")]
    pub per_hour: usize,
}

fn default_global_capacity() -> f64 { 100.0 }
fn default_global_refill() -> f64 { 50.0 }
fn default_per_second() -> usize { 5 }
fn default_per_minute() -> usize { 60 }
fn default_per_hour() -> usize { 1000 }

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_capacity: default_global_capacity(),
            global_refill_per_sec: default_global_refill(),
            per_second: default_per_second(),
            per_minute: default_per_minute(),
            per_hour: default_per_hour(),
        }
    }
}

/// Conversation storage settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_ttl")]
    pub ttl_secs: u64,
    #[serde(default = "default_max_conversations")]
    pub max_conversations: usize,
    /// Named summarization strategy applied when a conversation crosses its warning threshold
    #[serde(default = "default_strategy")]
    pub summarization_strategy: String,
}

fn default_context_ttl() -> u64 { 7200 }
fn default_max_conversations() -> usize { 1000 }
fn default_strategy() -> String { "balanced".to_string() }

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            ttl_secs: default_context_ttl(),
            max_conversations: default_max_conversations(),
            summarization_strategy: default_strategy(),
        }
    }
}

impl ContextConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Fast response orchestration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FastConfig {
    #[serde(default = "default_target_latency")]
    pub target_latency_ms: u64,
    #[serde(default = "default_true")]
    pub enable_instant_responses: bool,
    #[serde(default = "default_true")]
    pub enable_aggressive_cache: bool,
    #[serde(default = "default_true")]
    pub enable_compression: bool,
    #[serde(default = "default_true")]
    pub enable_model_downgrade: bool,
    #[serde(default = "default_true")]
    pub enable_precomputed: bool,
    #[serde(default = "default_aggressive_ttl")]
    pub aggressive_cache_ttl_secs: u64,
    #[serde(default = "default_aggressive_capacity")]
    pub aggressive_cache_capacity: u64,
    /// Characters of the last message that go into the aggressive fingerprint
    #[serde(default = "default_fingerprint_chars")]
    pub fingerprint_chars: usize,
}

fn default_target_latency() -> u64 { 3000 }
fn default_true() -> bool { true }
fn default_aggressive_ttl() -> u64 { 120 }
fn default_aggressive_capacity() -> u64 { 5000 }
fn default_fingerprint_chars() -> usize { 100 }

impl Default for FastConfig {
    fn default() -> Self {
        Self {
            target_latency_ms: default_target_latency(),
            enable_instant_responses: true,
            enable_aggressive_cache: true,
            enable_compression: true,
            enable_model_downgrade: true,
            enable_precomputed: true,
            aggressive_cache_ttl_secs: default_aggressive_ttl(),
            aggressive_cache_capacity: default_aggressive_capacity(),
            fingerprint_chars: default_fingerprint_chars(),
        }
    }
}

impl FastConfig {
    pub fn target_latency(&self) -> Duration {
        Duration::from_millis(self.target_latency_ms)
    }

    pub fn aggressive_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.aggressive_cache_ttl_secs)
    }
}

/// Streaming behaviour
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Tokens held back before a chunk is flushed
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
    #[serde(default = "default_word_delay")]
    pub instant_word_delay_ms: u64,
    #[serde(default = "default_stream_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream_temperature")]
    pub temperature: f32,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Latency samples kept per model
    #[serde(default = "default_latency_samples")]
    pub latency_samples: usize,
}

fn default_buffer_size() -> usize { 5 }
fn default_word_delay() -> u64 { 30 }
fn default_stream_max_tokens() -> u32 { 1000 }
fn default_stream_temperature() -> f32 { 0.3 }
fn default_channel_capacity() -> usize { 64 }
fn default_latency_samples() -> usize { 100 }

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            instant_word_delay_ms: default_word_delay(),
            max_tokens: default_stream_max_tokens(),
            temperature: default_stream_temperature(),
            channel_capacity: default_channel_capacity(),
            latency_samples: default_latency_samples(),
        }
    }
}

impl StreamingConfig {
    pub fn instant_word_delay(&self) -> Duration {
        Duration::from_millis(self.instant_word_delay_ms)
    }
}

/// OpenAI-compatible backend endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_url")]
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_backend_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_backend_retries")]
    pub max_retries: usize,
}

fn default_backend_url() -> String { "http://localhost:8080/v1".to_string() }
fn default_backend_timeout() -> u64 { 60 }
fn default_backend_retries() -> usize { 3 }

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: default_backend_url(),
            api_key: None,
            timeout_secs: default_backend_timeout(),
            max_retries: default_backend_retries(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Backend circuit breaker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_breaker_failures")]
    pub failure_threshold: usize,
    #[serde(default = "default_breaker_reset")]
    pub reset_timeout_secs: u64,
}

fn default_breaker_failures() -> usize { 5 }
fn default_breaker_reset() -> u64 { 30 }

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_breaker_failures(),
            reset_timeout_secs: default_breaker_reset(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String { "info".to_string() }

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RuntimeConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fast.target_latency_ms, 3000);
        assert_eq!(config.streaming.latency_samples, 100);
        assert_eq!(config.context.summarization_strategy, "balanced");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let raw = r#"
            [fast]
            target_latency_ms = 1500

            [rate_limit]
            per_second = 2
        "#;
        let config = RuntimeConfig::from_toml_str(raw).unwrap();
        assert_eq!(config.fast.target_latency_ms, 1500);
        assert!(config.fast.enable_instant_responses);
        assert_eq!(config.rate_limit.per_second, 2);
        assert_eq!(config.rate_limit.per_minute, 60);
        assert_eq!(config.cache.max_size, 1000);
    }

    #[test]
    fn test_invalid_config_rejected() {
        let raw = r#"
            [cache]
            max_size = 0
        "#;
        assert!(RuntimeConfig::from_toml_str(raw).is_err());
    }

    #[test]
    fn test_duration_conversions() {
        let config = RuntimeConfig::default();
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
        assert_eq!(config.fast.target_latency(), Duration::from_millis(3000));
        assert_eq!(config.breaker.reset_timeout(), Duration::from_secs(30));
        assert_eq!(config.streaming.instant_word_delay(), Duration::from_millis(30));
    }
}
