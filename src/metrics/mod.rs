//! Metrics collection for observability

use prometheus::{
    Counter, CounterVec, HistogramOpts, HistogramVec, Opts, Registry,
    register_counter_vec_with_registry, register_counter_with_registry,
    register_histogram_vec_with_registry,
};
use std::time::Duration;

/// Metrics collector.
///
/// Each runtime owns its own registry, so several runtimes (or tests) can
/// live in one process without colliding on metric names.
pub struct Metrics {
    registry: Registry,

    // Cache metrics
    pub cache_hits: CounterVec,
    pub cache_misses: CounterVec,
    pub cache_evictions: CounterVec,

    // Rate limiting metrics
    pub rate_limit_decisions: CounterVec,

    // Context management metrics
    pub summarizations: Counter,
    pub context_truncations: Counter,

    // Latency metrics
    pub response_duration: HistogramVec,
    pub first_token_latency: HistogramVec,

    // Fast path and streaming metrics
    pub fast_optimizations: CounterVec,
    pub fast_fallbacks: Counter,
    pub streams_cancelled: Counter,
}

impl Metrics {
    /// Create a new metrics collector
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let cache_hits = register_counter_vec_with_registry!(
            Opts::new("chat_cache_hits_total", "Cache hits by cache name"),
            &["cache"],
            registry
        )?;

        let cache_misses = register_counter_vec_with_registry!(
            Opts::new("chat_cache_misses_total", "Cache misses by cache name"),
            &["cache"],
            registry
        )?;

        let cache_evictions = register_counter_vec_with_registry!(
            Opts::new("chat_cache_evictions_total", "Entries removed by sweeps"),
            &["cache"],
            registry
        )?;

        let rate_limit_decisions = register_counter_vec_with_registry!(
            Opts::new("chat_rate_limit_decisions_total", "Rate limit decisions by outcome"),
            &["outcome"],
            registry
        )?;

        let summarizations = register_counter_with_registry!(
            Opts::new("chat_summarizations_total", "Conversation summarizations performed"),
            registry
        )?;

        let context_truncations = register_counter_with_registry!(
            Opts::new("chat_context_truncations_total", "Requests whose history was truncated"),
            registry
        )?;

        let response_duration = register_histogram_vec_with_registry!(
            HistogramOpts::new("chat_response_duration_seconds", "End-to-end response time")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 10.0, 30.0]),
            &["mode"],
            registry
        )?;

        let first_token_latency = register_histogram_vec_with_registry!(
            HistogramOpts::new("chat_first_token_seconds", "Time to first streamed chunk")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0]),
            &["model"],
            registry
        )?;

        let fast_optimizations = register_counter_vec_with_registry!(
            Opts::new("chat_fast_optimizations_total", "Fast path optimizations applied"),
            &["kind"],
            registry
        )?;

        let fast_fallbacks = register_counter_with_registry!(
            Opts::new("chat_fast_fallbacks_total", "Fast responses that fell back to streaming"),
            registry
        )?;

        let streams_cancelled = register_counter_with_registry!(
            Opts::new("chat_streams_cancelled_total", "Streams cancelled by callers"),
            registry
        )?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            cache_evictions,
            rate_limit_decisions,
            summarizations,
            context_truncations,
            response_duration,
            first_token_latency,
            fast_optimizations,
            fast_fallbacks,
            streams_cancelled,
        })
    }

    /// Get the metrics registry for exporting
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record a cache lookup
    pub fn record_cache_lookup(&self, cache: &str, hit: bool) {
        if hit {
            self.cache_hits.with_label_values(&[cache]).inc();
        } else {
            self.cache_misses.with_label_values(&[cache]).inc();
        }
    }

    /// Record entries removed by a sweep
    pub fn record_sweep(&self, cache: &str, removed: usize) {
        if removed > 0 {
            self.cache_evictions.with_label_values(&[cache]).inc_by(removed as f64);
        }
    }

    /// Record a rate limit decision
    pub fn record_rate_limit(&self, allowed: bool) {
        let outcome = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions.with_label_values(&[outcome]).inc();
    }

    /// Record a summarization event
    pub fn record_summarization(&self) {
        self.summarizations.inc();
    }

    pub fn record_truncation(&self) {
        self.context_truncations.inc();
    }

    /// Record a completed response for a mode (standard, fast, streaming)
    pub fn record_response(&self, mode: &str, elapsed: Duration) {
        self.response_duration
            .with_label_values(&[mode])
            .observe(elapsed.as_secs_f64());
    }

    pub fn record_first_token(&self, model_id: &str, latency: Duration) {
        self.first_token_latency
            .with_label_values(&[model_id])
            .observe(latency.as_secs_f64());
    }

    pub fn record_optimization(&self, kind: &str) {
        self.fast_optimizations.with_label_values(&[kind]).inc();
    }

    pub fn record_fast_fallback(&self) {
        self.fast_fallbacks.inc();
    }

    pub fn record_stream_cancelled(&self) {
        self.streams_cancelled.inc();
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        use prometheus::Encoder;

        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }

        String::from_utf8(buffer).unwrap_or_default()
    }
}
