//! Per-model circuit breaker for backend protection

use crate::config::BreakerConfig;
use crate::error::{Result, RuntimeError};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,   // Normal operation
    Open,     // Failing, reject requests
    HalfOpen, // Letting a probe through
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    failure_count: usize,
    last_failure: Option<Instant>,
    opened_at: Option<Instant>,
}

impl BreakerEntry {
    fn new() -> Self {
        Self {
            state: BreakerState::Closed,
            failure_count: 0,
            last_failure: None,
            opened_at: None,
        }
    }
}

/// Circuit breaker keyed by model id
pub struct CircuitBreaker {
    breakers: Mutex<HashMap<String, BreakerEntry>>,
    failure_threshold: usize,
    reset_timeout: Duration,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            breakers: Mutex::new(HashMap::new()),
            failure_threshold: config.failure_threshold.max(1),
            reset_timeout: config.reset_timeout(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Check if the circuit is open for a model, moving to half-open once the
    /// reset timeout has passed
    pub fn is_open(&self, model_id: &str) -> bool {
        let mut breakers = self.lock();
        let Some(entry) = breakers.get_mut(model_id) else {
            return false;
        };

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => match entry.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.reset_timeout => {
                    entry.state = BreakerState::HalfOpen;
                    info!(model_id, "Circuit half-open, allowing probe");
                    false
                }
                _ => true,
            },
        }
    }

    /// Fail fast with [`RuntimeError::CircuitOpen`] when the circuit is open
    pub fn check(&self, model_id: &str) -> Result<()> {
        if self.is_open(model_id) {
            return Err(RuntimeError::CircuitOpen(model_id.to_string()));
        }
        Ok(())
    }

    pub fn mark_success(&self, model_id: &str) {
        let mut breakers = self.lock();
        if let Some(entry) = breakers.get_mut(model_id) {
            if entry.state != BreakerState::Closed {
                info!(model_id, "Circuit closed");
            }
            *entry = BreakerEntry::new();
        }
    }

    pub fn mark_failure(&self, model_id: &str) {
        let mut breakers = self.lock();
        let entry = breakers
            .entry(model_id.to_string())
            .or_insert_with(BreakerEntry::new);

        let now = Instant::now();
        entry.failure_count += 1;
        entry.last_failure = Some(now);

        // a failed probe reopens immediately
        if entry.state == BreakerState::HalfOpen || entry.failure_count >= self.failure_threshold {
            if entry.state != BreakerState::Open {
                warn!(model_id, failures = entry.failure_count, "Circuit opened");
            }
            entry.state = BreakerState::Open;
            entry.opened_at = Some(now);
        }
    }

    pub fn state(&self, model_id: &str) -> BreakerState {
        self.lock()
            .get(model_id)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn stats(&self, model_id: &str) -> BreakerStats {
        match self.lock().get(model_id) {
            Some(entry) => BreakerStats {
                state: entry.state,
                failure_count: entry.failure_count,
                last_failure_ms_ago: entry.last_failure.map(|t| t.elapsed().as_millis() as u64),
            },
            None => BreakerStats {
                state: BreakerState::Closed,
                failure_count: 0,
                last_failure_ms_ago: None,
            },
        }
    }

    /// Stats for every model that has recorded a failure
    pub fn all_stats(&self) -> HashMap<String, BreakerStats> {
        let keys: Vec<String> = self.lock().keys().cloned().collect();
        keys.into_iter()
            .map(|model_id| {
                let stats = self.stats(&model_id);
                (model_id, stats)
            })
            .collect()
    }

    pub fn reset(&self, model_id: &str) {
        self.lock().remove(model_id);
    }

    pub fn reset_all(&self) {
        self.lock().clear();
    }
}

/// Circuit breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct BreakerStats {
    pub state: BreakerState,
    pub failure_count: usize,
    pub last_failure_ms_ago: Option<u64>,
}
