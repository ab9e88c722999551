//! Rolling latency samples per model

use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;

/// Summary of the retained samples
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencyStats {
    pub samples: usize,
    pub min_ms: u64,
    pub avg_ms: f64,
    pub max_ms: u64,
}

/// Keeps the most recent `capacity` samples for each model
pub struct LatencyTracker {
    samples: DashMap<String, VecDeque<u64>>,
    capacity: usize,
}

impl LatencyTracker {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, model_id: &str, latency: Duration) {
        let mut entry = self.samples.entry(model_id.to_string()).or_default();
        if entry.len() == self.capacity {
            entry.pop_front();
        }
        entry.push_back(latency.as_millis() as u64);
    }

    pub fn for_model(&self, model_id: &str) -> Option<LatencyStats> {
        self.samples.get(model_id).map(|samples| summarize(samples.value()))
    }

    pub fn all(&self) -> HashMap<String, LatencyStats> {
        self.samples
            .iter()
            .map(|entry| (entry.key().clone(), summarize(entry.value())))
            .collect()
    }

    pub fn clear(&self) {
        self.samples.clear();
    }
}

fn summarize(samples: &VecDeque<u64>) -> LatencyStats {
    if samples.is_empty() {
        return LatencyStats::default();
    }
    let sum: u64 = samples.iter().sum();
    LatencyStats {
        samples: samples.len(),
        min_ms: samples.iter().copied().min().unwrap_or(0),
        avg_ms: sum as f64 / samples.len() as f64,
        max_ms: samples.iter().copied().max().unwrap_or(0),
    }
}
