//! Sliding window tuning profiles

use crate::context::limits_for;
use crate::error::{Result, RuntimeError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Settings for one optimization pass
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowConfig {
    /// Hard ceiling for the returned slice
    pub max_tokens: usize,
    pub preserve_last_n: usize,
    pub preserve_system: bool,
    /// Fraction of `max_tokens` that greedy selection aims for
    pub compression_ratio: f64,
    pub enable_smart_summarization: bool,
}

impl WindowConfig {
    pub fn target_tokens(&self) -> usize {
        (self.max_tokens as f64 * self.compression_ratio).floor() as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(RuntimeError::Configuration(
                "window max_tokens must be greater than zero".to_string(),
            ));
        }
        if !(self.compression_ratio > 0.0 && self.compression_ratio <= 1.0) {
            return Err(RuntimeError::Configuration(format!(
                "compression_ratio must be in (0, 1], got {}",
                self.compression_ratio
            )));
        }
        Ok(())
    }

    /// Build the settings of a profile for a model's context window
    pub fn for_model(profile: WindowProfile, model_id: &str) -> Self {
        let window = limits_for(model_id).max_tokens as f64;
        let (share, preserve_last_n, summarize, compression_ratio) = match profile {
            WindowProfile::Speed => (0.6, 2, false, 0.7),
            WindowProfile::Balanced => (0.8, 4, true, 0.8),
            WindowProfile::Quality => (0.9, 6, true, 0.9),
        };
        Self {
            max_tokens: (window * share) as usize,
            preserve_last_n,
            preserve_system: true,
            compression_ratio,
            enable_smart_summarization: summarize,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            max_tokens: 4_000,
            preserve_last_n: 4,
            preserve_system: true,
            compression_ratio: 0.8,
            enable_smart_summarization: true,
        }
    }
}

/// Latency versus fidelity trade-off
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowProfile {
    Speed,
    Balanced,
    Quality,
}

impl WindowProfile {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowProfile::Speed => "speed",
            WindowProfile::Balanced => "balanced",
            WindowProfile::Quality => "quality",
        }
    }
}

impl fmt::Display for WindowProfile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WindowProfile {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "speed" => Ok(WindowProfile::Speed),
            "balanced" => Ok(WindowProfile::Balanced),
            "quality" => Ok(WindowProfile::Quality),
            other => Err(format!("unknown window profile: {}", other)),
        }
    }
}
