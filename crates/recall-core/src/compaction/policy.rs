//! # Compaction Policy
//!
//! Token budget and thresholds that decide when compaction runs and when it stops.

use serde::{Deserialize, Serialize};

use crate::error::{MemoryError, Result};

/// Token budget for one conversation's active context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompactionConfig {
    /// Context window of the model the active context is fed to
    pub model_context_window: u64,

    /// Below this fraction of the window `compact()` does nothing
    pub soft_threshold_ratio: f64,

    /// Above this fraction of the window compaction is required
    pub hard_threshold_ratio: f64,

    /// Most recent messages that are never summarized
    pub recent_window_size: usize,

    /// Messages (level 1) or summaries (level 2) folded into one summary
    pub chunk_size: usize,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            model_context_window: 200_000,
            soft_threshold_ratio: 0.6,
            hard_threshold_ratio: 0.85,
            recent_window_size: 20,
            chunk_size: 15,
        }
    }
}

impl CompactionConfig {
    /// Config for a small model window, compacting early
    pub fn small_window(model_context_window: u64) -> Self {
        Self {
            model_context_window,
            soft_threshold_ratio: 0.3,
            hard_threshold_ratio: 0.5,
            recent_window_size: 10,
            chunk_size: 10,
        }
    }

    /// Set the model context window
    pub fn with_context_window(mut self, tokens: u64) -> Self {
        self.model_context_window = tokens;
        self
    }

    /// Set both threshold ratios
    pub fn with_thresholds(mut self, soft: f64, hard: f64) -> Self {
        self.soft_threshold_ratio = soft;
        self.hard_threshold_ratio = hard;
        self
    }

    /// Set the recent window size
    pub fn with_recent_window(mut self, messages: usize) -> Self {
        self.recent_window_size = messages;
        self
    }

    /// Set the chunk size
    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size;
        self
    }

    /// `soft_threshold_ratio × model_context_window`, floored
    pub fn soft_threshold(&self) -> i64 {
        (self.soft_threshold_ratio * self.model_context_window as f64).floor() as i64
    }

    /// `hard_threshold_ratio × model_context_window`, floored
    pub fn hard_threshold(&self) -> i64 {
        (self.hard_threshold_ratio * self.model_context_window as f64).floor() as i64
    }

    /// Reject configurations the engine cannot make progress with
    pub fn validate(&self) -> Result<()> {
        if self.model_context_window == 0 {
            return Err(MemoryError::config("model_context_window must be positive"));
        }
        let ratio_ok = |r: f64| r.is_finite() && r > 0.0 && r <= 1.0;
        if !ratio_ok(self.soft_threshold_ratio) || !ratio_ok(self.hard_threshold_ratio) {
            return Err(MemoryError::config(
                "threshold ratios must lie in (0, 1]",
            ));
        }
        if self.soft_threshold_ratio > self.hard_threshold_ratio {
            return Err(MemoryError::config(format!(
                "soft_threshold_ratio ({}) exceeds hard_threshold_ratio ({})",
                self.soft_threshold_ratio, self.hard_threshold_ratio
            )));
        }
        if self.chunk_size < 2 {
            return Err(MemoryError::config("chunk_size must be at least 2"));
        }
        Ok(())
    }
}

/// Highest escalation step a compaction run reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionLevel {
    /// Chunks of raw messages into level-1 summaries
    Chunked = 1,
    /// Level-1 summaries folded into level-2 summaries
    SummaryOfSummaries = 2,
    /// All active summaries replaced by one deterministic digest
    Truncation = 3,
}

impl CompactionLevel {
    /// Level number stored on summaries and log rows
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Strategy label written to the compaction log
    pub fn strategy(self) -> &'static str {
        match self {
            Self::Chunked => "chunked_summary",
            Self::SummaryOfSummaries => "summary_of_summaries",
            Self::Truncation => "deterministic_truncation",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_thresholds() {
        let config = CompactionConfig::default();
        assert_eq!(config.soft_threshold(), 120_000);
        assert_eq!(config.hard_threshold(), 170_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_thresholds_are_floored() {
        let config = CompactionConfig::default()
            .with_context_window(999)
            .with_thresholds(0.3, 0.5);
        assert_eq!(config.soft_threshold(), 299);
        assert_eq!(config.hard_threshold(), 499);
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = CompactionConfig::default().with_thresholds(0.9, 0.5);
        assert!(matches!(
            config.validate(),
            Err(MemoryError::Configuration(_))
        ));
    }

    #[test]
    fn test_validate_rejects_tiny_chunks() {
        let config = CompactionConfig::default().with_chunk_size(1);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_level_strategy_labels() {
        assert_eq!(CompactionLevel::Chunked.as_u8(), 1);
        assert_eq!(CompactionLevel::Truncation.strategy(), "deterministic_truncation");
        assert!(CompactionLevel::Chunked < CompactionLevel::Truncation);
    }
}
