use super::defaults::{DEFAULT_MAX_BATCH, DEFAULT_MAX_RETRIES, LOW_LATENCY_MAX_BATCH};
use serde::{Deserialize, Serialize};

/// Batch and retry limits for the apply engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplyTuning {
    /// Operations per physical batch.
    pub max_batch: usize,
    /// Attempts per save, including the first.
    pub max_retries: usize,
}

/// Preset profiles that bundle common tuning choices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TuningProfile {
    #[default]
    Balanced,
    LowLatency,
    Bulk,
}

impl Default for ApplyTuning {
    fn default() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl ApplyTuning {
    pub fn from_profile(profile: TuningProfile) -> Self {
        match profile {
            TuningProfile::Balanced => Self::balanced(),
            TuningProfile::LowLatency => Self::low_latency(),
            TuningProfile::Bulk => Self::bulk(),
        }
    }

    pub fn balanced() -> Self {
        Self::default()
    }

    pub fn low_latency() -> Self {
        Self {
            max_batch: LOW_LATENCY_MAX_BATCH,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Same ceiling as balanced; bulk imports retry once more before giving up.
    pub fn bulk() -> Self {
        Self {
            max_batch: DEFAULT_MAX_BATCH,
            max_retries: DEFAULT_MAX_RETRIES + 1,
        }
    }

    /// Batch ceiling, never below one.
    pub fn batch_limit(&self) -> usize {
        self.max_batch.max(1)
    }

    /// Attempt count, never below one.
    pub fn attempt_limit(&self) -> usize {
        self.max_retries.max(1)
    }
}
