//! Unified configuration for rolodex components.
//!
//! Configuration is loaded with precedence: Env vars > Config file > Defaults
//!
//! # Example config file (rolodex.toml)
//! ```toml
//! profile = "low-latency"
//!
//! [loader]
//! load_stream_items = true
//! post_view_notification = false
//!
//! [storage]
//! data_dir = "/var/lib/rolodex"
//! ```
//!
//! Environment variables use the `ROLODEX_` prefix with `__` between
//! section and key, e.g. `ROLODEX_APPLY__MAX_BATCH=200`.

mod defaults;
mod tuning;

pub use defaults::*;
pub use tuning::*;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RolodexConfig {
    /// Preset used when `apply` is not given explicitly
    pub profile: TuningProfile,
    /// Explicit batch and retry limits
    #[serde(skip_serializing_if = "Option::is_none")]
    pub apply: Option<ApplyTuning>,
    pub loader: LoaderConfig,
    pub worker: WorkerConfig,
    pub storage: StorageConfig,
}

impl RolodexConfig {
    /// Load configuration with precedence: Env > File > Defaults
    pub fn load(config_path: Option<&str>) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(RolodexConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with ROLODEX_ prefix
        figment = figment.merge(Env::prefixed("ROLODEX_").split("__"));

        figment.extract().map_err(ConfigError::from)
    }

    /// Effective apply limits.
    pub fn apply_tuning(&self) -> ApplyTuning {
        self.apply
            .unwrap_or_else(|| ApplyTuning::from_profile(self.profile))
    }
}

/// What the contact assembler loads beyond the core rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub load_group_metadata: bool,
    pub load_invitable_account_types: bool,
    /// Tell account services when their raw contacts are viewed
    pub post_view_notification: bool,
    pub format_phone_numbers: bool,
    pub load_stream_items: bool,
    /// Deliver the full-size photo in a second, later result
    pub fetch_photo_in_background: bool,
    pub cache_capacity: usize,
    pub max_photo_bytes: usize,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            load_group_metadata: false,
            load_invitable_account_types: false,
            post_view_notification: false,
            format_phone_numbers: false,
            load_stream_items: false,
            fetch_photo_in_background: false,
            cache_capacity: DEFAULT_CONTACT_CACHE_CAPACITY,
            max_photo_bytes: DEFAULT_MAX_PHOTO_BYTES,
        }
    }
}

/// Background worker settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub queue_capacity: usize,
    pub thread_name: String,
    pub photo_thread_name: String,
    pub watch_buffer: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            thread_name: DEFAULT_WORKER_THREAD_NAME.to_string(),
            photo_thread_name: DEFAULT_PHOTO_THREAD_NAME.to_string(),
            watch_buffer: DEFAULT_WATCH_BUFFER,
        }
    }
}

/// RocksDB storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data directory; `None` keeps everything in memory
    pub data_dir: Option<PathBuf>,
    /// Run repair on startup
    pub repair: bool,
    /// Write buffer size in MB
    pub write_buffer_mb: usize,
    /// Background flush and compaction jobs
    pub max_background_jobs: i32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            repair: false,
            write_buffer_mb: DEFAULT_WRITE_BUFFER_MB,
            max_background_jobs: DEFAULT_BACKGROUND_JOBS,
        }
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = RolodexConfig::default();
        assert_eq!(config.profile, TuningProfile::Balanced);
        assert_eq!(config.apply_tuning().max_batch, DEFAULT_MAX_BATCH);
        assert_eq!(config.apply_tuning().max_retries, DEFAULT_MAX_RETRIES);
        assert_eq!(config.worker.queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.storage.data_dir.is_none());
    }

    #[test]
    fn test_profile_serde() {
        let json = serde_json::to_string(&TuningProfile::LowLatency).unwrap();
        assert_eq!(json, "\"low-latency\"");

        let profile: TuningProfile = serde_json::from_str("\"bulk\"").unwrap();
        assert_eq!(profile, TuningProfile::Bulk);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "profile = \"low-latency\"\n[loader]\nload_stream_items = true\n"
        )
        .unwrap();
        let config = RolodexConfig::load(file.path().to_str()).unwrap();
        assert_eq!(config.apply_tuning(), ApplyTuning::low_latency());
        assert!(config.loader.load_stream_items);
        assert!(!config.loader.load_group_metadata);
    }

    #[test]
    fn test_explicit_apply_wins_over_profile() {
        let config = RolodexConfig {
            profile: TuningProfile::LowLatency,
            apply: Some(ApplyTuning {
                max_batch: 7,
                max_retries: 1,
            }),
            ..Default::default()
        };
        assert_eq!(config.apply_tuning().max_batch, 7);
    }

    #[test]
    fn test_tuning_limits_never_zero() {
        let tuning = ApplyTuning {
            max_batch: 0,
            max_retries: 0,
        };
        assert_eq!(tuning.batch_limit(), 1);
        assert_eq!(tuning.attempt_limit(), 1);
    }
}
