// Configuration management
//
// Priority order (highest to lowest):
// 1. Environment variables (RECFLUX__* prefix)
// 2. Config file (YAML/TOML, optional)
// 3. Built-in defaults
//
// Section and field names join with double underscores, so
// RECFLUX__CACHE__CAPACITY=50000 overrides cache.capacity.

use crate::drift_monitor::{
    DEFAULT_CURRENT_WINDOW, DEFAULT_MONITORED_DIMS, DEFAULT_PSI_BINS, DEFAULT_REFERENCE_WINDOW,
};
use crate::feature_cache::{DEFAULT_READ_CACHE_CAPACITY, DEFAULT_READ_CACHE_TTL};
use crate::online_learning::{
    DEFAULT_BATCH_SIZE, DEFAULT_BUFFER_CAPACITY, DEFAULT_CHECKPOINT_RETENTION,
    DEFAULT_LEARNING_RATE,
};
use crate::retrain::{
    DEFAULT_DRIFT_P_THRESHOLD, DEFAULT_TRAINER_TIMEOUT_SECS, DEFAULT_VOLUME_THRESHOLD,
};
use crate::user_features::{ITEM_FEATURE_DIM, USER_FEATURE_DIM};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Complete engine configuration with all tunable parameters
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct RecfluxConfig {
    /// Feature cache layer
    pub cache: CacheSection,

    /// Distribution drift monitoring
    pub drift: DriftSection,

    /// Online learning coordinator
    pub learning: LearningSection,

    /// Experiment allocation and stats logging
    pub experiments: ExperimentsSection,

    /// Retrain trigger policy
    pub retrain: RetrainSection,

    /// Feature store backend selection
    pub backend: BackendSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CacheSection {
    /// Read cache entry TTL (seconds)
    pub read_ttl_secs: u64,

    /// Maximum cached vectors before eviction
    pub capacity: usize,

    /// User feature vector dimension
    pub user_dim: usize,

    /// Item feature vector dimension
    pub item_dim: usize,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            read_ttl_secs: DEFAULT_READ_CACHE_TTL.as_secs(),
            capacity: DEFAULT_READ_CACHE_CAPACITY,
            user_dim: USER_FEATURE_DIM,
            item_dim: ITEM_FEATURE_DIM,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DriftSection {
    /// Reference window size per dimension
    pub reference_window: usize,

    /// Current window size per dimension
    pub current_window: usize,

    /// Histogram bins used by the PSI computation
    pub psi_bins: usize,

    /// PSI at or above this is a warning
    pub warning_threshold: f64,

    /// PSI at or above this is critical
    pub critical_threshold: f64,

    /// Leading feature dimensions tracked for drift
    pub monitored_dims: usize,

    /// Background drift check period (seconds)
    pub check_interval_secs: u64,
}

impl Default for DriftSection {
    fn default() -> Self {
        Self {
            reference_window: DEFAULT_REFERENCE_WINDOW,
            current_window: DEFAULT_CURRENT_WINDOW,
            psi_bins: DEFAULT_PSI_BINS,
            warning_threshold: 0.1,
            critical_threshold: 0.2,
            monitored_dims: DEFAULT_MONITORED_DIMS,
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LearningSection {
    /// Interaction buffer capacity; reaching it auto-triggers an update
    pub buffer_capacity: usize,

    /// Minimum buffered interactions for a non-forced update
    pub batch_size: usize,

    /// Checkpoints retained for rollback
    pub checkpoint_retention: usize,

    /// Learning rate for the shipped reward accumulator
    pub learning_rate: f64,
}

impl Default for LearningSection {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            batch_size: DEFAULT_BATCH_SIZE,
            checkpoint_retention: DEFAULT_CHECKPOINT_RETENTION,
            learning_rate: DEFAULT_LEARNING_RATE,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct ExperimentsSection {
    /// Fixed RNG seed for reproducible allocation; unset seeds from the OS
    pub allocation_seed: Option<u64>,

    /// CSV impression/conversion log path; unset disables durable stats
    pub stats_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RetrainSection {
    /// Minimum drift p-value before a retrain fires
    pub drift_p_threshold: f64,

    /// Scheduled retrain period in hours; unset disables the schedule
    pub schedule_interval_hours: Option<u64>,

    /// Events since last retrain that force an incremental run
    pub volume_threshold: u64,

    /// Ceiling on a single training run (seconds)
    pub trainer_timeout_secs: u64,

    /// Background trigger check period (seconds)
    pub check_interval_secs: u64,
}

impl Default for RetrainSection {
    fn default() -> Self {
        Self {
            drift_p_threshold: DEFAULT_DRIFT_P_THRESHOLD,
            schedule_interval_hours: Some(168),
            volume_threshold: DEFAULT_VOLUME_THRESHOLD,
            trainer_timeout_secs: DEFAULT_TRAINER_TIMEOUT_SECS,
            check_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Process-local store, no durability
    #[default]
    Memory,

    /// Append-only log on local disk
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BackendSection {
    pub kind: BackendKind,

    /// Log path, required for the file backend
    pub path: Option<String>,

    /// Connection attempts before falling back to the memory backend
    pub connect_attempts: u32,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            kind: BackendKind::Memory,
            path: None,
            connect_attempts: 3,
        }
    }
}

impl RecfluxConfig {
    /// Load configuration with priority chain:
    /// 1. Environment variables (RECFLUX__*)
    /// 2. Config file (if provided)
    /// 3. Built-in defaults
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        let defaults = Self::default();
        let defaults_json =
            serde_json::to_string(&defaults).context("Failed to serialize defaults")?;
        builder = builder.add_source(config::File::from_str(
            &defaults_json,
            config::FileFormat::Json,
        ));

        if let Some(path) = config_file {
            builder = builder.add_source(
                config::File::with_name(path).required(false), // Don't fail if file doesn't exist
            );
        }

        builder = builder.add_source(
            config::Environment::with_prefix("RECFLUX")
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let settings = builder.build().context("Failed to build config")?;

        let config: Self = settings
            .try_deserialize()
            .context("Failed to deserialize config")?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.cache.read_ttl_secs > 0,
            "cache.read_ttl_secs must be > 0"
        );
        anyhow::ensure!(self.cache.capacity > 0, "cache.capacity must be > 0");
        anyhow::ensure!(self.cache.user_dim > 0, "cache.user_dim must be > 0");
        anyhow::ensure!(self.cache.item_dim > 0, "cache.item_dim must be > 0");

        anyhow::ensure!(self.drift.psi_bins >= 2, "drift.psi_bins must be >= 2");
        anyhow::ensure!(
            self.drift.reference_window > self.drift.psi_bins,
            "drift.reference_window must exceed drift.psi_bins, got {}",
            self.drift.reference_window
        );
        anyhow::ensure!(
            self.drift.current_window > self.drift.psi_bins,
            "drift.current_window must exceed drift.psi_bins, got {}",
            self.drift.current_window
        );
        anyhow::ensure!(
            self.drift.warning_threshold > 0.0 && self.drift.warning_threshold.is_finite(),
            "drift.warning_threshold must be a positive number"
        );
        anyhow::ensure!(
            self.drift.critical_threshold > self.drift.warning_threshold,
            "drift.critical_threshold {} must exceed drift.warning_threshold {}",
            self.drift.critical_threshold,
            self.drift.warning_threshold
        );
        anyhow::ensure!(
            self.drift.monitored_dims > 0,
            "drift.monitored_dims must be > 0"
        );
        anyhow::ensure!(
            self.drift.check_interval_secs > 0,
            "drift.check_interval_secs must be > 0"
        );

        anyhow::ensure!(
            self.learning.batch_size > 0,
            "learning.batch_size must be > 0"
        );
        anyhow::ensure!(
            self.learning.buffer_capacity >= self.learning.batch_size,
            "learning.buffer_capacity {} must cover learning.batch_size {}",
            self.learning.buffer_capacity,
            self.learning.batch_size
        );
        anyhow::ensure!(
            self.learning.checkpoint_retention > 0,
            "learning.checkpoint_retention must be > 0"
        );
        anyhow::ensure!(
            self.learning.learning_rate > 0.0 && self.learning.learning_rate.is_finite(),
            "learning.learning_rate must be a positive number"
        );

        anyhow::ensure!(
            self.retrain.drift_p_threshold > 0.0 && self.retrain.drift_p_threshold < 1.0,
            "retrain.drift_p_threshold must lie in (0, 1), got {}",
            self.retrain.drift_p_threshold
        );
        if let Some(hours) = self.retrain.schedule_interval_hours {
            anyhow::ensure!(
                hours > 0,
                "retrain.schedule_interval_hours must be > 0 when set"
            );
        }
        anyhow::ensure!(
            self.retrain.volume_threshold > 0,
            "retrain.volume_threshold must be > 0"
        );
        anyhow::ensure!(
            self.retrain.trainer_timeout_secs > 0,
            "retrain.trainer_timeout_secs must be > 0"
        );
        anyhow::ensure!(
            self.retrain.check_interval_secs > 0,
            "retrain.check_interval_secs must be > 0"
        );

        anyhow::ensure!(
            self.backend.connect_attempts > 0,
            "backend.connect_attempts must be > 0"
        );
        if self.backend.kind == BackendKind::File {
            anyhow::ensure!(
                self.backend
                    .path
                    .as_deref()
                    .is_some_and(|p| !p.trim().is_empty()),
                "backend.path is required for the file backend"
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_validate() {
        let config = RecfluxConfig::default();
        config.validate().unwrap();
        assert_eq!(config.cache.user_dim, USER_FEATURE_DIM);
        assert_eq!(config.learning.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.retrain.schedule_interval_hours, Some(168));
        assert_eq!(config.backend.kind, BackendKind::Memory);
    }

    #[test]
    fn test_validation_rejects_bad_sections() {
        let mut config = RecfluxConfig::default();
        config.drift.critical_threshold = 0.05;
        assert!(config.validate().is_err());

        let mut config = RecfluxConfig::default();
        config.learning.buffer_capacity = 4;
        config.learning.batch_size = 32;
        assert!(config.validate().is_err());

        let mut config = RecfluxConfig::default();
        config.backend.kind = BackendKind::File;
        config.backend.path = None;
        assert!(config.validate().is_err());

        let mut config = RecfluxConfig::default();
        config.retrain.drift_p_threshold = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_file_layer_overrides_defaults() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("recflux.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "[cache]\ncapacity = 123\n\n[learning]\nbatch_size = 8").unwrap();
        drop(file);

        let config = RecfluxConfig::load(path.to_str()).unwrap();
        assert_eq!(config.cache.capacity, 123);
        assert_eq!(config.learning.batch_size, 8);
        // Untouched fields keep their defaults
        assert_eq!(config.cache.read_ttl_secs, DEFAULT_READ_CACHE_TTL.as_secs());
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = RecfluxConfig::load(Some("/nonexistent/recflux.toml")).unwrap();
        assert_eq!(config.cache.capacity, DEFAULT_READ_CACHE_CAPACITY);
    }
}
