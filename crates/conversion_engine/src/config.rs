use std::path::PathBuf;
use std::time::Duration;

use conversion_core::{BackoffPolicy, PerformanceThresholds};
use engine_logging::RotationPolicy;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("backoff multiplier must be >= 1.0, got {0}")]
    InvalidMultiplier(f64),
    #[error("performance sample interval must be non-zero")]
    ZeroSampleInterval,
    #[error("performance sample buffer must hold at least one sample")]
    ZeroSampleCapacity,
    #[error("log rotation threshold must be non-zero")]
    ZeroLogSize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PerformanceSettings {
    pub sample_interval_ms: u64,
    pub max_samples: usize,
    pub time_threshold_ms: u64,
    pub memory_threshold_bytes: u64,
}

impl Default for PerformanceSettings {
    fn default() -> Self {
        Self {
            sample_interval_ms: 5_000,
            max_samples: 1_000,
            time_threshold_ms: 30_000,
            memory_threshold_bytes: 512 * 1024 * 1024,
        }
    }
}

impl PerformanceSettings {
    pub fn thresholds(&self) -> PerformanceThresholds {
        PerformanceThresholds {
            time_threshold_ms: self.time_threshold_ms,
            memory_threshold_bytes: self.memory_threshold_bytes,
        }
    }

    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportSettings {
    pub recent_conversions: usize,
    /// Number of trailing performance samples to embed; `0` leaves them out.
    pub performance_samples: usize,
    pub include_error_analysis: bool,
    /// Active conversions older than this are listed as stale.
    pub stale_after_ms: u64,
}

impl ReportSettings {
    pub fn stale_after(&self) -> Duration {
        Duration::from_millis(self.stale_after_ms)
    }
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            recent_conversions: 50,
            performance_samples: 100,
            include_error_analysis: true,
            stale_after_ms: 10 * 60 * 1_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    /// Extensions tried when the requested file is missing, in order.
    pub alternate_extensions: Vec<String>,
    /// Directory names next to the input's directory searched for the same file.
    pub alternate_dirs: Vec<String>,
    /// Extra roots searched for missing dependencies.
    pub dependency_roots: Vec<PathBuf>,
    /// Where write and permission failures are redirected. Defaults to a
    /// directory under the system temp dir.
    pub fallback_output_dir: Option<PathBuf>,
    pub backup_suffix: String,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            alternate_extensions: vec!["yml".into(), "yaml".into(), "json".into()],
            alternate_dirs: vec!["match".into(), "config".into(), "shared".into()],
            dependency_roots: Vec::new(),
            fallback_output_dir: None,
            backup_suffix: ".backup".into(),
        }
    }
}

impl RecoverySettings {
    pub fn fallback_dir(&self) -> PathBuf {
        self.fallback_output_dir
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("conversion-recovery"))
    }
}

/// Every tunable of the engine. Missing fields fall back to their defaults
/// when deserialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub log_dir: PathBuf,
    pub max_log_size_bytes: u64,
    pub max_log_files: usize,
    pub enable_recovery: bool,
    pub enable_diagnostics: bool,
    pub max_retry_attempts: u32,
    pub backoff: BackoffPolicy,
    pub performance: PerformanceSettings,
    /// Completed conversions kept for history queries and reports.
    pub history_limit: usize,
    pub report: ReportSettings,
    pub recovery: RecoverySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("logs"),
            max_log_size_bytes: 10 * 1024 * 1024,
            max_log_files: 5,
            enable_recovery: true,
            enable_diagnostics: true,
            max_retry_attempts: 3,
            backoff: BackoffPolicy::default(),
            performance: PerformanceSettings::default(),
            history_limit: 1_000,
            report: ReportSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn default_with_log_dir(log_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            ..Self::default()
        }
    }

    pub fn rotation_policy(&self) -> RotationPolicy {
        RotationPolicy {
            max_size_bytes: self.max_log_size_bytes,
            max_files: self.max_log_files,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff.multiplier.is_nan() || self.backoff.multiplier < 1.0 {
            return Err(ConfigError::InvalidMultiplier(self.backoff.multiplier));
        }
        if self.performance.sample_interval_ms == 0 {
            return Err(ConfigError::ZeroSampleInterval);
        }
        if self.performance.max_samples == 0 {
            return Err(ConfigError::ZeroSampleCapacity);
        }
        if self.max_log_size_bytes == 0 {
            return Err(ConfigError::ZeroLogSize);
        }
        Ok(())
    }
}
