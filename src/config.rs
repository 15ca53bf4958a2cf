//! Configuration types for media-relay

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{path::Path, path::PathBuf, time::Duration};

/// Where the pipeline keeps its working set and its state
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Working directory for fetched archives and extracted files (default: "./media-relay-work")
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Database path (default: "./media-relay.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            database_path: default_database_path(),
        }
    }
}

/// Disk budget configuration
///
/// A fetch is authorized only while
/// `resident_bytes + candidate_bytes + margin <= ceiling`, where
/// `margin = max(ceiling * margin_ratio, margin_floor_bytes)`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DiskBudgetConfig {
    /// Hard ceiling on bytes the pipeline may hold locally (None = unlimited)
    #[serde(default)]
    pub ceiling_bytes: Option<u64>,

    /// Safety margin as a fraction of the ceiling (default: 0.10)
    #[serde(default = "default_margin_ratio")]
    pub margin_ratio: f64,

    /// Minimum safety margin in bytes (default: 16 MiB)
    #[serde(default = "default_margin_floor")]
    pub margin_floor_bytes: u64,

    /// Multiplier applied to an archive's listed size when reserving budget (default: 2.0)
    ///
    /// A resident unit holds both the archive and its extracted copy until Reclaim.
    #[serde(default = "default_reservation_multiplier")]
    pub reservation_multiplier: f64,

    /// Warn at startup when the ceiling exceeds the real free space of the work dir (default: true)
    #[serde(default = "default_true")]
    pub check_free_space: bool,
}

impl Default for DiskBudgetConfig {
    fn default() -> Self {
        Self {
            ceiling_bytes: None,
            margin_ratio: default_margin_ratio(),
            margin_floor_bytes: default_margin_floor(),
            reservation_multiplier: default_reservation_multiplier(),
            check_free_space: true,
        }
    }
}

/// Worker pool sizing and pacing
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Units driven concurrently; the disk budget still gates every fetch (default: 1)
    #[serde(default = "default_max_concurrent_units")]
    pub max_concurrent_units: usize,

    /// Concurrent Enrich calls per unit (default: 4)
    #[serde(default = "default_enrich_workers")]
    pub enrich_workers: usize,

    /// Concurrent Publish calls per unit (default: 2)
    #[serde(default = "default_publish_workers")]
    pub publish_workers: usize,

    /// Files handed to the publish pool per batch (default: 50)
    #[serde(default = "default_publish_batch_size")]
    pub publish_batch_size: usize,

    /// Minimum spacing between two publish calls of the same worker (default: 0 = none)
    #[serde(default, with = "duration_serde")]
    pub publish_min_interval: Duration,

    /// Timeout applied to every collaborator call (default: 300 seconds)
    #[serde(default = "default_call_timeout", with = "duration_serde")]
    pub call_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_units: default_max_concurrent_units(),
            enrich_workers: default_enrich_workers(),
            publish_workers: default_publish_workers(),
            publish_batch_size: default_publish_batch_size(),
            publish_min_interval: Duration::ZERO,
            call_timeout: default_call_timeout(),
        }
    }
}

/// Pipeline policy switches
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PolicyConfig {
    /// Publish files whose metadata could not be embedded (default: false)
    #[serde(default)]
    pub publish_without_metadata: bool,

    /// Keep a partial or corrupt archive on disk after a failed fetch (default: true)
    #[serde(default = "default_true")]
    pub keep_failed_fetch_artifacts: bool,

    /// Extensions that are never published (recorded as Skipped)
    #[serde(default = "default_skip_extensions")]
    pub skip_extensions: Vec<String>,

    /// Extension of metadata sidecar files next to each media file (default: "json")
    #[serde(default = "default_sidecar_extension")]
    pub sidecar_extension: String,

    /// Album used when a file sits at the archive root (default: "Imported")
    #[serde(default = "default_album")]
    pub default_album: String,

    /// Abandon a file automatically once it has failed this many times (default: never)
    #[serde(default)]
    pub abandon_after_attempts: Option<u32>,

    /// Verify SHA-256 checksums when the source lists one (default: true)
    #[serde(default = "default_true")]
    pub verify_checksums: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            publish_without_metadata: false,
            keep_failed_fetch_artifacts: true,
            skip_extensions: default_skip_extensions(),
            sidecar_extension: default_sidecar_extension(),
            default_album: default_album(),
            abandon_after_attempts: None,
            verify_checksums: true,
        }
    }
}

impl PolicyConfig {
    /// Whether files with this path are excluded from publication
    pub fn is_skipped_extension(&self, path: &Path) -> bool {
        path.extension()
            .map(|ext| ext.to_string_lossy().to_lowercase())
            .is_some_and(|ext| {
                self.skip_extensions
                    .iter()
                    .any(|skip| skip.trim_start_matches('.').eq_ignore_ascii_case(&ext))
            })
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Main configuration for the pipeline
///
/// Every field has a serde default, so an empty JSON object is a valid config.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Working directory and database location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Disk budget governing when new archives may be fetched
    #[serde(default)]
    pub disk_budget: DiskBudgetConfig,

    /// Worker pool sizes and pacing
    #[serde(default)]
    pub workers: WorkerConfig,

    /// Policy switches (skips, metadata, artifact retention)
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Automatic backoff for transient collaborator failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Config {
    /// Load a configuration from a JSON file
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| Error::Config {
            message: format!("failed to read {}: {}", path.display(), e),
            key: None,
        })?;
        let config: Config = serde_json::from_str(&raw).map_err(|e| Error::Config {
            message: format!("failed to parse {}: {}", path.display(), e),
            key: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        fn invalid(key: &str, message: &str) -> Error {
            Error::Config {
                message: message.to_string(),
                key: Some(key.to_string()),
            }
        }

        if self.disk_budget.ceiling_bytes == Some(0) {
            return Err(invalid(
                "disk_budget.ceiling_bytes",
                "ceiling must be positive; omit it for an unlimited budget",
            ));
        }
        if !(0.0..1.0).contains(&self.disk_budget.margin_ratio) {
            return Err(invalid(
                "disk_budget.margin_ratio",
                "margin ratio must be within [0, 1)",
            ));
        }
        if !(self.disk_budget.reservation_multiplier >= 1.0) {
            return Err(invalid(
                "disk_budget.reservation_multiplier",
                "reservation multiplier must be at least 1.0",
            ));
        }
        if self.workers.max_concurrent_units == 0 {
            return Err(invalid(
                "workers.max_concurrent_units",
                "at least one unit must be allowed",
            ));
        }
        if self.workers.enrich_workers == 0 {
            return Err(invalid(
                "workers.enrich_workers",
                "at least one enrich worker is required",
            ));
        }
        if self.workers.publish_workers == 0 {
            return Err(invalid(
                "workers.publish_workers",
                "at least one publish worker is required",
            ));
        }
        if self.workers.publish_batch_size == 0 {
            return Err(invalid(
                "workers.publish_batch_size",
                "publish batch size must be positive",
            ));
        }
        if self.workers.call_timeout.is_zero() {
            return Err(invalid(
                "workers.call_timeout",
                "call timeout must be positive",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(invalid(
                "retry.backoff_multiplier",
                "backoff multiplier must be at least 1.0",
            ));
        }
        if self.policy.abandon_after_attempts == Some(0) {
            return Err(invalid(
                "policy.abandon_after_attempts",
                "abandon threshold must be positive",
            ));
        }
        Ok(())
    }
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("./media-relay-work")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("./media-relay.db")
}

fn default_true() -> bool {
    true
}

fn default_margin_ratio() -> f64 {
    0.10
}

fn default_margin_floor() -> u64 {
    16 * 1024 * 1024
}

fn default_reservation_multiplier() -> f64 {
    2.0
}

fn default_max_concurrent_units() -> usize {
    1
}

fn default_enrich_workers() -> usize {
    4
}

fn default_publish_workers() -> usize {
    2
}

fn default_publish_batch_size() -> usize {
    50
}

fn default_call_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_skip_extensions() -> Vec<String> {
    vec![
        "json".into(),
        "html".into(),
        "txt".into(),
        "ds_store".into(),
        "ini".into(),
    ]
}

fn default_sidecar_extension() -> String {
    "json".to_string()
}

fn default_album() -> String {
    "Imported".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

// Duration serialization helper (whole seconds)
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}
