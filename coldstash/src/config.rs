//! Configuration management for coldstash.
//!
//! Loads configuration from a TOML file with environment variable overrides
//! (`COLDSTASH__RETRY__MAX_DELAY_SECS=60`). One `AppConfig` is built at
//! startup and handed by reference to the pipelines.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::crypto::KdfStrength;
use crate::store::RetrievalTier;
use crate::{Result, StashError};

/// Smallest accepted archival poll interval.
pub const MIN_POLL_INTERVAL_MINUTES: u64 = 5;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub log: LogConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub crypto: CryptoConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub restore: RestoreConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// First backoff delay in milliseconds
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,

    /// Upper bound for a single backoff delay
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,

    /// Give up once this much wall-clock time has been spent retrying
    #[serde(default = "default_max_elapsed_hours")]
    pub max_elapsed_hours: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoConfig {
    /// Key derivation cost tier used for new encryptions. Blobs do not record
    /// it, so restores must run with the tier the backup used.
    #[serde(default)]
    pub strength: KdfStrength,

    /// scrypt parallelization lanes (1..=6); derived from the core count when
    /// unset. Like the tier, it must match between backup and restore; set it
    /// explicitly when the machines differ in core count.
    #[serde(default)]
    pub lanes: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Compression worker override; derived from the core count when unset
    #[serde(default)]
    pub workers: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreConfig {
    /// Retrieval speed for archival objects
    #[serde(default)]
    pub retrieval_tier: RetrievalTier,

    /// Days a retrieved copy stays readable
    #[serde(default = "default_available_days")]
    pub available_days: u32,

    /// Poll interval for pending retrievals; polling is disabled when unset
    #[serde(default)]
    pub poll_interval_minutes: Option<u64>,

    /// Leave `.tar.gz` archives packed after download
    #[serde(default)]
    pub skip_decompression: bool,

    /// Issue retrieval requests without asking the operator
    #[serde(default)]
    pub without_confirmation: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Root directory of the filesystem object store
    #[serde(default = "default_store_root")]
    pub root: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_initial_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_secs() -> u64 {
    5 * 60
}

fn default_max_elapsed_hours() -> u64 {
    12
}

fn default_available_days() -> u32 {
    3
}

fn default_store_root() -> PathBuf {
    PathBuf::from("/var/lib/coldstash/store")
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_secs: default_max_delay_secs(),
            max_elapsed_hours: default_max_elapsed_hours(),
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            strength: KdfStrength::default(),
            lanes: None,
        }
    }
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            retrieval_tier: RetrievalTier::default(),
            available_days: default_available_days(),
            poll_interval_minutes: None,
            skip_decompression: false,
            without_confirmation: false,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: default_store_root(),
        }
    }
}

impl RetryConfig {
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_secs(self.max_delay_secs)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_elapsed_hours * 3600)
    }
}

impl RestoreConfig {
    pub fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval_minutes
            .map(|minutes| Duration::from_secs(minutes * 60))
    }
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&content)
            .map_err(|e| StashError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load the optional file, then apply `COLDSTASH__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf()).format(config::FileFormat::Toml),
            );
        }
        let config: AppConfig = builder
            .add_source(
                config::Environment::with_prefix("COLDSTASH")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize())
            .map_err(|e| StashError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.retry.initial_delay_ms == 0 {
            return Err(StashError::Config(
                "retry.initial_delay_ms must be greater than zero".into(),
            ));
        }
        if self.retry.max_delay() < self.retry.initial_delay() {
            return Err(StashError::Config(
                "retry.max_delay_secs must not be below the initial delay".into(),
            ));
        }
        if let Some(minutes) = self.restore.poll_interval_minutes {
            if minutes < MIN_POLL_INTERVAL_MINUTES {
                return Err(StashError::Config(format!(
                    "restore.poll_interval_minutes must be {} or higher",
                    MIN_POLL_INTERVAL_MINUTES
                )));
            }
        }
        if self.restore.available_days < 1 {
            return Err(StashError::Config(
                "restore.available_days must be 1 or higher".into(),
            ));
        }
        if let Some(lanes) = self.crypto.lanes {
            if !(1..=6).contains(&lanes) {
                return Err(StashError::Config(
                    "crypto.lanes must be between 1 and 6".into(),
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.max_elapsed(), Duration::from_secs(12 * 3600));
        assert_eq!(config.restore.available_days, 3);
        assert!(config.restore.poll_interval().is_none());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[restore]\npoll_interval_minutes = 60\nretrieval_tier = \"standard\"\n\n[crypto]\nstrength = \"high\""
        )
        .unwrap();

        let config = AppConfig::from_file(file.path()).unwrap();
        assert_eq!(config.restore.poll_interval(), Some(Duration::from_secs(3600)));
        assert_eq!(config.restore.retrieval_tier, RetrievalTier::Standard);
        assert_eq!(config.crypto.strength, KdfStrength::High);
        assert_eq!(config.retry.initial_delay_ms, 1_000);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_short_poll_interval_rejected() {
        let mut config = AppConfig::default();
        config.restore.poll_interval_minutes = Some(2);
        assert!(matches!(config.validate(), Err(StashError::Config(_))));
    }

    #[test]
    fn test_lanes_out_of_range_rejected() {
        let mut config = AppConfig::default();
        config.crypto.lanes = Some(8);
        assert!(config.validate().is_err());
    }
}
