//! Cache Configuration
//!
//! Tunables for both tiers and the sync worker. Durations are carried in
//! milliseconds so the YAML file and the command line use the same units.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default entry time-to-live (24 hours)
pub const DEFAULT_TTL_MS: u64 = 24 * 60 * 60 * 1000;

/// Default memory tier capacity (entries)
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 500;

/// Default disk tier capacity (entries)
pub const DEFAULT_DISK_MAX_ENTRIES: usize = 5_000;

/// Default sync interval (30 seconds)
pub const DEFAULT_SYNC_INTERVAL_MS: u64 = 30_000;

/// File name of the persisted cache document
pub const CACHE_FILE_NAME: &str = "cache.json";

/// Cache configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CacheConfig {
    /// Master switch; a disabled cache misses every lookup
    pub enabled: bool,
    /// Enable the disk tier
    pub persistent_enabled: bool,
    /// Entry time-to-live measured from `cachedAt`
    pub ttl_ms: u64,
    /// Memory tier capacity in entries
    pub memory_max_entries: usize,
    /// Disk tier capacity in entries (enforced by periodic cleanup)
    pub disk_max_entries: usize,
    /// Interval between background flushes
    pub sync_interval_ms: u64,
    /// Index tier capacity as a multiple of `memory_max_entries`
    pub index_capacity_factor: usize,
    /// Fraction of expired entries at load that triggers a rewrite
    pub expired_cleanup_ratio: f64,
    /// Upper bound on the final flush at shutdown
    pub shutdown_timeout_ms: u64,
    /// Explicit location of the cache document; defaults to the per-user
    /// configuration directory
    pub disk_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            persistent_enabled: true,
            ttl_ms: DEFAULT_TTL_MS,
            memory_max_entries: DEFAULT_MEMORY_MAX_ENTRIES,
            disk_max_entries: DEFAULT_DISK_MAX_ENTRIES,
            sync_interval_ms: DEFAULT_SYNC_INTERVAL_MS,
            index_capacity_factor: 3,
            expired_cleanup_ratio: 0.2,
            shutdown_timeout_ms: 5_000,
            disk_path: None,
        }
    }
}

impl CacheConfig {
    /// Memory-only configuration, mostly useful in tests
    pub fn memory_only() -> Self {
        Self {
            persistent_enabled: false,
            ..Default::default()
        }
    }

    /// Load configuration from a YAML file; missing keys take defaults
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: CacheConfig = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.ttl_ms == 0 {
            return Err(Error::Config("ttlMs must be greater than zero".into()));
        }
        if self.memory_max_entries == 0 {
            return Err(Error::Config(
                "memoryMaxEntries must be greater than zero".into(),
            ));
        }
        if self.disk_max_entries == 0 {
            return Err(Error::Config(
                "diskMaxEntries must be greater than zero".into(),
            ));
        }
        if self.sync_interval_ms == 0 {
            return Err(Error::Config(
                "syncIntervalMs must be greater than zero".into(),
            ));
        }
        if self.index_capacity_factor == 0 {
            return Err(Error::Config(
                "indexCapacityFactor must be greater than zero".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.expired_cleanup_ratio) {
            return Err(Error::Config(format!(
                "expiredCleanupRatio must be within 0.0..=1.0, got {}",
                self.expired_cleanup_ratio
            )));
        }
        Ok(())
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_millis(self.ttl_ms)
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Capacity of each index tier
    pub fn index_capacity(&self) -> usize {
        self.memory_max_entries
            .saturating_mul(self.index_capacity_factor)
    }

    /// Resolve where the cache document lives
    ///
    /// Uses `disk_path` when set, otherwise `<config dir>/schema-cache/cache.json`
    /// (`~/.config/schema-cache/` on Linux).
    pub fn resolve_disk_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.disk_path {
            return Ok(path.clone());
        }
        let dirs = ProjectDirs::from("", "", "schema-cache").ok_or(Error::ConfigDirUnavailable)?;
        Ok(dirs.config_dir().join(CACHE_FILE_NAME))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CacheConfig::default();
        assert!(config.enabled);
        assert!(config.persistent_enabled);
        assert_eq!(config.ttl(), Duration::from_secs(24 * 60 * 60));
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.index_capacity(), 1_500);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_memory_only() {
        let config = CacheConfig::memory_only();
        assert!(config.enabled);
        assert!(!config.persistent_enabled);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = CacheConfig {
            memory_max_entries: 0,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(_)));
    }

    #[test]
    fn test_validate_rejects_bad_ratio() {
        let config = CacheConfig {
            expired_cleanup_ratio: 1.5,
            ..Default::default()
        };
        assert_matches!(config.validate(), Err(Error::Config(msg)) if msg.contains("expiredCleanupRatio"));
    }

    #[test]
    fn test_yaml_partial_override() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "ttlMs: 60000\nmemoryMaxEntries: 10\npersistentEnabled: false").unwrap();

        let config = CacheConfig::from_yaml_file(file.path()).unwrap();
        assert_eq!(config.ttl_ms, 60_000);
        assert_eq!(config.memory_max_entries, 10);
        assert!(!config.persistent_enabled);
        assert_eq!(config.disk_max_entries, DEFAULT_DISK_MAX_ENTRIES);
    }

    #[test]
    fn test_yaml_invalid_values_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "syncIntervalMs: 0").unwrap();

        assert_matches!(
            CacheConfig::from_yaml_file(file.path()),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_explicit_disk_path_wins() {
        let config = CacheConfig {
            disk_path: Some(PathBuf::from("/tmp/custom.json")),
            ..Default::default()
        };
        assert_eq!(
            config.resolve_disk_path().unwrap(),
            PathBuf::from("/tmp/custom.json")
        );
    }
}
