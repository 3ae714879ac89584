//! Runtime Configuration
//!
//! Configuration is layered: built-in defaults, then an optional JSON file,
//! then a handful of `TESTBOX_*` environment variables.  Every section uses
//! `#[serde(default)]` so a file only needs to name the values it changes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub manager: ManagerConfig,
    pub installer: InstallerConfig,
    pub cache: CacheConfig,
    /// Per-engine overrides merged over each engine's schema defaults.
    pub engines: HashMap<String, Map<String, Value>>,
}

/// Settings for [`IsolationManager`](crate::IsolationManager).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Global cap on live environments.
    pub max_concurrent_environments: usize,
    /// Root under which engines create environment directories.
    pub base_dir: PathBuf,
    /// Isolation level used when the caller does not name one.
    pub default_level: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_environments: 16,
            base_dir: std::env::temp_dir().join("testbox"),
            default_level: "basic".to_string(),
        }
    }
}

/// Settings for [`ParallelInstaller`](crate::ParallelInstaller).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstallerConfig {
    pub workers: usize,
    pub max_queue_size: usize,
    pub max_concurrent_installs: usize,
    /// Host CPU ceiling (percent of all cores) above which admission waits.
    pub max_cpu_percent: f64,
    /// Host memory ceiling (percent used) above which admission waits.
    pub max_memory_percent: f64,
    pub queue_poll_interval_ms: u64,
    pub admission_poll_interval_ms: u64,
    pub admission_timeout_ms: u64,
    pub install_timeout_secs: u64,
    pub max_consecutive_worker_errors: u32,
    pub worker_backoff_base_ms: u64,
    pub resolve_depth: usize,
    pub default_max_retries: u32,
    pub python_version: Option<String>,
    /// Finished and cancelled tasks remembered before the oldest are dropped.
    pub max_retained_results: usize,
}

impl Default for InstallerConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            max_queue_size: 1000,
            max_concurrent_installs: 4,
            max_cpu_percent: 90.0,
            max_memory_percent: 90.0,
            queue_poll_interval_ms: 100,
            admission_poll_interval_ms: 50,
            admission_timeout_ms: 60_000,
            install_timeout_secs: 300,
            max_consecutive_worker_errors: 5,
            worker_backoff_base_ms: 100,
            resolve_depth: 10,
            default_max_retries: 0,
            python_version: None,
            max_retained_results: 10_000,
        }
    }
}

impl InstallerConfig {
    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }

    pub fn admission_poll_interval(&self) -> Duration {
        Duration::from_millis(self.admission_poll_interval_ms)
    }

    pub fn admission_timeout(&self) -> Duration {
        Duration::from_millis(self.admission_timeout_ms)
    }

    pub fn install_timeout(&self) -> Duration {
        Duration::from_secs(self.install_timeout_secs)
    }
}

/// Settings for [`PackageCache`](crate::PackageCache).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub max_entries: usize,
    pub max_size_bytes: u64,
    pub ttl_secs: u64,
    /// Fraction of each ceiling that an eviction pass shrinks down to.
    pub cleanup_threshold: f64,
    pub allowed_extensions: Vec<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: std::env::temp_dir().join("testbox").join("cache"),
            max_entries: 1000,
            max_size_bytes: 5 * 1024 * 1024 * 1024, // 5 GiB
            ttl_secs: 7 * 24 * 3600,
            cleanup_threshold: 0.8,
            allowed_extensions: vec![
                ".whl".to_string(),
                ".tar.gz".to_string(),
                ".zip".to_string(),
                ".tar.bz2".to_string(),
            ],
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

impl Config {
    /// Load a JSON config file and apply environment overrides on top.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Loading configuration from {:?}", path);
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::Configuration(format!("cannot read {:?}: {e}", path)))?;
        let mut config: Config = serde_json::from_str(&raw)
            .map_err(|e| Error::Configuration(format!("cannot parse {:?}: {e}", path)))?;
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for processes without a file.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("TESTBOX_BASE_DIR") {
            debug!(dir = %dir, "TESTBOX_BASE_DIR override");
            self.manager.base_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("TESTBOX_CACHE_DIR") {
            debug!(dir = %dir, "TESTBOX_CACHE_DIR override");
            self.cache.cache_dir = PathBuf::from(dir);
        }
        if let Ok(workers) = std::env::var("TESTBOX_WORKERS") {
            self.installer.workers = parse_env("TESTBOX_WORKERS", &workers)?;
        }
        if let Ok(max) = std::env::var("TESTBOX_MAX_ENVIRONMENTS") {
            self.manager.max_concurrent_environments = parse_env("TESTBOX_MAX_ENVIRONMENTS", &max)?;
        }
        Ok(())
    }

    /// Reject values that would make a component unusable.
    pub fn validate(&self) -> Result<()> {
        if self.manager.max_concurrent_environments == 0 {
            return Err(Error::Configuration(
                "manager.max_concurrent_environments must be > 0".into(),
            ));
        }
        if self.installer.workers == 0 {
            return Err(Error::Configuration("installer.workers must be > 0".into()));
        }
        if self.installer.max_queue_size == 0 || self.installer.max_concurrent_installs == 0 {
            return Err(Error::Configuration(
                "installer queue size and concurrent installs must be > 0".into(),
            ));
        }
        if self.installer.max_retained_results == 0 {
            return Err(Error::Configuration(
                "installer.max_retained_results must be > 0".into(),
            ));
        }
        if self.cache.max_entries == 0 || self.cache.max_size_bytes == 0 {
            return Err(Error::Configuration("cache ceilings must be > 0".into()));
        }
        let t = self.cache.cleanup_threshold;
        if !(t > 0.0 && t <= 1.0) {
            return Err(Error::Configuration(format!(
                "cache.cleanup_threshold must be in (0, 1], got {t}"
            )));
        }
        Ok(())
    }

    /// Overrides configured for one engine, empty when none are set.
    pub fn engine_overrides(&self, name: &str) -> Map<String, Value> {
        self.engines.get(name).cloned().unwrap_or_default()
    }
}

fn parse_env(name: &str, value: &str) -> Result<usize> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Configuration(format!("{name} must be an integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.installer.workers, 4);
        assert_eq!(config.cache.cleanup_threshold, 0.8);
        assert_eq!(config.manager.default_level, "basic");
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("testbox.json");
        std::fs::write(
            &path,
            r#"{"installer": {"workers": 2}, "engines": {"container": {"image": "python:3.12"}}}"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.installer.max_queue_size, 1000);
        assert_eq!(
            config.engine_overrides("container").get("image"),
            Some(&Value::from("python:3.12"))
        );
        assert!(config.engine_overrides("basic").is_empty());
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let mut config = Config::default();
        config.cache.cleanup_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn test_unparseable_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.json");
        std::fs::write(&path, "{ not json").unwrap();
        assert!(matches!(Config::from_file(&path), Err(Error::Configuration(_))));
    }
}
