use crate::errors::{PoolError, Result};
use crate::executor::{CombineOp, ManagerConfig};
use crate::group::GroupMode;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Name of the worker binary looked up next to the running executable
pub const WORKER_EXE_NAME: &str = "mesh-worker";

/// Main configuration for pool jobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub pool: PoolConfig,
    pub logging: LoggingConfig,
}

/// Pool and job defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    pub workers: usize,
    pub mode: GroupMode,
    pub max_workers: usize,
    pub op: CombineOp,
    /// Worker executable; empty means `mesh-worker` beside this binary
    #[serde(default)]
    pub worker_exe: String,
    /// Time allowed for all workers to connect back and join
    pub spawn_timeout_secs: u64,
    /// Bound on every exchange; absent waits indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exchange_timeout_secs: Option<u64>,
    pub teardown_grace_secs: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub log_to_file: bool,
    /// Empty means `~/.meshpool/logs`
    #[serde(default)]
    pub log_dir: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            pool: PoolConfig {
                workers: 4,
                mode: GroupMode::Disjoint,
                max_workers: 256,
                op: CombineOp::Add,
                worker_exe: String::new(),
                spawn_timeout_secs: 10,
                exchange_timeout_secs: None,
                teardown_grace_secs: 5,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                log_to_file: false,
                log_dir: String::new(),
            },
        }
    }
}

impl Config {
    /// Get default configuration file path: `~/.meshpool/pool.toml`
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir()
            .ok_or_else(|| PoolError::Config("Cannot determine home directory".into()))?;
        Ok(home.join(".meshpool").join("pool.toml"))
    }

    /// Load `path` if it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Load configuration from file
    pub fn load(path: &Path) -> Result<Self> {
        tracing::info!(path = %path.display(), "Loading configuration");

        let content = std::fs::read_to_string(path).map_err(|e| {
            tracing::error!(path = %path.display(), error = %e, "Failed to read config file");
            e
        })?;

        let config: Config = toml::from_str(&content)?;

        config.validate()?;

        tracing::info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.pool.max_workers == 0 || self.pool.max_workers > 4096 {
            return Err(PoolError::Config(
                "max_workers must be between 1 and 4096".into(),
            ));
        }

        if self.pool.workers == 0 || self.pool.workers > self.pool.max_workers {
            return Err(PoolError::Config(format!(
                "workers must be between 1 and max_workers ({})",
                self.pool.max_workers
            )));
        }

        if self.pool.spawn_timeout_secs == 0 {
            return Err(PoolError::Config(
                "spawn_timeout_secs must be at least 1".into(),
            ));
        }

        if self.pool.exchange_timeout_secs == Some(0) {
            return Err(PoolError::Config(
                "exchange_timeout_secs must be at least 1 when set".into(),
            ));
        }

        match self.logging.level.to_lowercase().as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => {
                return Err(PoolError::Config(
                    "log level must be one of: trace, debug, info, warn, error".into(),
                ))
            }
        }

        Ok(())
    }

    /// Save configuration to file (atomic write)
    pub fn save(&self, path: &Path) -> Result<()> {
        tracing::info!(path = %path.display(), "Saving configuration");

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                tracing::error!(
                    path = %parent.display(),
                    error = %e,
                    "Failed to create config directory"
                );
                e
            })?;
        }

        let toml_string = toml::to_string_pretty(self)?;

        // Write to temp file, then rename
        let temp_path = path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &toml_string).map_err(|e| {
            tracing::error!(
                path = %temp_path.display(),
                error = %e,
                "Failed to write temp config file"
            );
            e
        })?;

        std::fs::rename(&temp_path, path).map_err(|e| {
            tracing::error!(
                from = %temp_path.display(),
                to = %path.display(),
                error = %e,
                "Failed to rename temp config file"
            );
            e
        })?;

        tracing::info!(path = %path.display(), "Configuration saved successfully");
        Ok(())
    }

    /// Manager settings for a job using these defaults
    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            worker_count: self.pool.workers,
            mode: self.pool.mode,
            op: self.pool.op,
            max_workers: self.pool.max_workers,
            exchange_timeout: self.pool.exchange_timeout_secs.map(Duration::from_secs),
            teardown_grace: Duration::from_secs(self.pool.teardown_grace_secs),
        }
    }

    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.pool.spawn_timeout_secs)
    }

    /// Worker executable to launch
    pub fn resolve_worker_exe(&self) -> Result<PathBuf> {
        if !self.pool.worker_exe.is_empty() {
            return Ok(PathBuf::from(&self.pool.worker_exe));
        }
        let current = std::env::current_exe()?;
        let dir = current
            .parent()
            .ok_or_else(|| PoolError::Config("Cannot determine executable directory".into()))?;
        Ok(dir.join(format!("{}{}", WORKER_EXE_NAME, std::env::consts::EXE_SUFFIX)))
    }

    /// Directory for rolling log files
    pub fn log_dir(&self) -> Option<PathBuf> {
        (!self.logging.log_dir.is_empty()).then(|| PathBuf::from(&self.logging.log_dir))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert_eq!(config.pool.workers, 4);
        assert_eq!(config.pool.mode, GroupMode::Disjoint);
        assert_eq!(config.pool.exchange_timeout_secs, None);
        assert_eq!(config.logging.level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_worker_counts() {
        let mut config = Config::default();
        config.pool.workers = 0;
        assert!(config.validate().is_err());

        config.pool.workers = 300;
        assert!(config.validate().is_err());

        config.pool.workers = 4;
        config.pool.max_workers = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_timeouts_and_level() {
        let mut config = Config::default();
        config.pool.exchange_timeout_secs = Some(0);
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.pool.spawn_timeout_secs = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("pool.toml");

        let mut config = Config::default();
        config.pool.workers = 7;
        config.pool.mode = GroupMode::Merged;
        config.pool.op = CombineOp::Max;
        config.pool.exchange_timeout_secs = Some(30);
        config.save(&config_path).unwrap();

        assert!(config_path.exists());
        assert!(!config_path.with_extension("toml.tmp").exists());

        let loaded = Config::load(&config_path).unwrap();
        assert_eq!(loaded.pool.workers, 7);
        assert_eq!(loaded.pool.mode, GroupMode::Merged);
        assert_eq!(loaded.pool.op, CombineOp::Max);
        assert_eq!(loaded.pool.exchange_timeout_secs, Some(30));
    }

    #[test]
    fn test_load_rejects_invalid_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("pool.toml");
        std::fs::write(&config_path, "[pool]\nworkers = \"many\"\n").unwrap();
        let err = Config::load(&config_path).unwrap_err();
        assert!(matches!(err, PoolError::Config(_) | PoolError::Serialization(_)));
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::load_or_default(&temp_dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.pool.workers, 4);
    }

    #[test]
    fn test_manager_config_mapping() {
        let mut config = Config::default();
        config.pool.exchange_timeout_secs = Some(3);
        let manager = config.manager_config();
        assert_eq!(manager.worker_count, 4);
        assert_eq!(manager.exchange_timeout, Some(Duration::from_secs(3)));
        assert_eq!(manager.teardown_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_worker_exe_override() {
        let mut config = Config::default();
        config.pool.worker_exe = "/opt/bin/mesh-worker".into();
        assert_eq!(
            config.resolve_worker_exe().unwrap(),
            PathBuf::from("/opt/bin/mesh-worker")
        );
        config.pool.worker_exe.clear();
        assert!(config
            .resolve_worker_exe()
            .unwrap()
            .ends_with(format!("mesh-worker{}", std::env::consts::EXE_SUFFIX)));
    }
}
