//! Runtime configuration
//!
//! Values are layered: built-in defaults, then an optional TOML file named by
//! `STUDIO_CONFIG`, then individual `STUDIO_*` environment overrides.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const CONFIG_PATH_ENV: &str = "STUDIO_CONFIG";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {value}")]
    InvalidEnv { key: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StudioConfig {
    pub persistence: PersistenceConfig,
    pub execution: ExecutionConfig,
    pub bus: BusConfig,
    pub supervision: SupervisionConfig,
    pub log_filter: String,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            persistence: PersistenceConfig::default(),
            execution: ExecutionConfig::default(),
            bus: BusConfig::default(),
            supervision: SupervisionConfig::default(),
            log_filter: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    /// Quiet period after the last mutation before a write goes out
    pub debounce_ms: u64,
    pub complete_cooldown_ms: u64,
    pub failure_cooldown_ms: u64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 1000,
            complete_cooldown_ms: 1500,
            failure_cooldown_ms: 3000,
        }
    }
}

impl PersistenceConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn complete_cooldown(&self) -> Duration {
        Duration::from_millis(self.complete_cooldown_ms)
    }

    pub fn failure_cooldown(&self) -> Duration {
        Duration::from_millis(self.failure_cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Grace window letting debounced edits settle before submit
    pub grace_ms: u64,
    pub poll_interval_ms: u64,
    pub cooldown_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            grace_ms: 300,
            poll_interval_ms: 1000,
            cooldown_ms: 3000,
        }
    }
}

impl ExecutionConfig {
    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub history_limit: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self { history_limit: 256 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisionConfig {
    pub max_restarts: u32,
    pub restart_period_secs: u64,
}

impl Default for SupervisionConfig {
    fn default() -> Self {
        Self {
            max_restarts: 3,
            restart_period_secs: 60,
        }
    }
}

impl SupervisionConfig {
    pub fn restart_period(&self) -> Duration {
        Duration::from_secs(self.restart_period_secs)
    }
}

impl StudioConfig {
    /// Load from `STUDIO_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var(CONFIG_PATH_ENV) {
            Ok(path) if !path.trim().is_empty() => Self::from_file(Path::new(&path))?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply `STUDIO_*` overrides using the given lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        override_u64(&lookup, "STUDIO_PERSIST_DEBOUNCE_MS", &mut self.persistence.debounce_ms)?;
        override_u64(
            &lookup,
            "STUDIO_PERSIST_COMPLETE_COOLDOWN_MS",
            &mut self.persistence.complete_cooldown_ms,
        )?;
        override_u64(
            &lookup,
            "STUDIO_PERSIST_FAILURE_COOLDOWN_MS",
            &mut self.persistence.failure_cooldown_ms,
        )?;
        override_u64(&lookup, "STUDIO_EXEC_GRACE_MS", &mut self.execution.grace_ms)?;
        override_u64(
            &lookup,
            "STUDIO_EXEC_POLL_INTERVAL_MS",
            &mut self.execution.poll_interval_ms,
        )?;
        override_u64(&lookup, "STUDIO_EXEC_COOLDOWN_MS", &mut self.execution.cooldown_ms)?;

        let mut history = self.bus.history_limit as u64;
        override_u64(&lookup, "STUDIO_BUS_HISTORY_LIMIT", &mut history)?;
        self.bus.history_limit = history as usize;

        let mut max_restarts = u64::from(self.supervision.max_restarts);
        override_u64(&lookup, "STUDIO_MAX_RESTARTS", &mut max_restarts)?;
        self.supervision.max_restarts =
            u32::try_from(max_restarts).map_err(|_| ConfigError::InvalidEnv {
                key: "STUDIO_MAX_RESTARTS".to_string(),
                value: max_restarts.to_string(),
            })?;
        override_u64(
            &lookup,
            "STUDIO_RESTART_PERIOD_SECS",
            &mut self.supervision.restart_period_secs,
        )?;

        if let Some(filter) = lookup("STUDIO_LOG").filter(|v| !v.trim().is_empty()) {
            self.log_filter = filter;
        }
        Ok(())
    }
}

fn override_u64<F>(lookup: &F, key: &str, slot: &mut u64) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidEnv {
            key: key.to_string(),
            value: raw.clone(),
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = StudioConfig::default();
        assert_eq!(config.persistence.debounce(), Duration::from_millis(1000));
        assert_eq!(config.execution.grace_ms, 300);
        assert_eq!(config.bus.history_limit, 256);
        assert_eq!(config.supervision.max_restarts, 3);
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[persistence]\ndebounce_ms = 250\n\n[execution]\npoll_interval_ms = 50").unwrap();

        let config = StudioConfig::from_file(file.path()).unwrap();
        assert_eq!(config.persistence.debounce_ms, 250);
        assert_eq!(config.persistence.complete_cooldown_ms, 1500);
        assert_eq!(config.execution.poll_interval_ms, 50);
        assert_eq!(config.execution.grace_ms, 300);
    }

    #[test]
    fn test_invalid_toml_reports_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[persistence\ndebounce_ms = ").unwrap();

        let err = StudioConfig::from_file(file.path()).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("STUDIO_PERSIST_DEBOUNCE_MS", "20"),
            ("STUDIO_EXEC_POLL_INTERVAL_MS", " 5 "),
            ("STUDIO_MAX_RESTARTS", "7"),
            ("STUDIO_LOG", "studio=debug"),
        ]);
        let mut config = StudioConfig::default();
        config
            .apply_env(|key| env.get(key).map(|v| v.to_string()))
            .unwrap();

        assert_eq!(config.persistence.debounce_ms, 20);
        assert_eq!(config.execution.poll_interval_ms, 5);
        assert_eq!(config.supervision.max_restarts, 7);
        assert_eq!(config.log_filter, "studio=debug");
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let mut config = StudioConfig::default();
        let err = config
            .apply_env(|key| (key == "STUDIO_EXEC_GRACE_MS").then(|| "soon".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidEnv { ref key, .. } if key == "STUDIO_EXEC_GRACE_MS"));
    }
}
