//! Runledger configuration
//! Loads and saves the YAML config file

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::checkpoint::{clamp_retention, DEFAULT_RETENTION};
use crate::tools::{SourceRanking, DEFAULT_MAX_PARALLEL, MODE_ACT};

/// Environment variable pointing at an alternative config file
pub const CONFIG_ENV: &str = "RUNLEDGER_CONFIG";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    /// Database path, `~` is expanded
    #[serde(default = "default_db_path")]
    pub database_path: String,

    /// Endpoint used when a command does not name one
    #[serde(default = "default_endpoint")]
    pub default_endpoint: String,

    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

fn default_db_path() -> String {
    "~/.runledger/runledger.db".to_string()
}

fn default_endpoint() -> String {
    "local".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_path: default_db_path(),
            default_endpoint: default_endpoint(),
            checkpoint: CheckpointConfig::default(),
            scheduler: SchedulerConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointConfig {
    /// Checkpoints kept per thread
    #[serde(default = "default_retention")]
    pub retention: usize,
}

fn default_retention() -> usize {
    DEFAULT_RETENTION
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            retention: default_retention(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    #[serde(default = "default_max_parallel")]
    pub max_parallel: usize,

    /// Trust order of tool sources, most trusted first
    #[serde(default)]
    pub source_ranking: SourceRanking,

    /// Execution mode for dispatches that do not name one
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL
}

fn default_mode() -> String {
    MODE_ACT.to_string()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            source_ranking: SourceRanking::default(),
            mode: default_mode(),
        }
    }
}

impl Config {
    /// Load config from the given path, `RUNLEDGER_CONFIG`, or the default location
    pub fn load(path: Option<&str>) -> Result<Self> {
        let config_path = Self::config_path(path)?;

        if !config_path.exists() {
            info!("Config file not found, creating default at {:?}", config_path);
            let config = Config::default();
            config.save_to(&config_path)?;
            return Ok(config);
        }

        let raw = fs::read_to_string(&config_path).context("Failed to read config file")?;
        let config: Config = serde_yaml::from_str(&raw).context("Failed to parse config file")?;

        debug!("Loaded config from {:?}", config_path);
        Ok(config.normalized())
    }

    pub fn save(&self, path: Option<&str>) -> Result<()> {
        self.save_to(&Self::config_path(path)?)
    }

    fn save_to(&self, config_path: &PathBuf) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = serde_yaml::to_string(&self)?;
        fs::write(config_path, content).context("Failed to write config file")?;

        info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// An explicit path wins over the environment override
    fn config_path(path: Option<&str>) -> Result<PathBuf> {
        if let Some(p) = path {
            return Ok(PathBuf::from(p));
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            if !env_path.trim().is_empty() {
                return Ok(PathBuf::from(env_path));
            }
        }

        let home = dirs::home_dir().context("Cannot find home directory")?;
        Ok(home.join(".runledger").join("config.yml"))
    }

    /// Clamp out-of-range values instead of failing
    pub fn normalized(mut self) -> Self {
        let retention = clamp_retention(self.checkpoint.retention);
        if retention != self.checkpoint.retention {
            warn!(
                "checkpoint.retention {} out of range, using {}",
                self.checkpoint.retention, retention
            );
            self.checkpoint.retention = retention;
        }
        if self.scheduler.max_parallel == 0 {
            warn!("scheduler.max_parallel must be at least 1");
            self.scheduler.max_parallel = 1;
        }
        if self.scheduler.mode.trim().is_empty() {
            self.scheduler.mode = default_mode();
        }
        if self.default_endpoint.trim().is_empty() {
            self.default_endpoint = default_endpoint();
        }
        self
    }

    /// Resolve database path (expand ~)
    pub fn resolve_db_path(&self) -> Result<PathBuf> {
        match self.database_path.strip_prefix("~/") {
            Some(rest) => {
                let home = dirs::home_dir().context("Cannot find home directory")?;
                Ok(home.join(rest))
            }
            None => Ok(PathBuf::from(&self.database_path)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolSource;

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.yml");
        let path_str = path.to_str().unwrap();

        let config = Config::load(Some(path_str)).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(Config::load(Some(path_str)).unwrap(), config);
    }

    #[test]
    fn partial_file_fills_defaults_and_clamps() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yml");
        fs::write(
            &path,
            "database_path: /tmp/x.db\ncheckpoint:\n  retention: 5000\nscheduler:\n  max_parallel: 0\n  source_ranking: [skill, builtin]\n",
        )
        .unwrap();

        let config = Config::load(path.to_str()).unwrap();
        assert_eq!(config.database_path, "/tmp/x.db");
        assert_eq!(config.default_endpoint, "local");
        assert_eq!(config.checkpoint.retention, crate::checkpoint::MAX_RETENTION);
        assert_eq!(config.scheduler.max_parallel, 1);
        assert_eq!(config.scheduler.mode, MODE_ACT);
        assert_eq!(
            config.scheduler.source_ranking,
            SourceRanking(vec![ToolSource::Skill, ToolSource::Builtin])
        );
    }

    #[test]
    fn absolute_db_path_is_kept() {
        let config = Config {
            database_path: "/var/lib/runledger.db".into(),
            ..Config::default()
        };
        assert_eq!(config.resolve_db_path().unwrap(), PathBuf::from("/var/lib/runledger.db"));
    }
}
