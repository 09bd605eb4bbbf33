//! orchd configuration types and loading

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::lifecycle::LifecycleConfig;
use crate::scheduler::SchedulerConfig;
use crate::worktree::WorktreeConfig;

/// Main orchd configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Worker pool settings
    pub pool: PoolSettings,

    /// Lifecycle engine settings
    pub lifecycle: LifecycleConfig,

    /// Scheduler settings
    pub scheduler: SchedulerConfig,

    /// Sandbox/worktree settings
    pub worktree: WorktreeConfig,

    /// Worker command templates
    pub workers: WorkersConfig,

    /// Storage settings
    pub storage: StorageConfig,

    /// Telemetry settings
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration with fallback chain
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path).context(format!("Failed to load config from {}", path.display()));
        }

        let local_config = PathBuf::from(".orchd.yml");
        if local_config.exists() {
            match Self::load_from_file(&local_config) {
                Ok(config) => return Ok(config),
                Err(e) => {
                    tracing::warn!("Failed to load config from {}: {}", local_config.display(), e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("orchd").join("orchd.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => return Ok(config),
                    Err(e) => {
                        tracing::warn!("Failed to load config from {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        tracing::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        tracing::info!("Loaded config from: {}", path.as_ref().display());
        Ok(config)
    }

    /// Validate configuration before driving a project
    ///
    /// Fails fast with clear messages instead of surfacing mid-run.
    pub fn validate(&self) -> Result<()> {
        if self.pool.capacity == 0 {
            eyre::bail!("pool capacity must be at least 1");
        }
        for (kind, command) in [
            ("coder", &self.workers.coder_command),
            ("validator", &self.workers.validator_command),
            ("reviewer", &self.workers.reviewer_command),
        ] {
            if command.trim().is_empty() {
                eyre::bail!("workers.{}-command is not configured", kind);
            }
        }
        Ok(())
    }

    /// Base data directory (state store, logs, telemetry)
    pub fn data_dir(&self) -> PathBuf {
        self.storage.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("orchd")
        })
    }

    /// Directory for the persistent record store
    pub fn store_dir(&self) -> PathBuf {
        self.data_dir().join("store")
    }

    /// Telemetry JSONL path
    pub fn telemetry_path(&self) -> PathBuf {
        self.telemetry
            .path
            .clone()
            .unwrap_or_else(|| self.data_dir().join("activity.jsonl"))
    }
}

/// Worker pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Number of execution slots (bounds simultaneously active sandboxes)
    pub capacity: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self { capacity: 4 }
    }
}

/// Worker command templates (rendered per invocation)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkersConfig {
    #[serde(rename = "coder-command")]
    pub coder_command: String,

    #[serde(rename = "validator-command")]
    pub validator_command: String,

    #[serde(rename = "reviewer-command")]
    pub reviewer_command: String,
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            coder_command: String::new(),
            validator_command: String::new(),
            reviewer_command: String::new(),
        }
    }
}

/// Storage settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Override the data directory (default: platform data-local dir)
    #[serde(rename = "data-dir")]
    pub data_dir: Option<PathBuf>,
}

/// Telemetry settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub enabled: bool,

    /// Override the activity stream path
    pub path: Option<PathBuf>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: None,
        }
    }
}
