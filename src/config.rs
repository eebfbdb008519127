use crate::error::{LockError, Result};
use crate::locking::workers::{MaxWorkersResolution, MaxWorkersResolver, MaxWorkersValue};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::Path;

const CONFIG_FILE_NAME: &str = "locking.toml";

/// Environment variable overriding the configured worker pool size.
pub const MAX_WORKERS_ENV: &str = "WORKLEASE_MAX_WORKERS";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockingConfig {
    /// Size of the worker lease pool. Unset means one worker per available CPU.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,

    #[serde(default = "default_enabled")]
    pub parallel_projects: bool,

    #[serde(default = "default_enabled")]
    pub deadlock_detection: bool,
}

impl Default for LockingConfig {
    fn default() -> Self {
        Self {
            max_workers: None,
            parallel_projects: true,
            deadlock_detection: true,
        }
    }
}

fn default_enabled() -> bool {
    true
}

impl LockingConfig {
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if !config_path.exists() {
            log::debug!("Config file not found at {config_path:?}, using defaults");
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(&config_path)?;
        let config: LockingConfig = toml::from_str(&contents)
            .map_err(|e| LockError::ConfigFile(format!("Failed to parse {CONFIG_FILE_NAME}: {e}")))?;
        config.max_workers_value()?;

        log::debug!("Loaded config from {config_path:?}");
        Ok(config)
    }

    pub fn save(&self, config_dir: &Path) -> Result<()> {
        let config_path = config_dir.join(CONFIG_FILE_NAME);

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| LockError::ConfigFile(format!("Failed to serialize config: {e}")))?;

        fs::write(&config_path, contents)?;
        log::debug!("Saved config to {config_path:?}");
        Ok(())
    }

    /// The configured pool size, rejecting a pool that could never grant a lease.
    pub fn max_workers_value(&self) -> Result<MaxWorkersValue> {
        match self.max_workers {
            None => Ok(MaxWorkersValue::Auto),
            Some(workers) => MaxWorkersValue::fixed(workers).ok_or_else(|| {
                LockError::InvalidConfig("max_workers must be at least 1".to_string())
            }),
        }
    }

    /// Resolves the pool size with `WORKLEASE_MAX_WORKERS` taking precedence.
    pub fn resolve_max_workers(&self) -> Result<MaxWorkersResolution> {
        let env_value = env::var(MAX_WORKERS_ENV).ok();
        self.resolve_max_workers_with(env_value.as_deref())
    }

    pub fn resolve_max_workers_with(&self, env_value: Option<&str>) -> Result<MaxWorkersResolution> {
        let resolution =
            MaxWorkersResolver::new(env_value, self.max_workers_value()?, MaxWorkersValue::Auto)
                .resolve()
                .map_err(|e| LockError::InvalidConfig(format!("{MAX_WORKERS_ENV}: {e}")))?;
        log::debug!(
            "Worker pool size {} (source: {})",
            resolution.value,
            resolution.source
        );
        Ok(resolution)
    }
}
