use std::fs;
use std::path::Path;
use std::time::Duration;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::constants::{
    ABORT_STORAGE_JOIN_TIMEOUT_MS, DEFAULT_COLLECTOR_JOIN_INTERVAL_MS, DEFAULT_HANG_TIMEOUT_MS,
    DEFAULT_HEARTBEAT_INTERVAL_MS, DEFAULT_MAX_HASH_SIZE_MB, DEFAULT_MAX_MISSED_HEARTBEATS,
    DEFAULT_QUEUE_CAPACITY, DEFAULT_STATUS_TIMEOUT_MS, DEFAULT_WORKER_JOIN_INTERVAL_MS,
};
use crate::error::{EngineError, Result};

/// Intervals governing the foreman and the orchestrator's polling joins
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MonitoringConfig {
    pub collector_join_interval_ms: u64,
    pub worker_join_interval_ms: u64,
    pub status_timeout_ms: u64,
    pub hang_timeout_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub max_missed_heartbeats: u32,
    pub abort_storage_join_timeout_ms: u64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        MonitoringConfig {
            collector_join_interval_ms: DEFAULT_COLLECTOR_JOIN_INTERVAL_MS,
            worker_join_interval_ms: DEFAULT_WORKER_JOIN_INTERVAL_MS,
            status_timeout_ms: DEFAULT_STATUS_TIMEOUT_MS,
            hang_timeout_ms: DEFAULT_HANG_TIMEOUT_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            max_missed_heartbeats: DEFAULT_MAX_MISSED_HEARTBEATS,
            abort_storage_join_timeout_ms: ABORT_STORAGE_JOIN_TIMEOUT_MS,
        }
    }
}

impl MonitoringConfig {
    pub fn collector_join_interval(&self) -> Duration {
        Duration::from_millis(self.collector_join_interval_ms)
    }

    pub fn worker_join_interval(&self) -> Duration {
        Duration::from_millis(self.worker_join_interval_ms)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    pub fn hang_timeout(&self) -> Duration {
        Duration::from_millis(self.hang_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn abort_storage_join_timeout(&self) -> Duration {
        Duration::from_millis(self.abort_storage_join_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        let intervals = [
            ("collector_join_interval_ms", self.collector_join_interval_ms),
            ("worker_join_interval_ms", self.worker_join_interval_ms),
            ("status_timeout_ms", self.status_timeout_ms),
            ("heartbeat_interval_ms", self.heartbeat_interval_ms),
        ];
        for (name, value) in intervals {
            if value == 0 {
                return Err(EngineError::configuration(format!(
                    "Monitoring interval {} must be greater than zero.",
                    name
                )));
            }
        }
        if self.hang_timeout_ms < self.heartbeat_interval_ms {
            return Err(EngineError::configuration(
                "Hang timeout must not be shorter than the heartbeat interval.",
            ));
        }
        Ok(())
    }
}

/// Engine tuning loaded from the optional YAML file given with `--config`
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct TuningConfig {
    pub monitoring: MonitoringConfig,
    /// Capacity of each bounded queue in multi-process mode
    pub queue_capacity: usize,
    /// Kill the own process group when the abort path cannot join storage
    pub hard_exit_on_abort: bool,
    /// Files larger than this are not hashed by the filestat parser
    pub max_hash_size_mb: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            monitoring: MonitoringConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            hard_exit_on_abort: true,
            max_hash_size_mb: DEFAULT_MAX_HASH_SIZE_MB,
        }
    }
}

impl TuningConfig {
    /// Load tuning from a YAML file
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: TuningConfig = serde_yaml::from_str(&content)?;
        config.validate()?;

        debug!("Loaded tuning configuration from {}", path.display());
        Ok(config)
    }

    /// Save tuning to a YAML file
    pub fn save_to_yaml_file(&self, path: &Path) -> Result<()> {
        let yaml = serde_yaml::to_string(self)?;
        fs::write(path, yaml)?;

        info!("Saved tuning configuration to {}", path.display());
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(EngineError::configuration("Queue capacity must be greater than zero."));
        }
        self.monitoring.validate()
    }
}

/// Load the tuning file, writing a default one when the path does not exist yet
pub fn load_or_create_tuning(config_path: Option<&Path>) -> Result<TuningConfig> {
    match config_path {
        Some(path) if path.exists() => TuningConfig::from_yaml_file(path),
        Some(path) => {
            info!("Creating default tuning configuration at {}", path.display());
            let config = TuningConfig::default();
            config.save_to_yaml_file(path)?;
            Ok(config)
        }
        None => Ok(TuningConfig::default()),
    }
}
