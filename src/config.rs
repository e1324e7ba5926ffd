//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Tunables for the labour core.
#[derive(Debug, Clone)]
pub struct LabourConfig {
    /// How long before the shift starts an unresolved shortfall fails the request.
    pub shortfall_window: Duration,
    /// Interval between shortfall sweeps.
    pub sweep_interval: Duration,
    /// Optimistic write attempts before surfacing `ConcurrentModification`.
    pub max_write_retries: u32,
    /// Broadcast channel capacity for labour events.
    pub event_capacity: usize,
    /// Smallest accepted `workers_needed`.
    pub min_workers: u32,
    /// Largest accepted `workers_needed`.
    pub max_workers: u32,
}

impl Default for LabourConfig {
    fn default() -> Self {
        Self {
            shortfall_window: Duration::from_secs(24 * 3600), // 1 day
            sweep_interval: Duration::from_secs(300),         // 5 minutes
            max_write_retries: 8,
            event_capacity: 256,
            min_workers: 1,
            max_workers: 50,
        }
    }
}

impl LabourConfig {
    /// Read overrides from the environment, keeping defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let shortfall_window = std::env::var("FARMHAND_SHORTFALL_WINDOW_HOURS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(|h| Duration::from_secs(h * 3600))
            .unwrap_or(defaults.shortfall_window);

        let sweep_interval = std::env::var("FARMHAND_SWEEP_INTERVAL_SECS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.sweep_interval);

        let max_write_retries = std::env::var("FARMHAND_MAX_WRITE_RETRIES")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.max_write_retries);

        let event_capacity = std::env::var("FARMHAND_EVENT_CAPACITY")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(defaults.event_capacity);

        Self {
            shortfall_window,
            sweep_interval,
            max_write_retries,
            event_capacity,
            ..defaults
        }
    }

    /// Reject values the core cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_write_retries == 0 {
            return Err(ConfigError::InvalidValue {
                key: "max_write_retries".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.event_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                key: "event_capacity".into(),
                message: "must be at least 1".into(),
            });
        }
        if self.min_workers == 0 || self.min_workers > self.max_workers {
            return Err(ConfigError::InvalidValue {
                key: "min_workers".into(),
                message: format!(
                    "must be between 1 and max_workers ({})",
                    self.max_workers
                ),
            });
        }
        Ok(())
    }

    /// The shortfall window as a signed chrono delta.
    pub fn shortfall_window_delta(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.shortfall_window)
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }
}

/// Process-level settings for the `farmhand` binary.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// libSQL database file.
    pub db_path: PathBuf,
    /// HTTP listen port.
    pub port: u16,
    /// Optional JSON roster for the in-memory worker directory.
    pub workers_file: Option<PathBuf>,
    /// Optional JSON list of coordinators that declined requests can move to.
    pub coordinators_file: Option<PathBuf>,
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let db_path = std::env::var("FARMHAND_DB_PATH")
            .unwrap_or_else(|_| "./data/farmhand.db".to_string())
            .into();

        let port: u16 = std::env::var("FARMHAND_PORT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(8080);

        let workers_file = std::env::var("FARMHAND_WORKERS_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        let coordinators_file = std::env::var("FARMHAND_COORDINATORS_FILE")
            .ok()
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Self {
            db_path,
            port,
            workers_file,
            coordinators_file,
        }
    }
}
