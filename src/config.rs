//! Configuration types.

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Path of the libSQL database file holding job instances and logs.
    pub db_path: PathBuf,
    /// How often a running job re-reads its status to notice a kill request.
    pub heartbeat_interval: Duration,
    /// How often a running job publishes a progress snapshot.
    pub refresh_interval: Duration,
    /// How often the polling queue looks for dispatchable jobs.
    pub poll_interval: Duration,
    /// Maximum number of jobs the polling queue claims per tick.
    pub poll_batch_size: usize,
    /// How long `shutdown` waits for in-flight jobs.
    pub shutdown_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/jobworker.db"),
            heartbeat_interval: Duration::from_secs(1),
            refresh_interval: Duration::from_secs(5),
            poll_interval: Duration::from_secs(1),
            poll_batch_size: 32,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl WorkerConfig {
    /// Build a config from `JOBWORKER_*` environment variables, falling back
    /// to the defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let db_path = lookup("JOBWORKER_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let heartbeat_interval = millis(&lookup, "JOBWORKER_HEARTBEAT_MS")?
            .unwrap_or(defaults.heartbeat_interval);
        let refresh_interval =
            millis(&lookup, "JOBWORKER_REFRESH_MS")?.unwrap_or(defaults.refresh_interval);
        let poll_interval =
            millis(&lookup, "JOBWORKER_POLL_MS")?.unwrap_or(defaults.poll_interval);
        let shutdown_grace =
            millis(&lookup, "JOBWORKER_SHUTDOWN_GRACE_MS")?.unwrap_or(defaults.shutdown_grace);

        let poll_batch_size = match lookup("JOBWORKER_POLL_BATCH") {
            Some(raw) => match raw.trim().parse::<usize>() {
                Ok(0) | Err(_) => {
                    return Err(ConfigError::InvalidValue {
                        key: "JOBWORKER_POLL_BATCH".to_string(),
                        message: format!("expected a positive integer, got {raw:?}"),
                    });
                }
                Ok(n) => n,
            },
            None => defaults.poll_batch_size,
        };

        Ok(Self {
            db_path,
            heartbeat_interval,
            refresh_interval,
            poll_interval,
            poll_batch_size,
            shutdown_grace,
        })
    }
}

/// Parse a positive millisecond duration from the environment.
fn millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    match raw.trim().parse::<u64>() {
        Ok(ms) if ms > 0 => Ok(Some(Duration::from_millis(ms))),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected a positive number of milliseconds, got {raw:?}"),
        }),
    }
}
