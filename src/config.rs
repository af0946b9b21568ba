//! Configuration for the DCA control plane

use std::path::PathBuf;
use std::time::Duration;

use crate::registry::RegistrySettings;
use crate::{Error, Result};

/// Default deadline for every blocking protocol operation
const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Records whose lease is older than this are purged at startup
const DEFAULT_STALE_WINDOW_HOURS: i64 = 24;

/// Read-loop idle cutoff; agents heartbeat well inside this
const DEFAULT_READ_IDLE_SECS: u64 = 90;

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Port to listen on
    pub port: u16,

    /// Data directory holding the device database
    pub data_dir: PathBuf,

    /// Deadline for send-queue enqueue, correlated replies, and secondary
    /// dial-backs
    pub request_timeout: Duration,

    /// Read-loop idle cutoff per connection
    pub read_idle_timeout: Duration,

    /// Staleness window for the startup purge
    pub stale_window: chrono::Duration,
}

impl Config {
    /// Load configuration from the environment
    ///
    /// `DCA_DATA_DIR`, `DCA_REQUEST_TIMEOUT_SECS`, `DCA_READ_IDLE_SECS` and
    /// `DCA_STALE_WINDOW_HOURS` override the defaults; the data directory
    /// falls back to the platform data dir.
    ///
    /// # Errors
    ///
    /// Returns error if an override cannot be parsed.
    pub fn load(port: u16) -> Result<Self> {
        let data_dir = match std::env::var("DCA_DATA_DIR") {
            Ok(dir) => PathBuf::from(dir),
            Err(_) => default_data_dir(),
        };

        Ok(Self {
            port,
            data_dir,
            request_timeout: Duration::from_secs(env_u64(
                "DCA_REQUEST_TIMEOUT_SECS",
                DEFAULT_TIMEOUT_SECS,
            )?),
            read_idle_timeout: Duration::from_secs(env_u64(
                "DCA_READ_IDLE_SECS",
                DEFAULT_READ_IDLE_SECS,
            )?),
            stale_window: chrono::Duration::hours(env_i64(
                "DCA_STALE_WINDOW_HOURS",
                DEFAULT_STALE_WINDOW_HOURS,
            )?),
        })
    }

    /// Path of the device database
    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("dca.db")
    }

    /// Registry timeouts derived from this configuration
    #[must_use]
    pub fn registry_settings(&self) -> RegistrySettings {
        RegistrySettings {
            send_timeout: self.request_timeout,
            request_timeout: self.request_timeout,
            secondary_timeout: self.request_timeout,
            read_idle_timeout: self.read_idle_timeout,
        }
    }
}

fn default_data_dir() -> PathBuf {
    directories::ProjectDirs::from("dev", "dca", "dca").map_or_else(
        || PathBuf::from(".dca"),
        |dirs| dirs.data_dir().to_path_buf(),
    )
}

fn env_u64(name: &str, default: u64) -> Result<u64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw}"))),
        Err(_) => Ok(default),
    }
}

fn env_i64(name: &str, default: i64) -> Result<i64> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| Error::Config(format!("{name} must be an integer, got {raw}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_without_env() {
        let config = Config::load(8000).unwrap();
        assert_eq!(config.port, 8000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.stale_window, chrono::Duration::hours(24));
        assert!(config.db_path().ends_with("dca.db"));
    }

    #[test]
    fn registry_settings_mirror_timeouts() {
        let config = Config::load(8000).unwrap();
        let settings = config.registry_settings();
        assert_eq!(settings.request_timeout, config.request_timeout);
        assert_eq!(settings.read_idle_timeout, config.read_idle_timeout);
    }
}
