//! Configuration file support
//!
//! Loads daemon configuration from a TOML file. A missing file falls back to
//! defaults; daemon-specific defaults (reconcile timer, restore wait) are
//! applied with [`SyncdConfig::with_daemon_defaults`] for anything the file
//! leaves unset.

use crate::error::{Result, SyncError};
use crate::writer::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Database configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_redis_host")]
    pub redis_host: String,

    #[serde(default = "default_redis_port")]
    pub redis_port: u16,

    #[serde(default = "default_appl_db")]
    pub appl_db: u32,

    #[serde(default = "default_config_db")]
    pub config_db: u32,

    #[serde(default = "default_state_db")]
    pub state_db: u32,
}

/// Warm restart configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WarmRestartConfig {
    /// Reconcile window length; CONFIG_DB `WARM_RESTART|<docker>` wins
    /// over this value at runtime.
    #[serde(default)]
    pub reconcile_timer_secs: Option<u64>,

    /// Upper bound on the wait for the kernel to restore its own state.
    #[serde(default)]
    pub restore_wait_timeout_secs: Option<u64>,

    /// Poll cadence of the restore wait.
    #[serde(default)]
    pub restore_poll_interval_ms: Option<u64>,
}

/// Event loop configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Periodic tick of the select loop.
    #[serde(default = "default_select_timeout")]
    pub select_timeout_ms: u64,

    /// Periods a record may stay unrefreshed before re-validation.
    /// Zero disables aging; unset takes the daemon default.
    #[serde(default)]
    pub aging_periods: Option<u64>,

    /// Upper bound on the wait for PortInitDone before subscribing.
    #[serde(default = "default_port_init_timeout")]
    pub port_init_timeout_secs: u64,
}

/// Store write retry configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

/// Complete daemon configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncdConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub warm_restart: WarmRestartConfig,

    #[serde(default)]
    pub sync: SyncConfig,

    #[serde(default)]
    pub retry: RetryConfig,
}

/// Per-daemon defaults for settings the file may leave unset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaemonDefaults {
    pub reconcile_timer_secs: u64,
    pub restore_wait_timeout_secs: u64,
    pub restore_poll_interval_ms: u64,
    pub aging_periods: u64,
}

impl Default for DaemonDefaults {
    fn default() -> Self {
        Self {
            reconcile_timer_secs: 5,
            restore_wait_timeout_secs: 180,
            restore_poll_interval_ms: 1000,
            aging_periods: 0,
        }
    }
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_appl_db() -> u32 {
    0
}

fn default_config_db() -> u32 {
    4
}

fn default_state_db() -> u32 {
    6
}

fn default_select_timeout() -> u64 {
    1000
}

fn default_port_init_timeout() -> u64 {
    300
}

fn default_max_attempts() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    2000
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            redis_host: default_redis_host(),
            redis_port: default_redis_port(),
            appl_db: default_appl_db(),
            config_db: default_config_db(),
            state_db: default_state_db(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            select_timeout_ms: default_select_timeout(),
            aging_periods: None,
            port_init_timeout_secs: default_port_init_timeout(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

impl SyncdConfig {
    /// Load configuration from file, falling back to defaults if the file
    /// does not exist.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => Self::parse(&content).map_err(|e| {
                SyncError::Config(format!("Failed to parse config file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(SyncError::Io(e)),
        }
    }

    /// Parse configuration from TOML text.
    pub fn parse(content: &str) -> std::result::Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Fill unset settings from the daemon's defaults.
    pub fn with_daemon_defaults(mut self, defaults: DaemonDefaults) -> Self {
        let wr = &mut self.warm_restart;
        wr.reconcile_timer_secs.get_or_insert(defaults.reconcile_timer_secs);
        wr.restore_wait_timeout_secs
            .get_or_insert(defaults.restore_wait_timeout_secs);
        wr.restore_poll_interval_ms
            .get_or_insert(defaults.restore_poll_interval_ms);
        self.sync.aging_periods.get_or_insert(defaults.aging_periods);
        self
    }

    /// Reject settings the daemon cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.sync.select_timeout_ms == 0 {
            return Err(SyncError::Config(
                "sync.select_timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SyncError::Config(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        if self.warm_restart.restore_poll_interval_ms == Some(0) {
            return Err(SyncError::Config(
                "warm_restart.restore_poll_interval_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.sync.select_timeout_ms)
    }

    pub fn reconcile_timer(&self) -> Duration {
        Duration::from_secs(
            self.warm_restart
                .reconcile_timer_secs
                .unwrap_or(DaemonDefaults::default().reconcile_timer_secs),
        )
    }

    pub fn restore_wait_timeout(&self) -> Duration {
        Duration::from_secs(
            self.warm_restart
                .restore_wait_timeout_secs
                .unwrap_or(DaemonDefaults::default().restore_wait_timeout_secs),
        )
    }

    pub fn restore_poll_interval(&self) -> Duration {
        Duration::from_millis(
            self.warm_restart
                .restore_poll_interval_ms
                .unwrap_or(DaemonDefaults::default().restore_poll_interval_ms),
        )
    }

    pub fn aging_periods(&self) -> u64 {
        self.sync
            .aging_periods
            .unwrap_or(DaemonDefaults::default().aging_periods)
    }

    pub fn port_init_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.port_init_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry.max_attempts,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_millis(self.retry.max_backoff_ms),
        }
    }
}
