//! Settings sections.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, SettingsError};

/// Root settings object.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PulseSettings {
    /// Listener settings.
    pub server: ServerSettings,
    /// Per-connection limits and heartbeat timing.
    pub connection: ConnectionSettings,
    /// Log output.
    pub logging: LoggingSettings,
}

/// Listener settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port (`0` picks a free port).
    pub port: u16,
    /// Upgrades are refused once this many clients are connected.
    pub max_connections: usize,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            max_connections: 1024,
        }
    }
}

/// Per-connection limits and heartbeat timing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionSettings {
    /// How long to wait for a pong before the read deadline expires.
    pub pong_wait_ms: u64,
    /// Ping cadence. Derived as 9/10 of `pong_wait_ms` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping_interval_ms: Option<u64>,
    /// Maximum inbound frame size in bytes.
    pub read_limit: usize,
    /// Upper bound on a single frame write. `None` disables the bound.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub write_wait_ms: Option<u64>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            pong_wait_ms: 10_000,
            ping_interval_ms: None,
            read_limit: 512,
            write_wait_ms: Some(10_000),
        }
    }
}

impl ConnectionSettings {
    /// Resolve `(pong_wait, ping_interval)`, checking that a ping always goes
    /// out before the deadline it refreshes can expire.
    pub fn heartbeat(&self) -> Result<(Duration, Duration)> {
        if self.pong_wait_ms == 0 {
            return Err(SettingsError::InvalidValue(
                "pongWaitMs must be positive".to_string(),
            ));
        }
        let pong_wait = Duration::from_millis(self.pong_wait_ms);
        let ping_interval = match self.ping_interval_ms {
            Some(ms) => Duration::from_millis(ms),
            None => pong_wait * 9 / 10,
        };
        if ping_interval.is_zero() || ping_interval >= pong_wait {
            return Err(SettingsError::InvalidValue(format!(
                "pingIntervalMs ({}) must be positive and below pongWaitMs ({})",
                ping_interval.as_millis(),
                self.pong_wait_ms
            )));
        }
        Ok((pong_wait, ping_interval))
    }

    /// Validated read limit.
    pub fn read_limit(&self) -> Result<usize> {
        if self.read_limit == 0 {
            return Err(SettingsError::InvalidValue(
                "readLimit must be positive".to_string(),
            ));
        }
        Ok(self.read_limit)
    }

    /// Write bound as a duration; `Some(0)` is treated as unset.
    pub fn write_wait(&self) -> Option<Duration> {
        self.write_wait_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
    }
}

/// Log output settings.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoggingSettings {
    /// Default filter directive (`RUST_LOG` wins when set).
    pub level: String,
    /// Emit JSON lines instead of compact text.
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}
