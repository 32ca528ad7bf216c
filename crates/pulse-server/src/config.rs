//! Server and per-client configuration.

use std::time::Duration;

use pulse_settings::{PulseSettings, SettingsError};

use crate::websocket::heartbeat::HeartbeatPolicy;

/// Default maximum inbound frame size in bytes.
pub const DEFAULT_READ_LIMIT: usize = 512;

/// Default bound on a single frame write.
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);

/// Limits and timings applied to every client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClientConfig {
    /// Ping cadence and pong window.
    pub heartbeat: HeartbeatPolicy,
    /// Maximum inbound frame size in bytes.
    pub read_limit: usize,
    /// Upper bound on a single frame write (`None` = unbounded).
    pub write_wait: Option<Duration>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatPolicy::default(),
            read_limit: DEFAULT_READ_LIMIT,
            write_wait: Some(DEFAULT_WRITE_WAIT),
        }
    }
}

/// Configuration for the Pulse server.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ServerConfig {
    /// Host to bind (default `"127.0.0.1"`).
    pub host: String,
    /// Port to bind (default `0` for auto-assign).
    pub port: u16,
    /// Maximum concurrent `WebSocket` clients.
    pub max_connections: usize,
    /// Per-client settings.
    pub client: ClientConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 0,
            max_connections: 1024,
            client: ClientConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Build from loaded settings, validating heartbeat timing and limits.
    pub fn from_settings(settings: &PulseSettings) -> Result<Self, SettingsError> {
        let conn = &settings.connection;
        let (pong_wait, ping_interval) = conn.heartbeat()?;
        let heartbeat = HeartbeatPolicy::with_ping_interval(pong_wait, ping_interval)
            .map_err(|e| SettingsError::InvalidValue(e.to_string()))?;
        Ok(Self {
            host: settings.server.host.clone(),
            port: settings.server.port,
            max_connections: settings.server.max_connections,
            client: ClientConfig {
                heartbeat,
                read_limit: conn.read_limit()?,
                write_wait: conn.write_wait(),
            },
        })
    }

    /// `host:port` string for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_port_is_zero() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn default_client_limits() {
        let cfg = ClientConfig::default();
        assert_eq!(cfg.read_limit, 512);
        assert_eq!(cfg.write_wait, Some(Duration::from_secs(10)));
        assert_eq!(cfg.heartbeat.pong_wait(), Duration::from_secs(10));
        assert_eq!(cfg.heartbeat.ping_interval(), Duration::from_secs(9));
    }

    #[test]
    fn from_default_settings() {
        let cfg = ServerConfig::from_settings(&PulseSettings::default()).unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.max_connections, 1024);
        assert_eq!(cfg.client, ClientConfig::default());
    }

    #[test]
    fn from_settings_with_custom_timing() {
        let mut settings = PulseSettings::default();
        settings.connection.pong_wait_ms = 2_000;
        settings.connection.ping_interval_ms = Some(500);
        settings.connection.read_limit = 4096;
        settings.connection.write_wait_ms = None;
        let cfg = ServerConfig::from_settings(&settings).unwrap();
        assert_eq!(cfg.client.heartbeat.pong_wait(), Duration::from_secs(2));
        assert_eq!(cfg.client.heartbeat.ping_interval(), Duration::from_millis(500));
        assert_eq!(cfg.client.read_limit, 4096);
        assert_eq!(cfg.client.write_wait, None);
    }

    #[test]
    fn invalid_timing_is_rejected() {
        let mut settings = PulseSettings::default();
        settings.connection.ping_interval_ms = Some(20_000);
        let err = ServerConfig::from_settings(&settings).unwrap_err();
        assert!(matches!(err, SettingsError::InvalidValue(_)));
    }
}
