//! `/health` endpoint.

use std::time::Instant;

use serde::Serialize;

/// Health check response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `"ok"` while serving, `"draining"` once shutdown has started.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Registered `WebSocket` clients.
    pub connections: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, connections: usize, draining: bool) -> HealthResponse {
    HealthResponse {
        status: if draining { "draining" } else { "ok" }.into(),
        uptime_secs: start_time.elapsed().as_secs(),
        connections,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn status_is_ok() {
        let resp = health_check(Instant::now(), 0, false);
        assert_eq!(resp.status, "ok");
        assert!(resp.uptime_secs < 2);
    }

    #[test]
    fn draining_status() {
        assert_eq!(health_check(Instant::now(), 0, true).status, "draining");
    }

    #[test]
    fn uptime_increases() {
        let start = Instant::now().checked_sub(Duration::from_secs(60)).unwrap();
        assert!(health_check(start, 0, false).uptime_secs >= 59);
    }

    #[test]
    fn serializes_camel_case() {
        let json = serde_json::to_value(health_check(Instant::now(), 3, false)).unwrap();
        assert_eq!(json["connections"], 3);
        assert!(json["uptimeSecs"].is_number());
    }
}
