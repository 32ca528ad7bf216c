//! Heartbeat ping/pong liveness policy.
//!
//! The write pump pings every `ping_interval`; the peer's transport answers
//! with a pong; the pong handler pushes the read deadline to
//! `now + pong_wait`. Nothing else extends the deadline, so a peer that keeps
//! sending application events but never pongs still times out.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

use super::connection::{PongHandler, ReadControl};
use crate::errors::TransportError;

/// Default time allowed between pongs.
pub const DEFAULT_PONG_WAIT: Duration = Duration::from_secs(10);

/// Invalid heartbeat timings.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum HeartbeatError {
    /// The pong window must be non-zero.
    #[error("pong wait must be positive")]
    ZeroPongWait,
    /// A ping must always be sent before the deadline it refreshes expires.
    #[error("ping interval {ping:?} must be positive and below pong wait {pong:?}")]
    PingNotBeforeDeadline {
        /// Requested ping interval.
        ping: Duration,
        /// Requested pong wait.
        pong: Duration,
    },
}

/// Ping cadence and pong window for one client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartbeatPolicy {
    pong_wait: Duration,
    ping_interval: Duration,
}

impl HeartbeatPolicy {
    /// Policy with `ping_interval = pong_wait * 9 / 10`.
    pub fn new(pong_wait: Duration) -> Result<Self, HeartbeatError> {
        Self::with_ping_interval(pong_wait, pong_wait * 9 / 10)
    }

    /// Policy with an explicit ping interval, which must be strictly below
    /// `pong_wait`.
    pub fn with_ping_interval(
        pong_wait: Duration,
        ping_interval: Duration,
    ) -> Result<Self, HeartbeatError> {
        if pong_wait.is_zero() {
            return Err(HeartbeatError::ZeroPongWait);
        }
        if ping_interval.is_zero() || ping_interval >= pong_wait {
            return Err(HeartbeatError::PingNotBeforeDeadline {
                ping: ping_interval,
                pong: pong_wait,
            });
        }
        Ok(Self {
            pong_wait,
            ping_interval,
        })
    }

    /// How long a pong keeps the connection alive.
    pub fn pong_wait(&self) -> Duration {
        self.pong_wait
    }

    /// Time between pings.
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Read deadline for a liveness proof observed at `now`.
    pub fn read_deadline(&self, now: Instant) -> Instant {
        now + self.pong_wait
    }

    /// Extend the read deadline after a pong.
    pub fn on_pong(&self, control: &mut ReadControl) -> Result<(), TransportError> {
        control.set_read_deadline(self.read_deadline(Instant::now()))
    }

    /// Pong handler bound to this policy.
    pub fn pong_handler(self) -> PongHandler {
        Box::new(move |_payload: &[u8], control: &mut ReadControl| self.on_pong(control))
    }

    /// Repeating ping timer. The first tick fires one interval from now.
    pub fn ticker(&self) -> Interval {
        let mut ticker = time::interval_at(Instant::now() + self.ping_interval, self.ping_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

impl Default for HeartbeatPolicy {
    fn default() -> Self {
        Self {
            pong_wait: DEFAULT_PONG_WAIT,
            ping_interval: DEFAULT_PONG_WAIT * 9 / 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::memory_connection;

    #[test]
    fn default_is_ten_and_nine_seconds() {
        let policy = HeartbeatPolicy::default();
        assert_eq!(policy.pong_wait(), Duration::from_secs(10));
        assert_eq!(policy.ping_interval(), Duration::from_secs(9));
    }

    #[test]
    fn new_derives_nine_tenths() {
        let policy = HeartbeatPolicy::new(Duration::from_millis(1000)).unwrap();
        assert_eq!(policy.ping_interval(), Duration::from_millis(900));
    }

    #[test]
    fn ping_must_precede_deadline() {
        let err = HeartbeatPolicy::with_ping_interval(
            Duration::from_secs(5),
            Duration::from_secs(5),
        )
        .unwrap_err();
        assert!(matches!(err, HeartbeatError::PingNotBeforeDeadline { .. }));
    }

    #[test]
    fn zero_values_rejected() {
        assert_eq!(
            HeartbeatPolicy::new(Duration::ZERO).unwrap_err(),
            HeartbeatError::ZeroPongWait
        );
        assert!(HeartbeatPolicy::with_ping_interval(Duration::from_secs(1), Duration::ZERO).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn read_deadline_is_now_plus_pong_wait() {
        let policy = HeartbeatPolicy::default();
        let now = Instant::now();
        assert_eq!(policy.read_deadline(now), now + Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn pong_handler_moves_deadline_forward() {
        let policy = HeartbeatPolicy::default();
        let (conn, _peer) = memory_connection();
        let (mut reader, _writer) = conn.split();
        reader.set_read_deadline(Instant::now()).unwrap();

        time::advance(Duration::from_secs(3)).await;
        let expected = Instant::now() + Duration::from_secs(10);
        let mut handler = policy.pong_handler();
        handler(&[], reader.control_mut()).unwrap();
        assert_eq!(reader.control().read_deadline(), Some(expected));
    }

    #[tokio::test]
    async fn pong_after_close_is_an_error() {
        let policy = HeartbeatPolicy::default();
        let (conn, _peer) = memory_connection();
        let closer = conn.closer();
        let (mut reader, _writer) = conn.split();
        let _ = closer.close();
        let err = policy.on_pong(reader.control_mut()).unwrap_err();
        assert_eq!(err, TransportError::ConnectionClosed);
    }

    #[tokio::test(start_paused = true)]
    async fn ticker_first_fires_after_one_interval() {
        let policy = HeartbeatPolicy::with_ping_interval(
            Duration::from_secs(10),
            Duration::from_secs(9),
        )
        .unwrap();
        let start = Instant::now();
        let mut ticker = policy.ticker();
        let _ = ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(9));
        let _ = ticker.tick().await;
        assert_eq!(start.elapsed(), Duration::from_secs(18));
    }
}
