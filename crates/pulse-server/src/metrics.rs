//! Prometheus recorder and metric names.

use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the global Prometheus recorder.
///
/// Fails if a recorder is already installed in this process.
pub fn install_recorder() -> Result<PrometheusHandle, BuildError> {
    let handle = PrometheusBuilder::new().install_recorder()?;
    info!("prometheus metrics recorder installed");
    Ok(handle)
}

/// Render the Prometheus text exposition.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// Connections accepted (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "pulse_ws_connections_total";
/// Connections deregistered (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "pulse_ws_disconnections_total";
/// Currently registered clients (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "pulse_ws_connections_active";
/// Upgrades refused at the connection cap (counter).
pub const WS_CONNECTIONS_REJECTED_TOTAL: &str = "pulse_ws_connections_rejected_total";
/// Inbound events decoded (counter).
pub const EVENTS_RECEIVED_TOTAL: &str = "pulse_events_received_total";
/// Outbound events written (counter).
pub const EVENTS_SENT_TOTAL: &str = "pulse_events_sent_total";
/// Inbound frames that failed to decode (counter).
pub const DECODE_FAILURES_TOTAL: &str = "pulse_decode_failures_total";
/// Events routed to a handler (counter, labels: kind).
pub const EVENTS_ROUTED_TOTAL: &str = "pulse_events_routed_total";
/// Events the router rejected (counter, labels: kind).
pub const ROUTE_FAILURES_TOTAL: &str = "pulse_route_failures_total";
/// Pump exits by cause (counter, labels: pump, reason).
pub const PUMP_EXITS_TOTAL: &str = "pulse_pump_exits_total";
/// Broadcast deliveries that found the recipient closed (counter).
pub const BROADCAST_DROPS_TOTAL: &str = "pulse_broadcast_drops_total";
