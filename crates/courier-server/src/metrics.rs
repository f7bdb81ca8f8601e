//! Prometheus metrics recorder and `/metrics` endpoint handler.

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing::info;

/// Install the Prometheus metrics recorder (global).
///
/// Returns the `PrometheusHandle` used to render the `/metrics` endpoint.
/// Must be called once at startup before any metrics are recorded.
pub fn install_recorder() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install metrics recorder");
    info!("prometheus metrics recorder installed");
    handle
}

/// Render Prometheus text format from the installed recorder.
pub fn render(handle: &PrometheusHandle) -> String {
    handle.render()
}

/// WebSocket connections opened total (counter).
pub const WS_CONNECTIONS_TOTAL: &str = "courier_ws_connections_total";
/// WebSocket disconnections total (counter).
pub const WS_DISCONNECTIONS_TOTAL: &str = "courier_ws_disconnections_total";
/// Active WebSocket connections (gauge).
pub const WS_CONNECTIONS_ACTIVE: &str = "courier_ws_connections_active";
/// Outbound messages dropped on a full queue (counter).
pub const WS_FRAMES_DROPPED_TOTAL: &str = "courier_ws_frames_dropped_total";
/// Upgrade requests rejected by the authorizer (counter).
pub const WS_UNAUTHORIZED_TOTAL: &str = "courier_ws_unauthorized_total";
/// Client envelopes published to the bus (counter).
pub const INBOUND_PUBLISHES_TOTAL: &str = "courier_inbound_publishes_total";
/// Client frames that were not a valid envelope (counter).
pub const INBOUND_REJECTED_TOTAL: &str = "courier_inbound_rejected_total";
