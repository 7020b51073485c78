//! Prometheus Metrics Module
//!
//! Exposes proxy metrics in Prometheus format.
//!
//! # Metrics Categories
//!
//! - **Frames**: Upstream frames received and dropped
//! - **Connection**: Upstream connection state, handshakes and reconnects
//! - **Subscriptions**: Active subscription count
//! - **Tunnel**: Session outcomes and relayed messages
//! - **HTTP**: Request latency per route
//!
//! # Integration
//!
//! Metrics are rendered at `/metrics` on the HTTP server.

use std::sync::OnceLock;
use std::time::Duration;

use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};

use crate::infrastructure::upstream::ConnectionState;

// =============================================================================
// Global Metrics Handle
// =============================================================================

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Install the Prometheus recorder.
///
/// Idempotent: later calls return the handle installed by the first one.
///
/// # Errors
///
/// Returns an error if another global recorder is already installed.
pub fn init_metrics() -> Result<PrometheusHandle, BuildError> {
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle.clone());
    }

    let handle = PrometheusBuilder::new().install_recorder()?;
    register_metrics();
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle).clone())
}

/// Get the Prometheus handle for rendering metrics.
///
/// Returns `None` if metrics have not been initialized.
#[must_use]
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    describe_counter!(
        "tr_proxy_frames_received_total",
        "Upstream frames received by kind"
    );
    describe_counter!(
        "tr_proxy_frames_dropped_total",
        "Upstream frames dropped by reason"
    );

    describe_gauge!(
        "tr_proxy_upstream_state",
        "Upstream connection state (0 disconnected, 1 connecting, 2 connected)"
    );
    describe_counter!(
        "tr_proxy_handshakes_total",
        "Upstream connect handshakes by outcome"
    );
    describe_counter!(
        "tr_proxy_reconnects_total",
        "Upstream reconnection attempts"
    );

    describe_gauge!(
        "tr_proxy_subscriptions_active",
        "Subscriptions currently registered"
    );

    describe_counter!(
        "tr_proxy_tunnel_sessions_total",
        "Tunnel sessions by outcome"
    );
    describe_counter!(
        "tr_proxy_tunnel_messages_total",
        "Messages relayed through tunnels by direction"
    );

    describe_histogram!(
        "tr_proxy_http_request_seconds",
        "HTTP request latency by route and status"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

/// Reason an upstream frame was dropped.
#[derive(Debug, Clone, Copy)]
pub enum DropReason {
    /// Frame did not match the protocol.
    Unrecognized,
    /// Data frame payload was not valid JSON.
    Malformed,
    /// No subscription registered under the frame's id.
    UnknownId,
}

impl DropReason {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Unrecognized => "unrecognized",
            Self::Malformed => "malformed",
            Self::UnknownId => "unknown_id",
        }
    }
}

/// Outcome of a tunnel session.
#[derive(Debug, Clone, Copy)]
pub enum TunnelOutcome {
    /// Shared secret rejected.
    AuthRejected,
    /// Target connection could not be opened.
    TargetFailed,
    /// Relay ran and ended.
    Completed,
    /// Client left before relaying started.
    Abandoned,
}

impl TunnelOutcome {
    const fn as_str(self) -> &'static str {
        match self {
            Self::AuthRejected => "auth_rejected",
            Self::TargetFailed => "target_failed",
            Self::Completed => "completed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Relay direction.
#[derive(Debug, Clone, Copy)]
pub enum Direction {
    /// Client to target.
    Outbound,
    /// Target to client.
    Inbound,
}

impl Direction {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Outbound => "outbound",
            Self::Inbound => "inbound",
        }
    }
}

/// Record a data frame received from upstream.
pub fn record_frame_received(kind: &'static str) {
    counter!("tr_proxy_frames_received_total", "kind" => kind).increment(1);
}

/// Record an upstream frame that was dropped.
pub fn record_frame_dropped(reason: DropReason) {
    counter!("tr_proxy_frames_dropped_total", "reason" => reason.as_str()).increment(1);
}

/// Update the upstream connection state gauge.
pub fn set_upstream_state(state: ConnectionState) {
    let value = match state {
        ConnectionState::Disconnected => 0.0,
        ConnectionState::Connecting => 1.0,
        ConnectionState::Connected => 2.0,
    };
    gauge!("tr_proxy_upstream_state").set(value);
}

/// Record a handshake outcome.
pub fn record_handshake(success: bool) {
    let outcome = if success { "success" } else { "failure" };
    counter!("tr_proxy_handshakes_total", "outcome" => outcome).increment(1);
}

/// Record an upstream reconnection attempt.
pub fn record_reconnect() {
    counter!("tr_proxy_reconnects_total").increment(1);
}

/// Update the active subscription gauge.
#[allow(clippy::cast_precision_loss)]
pub fn set_active_subscriptions(count: usize) {
    gauge!("tr_proxy_subscriptions_active").set(count as f64);
}

/// Record a finished tunnel session.
pub fn record_tunnel_session(outcome: TunnelOutcome) {
    counter!("tr_proxy_tunnel_sessions_total", "outcome" => outcome.as_str()).increment(1);
}

/// Record a relayed tunnel message.
pub fn record_tunnel_message(direction: Direction) {
    counter!("tr_proxy_tunnel_messages_total", "direction" => direction.as_str()).increment(1);
}

/// Record HTTP request latency.
pub fn record_http_request(route: &'static str, status: u16, duration: Duration) {
    histogram!(
        "tr_proxy_http_request_seconds",
        "route" => route,
        "status" => status.to_string()
    )
    .record(duration.as_secs_f64());
}

// =============================================================================
// Tests
// =============================================================================
