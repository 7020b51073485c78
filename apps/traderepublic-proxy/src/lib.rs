#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::indexing_slicing
    )
)]

//! Trade Republic Proxy - Streaming Client and WebSocket Relay
//!
//! Maintains a single multiplexed WebSocket connection to the Trade Republic
//! API, serves instrument quotes over HTTP, and relays authenticated
//! WebSocket tunnels to arbitrary targets.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Protocol types and state machines
//!   - `subscription`: Requests and the correlation id registry
//!   - `tunnel`: Tunnel handshake
//!   - `instrument`: ISINs, history ranges, payload views
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Subscription source and quote interfaces
//!   - `services`: One-shot lookups and quotes
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `upstream`: Connection manager, codec, timers, reconnect policy
//!   - `tunnel`: WebSocket relay
//!   - `http`: Routes, health and metrics
//!   - `config`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//! HTTP client ──► QuoteService ──► ConnectionManager ══ one socket ══► Trade Republic
//!                                        ▲
//!                      data frames ──────┘ (routed by correlation id)
//!
//! Tunnel client ──AUTH/CONN──► TunnelGateway ◄══ relay ══► target WebSocket
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Protocol types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::instrument::{HistoryRange, InstrumentQuote, Isin};
pub use domain::subscription::{SubscriptionId, SubscriptionRegistry, SubscriptionRequest};
pub use domain::tunnel::{SharedSecret, TunnelHandshake};

// Application
pub use application::ports::{QuoteError, QuotePort, SubscriptionSourcePort};
pub use application::services::{QuoteService, request_once};

// Infrastructure config
pub use infrastructure::config::{ConfigError, ProxyConfig, ServerSettings, UpstreamSettings};

// Upstream client
pub use infrastructure::upstream::{
    ConnectError, ConnectionManager, ConnectionState, SubscriptionHandle, UpstreamConfig,
};

// Servers
pub use infrastructure::http::{AppState, HttpServer, HttpServerError, router};
pub use infrastructure::tunnel::{TunnelError, TunnelGateway};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
