//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Trade Republic WebSocket client.
pub mod upstream;

/// Authenticated WebSocket relay.
pub mod tunnel;

/// HTTP routes, health and metrics endpoints.
pub mod http;

/// Configuration loading.
pub mod config;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Tracing and OpenTelemetry setup.
pub mod telemetry;
