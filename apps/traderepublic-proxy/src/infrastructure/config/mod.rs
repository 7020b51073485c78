//! Configuration Module
//!
//! Environment-driven configuration for the proxy service.

mod settings;

pub use settings::{
    ConfigError, DEFAULT_UPSTREAM_URL, ProxyConfig, ServerSettings, UpstreamSettings,
};
