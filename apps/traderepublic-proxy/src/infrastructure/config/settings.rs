//! Proxy Configuration Settings
//!
//! Configuration types for the proxy, loaded from environment variables.

use std::time::Duration;

use crate::domain::tunnel::SharedSecret;

/// Default upstream WebSocket endpoint.
pub const DEFAULT_UPSTREAM_URL: &str = "wss://api.traderepublic.com/";

/// Upstream connection settings.
#[derive(Debug, Clone)]
pub struct UpstreamSettings {
    /// WebSocket endpoint.
    pub url: String,
    /// Jurisdiction used for instrument lookups.
    pub jurisdiction: String,
    /// Locale sent with the connect handshake.
    pub locale: String,
    /// Client version sent with the connect handshake.
    pub client_version: String,
    /// Interval between echo frames.
    pub echo_interval: Duration,
    /// Time without subscriptions after which the connection is released.
    pub idle_timeout: Duration,
    /// Time allowed for the upstream to answer the connect frame.
    pub handshake_timeout: Duration,
    /// Initial reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Reconnect without delay on the first attempt after a drop.
    pub reconnect_immediate_first: bool,
    /// HTTP proxy the upstream socket is tunnelled through.
    pub proxy: Option<String>,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            url: DEFAULT_UPSTREAM_URL.to_string(),
            jurisdiction: "DE".to_string(),
            locale: "en".to_string(),
            client_version: "5582".to_string(),
            echo_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
            handshake_timeout: Duration::from_secs(10),
            reconnect_delay_initial: Duration::from_millis(500),
            reconnect_delay_max: Duration::from_secs(30),
            reconnect_delay_multiplier: 2.0,
            reconnect_immediate_first: true,
            proxy: None,
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Upper bound for one HTTP request, including upstream round-trips.
    pub request_timeout: Duration,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 34666,
            request_timeout: Duration::from_secs(30),
        }
    }
}

impl ServerSettings {
    /// `host:port` bind address.
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Complete proxy configuration.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Shared secret tunnel clients must present.
    pub authorization: SharedSecret,
    /// HTTP server settings.
    pub server: ServerSettings,
    /// Upstream connection settings.
    pub upstream: UpstreamSettings,
}

impl ProxyConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required environment variables are missing or a
    /// timer is set to zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        let authorization = std::env::var("PROXY_AUTHORIZATION")
            .map_err(|_| ConfigError::MissingEnvVar("PROXY_AUTHORIZATION".to_string()))?;

        if authorization.is_empty() {
            return Err(ConfigError::EmptyValue("PROXY_AUTHORIZATION".to_string()));
        }

        let server_defaults = ServerSettings::default();
        let server = ServerSettings {
            host: parse_env_string("PROXY_HOST", server_defaults.host),
            port: parse_env_u16("PROXY_PORT", server_defaults.port),
            request_timeout: require_non_zero(
                "PROXY_REQUEST_TIMEOUT_SECS",
                parse_env_duration_secs(
                    "PROXY_REQUEST_TIMEOUT_SECS",
                    server_defaults.request_timeout,
                ),
            )?,
        };

        let defaults = UpstreamSettings::default();
        let upstream = UpstreamSettings {
            url: parse_env_string("TR_WS_URL", defaults.url),
            jurisdiction: parse_env_string("TR_JURISDICTION", defaults.jurisdiction),
            locale: parse_env_string("TR_LOCALE", defaults.locale),
            client_version: parse_env_string("TR_CLIENT_VERSION", defaults.client_version),
            echo_interval: require_non_zero(
                "TR_ECHO_INTERVAL_SECS",
                parse_env_duration_secs("TR_ECHO_INTERVAL_SECS", defaults.echo_interval),
            )?,
            idle_timeout: require_non_zero(
                "TR_IDLE_TIMEOUT_SECS",
                parse_env_duration_secs("TR_IDLE_TIMEOUT_SECS", defaults.idle_timeout),
            )?,
            handshake_timeout: require_non_zero(
                "TR_HANDSHAKE_TIMEOUT_SECS",
                parse_env_duration_secs("TR_HANDSHAKE_TIMEOUT_SECS", defaults.handshake_timeout),
            )?,
            reconnect_delay_initial: parse_env_duration_millis(
                "TR_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: parse_env_duration_secs(
                "TR_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: parse_env_f64(
                "TR_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
            ),
            reconnect_immediate_first: parse_env_bool(
                "TR_RECONNECT_IMMEDIATE_FIRST",
                defaults.reconnect_immediate_first,
            ),
            proxy: std::env::var("HTTP_PROXY").ok().filter(|v| !v.is_empty()),
        };

        Ok(Self {
            authorization: SharedSecret::new(authorization),
            server,
            upstream,
        })
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has a value the proxy cannot run with.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with the value.
        reason: &'static str,
    },
}

fn require_non_zero(key: &str, value: Duration) -> Result<Duration, ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(value)
}

fn parse_env_string(key: &str, default: String) -> String {
    std::env::var(key)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or(default)
}

fn parse_env_u16(key: &str, default: u16) -> u16 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_f64(key: &str, default: f64) -> f64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_env_duration_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_env_duration_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::*;

    #[test]
    fn upstream_settings_defaults() {
        let settings = UpstreamSettings::default();
        assert_eq!(settings.url, "wss://api.traderepublic.com/");
        assert_eq!(settings.jurisdiction, "DE");
        assert_eq!(settings.echo_interval, Duration::from_secs(5));
        assert_eq!(settings.idle_timeout, Duration::from_secs(60));
        assert_eq!(settings.handshake_timeout, Duration::from_secs(10));
        assert_eq!(settings.reconnect_delay_initial, Duration::from_millis(500));
        assert!(settings.reconnect_immediate_first);
        assert!((settings.reconnect_delay_multiplier - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn server_settings_defaults() {
        let settings = ServerSettings::default();
        assert_eq!(settings.bind_addr(), "127.0.0.1:34666");
        assert_eq!(settings.request_timeout, Duration::from_secs(30));
    }

    #[test_case("true", Some(true))]
    #[test_case("1", Some(true))]
    #[test_case("ON", Some(true))]
    #[test_case("false", Some(false))]
    #[test_case("0", Some(false))]
    #[test_case("maybe", None)]
    fn bool_parsing(input: &str, expected: Option<bool>) {
        assert_eq!(parse_bool(input), expected);
    }

    #[test_case(0, false ; "zero rejected")]
    #[test_case(1, true ; "one second accepted")]
    #[test_case(60, true ; "default idle accepted")]
    fn timers_must_be_non_zero(secs: u64, ok: bool) {
        let result = require_non_zero("TR_ECHO_INTERVAL_SECS", Duration::from_secs(secs));
        assert_eq!(result.is_ok(), ok);
        if let Err(e) = result {
            assert!(matches!(e, ConfigError::InvalidValue { ref key, .. } if key == "TR_ECHO_INTERVAL_SECS"));
            assert!(e.to_string().contains("greater than zero"));
        }
    }

    #[test]
    fn authorization_redacted_debug() {
        let config = ProxyConfig {
            authorization: SharedSecret::new("hunter2"),
            server: ServerSettings::default(),
            upstream: UpstreamSettings::default(),
        };
        let debug = format!("{config:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("[REDACTED]"));
    }
}
