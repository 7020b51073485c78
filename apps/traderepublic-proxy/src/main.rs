//! Trade Republic Proxy Binary
//!
//! Starts the HTTP server, the tunnel gateway and the lazily connected
//! upstream client.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin traderepublic-proxy
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `PROXY_AUTHORIZATION`: Shared secret tunnel clients must present
//!
//! ## Optional
//! - `PROXY_HOST` / `PROXY_PORT`: Bind address (default: 127.0.0.1:34666)
//! - `PROXY_REQUEST_TIMEOUT_SECS`: HTTP request timeout (default: 30)
//! - `TR_WS_URL`: Upstream endpoint (default: <wss://api.traderepublic.com/>)
//! - `TR_JURISDICTION`: Instrument jurisdiction (default: DE)
//! - `TR_LOCALE` / `TR_CLIENT_VERSION`: Handshake metadata (default: en / 5582)
//! - `TR_ECHO_INTERVAL_SECS`: Echo interval (default: 5)
//! - `TR_IDLE_TIMEOUT_SECS`: Idle connection timeout (default: 60)
//! - `TR_HANDSHAKE_TIMEOUT_SECS`: Connect handshake timeout (default: 10)
//! - `TR_RECONNECT_*`: Reconnect backoff tuning
//! - `OTEL_ENABLED`: Export spans over OTLP (default: false)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::signal;
use tokio_util::sync::CancellationToken;
use traderepublic_proxy::infrastructure::telemetry;
use traderepublic_proxy::{
    AppState, ConnectionManager, HttpServer, ProxyConfig, QuoteService, TunnelGateway,
    UpstreamConfig, init_metrics,
};

/// Graceful shutdown timeout.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| "failed to install rustls crypto provider")?;

    load_dotenv();

    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting Trade Republic proxy");

    if let Err(e) = init_metrics() {
        tracing::warn!(error = %e, "Prometheus recorder unavailable");
    }

    let config = ProxyConfig::from_env()?;
    log_config(&config);

    let shutdown_token = CancellationToken::new();

    let upstream = ConnectionManager::new(UpstreamConfig::from_settings(&config.upstream));
    let quotes = QuoteService::new(upstream.clone(), config.upstream.jurisdiction.clone());
    let gateway = TunnelGateway::new(config.authorization.clone());

    let state = AppState::new(
        Arc::new(quotes),
        gateway,
        config.server.request_timeout,
        shutdown_token.clone(),
    );
    let server = HttpServer::new(config.server.bind_addr(), state, shutdown_token.clone());

    let mut server_handle = tokio::spawn(server.run());

    tracing::info!("Proxy ready");

    tokio::select! {
        () = await_shutdown() => {}
        result = &mut server_handle => {
            upstream.shutdown();
            return match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(e.into()),
                Err(e) => Err(e.into()),
            };
        }
    }

    shutdown_token.cancel();
    upstream.shutdown();

    tracing::info!(
        timeout_secs = SHUTDOWN_TIMEOUT.as_secs(),
        "Graceful shutdown started"
    );
    match tokio::time::timeout(SHUTDOWN_TIMEOUT, server_handle).await {
        Ok(Ok(Err(e))) => tracing::error!(error = %e, "HTTP server error"),
        Ok(_) => {}
        Err(_) => tracing::warn!("HTTP server did not stop in time"),
    }

    tracing::info!("Proxy stopped");
    Ok(())
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &ProxyConfig) {
    tracing::info!(
        addr = %config.server.bind_addr(),
        upstream = %config.upstream.url,
        jurisdiction = %config.upstream.jurisdiction,
        proxy = config.upstream.proxy.as_deref().unwrap_or("none"),
        "Configuration loaded"
    );
    tracing::debug!(
        echo_interval_secs = config.upstream.echo_interval.as_secs(),
        idle_timeout_secs = config.upstream.idle_timeout.as_secs(),
        handshake_timeout_secs = config.upstream.handshake_timeout.as_secs(),
        request_timeout_secs = config.server.request_timeout.as_secs(),
        "Timers"
    );
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
