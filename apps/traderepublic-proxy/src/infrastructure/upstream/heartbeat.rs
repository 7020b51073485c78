//! Session Timers
//!
//! Keep-alive echo frames and the idle timeout of an upstream session.
//!
//! Both timers belong to one session generation: they are created when the
//! handshake completes and stop with the generation's cancellation token, so
//! a timer can never fire against a connection that has already been replaced.

use std::pin::Pin;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;

/// Configuration for session timers.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between echo frames.
    pub echo_interval: Duration,
    /// Time without subscriptions after which the connection is released.
    pub idle_timeout: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            echo_interval: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

impl HeartbeatConfig {
    /// Create a new configuration with custom values.
    #[must_use]
    pub const fn new(echo_interval: Duration, idle_timeout: Duration) -> Self {
        Self {
            echo_interval,
            idle_timeout,
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub const fn from_upstream_settings(settings: &crate::UpstreamSettings) -> Self {
        Self {
            echo_interval: settings.echo_interval,
            idle_timeout: settings.idle_timeout,
        }
    }
}

/// Events emitted by the heartbeat manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeartbeatEvent {
    /// Send an echo frame carrying the current unix time in seconds.
    SendEcho {
        /// Unix time in seconds.
        timestamp: i64,
    },
}

/// Periodically requests echo frames until cancelled.
///
/// The first echo is requested one full interval after start; the handshake
/// itself already proved the connection alive.
pub struct HeartbeatManager {
    config: HeartbeatConfig,
    event_tx: mpsc::Sender<HeartbeatEvent>,
    cancel: CancellationToken,
}

impl HeartbeatManager {
    /// Create a new heartbeat manager.
    #[must_use]
    pub const fn new(
        config: HeartbeatConfig,
        event_tx: mpsc::Sender<HeartbeatEvent>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            event_tx,
            cancel,
        }
    }

    /// Run until cancelled or the event receiver is dropped.
    ///
    /// A zero echo interval disables echoes.
    pub async fn run(self) {
        if self.config.echo_interval.is_zero() {
            tracing::warn!("Echo interval is zero, heartbeat disabled");
            return;
        }

        let start = Instant::now() + self.config.echo_interval;
        let mut interval = tokio::time::interval_at(start, self.config.echo_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => {
                    tracing::debug!("Heartbeat manager cancelled");
                    break;
                }
                _ = interval.tick() => {
                    let timestamp = chrono::Utc::now().timestamp();
                    if self.event_tx.send(HeartbeatEvent::SendEcho { timestamp }).await.is_err() {
                        tracing::debug!("Event channel closed, stopping heartbeat");
                        break;
                    }
                }
            }
        }
    }
}

/// Re-armable idle deadline.
///
/// The session loop polls [`IdleTimer::expired`] and calls
/// [`IdleTimer::rearm`] whenever a subscription is added, so the timeout
/// always counts from the most recent activity.
#[derive(Debug)]
pub struct IdleTimer {
    timeout: Duration,
    sleep: Pin<Box<Sleep>>,
}

impl IdleTimer {
    /// Arm a timer that expires after `timeout`.
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            sleep: Box::pin(tokio::time::sleep(timeout)),
        }
    }

    /// Push the deadline `timeout` into the future.
    pub fn rearm(&mut self) {
        self.sleep.as_mut().reset(Instant::now() + self.timeout);
    }

    /// Resolves when the deadline passes.
    ///
    /// After expiry the caller decides whether to act; call
    /// [`rearm`](Self::rearm) to wait for the next period.
    pub async fn expired(&mut self) {
        self.sleep.as_mut().await;
    }
}
