//! Upstream Connection Manager
//!
//! Owns the single WebSocket connection to the Trade Republic API and
//! multiplexes every subscription over it.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --"connected"--> Connected
//! Connected --unclean close--> Connecting (automatic, resubscribes)
//! Connected --clean close / close() / idle--> Disconnected
//! ```
//!
//! # Concurrency
//!
//! The registry, the connection state and the writer of the current session
//! live behind one mutex. Sub frames for new subscriptions and the resubscribe
//! sweep after a handshake are both emitted under that lock, so every
//! registered subscription is sent exactly once per session.
//!
//! Concurrent [`ConnectionManager::connect`] callers share one in-flight
//! attempt. Each session generation owns a cancellation token that stops its
//! heartbeat and read loop when the session ends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::net::TcpStream;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::codec::{Frame, FrameCodec, Verb};
use super::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, IdleTimer};
use super::proxy::connect_via_proxy;
use super::reconnect::{ReconnectConfig, ReconnectPolicy};
use crate::application::ports::{PayloadStream, SubscriptionSourcePort};
use crate::domain::subscription::{
    CONNECT_ID, PayloadCallback, SubscriptionId, SubscriptionRegistry, SubscriptionRequest,
};
use crate::infrastructure::config::UpstreamSettings;
use crate::infrastructure::metrics::{self, DropReason};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;
type PendingConnect = Shared<BoxFuture<'static, Result<(), ConnectError>>>;

// =============================================================================
// Error Type
// =============================================================================

/// Errors returned by [`ConnectionManager::connect`].
///
/// Cloneable so that every caller waiting on a shared attempt receives it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The WebSocket could not be opened or failed during the handshake.
    #[error("upstream transport error: {0}")]
    Transport(String),

    /// The upstream accepted the socket but never sent `connected`.
    #[error("upstream handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The HTTP proxy could not tunnel to the upstream.
    #[error("upstream proxy error: {0}")]
    Proxy(String),

    /// The upstream closed the socket before the handshake completed.
    #[error("upstream closed the connection during handshake")]
    Closed,

    /// The connect frame could not be encoded.
    #[error("failed to encode connect frame: {0}")]
    Encode(String),

    /// The manager has been shut down.
    #[error("connection manager is shut down")]
    ShuttingDown,
}

// =============================================================================
// Configuration
// =============================================================================

/// Client metadata sent with the connect handshake.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    /// Locale, e.g. `en`.
    pub locale: String,
    /// Platform id.
    pub platform_id: String,
    /// Platform version.
    pub platform_version: String,
    /// Client id.
    pub client_id: String,
    /// Client version.
    pub client_version: String,
}

impl Default for ClientInfo {
    fn default() -> Self {
        Self {
            locale: "en".to_string(),
            platform_id: "undefined".to_string(),
            platform_version: "undefined".to_string(),
            client_id: "app.traderepublic.com".to_string(),
            client_version: "5582".to_string(),
        }
    }
}

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// WebSocket URL.
    pub url: String,
    /// Handshake metadata.
    pub client_info: ClientInfo,
    /// Echo and idle timers.
    pub heartbeat: HeartbeatConfig,
    /// Reconnection behavior.
    pub reconnect: ReconnectConfig,
    /// Time allowed to open the socket and receive `connected`.
    pub handshake_timeout: Duration,
    /// HTTP proxy to tunnel the socket through.
    pub proxy: Option<String>,
}

impl UpstreamConfig {
    /// Create a configuration with default timers for `url`.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client_info: ClientInfo::default(),
            heartbeat: HeartbeatConfig::default(),
            reconnect: ReconnectConfig::default(),
            handshake_timeout: Duration::from_secs(10),
            proxy: None,
        }
    }

    /// Create configuration from `UpstreamSettings`.
    #[must_use]
    pub fn from_settings(settings: &UpstreamSettings) -> Self {
        Self {
            url: settings.url.clone(),
            client_info: ClientInfo {
                locale: settings.locale.clone(),
                client_version: settings.client_version.clone(),
                ..ClientInfo::default()
            },
            heartbeat: HeartbeatConfig::from_upstream_settings(settings),
            reconnect: ReconnectConfig::from_upstream_settings(settings),
            handshake_timeout: settings.handshake_timeout,
            proxy: settings.proxy.clone(),
        }
    }
}

// =============================================================================
// Connection State
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No socket.
    #[default]
    Disconnected,
    /// Socket opening or handshake in progress.
    Connecting,
    /// Handshake completed.
    Connected,
}

impl ConnectionState {
    /// Lowercase name for logs and health output.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        }
    }
}

struct Core {
    registry: SubscriptionRegistry,
    state: ConnectionState,
    outbound: Option<mpsc::UnboundedSender<Message>>,
    session: Option<CancellationToken>,
    generation: u64,
}

impl Core {
    fn set_state(&mut self, state: ConnectionState) {
        self.state = state;
        metrics::set_upstream_state(state);
    }

    /// Send a close frame on the current session and forget it.
    ///
    /// The session's own close callback is ignored afterwards because the
    /// generation moves on.
    fn detach(&mut self) -> bool {
        let Some(outbound) = self.outbound.take() else {
            return false;
        };
        let _ = outbound.send(Message::Close(None));
        if let Some(session) = self.session.take() {
            session.cancel();
        }
        self.generation += 1;
        self.set_state(ConnectionState::Disconnected);
        self.registry.reset_if_empty();
        true
    }
}

struct Inner {
    config: UpstreamConfig,
    codec: FrameCodec,
    core: Mutex<Core>,
    pending: Mutex<Option<PendingConnect>>,
    activity: Notify,
    shutdown: CancellationToken,
    reconnect: Mutex<ReconnectPolicy>,
    reconnect_scheduled: AtomicBool,
}

// =============================================================================
// Connection Manager
// =============================================================================

/// Handle to the shared upstream connection.
///
/// Cheap to clone; all clones drive the same socket and registry.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let core = self.inner.core.lock();
        f.debug_struct("ConnectionManager")
            .field("url", &self.inner.config.url)
            .field("state", &core.state)
            .field("registry", &core.registry)
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Create a manager. No socket is opened until the first subscription or
    /// an explicit [`connect`](Self::connect).
    #[must_use]
    pub fn new(config: UpstreamConfig) -> Self {
        let reconnect = ReconnectPolicy::new(config.reconnect.clone());
        Self {
            inner: Arc::new(Inner {
                config,
                codec: FrameCodec::new(),
                core: Mutex::new(Core {
                    registry: SubscriptionRegistry::new(),
                    state: ConnectionState::Disconnected,
                    outbound: None,
                    session: None,
                    generation: 0,
                }),
                pending: Mutex::new(None),
                activity: Notify::new(),
                shutdown: CancellationToken::new(),
                reconnect: Mutex::new(reconnect),
                reconnect_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Ensure the connection is open and the handshake has completed.
    ///
    /// Returns immediately when connected and joins the in-flight attempt
    /// when one is running.
    ///
    /// # Errors
    ///
    /// Returns the attempt's error to every waiter when the socket cannot be
    /// opened or the handshake fails.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        if self.inner.shutdown.is_cancelled() {
            return Err(ConnectError::ShuttingDown);
        }

        let attempt = {
            let mut pending = self.inner.pending.lock();
            if self.inner.core.lock().state == ConnectionState::Connected {
                return Ok(());
            }
            match pending.as_ref() {
                Some(attempt) => attempt.clone(),
                None => {
                    let attempt = Inner::spawn_attempt(&self.inner);
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };

        attempt.await
    }

    /// Register a subscription and return its payload stream.
    ///
    /// Sends the sub frame right away when connected; otherwise starts a
    /// connect in the background and the frame goes out with the resubscribe
    /// sweep once the handshake completes. Must be called inside a Tokio
    /// runtime.
    #[must_use]
    pub fn subscribe(&self, request: SubscriptionRequest) -> SubscriptionHandle {
        let (payload_tx, payload_rx) = mpsc::unbounded_channel();
        let callback: PayloadCallback = Box::new(move |payload| {
            let _ = payload_tx.send(payload);
        });

        let (id, connected) = {
            let mut core = self.inner.core.lock();
            let topic = request.topic();
            let frame = self.inner.sub_frame(core.registry.next_id(), &request);
            let id = core.registry.add(request, callback);

            let connected = core.state == ConnectionState::Connected;
            if connected
                && let (Some(outbound), Some(frame)) = (core.outbound.as_ref(), frame)
            {
                let _ = outbound.send(frame);
            }
            metrics::set_active_subscriptions(core.registry.active_count());
            tracing::debug!(id, topic, connected, "Subscription registered");
            (id, connected)
        };

        self.inner.activity.notify_one();

        if !connected {
            let manager = self.clone();
            tokio::spawn(async move {
                if let Err(e) = manager.connect().await {
                    tracing::debug!(error = %e, "Background connect failed");
                }
            });
        }

        SubscriptionHandle {
            id,
            payloads: UnboundedReceiverStream::new(payload_rx),
            manager: self.clone(),
            active: true,
        }
    }

    /// Remove a subscription and send its unsub frame when connected.
    ///
    /// Returns `false` if `id` was not registered; no frame is sent then.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut core = self.inner.core.lock();
        if !core.registry.remove(id) {
            return false;
        }

        if core.state == ConnectionState::Connected {
            if let Some(outbound) = core.outbound.as_ref() {
                let frame = self.inner.codec.encode_bare(Verb::Unsub, id);
                let _ = outbound.send(Message::Text(frame.into()));
            }
        } else {
            core.registry.reset_if_empty();
        }

        metrics::set_active_subscriptions(core.registry.active_count());
        tracing::debug!(id, "Subscription removed");
        true
    }

    /// Close the socket if open. A close requested here never reconnects.
    pub fn close(&self) {
        if self.inner.core.lock().detach() {
            tracing::info!("Upstream connection closed");
        }
    }

    /// Stop reconnecting and close the socket.
    pub fn shutdown(&self) {
        self.inner.shutdown.cancel();
        self.close();
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        self.inner.core.lock().state
    }

    /// Whether the handshake has completed on the current socket.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.inner.core.lock().registry.active_count()
    }
}

impl SubscriptionSourcePort for ConnectionManager {
    fn subscribe(&self, request: SubscriptionRequest) -> PayloadStream {
        Self::subscribe(self, request).boxed()
    }

    fn is_connected(&self) -> bool {
        self.is_active()
    }
}

impl Inner {
    fn spawn_attempt(this: &Arc<Self>) -> PendingConnect {
        let inner = Arc::clone(this);
        let task = tokio::spawn(async move {
            let result = inner.establish().await;
            *inner.pending.lock() = None;
            result
        });

        async move {
            task.await
                .unwrap_or_else(|e| Err(ConnectError::Transport(e.to_string())))
        }
        .boxed()
        .shared()
    }

    async fn establish(self: &Arc<Self>) -> Result<(), ConnectError> {
        self.core.lock().set_state(ConnectionState::Connecting);
        tracing::info!(url = %self.config.url, "Connecting to upstream");

        let timeout = self.config.handshake_timeout;
        let result = match tokio::time::timeout(timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectError::HandshakeTimeout(timeout)),
        };

        match result {
            Ok(_) if self.shutdown.is_cancelled() => {
                self.core.lock().set_state(ConnectionState::Disconnected);
                Err(ConnectError::ShuttingDown)
            }
            Ok((write, read)) => {
                metrics::record_handshake(true);
                self.reconnect.lock().reset();
                self.start_session(write, read);
                Ok(())
            }
            Err(e) => {
                metrics::record_handshake(false);
                tracing::warn!(error = %e, "Upstream connect failed");

                let retry = {
                    let mut core = self.core.lock();
                    core.set_state(ConnectionState::Disconnected);
                    core.registry.reset_if_empty();
                    !core.registry.is_empty()
                };
                if retry && !self.shutdown.is_cancelled() {
                    self.schedule_reconnect();
                }
                Err(e)
            }
        }
    }

    async fn handshake(&self) -> Result<(WsSink, WsSource), ConnectError> {
        let url = self.config.url.as_str();
        let (ws_stream, _response) = if let Some(proxy) = &self.config.proxy {
            let stream = connect_via_proxy(proxy, url)
                .await
                .map_err(|e| ConnectError::Proxy(e.to_string()))?;
            tokio_tungstenite::client_async_tls(url, stream).await
        } else {
            tokio_tungstenite::connect_async(url).await
        }
        .map_err(|e| ConnectError::Transport(e.to_string()))?;
        let (mut write, mut read) = ws_stream.split();

        let frame = self
            .codec
            .encode(Verb::Connect, CONNECT_ID, Some(&self.config.client_info))
            .map_err(|e| ConnectError::Encode(e.to_string()))?;
        write
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| ConnectError::Transport(e.to_string()))?;

        loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    if self.on_frame(text.as_str()) {
                        return Ok((write, read));
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Err(ConnectError::Closed),
                Some(Ok(_)) => {}
                Some(Err(e)) => return Err(ConnectError::Transport(e.to_string())),
            }
        }
    }

    /// Decode and route one inbound frame. Returns whether it was the
    /// handshake marker.
    fn on_frame(&self, text: &str) -> bool {
        match self.codec.decode(text) {
            Ok(Frame::Connected) => {
                metrics::record_frame_received("connected");
                true
            }
            Ok(Frame::Data { id, payload }) => {
                metrics::record_frame_received("data");
                if !self.core.lock().registry.dispatch(id, payload) {
                    tracing::trace!(id, "No subscription for data frame");
                    metrics::record_frame_dropped(DropReason::UnknownId);
                }
                false
            }
            Ok(Frame::Unrecognized) => {
                tracing::trace!(frame = text, "Unrecognized upstream frame");
                metrics::record_frame_dropped(DropReason::Unrecognized);
                false
            }
            Err(e) => {
                tracing::debug!(error = %e, "Dropping malformed upstream frame");
                metrics::record_frame_dropped(DropReason::Malformed);
                false
            }
        }
    }

    fn sub_frame(&self, id: SubscriptionId, request: &SubscriptionRequest) -> Option<Message> {
        match self.codec.encode(Verb::Sub, id, Some(request)) {
            Ok(frame) => Some(Message::Text(frame.into())),
            Err(e) => {
                tracing::error!(id, error = %e, "Failed to encode sub frame");
                None
            }
        }
    }

    fn start_session(self: &Arc<Self>, write: WsSink, read: WsSource) {
        let session = CancellationToken::new();
        let (out_tx, out_rx) = mpsc::unbounded_channel();

        let generation = {
            let mut core = self.core.lock();
            let mut resubscribed = 0usize;
            for (id, request) in core.registry.entries() {
                if let Some(frame) = self.sub_frame(id, request) {
                    let _ = out_tx.send(frame);
                    resubscribed += 1;
                }
            }

            core.generation += 1;
            core.outbound = Some(out_tx.clone());
            core.session = Some(session.clone());
            core.set_state(ConnectionState::Connected);
            tracing::info!(resubscribed, "Upstream connected");
            core.generation
        };

        let (heartbeat_tx, heartbeat_rx) = mpsc::channel(8);
        tokio::spawn(write_loop(write, out_rx));
        tokio::spawn(
            HeartbeatManager::new(self.config.heartbeat.clone(), heartbeat_tx, session.clone())
                .run(),
        );
        tokio::spawn(Arc::clone(self).run_session(read, heartbeat_rx, out_tx, session, generation));
    }

    async fn run_session(
        self: Arc<Self>,
        mut read: WsSource,
        mut heartbeat_rx: mpsc::Receiver<HeartbeatEvent>,
        outbound: mpsc::UnboundedSender<Message>,
        session: CancellationToken,
        generation: u64,
    ) {
        let mut idle = IdleTimer::new(self.config.heartbeat.idle_timeout);

        let clean = loop {
            tokio::select! {
                () = session.cancelled() => return,
                Some(HeartbeatEvent::SendEcho { timestamp }) = heartbeat_rx.recv() => {
                    let seconds = u64::try_from(timestamp).unwrap_or_default();
                    let frame = self.codec.encode_bare(Verb::Echo, seconds);
                    let _ = outbound.send(Message::Text(frame.into()));
                }
                () = self.activity.notified() => idle.rearm(),
                () = idle.expired() => {
                    self.on_idle(generation);
                    idle.rearm();
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if self.on_frame(text.as_str()) {
                            tracing::debug!("Ignoring late handshake marker");
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::info!(?frame, "Upstream sent close frame");
                        break true;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!(error = %e, "Upstream socket error");
                        break false;
                    }
                    None => {
                        tracing::warn!("Upstream stream ended without close frame");
                        break false;
                    }
                },
            }
        };

        self.on_close(generation, clean);
    }

    fn on_idle(&self, generation: u64) {
        let mut core = self.core.lock();
        if core.generation == generation && core.registry.is_empty() && core.detach() {
            tracing::info!(
                idle_secs = self.config.heartbeat.idle_timeout.as_secs(),
                "Closing idle upstream connection"
            );
        }
    }

    fn on_close(self: &Arc<Self>, generation: u64, was_clean: bool) {
        let reconnect = {
            let mut core = self.core.lock();
            if core.generation != generation {
                return;
            }
            core.outbound = None;
            if let Some(session) = core.session.take() {
                session.cancel();
            }
            core.set_state(ConnectionState::Disconnected);
            core.registry.reset_if_empty();
            !was_clean && !self.shutdown.is_cancelled()
        };

        if reconnect {
            self.schedule_reconnect();
        } else {
            tracing::info!("Upstream connection closed cleanly");
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnect_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }

        let (delay, attempt) = {
            let mut policy = self.reconnect.lock();
            let delay = policy.next_delay();
            (delay, policy.attempt_count())
        };
        metrics::record_reconnect();
        tracing::info!(
            attempt,
            delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            "Reconnecting to upstream"
        );

        let inner = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                () = inner.shutdown.cancelled() => {
                    inner.reconnect_scheduled.store(false, Ordering::Release);
                    return;
                }
                () = tokio::time::sleep(delay) => {}
            }
            inner.reconnect_scheduled.store(false, Ordering::Release);

            let manager = ConnectionManager { inner };
            if let Err(e) = manager.connect().await {
                tracing::debug!(error = %e, attempt, "Reconnect attempt failed");
            }
        });
    }
}

async fn write_loop(mut write: WsSink, mut outbound: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = outbound.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = write.send(message).await {
            tracing::debug!(error = %e, "Upstream write failed");
            break;
        }
        if closing {
            break;
        }
    }
    let _ = write.close().await;
}

// =============================================================================
// Subscription Handle
// =============================================================================

/// Payload stream of one subscription.
///
/// Dropping the handle unsubscribes.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    payloads: UnboundedReceiverStream<serde_json::Value>,
    manager: ConnectionManager,
    active: bool,
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

impl SubscriptionHandle {
    /// Correlation id of this subscription.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Next payload, or `None` once unsubscribed and drained.
    pub async fn next_payload(&mut self) -> Option<serde_json::Value> {
        self.payloads.next().await
    }

    /// Unsubscribe. Only the first call has an effect.
    pub fn unsubscribe(&mut self) -> bool {
        if !self.active {
            return false;
        }
        self.active = false;
        self.manager.unsubscribe(self.id)
    }
}

impl Stream for SubscriptionHandle {
    type Item = serde_json::Value;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.payloads.poll_next_unpin(cx)
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}
