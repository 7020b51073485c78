//! Tunnel Relay
//!
//! Relays a downstream WebSocket to an arbitrary target WebSocket once the
//! downstream client has authenticated.
//!
//! The handshake decisions live in [`crate::domain::tunnel`]; this module
//! performs the I/O: reading the first two messages, opening the target,
//! and shuttling frames in both directions until either side goes away.
//!
//! Ping and pong frames are answered by each socket locally and are not
//! relayed.

use std::time::Duration;

use axum::extract::ws::{self, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::{self, protocol::frame::coding::CloseCode};
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::tunnel::{
    CLOSE_UPSTREAM_FAILED, HandshakeAction, READY_SIGNAL, SharedSecret, TunnelHandshake,
};
use crate::infrastructure::metrics::{self, Direction, TunnelOutcome};

/// Default time allowed to open the target connection.
pub const DEFAULT_TARGET_TIMEOUT: Duration = Duration::from_secs(10);

/// Maximum close reason length allowed by RFC 6455.
const MAX_CLOSE_REASON: usize = 123;

/// Errors opening the target connection.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    /// WebSocket connect failed.
    #[error("{0}")]
    Connect(#[from] tungstenite::Error),

    /// Target did not complete the WebSocket handshake in time.
    #[error("connection timed out after {0:?}")]
    Timeout(Duration),
}

/// Accepts upgraded downstream sockets and runs tunnel sessions.
#[derive(Debug, Clone)]
pub struct TunnelGateway {
    secret: SharedSecret,
    target_timeout: Duration,
}

impl TunnelGateway {
    /// Create a gateway guarded by `secret`.
    #[must_use]
    pub const fn new(secret: SharedSecret) -> Self {
        Self {
            secret,
            target_timeout: DEFAULT_TARGET_TIMEOUT,
        }
    }

    /// Override the target connect timeout.
    #[must_use]
    pub const fn with_target_timeout(mut self, timeout: Duration) -> Self {
        self.target_timeout = timeout;
        self
    }

    /// Run one session to completion.
    pub async fn run(&self, downstream: WebSocket) {
        let session_id = Uuid::new_v4();
        let span = tracing::info_span!("tunnel", %session_id);
        let outcome = self.run_session(downstream).instrument(span).await;
        metrics::record_tunnel_session(outcome);
    }

    async fn run_session(&self, mut downstream: WebSocket) -> TunnelOutcome {
        let mut handshake = TunnelHandshake::new(self.secret.clone());

        let target_url = loop {
            let text = match downstream.recv().await {
                Some(Ok(ws::Message::Text(text))) => text.as_str().to_string(),
                Some(Ok(ws::Message::Binary(bytes))) => String::from_utf8_lossy(&bytes).into_owned(),
                Some(Ok(ws::Message::Ping(_) | ws::Message::Pong(_))) => continue,
                Some(Ok(ws::Message::Close(_)) | Err(_)) | None => {
                    tracing::debug!(
                        state = ?handshake.state(),
                        authenticated = handshake.is_authenticated(),
                        "Client left during handshake"
                    );
                    handshake.on_closed();
                    return TunnelOutcome::Abandoned;
                }
            };

            match handshake.on_message(&text) {
                HandshakeAction::Continue => {
                    tracing::debug!("Client authenticated");
                }
                HandshakeAction::Connect(url) => break url,
                HandshakeAction::Reject { code, reason } => {
                    tracing::warn!(code, "Tunnel authentication rejected");
                    close_downstream(&mut downstream, code, &reason).await;
                    return TunnelOutcome::AuthRejected;
                }
            }
        };

        tracing::info!(target = %target_url, "Opening tunnel target");
        let target = match self.open_target(&target_url).await {
            Ok(target) => target,
            Err(e) => {
                tracing::warn!(target = %target_url, error = %e, "Tunnel target failed");
                if let HandshakeAction::Reject { code, reason } =
                    handshake.on_target_failed(e.to_string())
                {
                    close_downstream(&mut downstream, code, &reason).await;
                }
                return TunnelOutcome::TargetFailed;
            }
        };

        handshake.on_target_open();
        if downstream
            .send(ws::Message::Text(READY_SIGNAL.into()))
            .await
            .is_err()
        {
            handshake.on_closed();
            return TunnelOutcome::Abandoned;
        }

        relay(downstream, target).await;
        handshake.on_closed();
        tracing::info!("Tunnel closed");
        TunnelOutcome::Completed
    }

    async fn open_target(
        &self,
        url: &str,
    ) -> Result<
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
        TunnelError,
    > {
        let (stream, _response) =
            tokio::time::timeout(self.target_timeout, tokio_tungstenite::connect_async(url))
                .await
                .map_err(|_| TunnelError::Timeout(self.target_timeout))??;
        Ok(stream)
    }
}

async fn relay<T>(downstream: WebSocket, target: T)
where
    T: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + futures::Sink<tungstenite::Message, Error = tungstenite::Error>
        + Unpin,
{
    let (mut down_tx, mut down_rx) = downstream.split();
    let (mut up_tx, mut up_rx) = target.split();

    loop {
        tokio::select! {
            msg = down_rx.next() => match msg {
                Some(Ok(ws::Message::Close(frame))) => {
                    tracing::debug!(?frame, "Client closed tunnel");
                    let _ = up_tx.send(tungstenite::Message::Close(frame.map(to_target_close))).await;
                    break;
                }
                Some(Ok(message)) => {
                    let Some(message) = to_target(message) else { continue };
                    if let Err(e) = up_tx.send(message).await {
                        tracing::debug!(error = %e, "Tunnel target write failed");
                        let _ = down_tx.send(close_message(CLOSE_UPSTREAM_FAILED, &e.to_string())).await;
                        break;
                    }
                    metrics::record_tunnel_message(Direction::Outbound);
                }
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "Client socket error");
                    let _ = up_tx.close().await;
                    break;
                }
                None => {
                    let _ = up_tx.close().await;
                    break;
                }
            },
            msg = up_rx.next() => match msg {
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    tracing::debug!(?frame, "Target closed tunnel");
                    let _ = down_tx.send(ws::Message::Close(frame.map(to_downstream_close))).await;
                    break;
                }
                Some(Ok(message)) => {
                    let Some(message) = to_downstream(message) else { continue };
                    if down_tx.send(message).await.is_err() {
                        let _ = up_tx.close().await;
                        break;
                    }
                    metrics::record_tunnel_message(Direction::Inbound);
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Tunnel target error");
                    let _ = down_tx.send(close_message(CLOSE_UPSTREAM_FAILED, &e.to_string())).await;
                    break;
                }
                None => {
                    tracing::warn!("Tunnel target went away without a close frame");
                    let _ = down_tx
                        .send(close_message(CLOSE_UPSTREAM_FAILED, "target connection lost"))
                        .await;
                    break;
                }
            },
        }
    }
}

async fn close_downstream(downstream: &mut WebSocket, code: u16, reason: &str) {
    if let Err(e) = downstream.send(close_message(code, reason)).await {
        tracing::debug!(error = %e, "Failed to send close frame");
    }
}

fn close_message(code: u16, reason: &str) -> ws::Message {
    ws::Message::Close(Some(ws::CloseFrame {
        code,
        reason: truncate_reason(reason).into(),
    }))
}

/// Cut `reason` to the longest prefix that fits a close frame.
fn truncate_reason(reason: &str) -> &str {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason;
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    &reason[..end]
}

fn to_target(message: ws::Message) -> Option<tungstenite::Message> {
    match message {
        ws::Message::Text(text) => Some(tungstenite::Message::Text(text.as_str().into())),
        ws::Message::Binary(bytes) => Some(tungstenite::Message::Binary(bytes)),
        ws::Message::Close(frame) => Some(tungstenite::Message::Close(frame.map(to_target_close))),
        ws::Message::Ping(_) | ws::Message::Pong(_) => None,
    }
}

fn to_downstream(message: tungstenite::Message) -> Option<ws::Message> {
    match message {
        tungstenite::Message::Text(text) => Some(ws::Message::Text(text.as_str().into())),
        tungstenite::Message::Binary(bytes) => Some(ws::Message::Binary(bytes)),
        tungstenite::Message::Close(frame) => {
            Some(ws::Message::Close(frame.map(to_downstream_close)))
        }
        tungstenite::Message::Ping(_)
        | tungstenite::Message::Pong(_)
        | tungstenite::Message::Frame(_) => None,
    }
}

fn to_target_close(frame: ws::CloseFrame) -> tungstenite::protocol::CloseFrame {
    tungstenite::protocol::CloseFrame {
        code: CloseCode::from(frame.code),
        reason: frame.reason.as_str().into(),
    }
}

fn to_downstream_close(frame: tungstenite::protocol::CloseFrame) -> ws::CloseFrame {
    ws::CloseFrame {
        code: u16::from(frame.code),
        reason: frame.reason.as_str().into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_reason_kept() {
        assert_eq!(truncate_reason("connection refused"), "connection refused");
    }

    #[test]
    fn long_reason_truncated_on_char_boundary() {
        let reason = "é".repeat(100);
        let truncated = truncate_reason(&reason);
        assert!(truncated.len() <= MAX_CLOSE_REASON);
        assert!(reason.starts_with(truncated));
    }

    #[test]
    fn close_codes_survive_conversion() {
        let frame = ws::CloseFrame {
            code: 4400,
            reason: "gone".into(),
        };
        let converted = to_downstream_close(to_target_close(frame));
        assert_eq!(converted.code, 4400);
        assert_eq!(converted.reason.as_str(), "gone");
    }

    #[test]
    fn control_frames_not_relayed() {
        assert!(to_target(ws::Message::Ping(Vec::new().into())).is_none());
        assert!(to_downstream(tungstenite::Message::Pong(Vec::new().into())).is_none());
    }

    #[test]
    fn text_relayed_verbatim() {
        let Some(tungstenite::Message::Text(text)) =
            to_target(ws::Message::Text("hello".into()))
        else {
            panic!("expected text");
        };
        assert_eq!(text.as_str(), "hello");
    }
}
