//! Tunnel Handshake State Machine
//!
//! Gates a relayed connection behind a shared-secret handshake.
//!
//! # Protocol
//!
//! 1. Client sends `AUTH <secret>`
//! 2. Client sends `CONN <target-url>`
//! 3. Server opens the target and replies `REDY`
//! 4. Messages are relayed verbatim in both directions
//!
//! # Close Codes
//!
//! - 4401: shared secret rejected
//! - 4400: target connection failed (reason carried as close text)

use std::fmt;

/// Prefix of the authentication message.
pub const AUTH_PREFIX: &str = "AUTH ";

/// Prefix of the target message.
pub const CONN_PREFIX: &str = "CONN ";

/// Message sent downstream once the target connection is open.
pub const READY_SIGNAL: &str = "REDY";

/// Close code sent when authentication fails.
pub const CLOSE_AUTH_REJECTED: u16 = 4401;

/// Close code sent when the target connection fails.
pub const CLOSE_UPSTREAM_FAILED: u16 = 4400;

/// Reason text sent with [`CLOSE_AUTH_REJECTED`].
pub const AUTH_REJECTED_REASON: &str = "unauthorized";

// =============================================================================
// Shared Secret
// =============================================================================

/// Shared secret that downstream clients must present.
///
/// The `Debug` implementation redacts the value for safe logging.
#[derive(Clone, PartialEq, Eq)]
pub struct SharedSecret(String);

impl SharedSecret {
    /// Wrap a secret value.
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    /// Exact, case-sensitive comparison.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        self.0 == candidate
    }
}

impl fmt::Debug for SharedSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SharedSecret([REDACTED])")
    }
}

// =============================================================================
// Handshake State
// =============================================================================

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// Waiting for `AUTH <secret>`.
    #[default]
    AwaitingAuth,
    /// Authenticated, waiting for `CONN <target>`.
    AwaitingTarget,
    /// Target requested, outbound connection in progress.
    Connecting,
    /// Relaying messages between both parties.
    Relaying,
    /// Session over.
    Closed,
}

/// What the I/O layer must do after a handshake step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeAction {
    /// Nothing to do; wait for the next message.
    Continue,
    /// Open an outbound connection to this target.
    Connect(String),
    /// Close the downstream connection and end the session.
    Reject {
        /// WebSocket close code.
        code: u16,
        /// Close reason.
        reason: String,
    },
}

/// Drives one session through the handshake.
///
/// The handler is pure: it consumes downstream messages and returns the
/// action the relay must perform, which keeps the gateway's decisions in one
/// place.
#[derive(Debug)]
pub struct TunnelHandshake {
    secret: SharedSecret,
    state: TunnelState,
}

impl TunnelHandshake {
    /// Start a session awaiting authentication.
    #[must_use]
    pub const fn new(secret: SharedSecret) -> Self {
        Self {
            secret,
            state: TunnelState::AwaitingAuth,
        }
    }

    /// Current phase.
    #[must_use]
    pub const fn state(&self) -> TunnelState {
        self.state
    }

    /// Feed a downstream message received before relaying starts.
    pub fn on_message(&mut self, text: &str) -> HandshakeAction {
        match self.state {
            TunnelState::AwaitingAuth => {
                // A bare secret without the prefix is accepted too.
                let presented = text.strip_prefix(AUTH_PREFIX).unwrap_or(text);
                if self.secret.matches(presented) {
                    self.state = TunnelState::AwaitingTarget;
                    HandshakeAction::Continue
                } else {
                    self.state = TunnelState::Closed;
                    HandshakeAction::Reject {
                        code: CLOSE_AUTH_REJECTED,
                        reason: AUTH_REJECTED_REASON.to_string(),
                    }
                }
            }
            TunnelState::AwaitingTarget => {
                let target = text.strip_prefix(CONN_PREFIX).unwrap_or(text);
                self.state = TunnelState::Connecting;
                HandshakeAction::Connect(target.to_string())
            }
            TunnelState::Connecting | TunnelState::Relaying | TunnelState::Closed => {
                HandshakeAction::Continue
            }
        }
    }

    /// The outbound connection opened.
    pub fn on_target_open(&mut self) {
        if self.state == TunnelState::Connecting {
            self.state = TunnelState::Relaying;
        }
    }

    /// The outbound connection failed to open.
    pub fn on_target_failed(&mut self, reason: impl Into<String>) -> HandshakeAction {
        self.state = TunnelState::Closed;
        HandshakeAction::Reject {
            code: CLOSE_UPSTREAM_FAILED,
            reason: reason.into(),
        }
    }

    /// Either party went away.
    pub fn on_closed(&mut self) {
        self.state = TunnelState::Closed;
    }

    /// Whether the secret has been accepted.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(
            self.state,
            TunnelState::AwaitingTarget | TunnelState::Connecting | TunnelState::Relaying
        )
    }
}
