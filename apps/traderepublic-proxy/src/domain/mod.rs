//! Domain Layer - Protocol types and state machines.
//!
//! Pure bookkeeping with no I/O: the subscription registry, the tunnel
//! handshake and the instrument value types.

/// Instrument identifiers and payload views.
pub mod instrument;

/// Subscription requests and the correlation id registry.
pub mod subscription;

/// Tunnel handshake state machine.
pub mod tunnel;
