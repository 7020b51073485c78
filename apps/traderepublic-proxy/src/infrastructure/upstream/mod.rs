//! Trade Republic Upstream Client
//!
//! A single multiplexed WebSocket connection to the Trade Republic API.
//!
//! # Protocol
//!
//! 1. Client sends `connect 22 {client info}`
//! 2. Server replies `connected`
//! 3. Client sends `sub <id> {request}` per subscription
//! 4. Server pushes `<id> A {payload}` data frames
//! 5. Client sends `echo <unix seconds>` every few seconds
//!
//! # Modules
//!
//! - `codec`: Frame encoding and decoding
//! - `client`: Connection manager and subscription handles
//! - `heartbeat`: Echo and idle timers
//! - `proxy`: HTTP CONNECT tunnel for `HTTP_PROXY`
//! - `reconnect`: Backoff between reconnection attempts

pub mod client;
pub mod codec;
pub mod heartbeat;
pub mod proxy;
pub mod reconnect;

pub use client::{
    ClientInfo, ConnectError, ConnectionManager, ConnectionState, SubscriptionHandle,
    UpstreamConfig,
};
pub use codec::{CodecError, Frame, FrameCodec, Verb};
pub use heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatManager, IdleTimer};
pub use proxy::ProxyError;
pub use reconnect::{ReconnectConfig, ReconnectPolicy};
