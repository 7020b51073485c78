//! Subscription Source Port
//!
//! Anything that can turn a [`SubscriptionRequest`] into a stream of
//! payloads. The upstream connection manager is the production adapter.

use futures::stream::BoxStream;

use crate::domain::subscription::SubscriptionRequest;

/// Payloads of one subscription. Dropping the stream unsubscribes.
pub type PayloadStream = BoxStream<'static, serde_json::Value>;

/// Port for opening subscriptions.
pub trait SubscriptionSourcePort: Send + Sync {
    /// Register `request` and return its payload stream.
    fn subscribe(&self, request: SubscriptionRequest) -> PayloadStream;

    /// Whether the underlying connection is open.
    fn is_connected(&self) -> bool;
}
