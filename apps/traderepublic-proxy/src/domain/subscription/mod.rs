//! Subscription Registry
//!
//! Domain types for the subscriptions multiplexed over the single upstream
//! connection.
//!
//! # Design
//!
//! Every subscription is keyed by a correlation id. The upstream service tags
//! each data frame with the id of the subscription that requested it, so the
//! registry is the only lookup needed to route a payload back to its consumer.
//!
//! Ids at or below [`ID_BASELINE`] are reserved for control frames (the
//! connect handshake uses [`CONNECT_ID`]). Subscriptions take `baseline + 1`,
//! `baseline + 2`, and so on. The counter only returns to the baseline when no
//! subscription is outstanding.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

// =============================================================================
// Types
// =============================================================================

/// Correlation id linking a subscribe request to its data frames.
pub type SubscriptionId = u64;

/// Highest reserved correlation id. Subscription ids start above it.
pub const ID_BASELINE: SubscriptionId = 24;

/// Correlation id used by the connect handshake frame.
pub const CONNECT_ID: SubscriptionId = 22;

/// Callback invoked with every payload delivered to a subscription.
pub type PayloadCallback = Box<dyn Fn(serde_json::Value) + Send + Sync>;

// =============================================================================
// Subscription Requests
// =============================================================================

/// Filter entry for a `neonSearch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "key", content = "value", rename_all = "lowercase")]
pub enum SearchFilter {
    /// Restrict results to an instrument type (`stock` or `fund`).
    Type(InstrumentKind),
    /// Restrict results to a jurisdiction (e.g. `DE`).
    Jurisdiction(String),
}

/// Instrument type accepted by [`SearchFilter::Type`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstrumentKind {
    /// Shares.
    Stock,
    /// Funds and ETFs.
    Fund,
}

/// Body of a `neonSearch` request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchQuery {
    /// Free-text query.
    pub q: String,
    /// 1-based result page.
    pub page: u32,
    /// Results per page.
    pub page_size: u32,
    /// Result filters.
    pub filter: Vec<SearchFilter>,
}

/// A subscription request, one variant per upstream topic.
///
/// Serialized with a `type` discriminator, which is exactly the payload of a
/// `sub` frame. Exchange-scoped topics ([`Self::Ticker`],
/// [`Self::AggregateHistoryLight`]) serialize their `id` as the composite key
/// `"<id>.<exchange>"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionRequest {
    /// Static instrument details.
    Instrument {
        /// ISIN.
        id: String,
        /// Jurisdiction, e.g. `DE`.
        jurisdiction: String,
    },
    /// The instrument's home exchange.
    HomeInstrumentExchange {
        /// ISIN.
        id: String,
    },
    /// Streaming bid/ask/last prices.
    Ticker {
        /// ISIN.
        id: String,
        /// Exchange id, e.g. `LSX`.
        exchange: String,
    },
    /// Aggregated price history.
    AggregateHistoryLight {
        /// ISIN.
        id: String,
        /// Exchange id.
        exchange: String,
        /// Range token such as `1d` or `5y`.
        range: String,
    },
    /// Instrument search.
    NeonSearch {
        /// Query body.
        data: SearchQuery,
    },
}

impl SubscriptionRequest {
    /// Wire topic name.
    #[must_use]
    pub const fn topic(&self) -> &'static str {
        match self {
            Self::Instrument { .. } => "instrument",
            Self::HomeInstrumentExchange { .. } => "homeInstrumentExchange",
            Self::Ticker { .. } => "ticker",
            Self::AggregateHistoryLight { .. } => "aggregateHistoryLight",
            Self::NeonSearch { .. } => "neonSearch",
        }
    }

    /// Identity sent upstream in the `id` field, if the topic has one.
    ///
    /// Exchange-scoped topics use the composite key `"<id>.<exchange>"` so the
    /// upstream service resolves the right exchange feed.
    #[must_use]
    pub fn key(&self) -> Option<String> {
        match self {
            Self::Instrument { id, .. } | Self::HomeInstrumentExchange { id } => Some(id.clone()),
            Self::Ticker { id, exchange } | Self::AggregateHistoryLight { id, exchange, .. } => {
                Some(composite_key(id, exchange))
            }
            Self::NeonSearch { .. } => None,
        }
    }
}

impl Serialize for SubscriptionRequest {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        use serde::ser::SerializeMap;

        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("type", self.topic())?;
        match self {
            Self::Instrument { jurisdiction, .. } => {
                map.serialize_entry("id", &self.key())?;
                map.serialize_entry("jurisdiction", jurisdiction)?;
            }
            Self::HomeInstrumentExchange { .. } => {
                map.serialize_entry("id", &self.key())?;
            }
            Self::Ticker { exchange, .. } => {
                map.serialize_entry("id", &self.key())?;
                map.serialize_entry("exchange", exchange)?;
            }
            Self::AggregateHistoryLight {
                exchange, range, ..
            } => {
                map.serialize_entry("id", &self.key())?;
                map.serialize_entry("exchange", exchange)?;
                map.serialize_entry("range", range)?;
            }
            Self::NeonSearch { data } => {
                map.serialize_entry("data", data)?;
            }
        }
        map.end()
    }
}

/// Build the `"<id>.<exchange>"` key used by exchange-scoped topics.
#[must_use]
pub fn composite_key(id: &str, exchange: &str) -> String {
    format!("{id}.{exchange}")
}

// =============================================================================
// Registry
// =============================================================================

struct Entry {
    request: SubscriptionRequest,
    callback: PayloadCallback,
}

/// Correlation id → subscription bookkeeping.
///
/// Pure bookkeeping: the registry never touches the network. The connection
/// manager owns one registry and serializes access to it.
pub struct SubscriptionRegistry {
    entries: BTreeMap<SubscriptionId, Entry>,
    counter: SubscriptionId,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionRegistry")
            .field("ids", &self.entries.keys().collect::<Vec<_>>())
            .field("counter", &self.counter)
            .finish()
    }
}

impl SubscriptionRegistry {
    /// Create an empty registry with the counter at [`ID_BASELINE`].
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            counter: ID_BASELINE,
        }
    }

    /// Register a subscription and return its freshly allocated id.
    pub fn add(
        &mut self,
        request: SubscriptionRequest,
        callback: PayloadCallback,
    ) -> SubscriptionId {
        self.counter += 1;
        let id = self.counter;
        self.entries.insert(id, Entry { request, callback });
        id
    }

    /// Remove a subscription. Returns `false` if the id was not registered.
    pub fn remove(&mut self, id: SubscriptionId) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Deliver a payload to the subscription registered under `id`.
    ///
    /// Returns `false` (and drops the payload) when no such subscription
    /// exists, e.g. for late replies after an unsubscribe.
    pub fn dispatch(&self, id: SubscriptionId, payload: serde_json::Value) -> bool {
        self.entries.get(&id).is_some_and(|entry| {
            (entry.callback)(payload);
            true
        })
    }

    /// Number of registered subscriptions.
    #[must_use]
    pub fn active_count(&self) -> usize {
        self.entries.len()
    }

    /// Whether no subscription is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Registered `(id, request)` pairs in the order they were added.
    ///
    /// Ids are allocated monotonically, so id order is insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (SubscriptionId, &SubscriptionRequest)> + '_ {
        self.entries.iter().map(|(id, entry)| (*id, &entry.request))
    }

    /// Id the next [`add`](Self::add) will return.
    #[must_use]
    pub const fn next_id(&self) -> SubscriptionId {
        self.counter + 1
    }

    /// Reset the counter to [`ID_BASELINE`] if nothing is registered.
    ///
    /// Returns whether the reset happened.
    pub fn reset_if_empty(&mut self) -> bool {
        if self.entries.is_empty() {
            self.counter = ID_BASELINE;
            true
        } else {
            false
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    fn noop() -> PayloadCallback {
        Box::new(|_| {})
    }

    fn instrument(isin: &str) -> SubscriptionRequest {
        SubscriptionRequest::Instrument {
            id: isin.to_string(),
            jurisdiction: "DE".to_string(),
        }
    }

    #[test]
    fn ids_start_above_baseline() {
        let mut registry = SubscriptionRegistry::new();
        assert_eq!(registry.add(instrument("A"), noop()), ID_BASELINE + 1);
        assert_eq!(registry.add(instrument("B"), noop()), ID_BASELINE + 2);
        assert!(CONNECT_ID <= ID_BASELINE);
    }

    #[test]
    fn ids_not_reused_while_outstanding() {
        let mut registry = SubscriptionRegistry::new();
        let first = registry.add(instrument("A"), noop());
        let second = registry.add(instrument("B"), noop());
        registry.remove(first);

        let third = registry.add(instrument("C"), noop());
        assert_ne!(third, second);
        assert_ne!(third, first);
        assert!(!registry.reset_if_empty());
    }

    #[test]
    fn remove_is_idempotent() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.add(instrument("A"), noop());

        assert!(registry.remove(id));
        assert!(!registry.remove(id));
        assert!(!registry.remove(9999));
        assert_eq!(registry.active_count(), 0);
    }

    #[test]
    fn dispatch_reaches_callback() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let mut registry = SubscriptionRegistry::new();
        let id = registry.add(
            instrument("A"),
            Box::new(move |payload| sink.lock().push(payload)),
        );

        assert!(registry.dispatch(id, json!({"bid": {"price": 1}})));
        assert_eq!(received.lock().as_slice(), &[json!({"bid": {"price": 1}})]);
    }

    #[test]
    fn dispatch_unknown_id_is_dropped() {
        let registry = SubscriptionRegistry::new();
        assert!(!registry.dispatch(17, json!({})));
    }

    #[test]
    fn entries_in_insertion_order() {
        let mut registry = SubscriptionRegistry::new();
        let a = registry.add(instrument("A"), noop());
        let b = registry.add(instrument("B"), noop());
        let c = registry.add(instrument("C"), noop());
        registry.remove(b);

        let ids: Vec<_> = registry.entries().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![a, c]);

        // Restartable
        assert_eq!(registry.entries().count(), 2);
    }

    #[test]
    fn counter_resets_only_when_empty() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.add(instrument("A"), noop());
        assert!(!registry.reset_if_empty());
        assert_eq!(registry.next_id(), id + 1);

        registry.remove(id);
        assert!(registry.reset_if_empty());
        assert_eq!(registry.next_id(), ID_BASELINE + 1);
    }

    #[test]
    fn ticker_uses_composite_key() {
        let request = SubscriptionRequest::Ticker {
            id: "US0378331005".to_string(),
            exchange: "LSX".to_string(),
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({"type": "ticker", "id": "US0378331005.LSX", "exchange": "LSX"})
        );
    }

    #[test]
    fn history_uses_composite_key() {
        let request = SubscriptionRequest::AggregateHistoryLight {
            id: "US0378331005".to_string(),
            exchange: "LSX".to_string(),
            range: "1d".to_string(),
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(wire["id"], "US0378331005.LSX");
        assert_eq!(wire["range"], "1d");
        assert_eq!(wire["type"], "aggregateHistoryLight");
    }

    #[test]
    fn instrument_wire_shape() {
        let wire = serde_json::to_value(instrument("US0378331005")).unwrap();
        assert_eq!(
            wire,
            json!({"type": "instrument", "id": "US0378331005", "jurisdiction": "DE"})
        );
    }

    #[test]
    fn search_wire_shape() {
        let request = SubscriptionRequest::NeonSearch {
            data: SearchQuery {
                q: "apple".to_string(),
                page: 1,
                page_size: 1,
                filter: vec![
                    SearchFilter::Type(InstrumentKind::Stock),
                    SearchFilter::Jurisdiction("DE".to_string()),
                ],
            },
        };

        let wire = serde_json::to_value(&request).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "neonSearch",
                "data": {
                    "q": "apple",
                    "page": 1,
                    "pageSize": 1,
                    "filter": [
                        {"key": "type", "value": "stock"},
                        {"key": "jurisdiction", "value": "DE"}
                    ]
                }
            })
        );
    }

    #[test]
    fn search_has_no_key() {
        let request = SubscriptionRequest::NeonSearch {
            data: SearchQuery {
                q: "x".to_string(),
                page: 1,
                page_size: 1,
                filter: vec![],
            },
        };
        assert_eq!(request.key(), None);
        assert_eq!(request.topic(), "neonSearch");
    }
}
