//! Quote Service
//!
//! Request/response helpers on top of streaming subscriptions.
//!
//! Most upstream topics answer a subscription with a single meaningful
//! payload. [`request_once`] subscribes, waits for the first payload and
//! unsubscribes by dropping the stream; every lookup here is built on it.
//! [`QuoteService::ticker`] is the exception and stays subscribed.

use async_trait::async_trait;
use futures::StreamExt;
use futures::future::try_join_all;
use serde::de::DeserializeOwned;

use crate::application::ports::{PayloadStream, QuoteError, QuotePort, SubscriptionSourcePort};
use crate::domain::instrument::{
    HistoryRange, ISIN_LEN, InstrumentDetails, InstrumentQuote, Isin, SearchResults, TickerSnapshot,
};
use crate::domain::subscription::{SearchQuery, SubscriptionRequest};

/// Subscribe, take the first payload, unsubscribe.
///
/// # Errors
///
/// Returns [`QuoteError::NoPayload`] if the stream ends before delivering.
pub async fn request_once<S>(
    source: &S,
    request: SubscriptionRequest,
) -> Result<serde_json::Value, QuoteError>
where
    S: SubscriptionSourcePort + ?Sized,
{
    let topic = request.topic();
    let mut stream = source.subscribe(request);
    stream.next().await.ok_or(QuoteError::NoPayload { topic })
}

fn decode<T: DeserializeOwned>(
    topic: &'static str,
    payload: serde_json::Value,
) -> Result<T, QuoteError> {
    serde_json::from_value(payload).map_err(|source| QuoteError::Payload { topic, source })
}

/// Instrument lookups over a subscription source.
#[derive(Debug, Clone)]
pub struct QuoteService<S> {
    source: S,
    jurisdiction: String,
}

impl<S: SubscriptionSourcePort> QuoteService<S> {
    /// Create a service using `jurisdiction` for instrument lookups.
    pub fn new(source: S, jurisdiction: impl Into<String>) -> Self {
        Self {
            source,
            jurisdiction: jurisdiction.into(),
        }
    }

    /// Underlying source.
    pub const fn source(&self) -> &S {
        &self.source
    }

    /// Raw `instrument` payload. Uses the configured jurisdiction when none
    /// is given.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription ends without a payload.
    pub async fn instrument(
        &self,
        isin: &Isin,
        jurisdiction: Option<&str>,
    ) -> Result<serde_json::Value, QuoteError> {
        let request = SubscriptionRequest::Instrument {
            id: isin.to_string(),
            jurisdiction: jurisdiction.unwrap_or(&self.jurisdiction).to_string(),
        };
        request_once(&self.source, request).await
    }

    /// Typed view of [`instrument`](Self::instrument).
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails or the payload lacks an ISIN.
    pub async fn instrument_details(&self, isin: &Isin) -> Result<InstrumentDetails, QuoteError> {
        let payload = self.instrument(isin, None).await?;
        decode("instrument", payload)
    }

    /// Raw `homeInstrumentExchange` payload.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription ends without a payload.
    pub async fn exchange(&self, isin: &Isin) -> Result<serde_json::Value, QuoteError> {
        let request = SubscriptionRequest::HomeInstrumentExchange {
            id: isin.to_string(),
        };
        request_once(&self.source, request).await
    }

    /// Raw `aggregateHistoryLight` payload.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription ends without a payload.
    pub async fn aggregate_history(
        &self,
        isin: &Isin,
        exchange: &str,
        range: HistoryRange,
    ) -> Result<serde_json::Value, QuoteError> {
        let request = SubscriptionRequest::AggregateHistoryLight {
            id: isin.to_string(),
            exchange: exchange.to_string(),
            range: range.to_string(),
        };
        request_once(&self.source, request).await
    }

    /// First page of search hits for `query`, one hit per page.
    ///
    /// # Errors
    ///
    /// Returns error if the subscription ends without a payload.
    pub async fn search(&self, query: &str) -> Result<Vec<serde_json::Value>, QuoteError> {
        let payload = self.search_payload(query).await?;

        Ok(match payload {
            serde_json::Value::Object(mut map) => match map.remove("results") {
                Some(serde_json::Value::Array(results)) => results,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        })
    }

    async fn search_payload(&self, query: &str) -> Result<serde_json::Value, QuoteError> {
        let request = SubscriptionRequest::NeonSearch {
            data: SearchQuery {
                q: query.to_string(),
                page: 1,
                page_size: 1,
                filter: Vec::new(),
            },
        };
        request_once(&self.source, request).await
    }

    /// Standing ticker subscription on `exchange`.
    pub fn ticker(&self, isin: &Isin, exchange: &str) -> PayloadStream {
        self.source.subscribe(SubscriptionRequest::Ticker {
            id: isin.to_string(),
            exchange: exchange.to_string(),
        })
    }

    async fn quote(&self, isin: &Isin) -> Result<InstrumentQuote, QuoteError> {
        let details = self.instrument_details(isin).await?;
        let exchange = details
            .exchange_ids
            .first()
            .ok_or_else(|| QuoteError::NoExchange(isin.to_string()))?;

        let mut ticker = self.ticker(isin, exchange);
        let payload = ticker
            .next()
            .await
            .ok_or(QuoteError::NoPayload { topic: "ticker" })?;
        drop(ticker);

        let snapshot: TickerSnapshot = decode("ticker", payload)?;
        Ok(InstrumentQuote {
            short_name: details.short_name,
            bid_price: snapshot.bid.price,
        })
    }
}

#[async_trait]
impl<S: SubscriptionSourcePort> QuotePort for QuoteService<S> {
    async fn instrument_quote(&self, isin: &Isin) -> Result<InstrumentQuote, QuoteError> {
        self.quote(isin).await
    }

    async fn search_quotes(&self, query: &str) -> Result<Vec<InstrumentQuote>, QuoteError> {
        if query.chars().count() == ISIN_LEN {
            let isin: Isin = query.parse()?;
            return Ok(vec![self.quote(&isin).await?]);
        }

        let found: SearchResults = decode("neonSearch", self.search_payload(query).await?)?;
        tracing::debug!(
            query,
            hits = found.results.len(),
            total = found.result_count,
            "Search resolved"
        );

        let isins = found
            .results
            .iter()
            .map(|hit| hit.isin.parse::<Isin>())
            .collect::<Result<Vec<_>, _>>()?;

        try_join_all(isins.iter().map(|isin| self.quote(isin))).await
    }

    fn is_connected(&self) -> bool {
        self.source.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::stream;
    use parking_lot::Mutex;
    use rust_decimal::Decimal;
    use serde_json::json;

    use super::*;

    struct LiveGuard(Arc<AtomicUsize>);

    impl Drop for LiveGuard {
        fn drop(&mut self) {
            self.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    /// Answers each topic with a fixed payload and then stays open.
    #[derive(Default)]
    struct FakeSource {
        payloads: HashMap<&'static str, serde_json::Value>,
        requests: Mutex<Vec<SubscriptionRequest>>,
        live: Arc<AtomicUsize>,
    }

    impl FakeSource {
        fn with(mut self, topic: &'static str, payload: serde_json::Value) -> Self {
            self.payloads.insert(topic, payload);
            self
        }
    }

    impl SubscriptionSourcePort for FakeSource {
        fn subscribe(&self, request: SubscriptionRequest) -> PayloadStream {
            let payload = self.payloads.get(request.topic()).cloned();
            self.requests.lock().push(request);

            self.live.fetch_add(1, Ordering::SeqCst);
            let guard = LiveGuard(Arc::clone(&self.live));

            stream::iter(payload)
                .chain(stream::pending())
                .map(move |value| {
                    let _ = &guard;
                    value
                })
                .boxed()
        }

        fn is_connected(&self) -> bool {
            true
        }
    }

    fn apple() -> Isin {
        "US0378331005".parse().unwrap()
    }

    fn apple_source() -> FakeSource {
        FakeSource::default()
            .with(
                "instrument",
                json!({"isin": "US0378331005", "shortName": "Apple", "exchangeIds": ["LSX", "TUB"]}),
            )
            .with("ticker", json!({"bid": {"price": 182.5}, "ask": {"price": 182.7}}))
    }

    #[tokio::test]
    async fn request_once_unsubscribes_after_first_payload() {
        let source = FakeSource::default().with("homeInstrumentExchange", json!({"exchangeId": "LSX"}));
        let service = QuoteService::new(source, "DE");

        let payload = service.exchange(&apple()).await.unwrap();
        assert_eq!(payload, json!({"exchangeId": "LSX"}));
        assert_eq!(service.source().live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn request_once_reports_empty_stream() {
        struct Empty;
        impl SubscriptionSourcePort for Empty {
            fn subscribe(&self, _request: SubscriptionRequest) -> PayloadStream {
                stream::empty().boxed()
            }
            fn is_connected(&self) -> bool {
                false
            }
        }

        let result = request_once(&Empty, SubscriptionRequest::HomeInstrumentExchange {
            id: "X".to_string(),
        })
        .await;
        assert!(matches!(result, Err(QuoteError::NoPayload { topic: "homeInstrumentExchange" })));
    }

    #[tokio::test]
    async fn instrument_uses_default_jurisdiction() {
        let service = QuoteService::new(apple_source(), "DE");
        service.instrument(&apple(), None).await.unwrap();
        service.instrument(&apple(), Some("AT")).await.unwrap();

        let requests = service.source().requests.lock().clone();
        assert_eq!(
            requests,
            vec![
                SubscriptionRequest::Instrument {
                    id: "US0378331005".to_string(),
                    jurisdiction: "DE".to_string(),
                },
                SubscriptionRequest::Instrument {
                    id: "US0378331005".to_string(),
                    jurisdiction: "AT".to_string(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn history_sends_range_token() {
        let source = FakeSource::default().with("aggregateHistoryLight", json!({"aggregates": []}));
        let service = QuoteService::new(source, "DE");

        service
            .aggregate_history(&apple(), "LSX", "5y".parse().unwrap())
            .await
            .unwrap();

        let requests = service.source().requests.lock().clone();
        assert_eq!(
            requests,
            vec![SubscriptionRequest::AggregateHistoryLight {
                id: "US0378331005".to_string(),
                exchange: "LSX".to_string(),
                range: "5y".to_string(),
            }]
        );
    }

    #[tokio::test]
    async fn search_returns_results_array() {
        let source = FakeSource::default().with(
            "neonSearch",
            json!({"results": [{"isin": "US0378331005", "name": "Apple"}], "resultCount": 1}),
        );
        let service = QuoteService::new(source, "DE");

        let results = service.search("apple").await.unwrap();
        assert_eq!(results.len(), 1);

        let requests = service.source().requests.lock().clone();
        let SubscriptionRequest::NeonSearch { data } = &requests[0] else {
            panic!("expected search request");
        };
        assert_eq!((data.page, data.page_size), (1, 1));
        assert!(data.filter.is_empty());
    }

    #[tokio::test]
    async fn instrument_quote_uses_first_exchange() {
        let service = QuoteService::new(apple_source(), "DE");

        let quote = service.instrument_quote(&apple()).await.unwrap();
        assert_eq!(quote.short_name, "Apple");
        assert_eq!(quote.bid_price, Decimal::new(1825, 1));

        let requests = service.source().requests.lock().clone();
        assert!(requests.contains(&SubscriptionRequest::Ticker {
            id: "US0378331005".to_string(),
            exchange: "LSX".to_string(),
        }));
        assert_eq!(service.source().live.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn instrument_without_exchange_fails() {
        let source = FakeSource::default().with(
            "instrument",
            json!({"isin": "US0378331005", "shortName": "Apple", "exchangeIds": []}),
        );
        let service = QuoteService::new(source, "DE");

        assert!(matches!(
            service.instrument_quote(&apple()).await,
            Err(QuoteError::NoExchange(_))
        ));
    }

    #[tokio::test]
    async fn search_quotes_takes_isin_shortcut() {
        let service = QuoteService::new(apple_source(), "DE");

        let quotes = service.search_quotes("US0378331005").await.unwrap();
        assert_eq!(quotes.len(), 1);

        let requests = service.source().requests.lock().clone();
        assert!(requests.iter().all(|r| r.topic() != "neonSearch"));
    }

    #[tokio::test]
    async fn search_quotes_fans_out_over_hits() {
        let source = apple_source().with(
            "neonSearch",
            json!({"results": [{"isin": "US0378331005", "name": "Apple"}], "resultCount": 1}),
        );
        let service = QuoteService::new(source, "DE");

        let quotes = service.search_quotes("apple").await.unwrap();
        assert_eq!(
            quotes,
            vec![InstrumentQuote {
                short_name: "Apple".to_string(),
                bid_price: Decimal::new(1825, 1),
            }]
        );
    }

    #[tokio::test]
    async fn search_quotes_rejects_malformed_hits() {
        let source = apple_source().with("neonSearch", json!({"results": [{"name": "Apple"}]}));
        let service = QuoteService::new(source, "DE");

        assert!(matches!(
            service.search_quotes("apple").await,
            Err(QuoteError::Payload { topic: "neonSearch", .. })
        ));
    }

    #[tokio::test]
    async fn search_quotes_with_no_hits_is_empty() {
        let source = FakeSource::default().with("neonSearch", json!({"resultCount": 0}));
        let service = QuoteService::new(source, "DE");

        assert!(service.search_quotes("nothing").await.unwrap().is_empty());
    }
}
