//! Quote Port
//!
//! Instrument quotes as served by the HTTP surface.

use async_trait::async_trait;

use crate::domain::instrument::{InstrumentError, InstrumentQuote, Isin};

/// Errors from quote lookups.
#[derive(Debug, thiserror::Error)]
pub enum QuoteError {
    /// The subscription ended before delivering a payload.
    #[error("{topic} subscription ended without a payload")]
    NoPayload {
        /// Upstream topic.
        topic: &'static str,
    },

    /// A payload did not have the expected shape.
    #[error("unexpected {topic} payload: {source}")]
    Payload {
        /// Upstream topic.
        topic: &'static str,
        /// Decode error.
        #[source]
        source: serde_json::Error,
    },

    /// The instrument lists no exchange to take prices from.
    #[error("instrument {0} has no exchange")]
    NoExchange(String),

    /// Invalid input.
    #[error(transparent)]
    Invalid(#[from] InstrumentError),
}

/// Port for quote lookups.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait QuotePort: Send + Sync {
    /// Name and current bid of one instrument.
    ///
    /// # Errors
    ///
    /// Returns error if the instrument or its ticker cannot be read.
    async fn instrument_quote(&self, isin: &Isin) -> Result<InstrumentQuote, QuoteError>;

    /// Quotes for every instrument matching `query`.
    ///
    /// # Errors
    ///
    /// Returns error if the search or any quote lookup fails.
    async fn search_quotes(&self, query: &str) -> Result<Vec<InstrumentQuote>, QuoteError>;

    /// Whether the upstream connection is currently open.
    fn is_connected(&self) -> bool;
}
