//! Instrument Types
//!
//! Typed views over the handful of payload fields the proxy reads. Everything
//! else in an upstream payload is passed through as opaque JSON.

use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// ISIN
// =============================================================================

/// Length of an ISIN.
pub const ISIN_LEN: usize = 12;

/// An International Securities Identification Number.
///
/// Only the length is validated; the upstream service is the authority on
/// whether an ISIN exists.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Isin(String);

impl Isin {
    /// Borrow the ISIN text.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Isin {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.chars().count() == ISIN_LEN {
            Ok(Self(s.to_string()))
        } else {
            Err(InstrumentError::InvalidIsin(s.to_string()))
        }
    }
}

impl fmt::Display for Isin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// =============================================================================
// History Range
// =============================================================================

/// Unit of a [`HistoryRange`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeUnit {
    /// Days.
    Day,
    /// Weeks.
    Week,
    /// Months.
    Month,
    /// Years.
    Year,
}

impl RangeUnit {
    const fn suffix(self) -> char {
        match self {
            Self::Day => 'd',
            Self::Week => 'w',
            Self::Month => 'm',
            Self::Year => 'y',
        }
    }
}

/// Aggregate history range token: `<integer><d|w|m|y>`, e.g. `1d`, `5y`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryRange {
    /// Number of units.
    pub count: u32,
    /// Unit.
    pub unit: RangeUnit,
}

impl FromStr for HistoryRange {
    type Err = InstrumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || InstrumentError::InvalidRange(s.to_string());

        let mut chars = s.chars();
        let unit = match chars.next_back() {
            Some('d') => RangeUnit::Day,
            Some('w') => RangeUnit::Week,
            Some('m') => RangeUnit::Month,
            Some('y') => RangeUnit::Year,
            _ => return Err(invalid()),
        };

        let digits = chars.as_str();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let count = digits.parse().map_err(|_| invalid())?;

        Ok(Self { count, unit })
    }
}

impl fmt::Display for HistoryRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.count, self.unit.suffix())
    }
}

// =============================================================================
// Payload Views
// =============================================================================

/// Fields read from an `instrument` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentDetails {
    /// ISIN.
    pub isin: String,
    /// Display name.
    #[serde(default)]
    pub short_name: String,
    /// Exchanges the instrument trades on; the first is the default feed.
    #[serde(default)]
    pub exchange_ids: Vec<String>,
}

/// One side of a ticker payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PricePoint {
    /// Price.
    pub price: Decimal,
    /// Unix time in milliseconds.
    #[serde(default)]
    pub time: Option<i64>,
    /// Size.
    #[serde(default)]
    pub size: Option<Decimal>,
}

/// Fields read from a `ticker` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TickerSnapshot {
    /// Best bid.
    pub bid: PricePoint,
    /// Best ask.
    #[serde(default)]
    pub ask: Option<PricePoint>,
    /// Last trade.
    #[serde(default)]
    pub last: Option<PricePoint>,
}

/// One hit of a `neonSearch` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SearchHit {
    /// ISIN.
    pub isin: String,
    /// Display name.
    #[serde(default)]
    pub name: String,
}

/// Fields read from a `neonSearch` payload.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchResults {
    /// Hits on the requested page.
    #[serde(default)]
    pub results: Vec<SearchHit>,
    /// Total hit count.
    #[serde(default)]
    pub result_count: u64,
}

/// Instrument name with its current bid, as served over HTTP.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstrumentQuote {
    /// Display name.
    pub short_name: String,
    /// Current bid price.
    #[serde(with = "rust_decimal::serde::float")]
    pub bid_price: Decimal,
}

// =============================================================================
// Errors
// =============================================================================

/// Validation errors for instrument inputs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InstrumentError {
    /// ISIN is not 12 characters long.
    #[error("invalid ISIN '{0}': expected {ISIN_LEN} characters")]
    InvalidIsin(String),

    /// Range token does not match `<integer><d|w|m|y>`.
    #[error("invalid history range '{0}': expected <integer><d|w|m|y>")]
    InvalidRange(String),
}
