//! Application Services
//!
//! - `quotes`: One-shot lookups and instrument quotes over a
//!   subscription source

pub mod quotes;

pub use quotes::{QuoteService, request_once};
