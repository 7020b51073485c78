//! Application Ports (Driver and Driven)
//!
//! - **Driven Port** `SubscriptionSourcePort`: how the services reach the
//!   upstream connection
//! - **Driver Port** `QuotePort`: how the HTTP surface uses the services

mod quote_port;
mod subscription_source_port;

pub use quote_port::{QuoteError, QuotePort};
pub use subscription_source_port::{PayloadStream, SubscriptionSourcePort};

#[cfg(test)]
pub use quote_port::MockQuotePort;
