//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with the upstream connection.

/// Port interfaces for the upstream source and the quote use cases.
pub mod ports;

/// One-shot request/response and quote services.
pub mod services;
