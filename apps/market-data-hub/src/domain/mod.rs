//! Domain Layer - Core market data types and business logic.
//!
//! This layer contains the core domain types with no I/O. All types here
//! are pure Rust with serialization support.

/// Ticks and security identifiers.
pub mod market_data;

/// Portfolio valuation against recorded prices.
pub mod performance;

/// Callback registration per security.
pub mod subscription;

/// Users, portfolios, holdings and orders.
pub mod trading;
