//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with storage and transport.

/// Port interfaces for external systems (durable store, cache, pub/sub).
pub mod ports;

/// Application services for data access and tick distribution.
pub mod services;
