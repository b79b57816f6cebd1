//! In-Memory Adapters
//!
//! Process-local implementations of every driven port. Used by the test
//! suites and by the `memory` backend for running without PostgreSQL or
//! Redis. Nothing here survives a restart.

mod cache;
mod store;
mod transport;

pub use cache::InMemoryCache;
pub use store::InMemoryStore;
pub use transport::{InMemoryBroker, InMemoryPublisher, InMemorySubscriber};
