//! Port Interfaces
//!
//! Defines the interfaces (ports) for external systems following
//! the Hexagonal Architecture pattern. These are the contracts that
//! infrastructure adapters must implement.
//!
//! ## Driven Ports (Outbound)
//!
//! - `DurableStore`: Append-only tick history and reference tables
//! - `FastCache`: TTL-bounded key/value and set storage
//! - `TransportPublisher` / `TransportSubscriber`: Channel pub/sub

mod cache_port;
mod store_port;
mod transport_port;

pub use cache_port::FastCache;
pub use store_port::{DataAccessError, DurableStore};
pub use transport_port::{
    MessageReceiver, TransportError, TransportMessage, TransportPublisher, TransportSubscriber,
};
