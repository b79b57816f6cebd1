//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `DatabaseService`: Data access layer over the durable store and cache
//! - `MarketDataService`: Publish/subscribe distributor for ticks

mod database_service;
mod market_data_service;

pub use database_service::{DatabaseService, SESSION_TTL, TICK_TTL};
pub use market_data_service::{
    DistributorConfig, MarketDataError, MarketDataService, TickStream,
};
