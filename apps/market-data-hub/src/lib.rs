#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::needless_pass_by_value,
        clippy::items_after_statements,
        clippy::redundant_clone
    )
)]

//! Market Data Hub - Tick Distribution and Caching
//!
//! Records security price/volume ticks in a durable store, keeps the latest
//! tick per security in a fast cache, and fans updates out to in-process
//! callbacks over a pub/sub transport.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core types and pure logic
//!   - `market_data`: Securities and ticks
//!   - `subscription`: Callback registry per security
//!   - `trading`: Users, portfolios, holdings, orders
//!   - `performance`: Portfolio valuation
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Durable store, fast cache, pub/sub transport
//!   - `services`: Data access layer, tick distributor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `postgres`: Durable store over `sqlx`
//!   - `redis`: Cache and pub/sub over `redis`
//!   - `memory`: In-process adapters for tests and local runs
//!   - `backend`: Adapter selection and wiring
//!   - `config`, `health`, `metrics`, `telemetry`
//!
//! # Data Flow
//!
//! ```text
//!                      ┌──────────────┐   append    ┌────────────┐
//! publish_update ────► │ DatabaseSvc  │ ──────────► │ PostgreSQL │
//!                      │              │   SET EX    ├────────────┤
//!                      └──────┬───────┘ ──────────► │   Redis    │
//!                             │ PUBLISH market:<id> └─────┬──────┘
//!                             ▼                           │
//!                      ┌──────────────┐   SUBSCRIBE       │
//!                      │ MarketDataSvc│ ◄─────────────────┘
//!                      │   dispatch   │ ──► callback 1
//!                      └──────────────┘ ──► callback N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core types with no I/O.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::market_data::{NewTick, SecurityId, Tick};
pub use domain::performance::{HoldingPerformance, PortfolioPerformance, ValuationOverflow};
pub use domain::subscription::{
    CallbackHandle, ChannelChange, Registration, SubscriptionRegistry, SubscriptionStats,
    TickCallback, WeakCallbackHandle,
};
pub use domain::trading::{
    Holding, NewOrder, NewUser, Order, OrderId, OrderSide, OrderStatus, OrderType, Portfolio,
    PortfolioId, Security, TimeInForce, User, UserId,
};

// Ports
pub use application::ports::{
    DataAccessError, DurableStore, FastCache, TransportError, TransportMessage,
    TransportPublisher, TransportSubscriber,
};

// Services
pub use application::services::{
    DatabaseService, DistributorConfig, MarketDataError, MarketDataService, SESSION_TTL, TICK_TTL,
    TickStream,
};

// Infrastructure config
pub use infrastructure::config::{
    Backend, CacheSettings, ConfigError, DistributorSettings, HubConfig, ServerSettings,
    StoreSettings,
};

// Backend wiring
pub use infrastructure::backend::{BackendError, HubServices};

// In-memory adapters (for integration tests)
pub use infrastructure::memory::{
    InMemoryBroker, InMemoryCache, InMemoryPublisher, InMemoryStore, InMemorySubscriber,
};

// Health server
pub use infrastructure::health::{HealthServer, HealthServerError, HealthServerState};

// Metrics
pub use infrastructure::metrics::init_metrics;

// Telemetry
pub use infrastructure::telemetry::{TelemetryConfig, TelemetryGuard, init as init_telemetry};
