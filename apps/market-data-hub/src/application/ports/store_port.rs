//! Durable Store Port (Driven Port)
//!
//! Interface for the relational store holding tick history and the
//! users/securities/portfolios/holdings/orders reference tables.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::market_data::{SecurityId, Tick};
use crate::domain::performance::{PricedHolding, ValuationOverflow};
use crate::domain::trading::{Order, OrderId, Portfolio, PortfolioId, Security, User, UserId};

/// Data access error.
///
/// Shared by the durable store and the fast cache. A missing record is not
/// an error; lookups return `Option`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataAccessError {
    /// Connection or transport to the store is down.
    #[error("Store unavailable: {message}")]
    StoreUnavailable {
        /// Error details.
        message: String,
    },

    /// Duplicate key or foreign key failure.
    #[error("Constraint violation: {message}")]
    ConstraintViolation {
        /// Error details.
        message: String,
    },

    /// A stored value could not be encoded or decoded.
    #[error("Serialization error: {message}")]
    Serialization {
        /// Error details.
        message: String,
    },

    /// Any other driver error, passed through.
    #[error("Driver error: {message}")]
    Driver {
        /// Error details.
        message: String,
    },

    /// Stored values are too large to value together.
    #[error("Valuation error: {message}")]
    Valuation {
        /// Error details.
        message: String,
    },
}

impl DataAccessError {
    /// Shorthand for `StoreUnavailable`.
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::StoreUnavailable {
            message: message.into(),
        }
    }

    /// Shorthand for `ConstraintViolation`.
    pub fn constraint(message: impl Into<String>) -> Self {
        Self::ConstraintViolation {
            message: message.into(),
        }
    }

    /// Whether retrying later may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::StoreUnavailable { .. })
    }

    /// Short label for the error variant.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StoreUnavailable { .. } => "unavailable",
            Self::ConstraintViolation { .. } => "constraint",
            Self::Serialization { .. } => "serialization",
            Self::Driver { .. } => "driver",
            Self::Valuation { .. } => "valuation",
        }
    }
}

impl From<ValuationOverflow> for DataAccessError {
    fn from(err: ValuationOverflow) -> Self {
        Self::Valuation {
            message: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for DataAccessError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Port for the durable store.
///
/// Ticks are append-only. Range queries are inclusive on both ends and
/// return ticks in ascending timestamp order.
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Insert a user. Duplicate emails are a `ConstraintViolation`.
    async fn insert_user(&self, user: &User, password_hash: &str) -> Result<(), DataAccessError>;

    /// Insert or update a listed security.
    async fn upsert_security(&self, security: &Security) -> Result<(), DataAccessError>;

    /// Insert a portfolio. Unknown users are a `ConstraintViolation`.
    async fn insert_portfolio(
        &self,
        id: PortfolioId,
        user_id: UserId,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), DataAccessError>;

    /// Load a portfolio with its symbol-joined holdings.
    async fn find_portfolio(&self, id: PortfolioId)
    -> Result<Option<Portfolio>, DataAccessError>;

    /// Set the quantity and average cost of a holding.
    async fn upsert_holding(
        &self,
        portfolio_id: PortfolioId,
        security_id: &SecurityId,
        quantity: i64,
        average_cost: Decimal,
    ) -> Result<(), DataAccessError>;

    /// Insert an order.
    async fn insert_order(&self, order: &Order) -> Result<(), DataAccessError>;

    /// Load an order.
    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, DataAccessError>;

    /// Append a tick to the history.
    async fn append_tick(&self, tick: &Tick) -> Result<(), DataAccessError>;

    /// Ticks for `security_id` with `start <= timestamp <= end`, ascending.
    async fn tick_range(
        &self,
        security_id: &SecurityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DataAccessError>;

    /// The most recent tick for `security_id`.
    async fn latest_tick(&self, security_id: &SecurityId) -> Result<Option<Tick>, DataAccessError>;

    /// Holdings of a portfolio joined with each security's latest tick price.
    ///
    /// Returns `None` if the portfolio does not exist.
    async fn priced_holdings(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Option<Vec<PricedHolding>>, DataAccessError>;

    /// Release the store's connections.
    async fn close(&self);
}
