//! Trading Reference Types
//!
//! Users, portfolios, holdings and orders as stored in the durable store.
//! Orders are recorded intent only; nothing here matches or executes them.

use chrono::{DateTime, Days, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::market_data::SecurityId;

macro_rules! record_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a fresh identifier.
            #[must_use]
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            /// Wrap an existing UUID.
            #[must_use]
            pub const fn from_uuid(id: Uuid) -> Self {
                Self(id)
            }

            /// The underlying UUID.
            #[must_use]
            pub const fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                self.0.fmt(f)
            }
        }
    };
}

record_id!(
    /// Identifier of a registered user.
    UserId
);
record_id!(
    /// Identifier of a portfolio.
    PortfolioId
);
record_id!(
    /// Identifier of a recorded order.
    OrderId
);

// =============================================================================
// Users
// =============================================================================

/// Fields required to register a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    /// Login email, unique across users.
    pub email: String,
    /// Pre-hashed password. Never interpreted here.
    pub password_hash: String,
    /// Display name.
    pub name: String,
    /// Contact phone number.
    pub phone: Option<String>,
}

/// A registered user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// User identifier.
    pub id: UserId,
    /// Login email.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Contact phone number.
    pub phone: Option<String>,
    /// Registration time.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Securities, Portfolios and Holdings
// =============================================================================

/// A listed security.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Security {
    /// Security identifier used on channels and cache keys.
    pub id: SecurityId,
    /// Exchange ticker symbol.
    pub symbol: String,
    /// Issuer name.
    pub name: String,
}

/// A position held in a portfolio, joined with its security's symbol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    /// Security held.
    pub security_id: SecurityId,
    /// Ticker symbol of the security.
    pub symbol: String,
    /// Number of shares held.
    pub quantity: i64,
    /// Average acquisition cost per share.
    pub average_cost: Decimal,
}

impl Holding {
    /// Total acquisition cost of the position, `None` if it does not fit a
    /// `Decimal`.
    #[must_use]
    pub fn cost_basis(&self) -> Option<Decimal> {
        self.average_cost.checked_mul(Decimal::from(self.quantity))
    }
}

/// A portfolio with its holdings embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Portfolio {
    /// Portfolio identifier.
    pub id: PortfolioId,
    /// Owning user.
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Current holdings; empty when nothing is held.
    pub holdings: Vec<Holding>,
}

// =============================================================================
// Orders
// =============================================================================

/// Order type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderType {
    /// Execute at the prevailing market price.
    Market,
    /// Execute at the limit price or better.
    Limit,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSide {
    /// Buy order.
    Buy,
    /// Sell order.
    Sell,
}

/// Time in force for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeInForce {
    /// Valid until the start of the next day.
    #[default]
    Day,
    /// Good-til-canceled; never expires.
    Gtc,
}

/// Lifecycle status of a recorded order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    /// Recorded, awaiting processing elsewhere.
    #[default]
    Pending,
    /// Canceled by the user.
    Canceled,
    /// Expired at end of day.
    Expired,
}

macro_rules! str_enum {
    ($ty:ty { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            /// Database and wire representation.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $s),+
                }
            }

            /// Parse the database representation.
            #[must_use]
            pub fn parse(s: &str) -> Option<Self> {
                match s.to_lowercase().as_str() {
                    $($s => Some(Self::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

str_enum!(OrderType { Market => "market", Limit => "limit" });
str_enum!(OrderSide { Buy => "buy", Sell => "sell" });
str_enum!(TimeInForce { Day => "day", Gtc => "gtc" });
str_enum!(OrderStatus { Pending => "pending", Canceled => "canceled", Expired => "expired" });

impl TimeInForce {
    /// Expiry for an order placed at `placed_at`.
    ///
    /// Day orders expire at the start of the next UTC day; GTC orders never
    /// expire.
    #[must_use]
    pub fn expiry(self, placed_at: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::Day => placed_at
                .date_naive()
                .checked_add_days(Days::new(1))
                .map(|day| day.and_time(NaiveTime::MIN).and_utc()),
            Self::Gtc => None,
        }
    }
}

/// Fields required to record an order.
#[derive(Debug, Clone)]
pub struct NewOrder {
    /// Ordering user.
    pub user_id: UserId,
    /// Security ordered.
    pub security_id: SecurityId,
    /// Order type.
    pub order_type: OrderType,
    /// Order side.
    pub side: OrderSide,
    /// Number of shares.
    pub quantity: i64,
    /// Limit price, if any.
    pub price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
}

/// A recorded order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Order {
    /// Order identifier.
    pub id: OrderId,
    /// Ordering user.
    pub user_id: UserId,
    /// Security ordered.
    pub security_id: SecurityId,
    /// Order type.
    pub order_type: OrderType,
    /// Order side.
    pub side: OrderSide,
    /// Number of shares.
    pub quantity: i64,
    /// Limit price, if any.
    pub price: Option<Decimal>,
    /// Time in force.
    pub time_in_force: TimeInForce,
    /// Lifecycle status.
    pub status: OrderStatus,
    /// Expiry time; `None` for GTC orders.
    pub expires_at: Option<DateTime<Utc>>,
    /// When the order was recorded.
    pub created_at: DateTime<Utc>,
}

impl Order {
    /// Build the stored record for a new order placed at `now`.
    #[must_use]
    pub fn place(id: OrderId, new: NewOrder, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id: new.user_id,
            security_id: new.security_id,
            order_type: new.order_type,
            side: new.side,
            quantity: new.quantity,
            price: new.price,
            time_in_force: new.time_in_force,
            status: OrderStatus::Pending,
            expires_at: new.time_in_force.expiry(now),
            created_at: now,
        }
    }
}
