//! Data Access Layer
//!
//! `DatabaseService` is the single owner of the durable store and fast
//! cache connections. Everything else reaches the stores through it.
//!
//! # Consistency
//!
//! Recording a tick appends it to the durable store and then overwrites the
//! cached latest value. There is no transaction spanning the two: a failed
//! append short-circuits before the cache is touched, and a crash between
//! the two leaves the cache stale until its TTL runs out. The cache is only
//! ever a shortcut; `get_latest_tick` falls back to the store on a miss.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tracing::{debug, info, warn};

use crate::application::ports::{DataAccessError, DurableStore, FastCache};
use crate::domain::market_data::{NewTick, SecurityId, Tick};
use crate::domain::performance::PortfolioPerformance;
use crate::domain::trading::{
    NewOrder, NewUser, Order, OrderId, Portfolio, PortfolioId, Security, User, UserId,
};

/// How long the latest tick stays cached.
pub const TICK_TTL: Duration = Duration::from_secs(60);

/// How long a session blob stays cached.
pub const SESSION_TTL: Duration = Duration::from_secs(60 * 60);

fn tick_key(security_id: &SecurityId) -> String {
    format!("tick:{security_id}")
}

fn session_key(user_id: UserId) -> String {
    format!("session:{user_id}")
}

fn watchlist_key(user_id: UserId) -> String {
    format!("watchlist:{user_id}")
}

/// Typed operations over the durable store and the fast cache.
pub struct DatabaseService {
    store: Arc<dyn DurableStore>,
    cache: Arc<dyn FastCache>,
    closed: AtomicBool,
}

impl std::fmt::Debug for DatabaseService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseService")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl DatabaseService {
    /// Create the service over connected store and cache adapters.
    #[must_use]
    pub fn new(store: Arc<dyn DurableStore>, cache: Arc<dyn FastCache>) -> Self {
        Self {
            store,
            cache,
            closed: AtomicBool::new(false),
        }
    }

    fn ensure_open(&self) -> Result<(), DataAccessError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DataAccessError::unavailable("data access layer is shut down"));
        }
        Ok(())
    }

    // =========================================================================
    // Users, Portfolios, Orders
    // =========================================================================

    /// Register a user.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` if the email is already registered.
    pub async fn create_user(&self, new: NewUser) -> Result<UserId, DataAccessError> {
        self.ensure_open()?;

        let user = User {
            id: UserId::generate(),
            email: new.email,
            name: new.name,
            phone: new.phone,
            created_at: Utc::now(),
        };
        self.store.insert_user(&user, &new.password_hash).await?;

        debug!(user_id = %user.id, "User created");
        Ok(user.id)
    }

    /// Register or update a listed security.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn register_security(&self, security: Security) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.store.upsert_security(&security).await
    }

    /// Create a portfolio for `user_id`.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` if the user does not exist.
    pub async fn create_portfolio(
        &self,
        user_id: UserId,
        name: &str,
    ) -> Result<PortfolioId, DataAccessError> {
        self.ensure_open()?;

        let id = PortfolioId::generate();
        self.store
            .insert_portfolio(id, user_id, name, Utc::now())
            .await?;

        debug!(portfolio_id = %id, user_id = %user_id, "Portfolio created");
        Ok(id)
    }

    /// Load a portfolio with its holdings. `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn get_portfolio(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Option<Portfolio>, DataAccessError> {
        self.ensure_open()?;
        self.store.find_portfolio(portfolio_id).await
    }

    /// Set a holding's quantity and average cost.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` for unknown portfolios or securities.
    pub async fn set_holding(
        &self,
        portfolio_id: PortfolioId,
        security_id: &SecurityId,
        quantity: i64,
        average_cost: Decimal,
    ) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.store
            .upsert_holding(portfolio_id, security_id, quantity, average_cost)
            .await
    }

    /// Record an order. Day orders expire at the start of the next day.
    ///
    /// Only the intent is stored; nothing is matched or executed.
    ///
    /// # Errors
    ///
    /// `ConstraintViolation` for unknown users or securities.
    pub async fn create_order(&self, new: NewOrder) -> Result<OrderId, DataAccessError> {
        self.ensure_open()?;

        let order = Order::place(OrderId::generate(), new, Utc::now());
        self.store.insert_order(&order).await?;

        debug!(
            order_id = %order.id,
            security_id = %order.security_id,
            side = order.side.as_str(),
            time_in_force = order.time_in_force.as_str(),
            "Order recorded"
        );
        Ok(order.id)
    }

    /// Load a recorded order.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn get_order(&self, order_id: OrderId) -> Result<Option<Order>, DataAccessError> {
        self.ensure_open()?;
        self.store.find_order(order_id).await
    }

    // =========================================================================
    // Ticks
    // =========================================================================

    /// Overwrite the cached latest tick for `security_id`.
    ///
    /// Each call resets the TTL.
    ///
    /// # Errors
    ///
    /// Propagates cache errors.
    pub async fn cache_tick(
        &self,
        security_id: &SecurityId,
        tick: &Tick,
    ) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let payload = tick.to_json()?;
        self.cache
            .set_with_ttl(&tick_key(security_id), &payload, TICK_TTL)
            .await
    }

    /// Cached latest tick for `security_id`. Never reads the durable store.
    ///
    /// # Errors
    ///
    /// Propagates cache errors. A cached value that no longer parses is
    /// treated as a miss.
    pub async fn get_cached_tick(
        &self,
        security_id: &SecurityId,
    ) -> Result<Option<Tick>, DataAccessError> {
        self.ensure_open()?;
        let Some(payload) = self.cache.get(&tick_key(security_id)).await? else {
            return Ok(None);
        };

        match Tick::from_json(&payload) {
            Ok(tick) => Ok(Some(tick)),
            Err(e) => {
                warn!(security_id = %security_id, error = %e, "Discarding unreadable cached tick");
                Ok(None)
            }
        }
    }

    /// Latest tick, from the cache if present, otherwise from the store.
    ///
    /// # Errors
    ///
    /// Propagates store errors. Cache errors fall through to the store.
    pub async fn get_latest_tick(
        &self,
        security_id: &SecurityId,
    ) -> Result<Option<Tick>, DataAccessError> {
        match self.get_cached_tick(security_id).await {
            Ok(Some(tick)) => return Ok(Some(tick)),
            Ok(None) => {}
            Err(e) => {
                warn!(security_id = %security_id, error = %e, "Cache read failed, using store");
            }
        }
        self.ensure_open()?;
        self.store.latest_tick(security_id).await
    }

    /// Append a price/volume tick, timestamped now, and cache it.
    ///
    /// # Errors
    ///
    /// A store failure is returned before the cache is written.
    pub async fn record_tick(
        &self,
        security_id: &SecurityId,
        price: Decimal,
        volume: Option<i64>,
    ) -> Result<Tick, DataAccessError> {
        self.update_market_data(NewTick::new(security_id.clone(), price, volume))
            .await
    }

    /// Append a full tick, timestamped now, and cache it.
    ///
    /// # Errors
    ///
    /// A store failure is returned before the cache is written.
    pub async fn update_market_data(&self, new: NewTick) -> Result<Tick, DataAccessError> {
        self.ensure_open()?;

        let tick = new.at(Utc::now());
        self.store.append_tick(&tick).await?;
        self.cache_tick(&tick.security_id, &tick).await?;

        debug!(security_id = %tick.security_id, price = %tick.price, "Tick recorded");
        Ok(tick)
    }

    /// Ticks in `[start, end]`, ascending by timestamp.
    ///
    /// # Errors
    ///
    /// Propagates store errors.
    pub async fn get_tick_history(
        &self,
        security_id: &SecurityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DataAccessError> {
        self.ensure_open()?;
        if start > end {
            return Ok(Vec::new());
        }
        self.store.tick_range(security_id, start, end).await
    }

    // =========================================================================
    // Sessions and Watchlists
    // =========================================================================

    /// Cache an opaque session blob for one hour.
    ///
    /// # Errors
    ///
    /// Propagates cache errors.
    pub async fn cache_session(
        &self,
        user_id: UserId,
        blob: &serde_json::Value,
    ) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        let payload = serde_json::to_string(blob)?;
        self.cache
            .set_with_ttl(&session_key(user_id), &payload, SESSION_TTL)
            .await
    }

    /// Cached session blob, if present.
    ///
    /// # Errors
    ///
    /// Propagates cache errors and unreadable blobs.
    pub async fn get_cached_session(
        &self,
        user_id: UserId,
    ) -> Result<Option<serde_json::Value>, DataAccessError> {
        self.ensure_open()?;
        self.cache
            .get(&session_key(user_id))
            .await?
            .map(|payload| serde_json::from_str(&payload).map_err(DataAccessError::from))
            .transpose()
    }

    /// Add a security to the user's watchlist. Adding twice is harmless.
    ///
    /// # Errors
    ///
    /// Propagates cache errors.
    pub async fn add_to_watchlist(
        &self,
        user_id: UserId,
        security_id: &SecurityId,
    ) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.cache
            .set_add(&watchlist_key(user_id), security_id.as_str())
            .await
    }

    /// Remove a security from the user's watchlist.
    ///
    /// # Errors
    ///
    /// Propagates cache errors.
    pub async fn remove_from_watchlist(
        &self,
        user_id: UserId,
        security_id: &SecurityId,
    ) -> Result<(), DataAccessError> {
        self.ensure_open()?;
        self.cache
            .set_remove(&watchlist_key(user_id), security_id.as_str())
            .await
    }

    /// The user's watchlist.
    ///
    /// # Errors
    ///
    /// Propagates cache errors.
    pub async fn get_watchlist(
        &self,
        user_id: UserId,
    ) -> Result<HashSet<SecurityId>, DataAccessError> {
        self.ensure_open()?;
        Ok(self
            .cache
            .set_members(&watchlist_key(user_id))
            .await?
            .into_iter()
            .map(SecurityId::from)
            .collect())
    }

    // =========================================================================
    // Performance
    // =========================================================================

    /// Value a portfolio against each security's latest recorded tick.
    ///
    /// `None` if the portfolio does not exist. Holdings without any recorded
    /// tick are valued at average cost and mark the result partial.
    ///
    /// # Errors
    ///
    /// Propagates store errors. `Valuation` if a value or total exceeds the
    /// `Decimal` range.
    pub async fn get_portfolio_performance(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Option<PortfolioPerformance>, DataAccessError> {
        self.ensure_open()?;
        let Some(holdings) = self.store.priced_holdings(portfolio_id).await? else {
            return Ok(None);
        };

        let performance =
            PortfolioPerformance::compute(portfolio_id, holdings).inspect_err(|e| {
                warn!(portfolio_id = %portfolio_id, error = %e, "Portfolio not valued");
            })?;
        if performance.is_partial {
            debug!(portfolio_id = %portfolio_id, "Portfolio has unpriced holdings");
        }
        Ok(Some(performance))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Whether `shutdown` has been called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Release both store connections. Later calls do nothing.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.store.close().await;
        self.cache.close().await;
        info!("Data access layer shut down");
    }
}
