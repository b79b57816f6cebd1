//! In-memory durable store for testing and local development.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rust_decimal::Decimal;

use crate::application::ports::{DataAccessError, DurableStore};
use crate::domain::market_data::{SecurityId, Tick};
use crate::domain::performance::PricedHolding;
use crate::domain::trading::{
    Holding, Order, OrderId, Portfolio, PortfolioId, Security, User, UserId,
};

#[derive(Debug, Clone)]
struct PortfolioRow {
    user_id: UserId,
    name: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Tables {
    users: HashMap<UserId, User>,
    securities: HashMap<SecurityId, Security>,
    portfolios: HashMap<PortfolioId, PortfolioRow>,
    holdings: HashMap<PortfolioId, BTreeMap<SecurityId, (i64, Decimal)>>,
    orders: HashMap<OrderId, Order>,
    ticks: HashMap<SecurityId, Vec<Tick>>,
}

impl Tables {
    fn holdings_of(&self, portfolio_id: PortfolioId) -> Vec<Holding> {
        self.holdings
            .get(&portfolio_id)
            .map(|rows| {
                rows.iter()
                    .map(|(security_id, (quantity, average_cost))| Holding {
                        security_id: security_id.clone(),
                        symbol: self
                            .securities
                            .get(security_id)
                            .map_or_else(|| security_id.to_string(), |s| s.symbol.clone()),
                        quantity: *quantity,
                        average_cost: *average_cost,
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// In-memory implementation of `DurableStore`.
///
/// Enforces the same unique and foreign key constraints as the relational
/// schema. Counts every port call and can be switched into an unavailable
/// state to simulate an outage.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    calls: AtomicU64,
    unavailable: AtomicBool,
    closed: AtomicBool,
}

impl InMemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of port calls made so far.
    #[must_use]
    pub fn calls(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Make every call fail with `StoreUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Whether `close` has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Total number of ticks stored for `security_id`.
    #[must_use]
    pub fn tick_count(&self, security_id: &SecurityId) -> usize {
        self.tables.read().ticks.get(security_id).map_or(0, Vec::len)
    }

    fn enter(&self) -> Result<(), DataAccessError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DataAccessError::unavailable("in-memory store offline"));
        }
        if self.closed.load(Ordering::SeqCst) {
            return Err(DataAccessError::unavailable("in-memory store closed"));
        }
        Ok(())
    }
}

#[async_trait]
impl DurableStore for InMemoryStore {
    async fn insert_user(&self, user: &User, _password_hash: &str) -> Result<(), DataAccessError> {
        self.enter()?;
        let mut tables = self.tables.write();

        if tables.users.values().any(|u| u.email == user.email) {
            return Err(DataAccessError::constraint(format!(
                "email already registered: {}",
                user.email
            )));
        }

        tables.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn upsert_security(&self, security: &Security) -> Result<(), DataAccessError> {
        self.enter()?;
        self.tables
            .write()
            .securities
            .insert(security.id.clone(), security.clone());
        Ok(())
    }

    async fn insert_portfolio(
        &self,
        id: PortfolioId,
        user_id: UserId,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        self.enter()?;
        let mut tables = self.tables.write();

        if !tables.users.contains_key(&user_id) {
            return Err(DataAccessError::constraint(format!("unknown user: {user_id}")));
        }

        tables.portfolios.insert(
            id,
            PortfolioRow {
                user_id,
                name: name.to_string(),
                created_at,
            },
        );
        Ok(())
    }

    async fn find_portfolio(
        &self,
        id: PortfolioId,
    ) -> Result<Option<Portfolio>, DataAccessError> {
        self.enter()?;
        let tables = self.tables.read();

        Ok(tables.portfolios.get(&id).map(|row| Portfolio {
            id,
            user_id: row.user_id,
            name: row.name.clone(),
            created_at: row.created_at,
            holdings: tables.holdings_of(id),
        }))
    }

    async fn upsert_holding(
        &self,
        portfolio_id: PortfolioId,
        security_id: &SecurityId,
        quantity: i64,
        average_cost: Decimal,
    ) -> Result<(), DataAccessError> {
        self.enter()?;
        let mut tables = self.tables.write();

        if !tables.portfolios.contains_key(&portfolio_id) {
            return Err(DataAccessError::constraint(format!(
                "unknown portfolio: {portfolio_id}"
            )));
        }
        if !tables.securities.contains_key(security_id) {
            return Err(DataAccessError::constraint(format!(
                "unknown security: {security_id}"
            )));
        }

        tables
            .holdings
            .entry(portfolio_id)
            .or_default()
            .insert(security_id.clone(), (quantity, average_cost));
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<(), DataAccessError> {
        self.enter()?;
        let mut tables = self.tables.write();

        if !tables.users.contains_key(&order.user_id) {
            return Err(DataAccessError::constraint(format!(
                "unknown user: {}",
                order.user_id
            )));
        }
        if !tables.securities.contains_key(&order.security_id) {
            return Err(DataAccessError::constraint(format!(
                "unknown security: {}",
                order.security_id
            )));
        }

        tables.orders.insert(order.id, order.clone());
        Ok(())
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, DataAccessError> {
        self.enter()?;
        Ok(self.tables.read().orders.get(&id).cloned())
    }

    async fn append_tick(&self, tick: &Tick) -> Result<(), DataAccessError> {
        self.enter()?;
        let mut tables = self.tables.write();
        let series = tables.ticks.entry(tick.security_id.clone()).or_default();

        // Equal timestamps keep arrival order.
        let pos = series.partition_point(|t| t.timestamp <= tick.timestamp);
        series.insert(pos, tick.clone());
        Ok(())
    }

    async fn tick_range(
        &self,
        security_id: &SecurityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DataAccessError> {
        self.enter()?;
        Ok(self
            .tables
            .read()
            .ticks
            .get(security_id)
            .map(|series| {
                series
                    .iter()
                    .filter(|t| t.timestamp >= start && t.timestamp <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn latest_tick(&self, security_id: &SecurityId) -> Result<Option<Tick>, DataAccessError> {
        self.enter()?;
        Ok(self
            .tables
            .read()
            .ticks
            .get(security_id)
            .and_then(|series| series.last().cloned()))
    }

    async fn priced_holdings(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Option<Vec<PricedHolding>>, DataAccessError> {
        self.enter()?;
        let tables = self.tables.read();

        if !tables.portfolios.contains_key(&portfolio_id) {
            return Ok(None);
        }

        Ok(Some(
            tables
                .holdings_of(portfolio_id)
                .into_iter()
                .map(|holding| {
                    let last_price = tables
                        .ticks
                        .get(&holding.security_id)
                        .and_then(|series| series.last())
                        .map(|t| t.price);
                    PricedHolding {
                        holding,
                        last_price,
                    }
                })
                .collect(),
        ))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use chrono::Duration;

    use super::*;
    use crate::domain::market_data::NewTick;

    fn user(email: &str) -> User {
        User {
            id: UserId::generate(),
            email: email.to_string(),
            name: "Asha".to_string(),
            phone: None,
            created_at: Utc::now(),
        }
    }

    fn tick_at(id: &str, price: i64, at: DateTime<Utc>) -> Tick {
        NewTick::new(id, Decimal::from(price), Some(100)).at(at)
    }

    #[tokio::test]
    async fn duplicate_email_is_constraint_violation() {
        let store = InMemoryStore::new();
        store.insert_user(&user("a@dse.co.tz"), "h").await.unwrap();

        let err = store
            .insert_user(&user("a@dse.co.tz"), "h")
            .await
            .unwrap_err();
        assert!(matches!(err, DataAccessError::ConstraintViolation { .. }));
    }

    #[tokio::test]
    async fn out_of_order_ticks_are_sorted() {
        let store = InMemoryStore::new();
        let now = Utc::now();

        store.append_tick(&tick_at("CRDB", 2, now)).await.unwrap();
        store
            .append_tick(&tick_at("CRDB", 1, now - Duration::seconds(5)))
            .await
            .unwrap();

        let latest = store.latest_tick(&"CRDB".into()).await.unwrap().unwrap();
        assert_eq!(latest.price, Decimal::from(2));

        let all = store
            .tick_range(&"CRDB".into(), now - Duration::minutes(1), now)
            .await
            .unwrap();
        assert_eq!(all[0].price, Decimal::from(1));
    }

    #[tokio::test]
    async fn range_bounds_are_inclusive() {
        let store = InMemoryStore::new();
        let start = Utc::now();
        let end = start + Duration::seconds(10);

        store.append_tick(&tick_at("NMB", 1, start)).await.unwrap();
        store.append_tick(&tick_at("NMB", 2, end)).await.unwrap();
        store
            .append_tick(&tick_at("NMB", 3, end + Duration::seconds(1)))
            .await
            .unwrap();

        let range = store.tick_range(&"NMB".into(), start, end).await.unwrap();
        assert_eq!(range.len(), 2);
    }

    #[tokio::test]
    async fn unavailable_store_fails_and_counts_calls() {
        let store = InMemoryStore::new();
        store.set_unavailable(true);

        let err = store.latest_tick(&"TBL".into()).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(store.calls(), 1);
    }

    #[tokio::test]
    async fn closed_store_rejects_calls() {
        let store = InMemoryStore::new();
        store.close().await;
        assert!(store.is_closed());
        assert!(store.latest_tick(&"TBL".into()).await.is_err());
    }
}
