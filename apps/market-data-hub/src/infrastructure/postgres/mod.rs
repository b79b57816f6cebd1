//! PostgreSQL durable store.
//!
//! Implements `DurableStore` over a `sqlx` connection pool. The schema is
//! created on connect if it does not exist yet.
//!
//! # Error Mapping
//!
//! | sqlx error                          | `DataAccessError`     |
//! |-------------------------------------|-----------------------|
//! | database error, SQLSTATE class 23   | `ConstraintViolation` |
//! | pool timeout/closed, I/O, TLS       | `StoreUnavailable`    |
//! | column decode, unknown column       | `Serialization`       |
//! | anything else                       | `Driver`              |

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgConnectOptions, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::application::ports::{DataAccessError, DurableStore};
use crate::domain::market_data::{SecurityId, Tick};
use crate::domain::performance::PricedHolding;
use crate::domain::trading::{
    Holding, Order, OrderId, OrderSide, OrderStatus, OrderType, Portfolio, PortfolioId, Security,
    TimeInForce, User, UserId,
};
use crate::infrastructure::config::StoreSettings;

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS users (
    id            UUID PRIMARY KEY,
    email         TEXT NOT NULL UNIQUE,
    password_hash TEXT NOT NULL,
    name          TEXT NOT NULL,
    phone         TEXT,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS securities (
    id     TEXT PRIMARY KEY,
    symbol TEXT NOT NULL,
    name   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS portfolios (
    id         UUID PRIMARY KEY,
    user_id    UUID NOT NULL REFERENCES users (id),
    name       TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS holdings (
    portfolio_id UUID NOT NULL REFERENCES portfolios (id) ON DELETE CASCADE,
    security_id  TEXT NOT NULL REFERENCES securities (id),
    quantity     BIGINT NOT NULL,
    average_cost NUMERIC NOT NULL,
    PRIMARY KEY (portfolio_id, security_id)
);

CREATE TABLE IF NOT EXISTS orders (
    id            UUID PRIMARY KEY,
    user_id       UUID NOT NULL REFERENCES users (id),
    security_id   TEXT NOT NULL REFERENCES securities (id),
    order_type    TEXT NOT NULL,
    side          TEXT NOT NULL,
    quantity      BIGINT NOT NULL,
    price         NUMERIC,
    time_in_force TEXT NOT NULL,
    status        TEXT NOT NULL,
    expires_at    TIMESTAMPTZ,
    created_at    TIMESTAMPTZ NOT NULL
);

CREATE TABLE IF NOT EXISTS market_data (
    id          BIGSERIAL PRIMARY KEY,
    security_id TEXT NOT NULL,
    timestamp   TIMESTAMPTZ NOT NULL,
    price       NUMERIC NOT NULL,
    volume      BIGINT,
    high        NUMERIC,
    low         NUMERIC,
    open        NUMERIC,
    close       NUMERIC
);

CREATE INDEX IF NOT EXISTS market_data_security_time
    ON market_data (security_id, timestamp);
";

/// Map a driver error onto the data access taxonomy.
fn map_sqlx(err: sqlx::Error) -> DataAccessError {
    match &err {
        sqlx::Error::Database(db) if db.code().is_some_and(|code| code.starts_with("23")) => {
            DataAccessError::constraint(db.message().to_string())
        }
        sqlx::Error::PoolTimedOut
        | sqlx::Error::PoolClosed
        | sqlx::Error::Io(_)
        | sqlx::Error::Tls(_)
        | sqlx::Error::WorkerCrashed => DataAccessError::unavailable(err.to_string()),
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::Decode(_) => DataAccessError::Serialization {
            message: err.to_string(),
        },
        _ => DataAccessError::Driver {
            message: err.to_string(),
        },
    }
}

fn parse_column<T>(value: &str, column: &str, parse: fn(&str) -> Option<T>) -> Result<T, DataAccessError> {
    parse(value).ok_or_else(|| DataAccessError::Serialization {
        message: format!("unexpected {column} value: {value}"),
    })
}

fn row_to_tick(row: &PgRow) -> Result<Tick, DataAccessError> {
    Ok(Tick {
        security_id: SecurityId::new(row.try_get::<String, _>("security_id").map_err(map_sqlx)?),
        timestamp: row.try_get("timestamp").map_err(map_sqlx)?,
        price: row.try_get("price").map_err(map_sqlx)?,
        volume: row.try_get("volume").map_err(map_sqlx)?,
        high: row.try_get("high").map_err(map_sqlx)?,
        low: row.try_get("low").map_err(map_sqlx)?,
        open: row.try_get("open").map_err(map_sqlx)?,
        close: row.try_get("close").map_err(map_sqlx)?,
    })
}

fn row_to_holding(row: &PgRow) -> Result<Holding, DataAccessError> {
    Ok(Holding {
        security_id: SecurityId::new(row.try_get::<String, _>("security_id").map_err(map_sqlx)?),
        symbol: row.try_get("symbol").map_err(map_sqlx)?,
        quantity: row.try_get("quantity").map_err(map_sqlx)?,
        average_cost: row.try_get("average_cost").map_err(map_sqlx)?,
    })
}

fn row_to_order(row: &PgRow) -> Result<Order, DataAccessError> {
    let order_type: String = row.try_get("order_type").map_err(map_sqlx)?;
    let side: String = row.try_get("side").map_err(map_sqlx)?;
    let time_in_force: String = row.try_get("time_in_force").map_err(map_sqlx)?;
    let status: String = row.try_get("status").map_err(map_sqlx)?;

    Ok(Order {
        id: OrderId::from_uuid(row.try_get("id").map_err(map_sqlx)?),
        user_id: UserId::from_uuid(row.try_get("user_id").map_err(map_sqlx)?),
        security_id: SecurityId::new(row.try_get::<String, _>("security_id").map_err(map_sqlx)?),
        order_type: parse_column(&order_type, "order_type", OrderType::parse)?,
        side: parse_column(&side, "side", OrderSide::parse)?,
        quantity: row.try_get("quantity").map_err(map_sqlx)?,
        price: row.try_get("price").map_err(map_sqlx)?,
        time_in_force: parse_column(&time_in_force, "time_in_force", TimeInForce::parse)?,
        status: parse_column(&status, "status", OrderStatus::parse)?,
        expires_at: row.try_get("expires_at").map_err(map_sqlx)?,
        created_at: row.try_get("created_at").map_err(map_sqlx)?,
    })
}

/// `DurableStore` backed by PostgreSQL.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Connect a pool and create the schema if needed.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the database cannot be reached; other driver
    /// errors if the schema cannot be created.
    pub async fn connect(settings: &StoreSettings) -> Result<Self, DataAccessError> {
        let options = PgConnectOptions::new()
            .host(&settings.host)
            .port(settings.port)
            .username(&settings.user)
            .password(settings.password())
            .database(&settings.database);

        let pool = PgPoolOptions::new()
            .max_connections(settings.max_connections)
            .acquire_timeout(settings.acquire_timeout)
            .connect_with(options)
            .await
            .map_err(map_sqlx)?;

        info!(
            host = %settings.host,
            database = %settings.database,
            max_connections = settings.max_connections,
            "PostgreSQL connection pool initialized"
        );

        let store = Self::with_pool(pool);
        store.bootstrap().await?;
        Ok(store)
    }

    /// Wrap an existing pool. The schema is assumed to exist.
    #[must_use]
    pub const fn with_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying connection pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create any missing tables and indexes.
    ///
    /// # Errors
    ///
    /// Propagates driver errors.
    pub async fn bootstrap(&self) -> Result<(), DataAccessError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        debug!("Schema bootstrap complete");
        Ok(())
    }

    async fn holdings_of(&self, portfolio_id: PortfolioId) -> Result<Vec<Holding>, DataAccessError> {
        let rows = sqlx::query(
            r"
            SELECT h.security_id, COALESCE(s.symbol, h.security_id) AS symbol,
                   h.quantity, h.average_cost
            FROM holdings h
            LEFT JOIN securities s ON s.id = h.security_id
            WHERE h.portfolio_id = $1
            ORDER BY h.security_id
            ",
        )
        .bind(portfolio_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_holding).collect()
    }
}

#[async_trait]
impl DurableStore for PgStore {
    async fn insert_user(&self, user: &User, password_hash: &str) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO users (id, email, password_hash, name, phone, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ",
        )
        .bind(user.id.as_uuid())
        .bind(&user.email)
        .bind(password_hash)
        .bind(&user.name)
        .bind(&user.phone)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn upsert_security(&self, security: &Security) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO securities (id, symbol, name)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE SET symbol = EXCLUDED.symbol, name = EXCLUDED.name
            ",
        )
        .bind(security.id.as_str())
        .bind(&security.symbol)
        .bind(&security.name)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_portfolio(
        &self,
        id: PortfolioId,
        user_id: UserId,
        name: &str,
        created_at: DateTime<Utc>,
    ) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO portfolios (id, user_id, name, created_at)
            VALUES ($1, $2, $3, $4)
            ",
        )
        .bind(id.as_uuid())
        .bind(user_id.as_uuid())
        .bind(name)
        .bind(created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_portfolio(&self, id: PortfolioId) -> Result<Option<Portfolio>, DataAccessError> {
        let Some(row) = sqlx::query(
            "SELECT id, user_id, name, created_at FROM portfolios WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        else {
            return Ok(None);
        };

        let holdings = self.holdings_of(id).await?;

        Ok(Some(Portfolio {
            id,
            user_id: UserId::from_uuid(row.try_get("user_id").map_err(map_sqlx)?),
            name: row.try_get("name").map_err(map_sqlx)?,
            created_at: row.try_get("created_at").map_err(map_sqlx)?,
            holdings,
        }))
    }

    async fn upsert_holding(
        &self,
        portfolio_id: PortfolioId,
        security_id: &SecurityId,
        quantity: i64,
        average_cost: Decimal,
    ) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO holdings (portfolio_id, security_id, quantity, average_cost)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (portfolio_id, security_id) DO UPDATE SET
                quantity = EXCLUDED.quantity,
                average_cost = EXCLUDED.average_cost
            ",
        )
        .bind(portfolio_id.as_uuid())
        .bind(security_id.as_str())
        .bind(quantity)
        .bind(average_cost)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn insert_order(&self, order: &Order) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO orders (
                id, user_id, security_id, order_type, side, quantity, price,
                time_in_force, status, expires_at, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ",
        )
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.security_id.as_str())
        .bind(order.order_type.as_str())
        .bind(order.side.as_str())
        .bind(order.quantity)
        .bind(order.price)
        .bind(order.time_in_force.as_str())
        .bind(order.status.as_str())
        .bind(order.expires_at)
        .bind(order.created_at)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn find_order(&self, id: OrderId) -> Result<Option<Order>, DataAccessError> {
        sqlx::query(
            r"
            SELECT id, user_id, security_id, order_type, side, quantity, price,
                   time_in_force, status, expires_at, created_at
            FROM orders WHERE id = $1
            ",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(row_to_order)
        .transpose()
    }

    async fn append_tick(&self, tick: &Tick) -> Result<(), DataAccessError> {
        sqlx::query(
            r"
            INSERT INTO market_data (security_id, timestamp, price, volume, high, low, open, close)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ",
        )
        .bind(tick.security_id.as_str())
        .bind(tick.timestamp)
        .bind(tick.price)
        .bind(tick.volume)
        .bind(tick.high)
        .bind(tick.low)
        .bind(tick.open)
        .bind(tick.close)
        .execute(&self.pool)
        .await
        .map_err(map_sqlx)?;
        Ok(())
    }

    async fn tick_range(
        &self,
        security_id: &SecurityId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<Tick>, DataAccessError> {
        let rows = sqlx::query(
            r"
            SELECT security_id, timestamp, price, volume, high, low, open, close
            FROM market_data
            WHERE security_id = $1 AND timestamp BETWEEN $2 AND $3
            ORDER BY timestamp, id
            ",
        )
        .bind(security_id.as_str())
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter().map(row_to_tick).collect()
    }

    async fn latest_tick(&self, security_id: &SecurityId) -> Result<Option<Tick>, DataAccessError> {
        sqlx::query(
            r"
            SELECT security_id, timestamp, price, volume, high, low, open, close
            FROM market_data
            WHERE security_id = $1
            ORDER BY timestamp DESC, id DESC
            LIMIT 1
            ",
        )
        .bind(security_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(map_sqlx)?
        .as_ref()
        .map(row_to_tick)
        .transpose()
    }

    async fn priced_holdings(
        &self,
        portfolio_id: PortfolioId,
    ) -> Result<Option<Vec<PricedHolding>>, DataAccessError> {
        let exists = sqlx::query("SELECT 1 FROM portfolios WHERE id = $1")
            .bind(portfolio_id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(map_sqlx)?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let rows = sqlx::query(
            r"
            SELECT h.security_id, COALESCE(s.symbol, h.security_id) AS symbol,
                   h.quantity, h.average_cost, latest.price AS last_price
            FROM holdings h
            LEFT JOIN securities s ON s.id = h.security_id
            LEFT JOIN LATERAL (
                SELECT m.price
                FROM market_data m
                WHERE m.security_id = h.security_id
                ORDER BY m.timestamp DESC, m.id DESC
                LIMIT 1
            ) latest ON TRUE
            WHERE h.portfolio_id = $1
            ORDER BY h.security_id
            ",
        )
        .bind(portfolio_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(map_sqlx)?;

        rows.iter()
            .map(|row| {
                Ok(PricedHolding {
                    holding: row_to_holding(row)?,
                    last_price: row.try_get("last_price").map_err(map_sqlx)?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Some)
    }

    async fn close(&self) {
        self.pool.close().await;
        info!("PostgreSQL connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_is_unavailable() {
        let err = map_sqlx(sqlx::Error::PoolTimedOut);
        assert!(matches!(err, DataAccessError::StoreUnavailable { .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn io_failure_is_unavailable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            map_sqlx(sqlx::Error::Io(io)),
            DataAccessError::StoreUnavailable { .. }
        ));
    }

    #[test]
    fn missing_column_is_serialization() {
        assert!(matches!(
            map_sqlx(sqlx::Error::ColumnNotFound("price".to_string())),
            DataAccessError::Serialization { .. }
        ));
    }

    #[test]
    fn other_errors_pass_through_as_driver() {
        assert!(matches!(
            map_sqlx(sqlx::Error::RowNotFound),
            DataAccessError::Driver { .. }
        ));
    }

    #[test]
    fn unknown_enum_column_is_serialization() {
        let err = parse_column("STOP", "order_type", OrderType::parse).unwrap_err();
        assert!(matches!(err, DataAccessError::Serialization { .. }));
    }

    #[test]
    fn schema_declares_every_table() {
        for table in ["users", "securities", "portfolios", "holdings", "orders", "market_data"] {
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {table}")));
        }
    }
}
