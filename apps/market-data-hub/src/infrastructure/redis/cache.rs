//! Redis fast cache.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use tracing::info;

use super::map_redis;
use crate::application::ports::{DataAccessError, FastCache};

/// `FastCache` backed by Redis.
///
/// Values are plain strings with `SET EX`; sets map to Redis sets.
pub struct RedisCache {
    connection: Mutex<Option<MultiplexedConnection>>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache")
            .field("open", &self.connection.lock().is_some())
            .finish()
    }
}

impl RedisCache {
    /// Open a multiplexed connection.
    ///
    /// # Errors
    ///
    /// `StoreUnavailable` if the server cannot be reached.
    pub async fn connect(client: &redis::Client) -> Result<Self, DataAccessError> {
        let connection = client
            .get_multiplexed_async_connection()
            .await
            .map_err(map_redis)?;
        info!("Redis cache connection established");

        Ok(Self {
            connection: Mutex::new(Some(connection)),
        })
    }

    fn connection(&self) -> Result<MultiplexedConnection, DataAccessError> {
        self.connection
            .lock()
            .clone()
            .ok_or_else(|| DataAccessError::unavailable("redis cache connection closed"))
    }
}

#[async_trait]
impl FastCache for RedisCache {
    async fn set_with_ttl(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<(), DataAccessError> {
        let mut conn = self.connection()?;
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(map_redis)
    }

    async fn get(&self, key: &str) -> Result<Option<String>, DataAccessError> {
        let mut conn = self.connection()?;
        conn.get(key).await.map_err(map_redis)
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<(), DataAccessError> {
        let mut conn = self.connection()?;
        conn.sadd::<_, _, ()>(key, member).await.map_err(map_redis)
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DataAccessError> {
        let mut conn = self.connection()?;
        conn.srem::<_, _, ()>(key, member).await.map_err(map_redis)
    }

    async fn set_members(&self, key: &str) -> Result<HashSet<String>, DataAccessError> {
        let mut conn = self.connection()?;
        conn.smembers(key).await.map_err(map_redis)
    }

    async fn close(&self) {
        if self.connection.lock().take().is_some() {
            info!("Redis cache connection closed");
        }
    }
}
