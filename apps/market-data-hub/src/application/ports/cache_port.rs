//! Fast Cache Port (Driven Port)
//!
//! Interface for the key/value cache. Keys are opaque strings chosen by
//! the data access layer.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;

use super::DataAccessError;

/// Port for the fast cache.
#[async_trait]
pub trait FastCache: Send + Sync {
    /// Overwrite `key` with `value`, expiring after `ttl`.
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration)
    -> Result<(), DataAccessError>;

    /// Read `key`; `None` on a miss or after expiry.
    async fn get(&self, key: &str) -> Result<Option<String>, DataAccessError>;

    /// Add `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<(), DataAccessError>;

    /// Remove `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<(), DataAccessError>;

    /// Members of the set at `key`; empty if absent.
    async fn set_members(&self, key: &str) -> Result<HashSet<String>, DataAccessError>;

    /// Release the cache connection.
    async fn close(&self);
}
