//! Redis adapters.
//!
//! - `RedisCache`: `FastCache` over a multiplexed connection
//! - `RedisPublisher`: publish-only connection
//! - `RedisSubscriber`: dedicated pub/sub connection driven by a task
//!
//! Each adapter opens its own connection; a connection in subscriber mode
//! cannot issue regular commands.

mod cache;
mod transport;

pub use cache::RedisCache;
pub use transport::{RedisPublisher, RedisSubscriber};

use crate::application::ports::DataAccessError;
use crate::infrastructure::config::CacheSettings;

/// Build a client for the configured server. Does not connect.
///
/// # Errors
///
/// `StoreUnavailable` if the URL is rejected.
pub fn client(settings: &CacheSettings) -> Result<redis::Client, DataAccessError> {
    redis::Client::open(settings.url()).map_err(map_redis)
}

/// Map a client error onto the data access taxonomy.
fn map_redis(err: redis::RedisError) -> DataAccessError {
    if err.is_io_error()
        || err.is_connection_dropped()
        || err.is_connection_refusal()
        || err.is_timeout()
        || err.kind() == redis::ErrorKind::InvalidClientConfig
    {
        DataAccessError::unavailable(err.to_string())
    } else if err.kind() == redis::ErrorKind::TypeError {
        DataAccessError::Serialization {
            message: err.to_string(),
        }
    } else {
        DataAccessError::Driver {
            message: err.to_string(),
        }
    }
}
