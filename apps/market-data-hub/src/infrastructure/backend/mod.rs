//! Backend wiring.
//!
//! Builds the data access layer and the distributor over the adapters
//! selected by `HubConfig::backend`.

use std::sync::Arc;

use tracing::info;

use crate::application::ports::{
    DataAccessError, DurableStore, FastCache, TransportError, TransportPublisher,
    TransportSubscriber,
};
use crate::application::services::{
    DatabaseService, DistributorConfig, MarketDataError, MarketDataService,
};
use crate::infrastructure::config::{Backend, HubConfig};
use crate::infrastructure::memory::{InMemoryBroker, InMemoryCache, InMemoryStore};
use crate::infrastructure::postgres::PgStore;
use crate::infrastructure::redis::{self, RedisCache, RedisPublisher, RedisSubscriber};

/// Errors raised while connecting a backend.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Store or cache connection failed.
    #[error(transparent)]
    DataAccess(#[from] DataAccessError),

    /// Transport connection failed.
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// The distributor could not start.
    #[error(transparent)]
    MarketData(#[from] MarketDataError),
}

/// The two connected services.
#[derive(Debug, Clone)]
pub struct HubServices {
    /// Data access layer.
    pub database: Arc<DatabaseService>,
    /// Tick distributor.
    pub market_data: Arc<MarketDataService>,
}

impl HubServices {
    /// Start the distributor over already-connected adapters.
    ///
    /// # Errors
    ///
    /// Fails if the subscriber's message receiver was already taken.
    pub fn assemble(
        store: Arc<dyn DurableStore>,
        cache: Arc<dyn FastCache>,
        publisher: Arc<dyn TransportPublisher>,
        subscriber: Arc<dyn TransportSubscriber>,
        config: DistributorConfig,
    ) -> Result<Self, MarketDataError> {
        let database = Arc::new(DatabaseService::new(store, cache));
        let market_data = Arc::new(MarketDataService::start_with_config(
            Arc::clone(&database),
            publisher,
            subscriber,
            config,
        )?);
        Ok(Self {
            database,
            market_data,
        })
    }

    /// Shut down the distributor, then the data access layer.
    pub async fn shutdown(&self) {
        self.market_data.shutdown().await;
        self.database.shutdown().await;
    }
}

/// Connect every adapter for the configured backend.
///
/// # Errors
///
/// Returns the first connection failure.
pub async fn connect(config: &HubConfig) -> Result<HubServices, BackendError> {
    match config.backend {
        Backend::Memory => Ok(in_memory(config.distributor.into())?),
        Backend::External => {
            let store = PgStore::connect(&config.store).await?;
            let client = redis::client(&config.cache)?;
            let cache = RedisCache::connect(&client).await?;
            let publisher = RedisPublisher::connect(&client).await?;
            let subscriber = RedisSubscriber::connect(&client).await?;

            info!(
                store = %config.store.host,
                cache = %config.cache.host,
                "External backend connected"
            );

            Ok(HubServices::assemble(
                Arc::new(store),
                Arc::new(cache),
                Arc::new(publisher),
                Arc::new(subscriber),
                config.distributor.into(),
            )?)
        }
    }
}

/// Wire the services over fresh in-memory adapters.
///
/// # Errors
///
/// Only fails if the distributor cannot start.
pub fn connect_in_memory() -> Result<HubServices, MarketDataError> {
    in_memory(DistributorConfig::default())
}

fn in_memory(config: DistributorConfig) -> Result<HubServices, MarketDataError> {
    let broker = InMemoryBroker::new();
    info!("In-memory backend connected");
    HubServices::assemble(
        Arc::new(InMemoryStore::new()),
        Arc::new(InMemoryCache::new()),
        Arc::new(broker.publisher()),
        Arc::new(broker.subscriber()),
        config,
    )
}
