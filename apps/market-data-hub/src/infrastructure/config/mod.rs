//! Configuration Module
//!
//! Configuration loading for the hub's stores, transport and servers.

mod settings;

pub use settings::{
    Backend, CacheSettings, ConfigError, DistributorSettings, HubConfig, ServerSettings,
    StoreSettings,
};
