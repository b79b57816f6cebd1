//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Backend selection and service wiring.
pub mod backend;

/// Configuration loading.
pub mod config;

/// Health check HTTP endpoint.
pub mod health;

/// In-memory adapters for tests and local runs.
pub mod memory;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// PostgreSQL durable store.
pub mod postgres;

/// Redis cache and pub/sub transport.
pub mod redis;

/// OpenTelemetry tracing integration.
pub mod telemetry;
