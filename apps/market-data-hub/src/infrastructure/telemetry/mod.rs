//! Logging and span export for the hub process.
//!
//! Log lines go to stdout through `tracing_subscriber::fmt`. Spans are
//! shipped over OTLP only when `OTEL_ENABLED` is set; an exporter that
//! fails to build leaves the hub logging locally.
//!
//! | Variable                      | Default                 |
//! |-------------------------------|-------------------------|
//! | `RUST_LOG`                    | `market_data_hub=info`  |
//! | `OTEL_ENABLED`                | `false`                 |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | `http://localhost:4317` |
//! | `OTEL_SERVICE_NAME`           | `market-data-hub`       |

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::{SpanExporter, WithExportConfig};
use opentelemetry_sdk::Resource;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const SERVICE_NAME: &str = "market-data-hub";

const OTLP_ENDPOINT: &str = "http://localhost:4317";

/// Directives applied on top of `RUST_LOG`. Driver crates are noisy at info.
const BASE_DIRECTIVES: [&str; 3] = ["market_data_hub=info", "sqlx=warn", "hyper=warn"];

/// Flushes exported spans on drop. Hold it for the life of `main`.
pub struct TelemetryGuard {
    provider: Option<SdkTracerProvider>,
}

impl TelemetryGuard {
    /// Whether spans leave the process.
    #[must_use]
    pub const fn is_exporting(&self) -> bool {
        self.provider.is_some()
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let Some(provider) = self.provider.take() else {
            return;
        };
        if let Err(e) = provider.shutdown() {
            eprintln!("market-data-hub: span flush failed: {e}");
        }
    }
}

/// Where and whether to export spans.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Export spans over OTLP.
    pub enabled: bool,
    /// OTLP gRPC collector.
    pub otlp_endpoint: String,
    /// `service.name` resource attribute.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            otlp_endpoint: OTLP_ENDPOINT.to_string(),
            service_name: SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Read the `OTEL_*` variables, defaulting any that are unset.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            enabled: std::env::var("OTEL_ENABLED").is_ok_and(|v| is_truthy(&v)),
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
                .unwrap_or(defaults.otlp_endpoint),
            service_name: std::env::var("OTEL_SERVICE_NAME").unwrap_or(defaults.service_name),
        }
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(value.to_ascii_lowercase().as_str(), "true" | "1" | "yes")
}

#[allow(clippy::expect_used)]
fn log_filter() -> EnvFilter {
    BASE_DIRECTIVES
        .iter()
        .fold(EnvFilter::from_default_env(), |filter, directive| {
            filter.add_directive(directive.parse().expect("base log directive parses"))
        })
}

/// Install the global subscriber from `OTEL_*` and `RUST_LOG`.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Install the global subscriber. Call once per process.
#[must_use]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let registry = tracing_subscriber::registry()
        .with(log_filter())
        .with(fmt_layer);

    let Some(provider) = config.enabled.then(|| tracer_provider(&config)).flatten() else {
        registry.init();
        return TelemetryGuard { provider: None };
    };

    let otel_layer =
        tracing_opentelemetry::layer().with_tracer(provider.tracer(config.service_name));
    registry.with(otel_layer).init();

    TelemetryGuard {
        provider: Some(provider),
    }
}

fn tracer_provider(config: &TelemetryConfig) -> Option<SdkTracerProvider> {
    let exporter = SpanExporter::builder()
        .with_tonic()
        .with_endpoint(&config.otlp_endpoint)
        .build()
        .inspect_err(|e| eprintln!("market-data-hub: OTLP export disabled: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(config.service_name.clone())
        .build();
    Some(
        SdkTracerProvider::builder()
            .with_batch_exporter(exporter)
            .with_resource(resource)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn export_is_off_by_default() {
        let config = TelemetryConfig::default();
        assert!(!config.enabled);
        assert_eq!(config.otlp_endpoint, OTLP_ENDPOINT);
        assert_eq!(config.service_name, SERVICE_NAME);
    }

    #[test]
    fn enable_flag_accepts_common_spellings() {
        for value in ["true", "TRUE", "1", "yes"] {
            assert!(is_truthy(value), "{value}");
        }
        for value in ["false", "0", "", "on"] {
            assert!(!is_truthy(value), "{value}");
        }
    }

    #[test]
    fn base_directives_parse() {
        for directive in BASE_DIRECTIVES {
            assert!(directive.parse::<tracing_subscriber::filter::Directive>().is_ok());
        }
    }

    #[test]
    fn local_only_guard_is_not_exporting() {
        let guard = TelemetryGuard { provider: None };
        assert!(!guard.is_exporting());
    }
}
