//! Tracing and OpenTelemetry initialisation for the planner.
//!
//! Call [`init_tracing`] once at process startup to install the `tracing`
//! subscriber described by a [`TelemetryConfig`], with an optional OTLP span
//! exporter.
//!
//! # Environment variables
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Log filter; overrides `telemetry.log_filter`. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Collector base URL used when `telemetry.otlp_endpoint` is unset. |
//!
//! `FSD_LOG_FORMAT`, `FSD_LOG_FILTER` and `FSD_OTLP_ENDPOINT` are folded into
//! the config by [`apply_env_overrides`][fsd_types::config::apply_env_overrides].
//!
//! # Example
//!
//! ```rust,no_run
//! use fsd_types::config::TelemetryConfig;
//!
//! // Hold the guard for the entire lifetime of the process.
//! let _guard = fsd_runtime::telemetry::init_tracing(&TelemetryConfig::default());
//! ```

use fsd_types::config::{LogFormat, TelemetryConfig};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber: `EnvFilter`, compact or JSON formatting,
/// and an OTLP/HTTP span layer when an endpoint is known.
///
/// A second call leaves the first subscriber in place.  The returned
/// [`TracerProviderGuard`] must be held for the lifetime of the process;
/// dropping it flushes pending spans.
pub fn init_tracing(cfg: &TelemetryConfig) -> TracerProviderGuard {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cfg.log_filter));
    let provider = resolve_endpoint(cfg).and_then(|ep| build_provider(&cfg.service_name, &ep));

    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("fsd")));
    let (json, compact) = match cfg.log_format {
        LogFormat::Json => (Some(tracing_subscriber::fmt::layer().json()), None),
        LogFormat::Compact => (None, Some(tracing_subscriber::fmt::layer().compact())),
    };

    let installed = tracing_subscriber::registry()
        .with(env_filter)
        .with(otel_layer)
        .with(json)
        .with(compact)
        .try_init();
    if installed.is_err() {
        eprintln!("[fsd] tracing subscriber already installed; keeping the existing one");
    }

    TracerProviderGuard(provider)
}

/// RAII guard that shuts down the OTel [`SdkTracerProvider`] on drop.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    /// Whether spans are being exported.
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("[fsd] OpenTelemetry provider shutdown error: {e}");
        }
    }
}

/// Config endpoint first, then `OTEL_EXPORTER_OTLP_ENDPOINT`.
fn resolve_endpoint(cfg: &TelemetryConfig) -> Option<String> {
    cfg.otlp_endpoint
        .clone()
        .or_else(|| std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok())
        .filter(|ep| !ep.trim().is_empty())
}

/// Returns `None` when the exporter cannot be initialised (the error is
/// printed to stderr and the caller falls back to plain log output).
fn build_provider(service_name: &str, endpoint: &str) -> Option<SdkTracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[fsd] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            // Synchronous export: the planner runs without an async runtime.
            .with_simple_exporter(exporter)
            .build(),
    )
}
