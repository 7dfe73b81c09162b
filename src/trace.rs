//! Tracing subscriber setup. See [`init_tracing`].

use opentelemetry::{KeyValue, trace::TracerProvider as _};
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use opentelemetry_semantic_conventions::resource::{SERVICE_NAME, SERVICE_VERSION};
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

const SERVICE: &str = "gpu-alert-monitor";

/// Install the global tracing subscriber, and return the OpenTelemetry
/// tracer provider backing it.
///
/// The subscriber has three layers:
/// - an [`EnvFilter`] read from `RUST_LOG`, defaulting to `info`;
/// - a formatting layer writing to stdout, as JSON when `LOG_FORMAT=json`;
/// - a [`tracing_opentelemetry`] layer exporting spans over OTLP/HTTP to the
///   collector named by the standard `OTEL_EXPORTER_OTLP_*` variables
///   (`http://localhost:4318` by default).
///
/// Spans are exported in batches, and only once they close. Call
/// [`SdkTracerProvider::shutdown`] before exiting so the final batch is
/// flushed.
///
/// If the exporter cannot be built, spans are still recorded but go nowhere.
/// Logging to stdout is unaffected.
pub fn init_tracing() -> SdkTracerProvider {
    let resource = Resource::builder()
        .with_attributes([
            KeyValue::new(SERVICE_NAME, SERVICE),
            KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
        ])
        .build();

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .build();

    let (provider, exporter_err) = match exporter {
        Ok(exporter) => (
            SdkTracerProvider::builder()
                .with_resource(resource)
                .with_batch_exporter(exporter)
                .build(),
            None,
        ),
        Err(err) => (
            SdkTracerProvider::builder().with_resource(resource).build(),
            Some(err),
        ),
    };

    let otel_layer = tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE));

    let json = std::env::var("LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json"));
    let fmt_layer = if json {
        tracing_subscriber::fmt::layer().json().boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    if let Some(err) = exporter_err {
        tracing::warn!(%err, "OTLP span exporter unavailable, spans will not be exported");
    }

    provider
}
