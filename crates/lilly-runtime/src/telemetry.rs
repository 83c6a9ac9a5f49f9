//! Process diagnostics: the global `tracing` subscriber.
//!
//! This is the operator-facing diagnostic channel (reader thread lifecycle,
//! settings resolution, contained logger failures).  Runtime events proper go
//! through [`RuntimeLogger`][crate::logger::RuntimeLogger].
//!
//! | Variable | Effect |
//! |---|---|
//! | `RUST_LOG` | Filter directives; wins over the settings `log_level`. |
//! | `LILLY_LOG_FORMAT=json` | JSON diagnostics even when settings say `text`. |
//! | `OTEL_EXPORTER_OTLP_ENDPOINT` | Export spans over OTLP/HTTP to this collector. |
//!
//! ```rust,no_run
//! use lilly_types::{LogFormat, LogLevel};
//!
//! let _guard = lilly_runtime::telemetry::init_tracing("lilly", LogLevel::Info, LogFormat::Text);
//! ```

use lilly_types::{LogFormat, LogLevel};
use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{Resource, trace::SdkTracerProvider};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global subscriber.
///
/// Diagnostics are written to stderr so they never interleave with runtime
/// records on stdout.  Hold the returned guard until exit; dropping it shuts
/// the OTLP provider down.  Calling this twice keeps the first subscriber.
pub fn init_tracing(service_name: &str, level: LogLevel, format: LogFormat) -> TracerProviderGuard {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_filter_directive()));
    let use_json = format == LogFormat::Json || json_forced();

    let provider = build_provider(service_name);
    let otel_layer = provider
        .as_ref()
        .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer("lilly")));

    let registry = tracing_subscriber::registry().with(env_filter).with(otel_layer);
    let installed = if use_json {
        registry
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = installed {
        eprintln!("[lilly] tracing subscriber already installed: {e}");
    }

    TracerProviderGuard(provider)
}

fn json_forced() -> bool {
    std::env::var("LILLY_LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"))
}

/// Shuts the OTLP provider down on drop, flushing pending spans.
pub struct TracerProviderGuard(Option<SdkTracerProvider>);

impl TracerProviderGuard {
    pub fn is_exporting(&self) -> bool {
        self.0.is_some()
    }
}

impl Drop for TracerProviderGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.0.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("[lilly] OpenTelemetry provider shutdown error: {e}");
            }
        }
    }
}

fn build_provider(service_name: &str) -> Option<SdkTracerProvider> {
    let endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok()?;

    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_http()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| eprintln!("[lilly] OTLP exporter init failed: {e}"))
        .ok()?;

    let resource = Resource::builder()
        .with_service_name(service_name.to_string())
        .build();

    // The heartbeat loop is synchronous, so there is no async runtime for a
    // batch exporter to spawn onto.
    Some(
        SdkTracerProvider::builder()
            .with_resource(resource)
            .with_simple_exporter(exporter)
            .build(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_provider_without_endpoint() {
        // SAFETY: no other test in this crate reads this variable.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        assert!(build_provider("lilly-test").is_none());
    }

    #[test]
    fn empty_guard_drops_quietly() {
        let guard = TracerProviderGuard(None);
        assert!(!guard.is_exporting());
        drop(guard);
    }

    #[test]
    fn init_tracing_twice_does_not_panic() {
        // SAFETY: see above.
        unsafe { std::env::remove_var("OTEL_EXPORTER_OTLP_ENDPOINT") };
        let _first = init_tracing("lilly-test", LogLevel::Debug, LogFormat::Text);
        let _second = init_tracing("lilly-test", LogLevel::Info, LogFormat::Json);
    }
}
