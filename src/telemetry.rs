//! Logging and trace export for the treesync processes.
//!
//! The sink is picked from `OTEL_EXPORTER_OTLP_ENDPOINT`:
//!
//! | value          | sink                                             |
//! |----------------|--------------------------------------------------|
//! | unset or empty | compact lines on stderr                          |
//! | `stderr`       | one JSON object per event on stderr              |
//! | anything else  | OTLP over HTTP (needs the `otel` feature)        |
//!
//! Filtering follows `RUST_LOG`; without it treesync's own crates log at
//! `info` and dependencies at `warn`. Each process reports its role
//! (`relay`, `writer`, `replica`, `serve`) as `service.role` so spans from
//! a split deployment can be told apart.

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt as _;
use tracing_subscriber::util::SubscriberInitExt as _;

const DEFAULT_FILTER: &str = "treesync=info,treesync_git=info,treesync_cli=info,warn";

/// Where log events go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sink {
    Compact,
    Json,
    Otlp(String),
}

impl Sink {
    /// Interpret the value of `OTEL_EXPORTER_OTLP_ENDPOINT`.
    #[must_use]
    pub fn from_endpoint(endpoint: Option<&str>) -> Self {
        match endpoint.map(str::trim) {
            None | Some("") => Self::Compact,
            Some(v) if v.eq_ignore_ascii_case("stderr") => Self::Json,
            Some(v) => Self::Otlp(v.to_owned()),
        }
    }

    fn from_env() -> Self {
        Self::from_endpoint(std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok().as_deref())
    }
}

/// Flushes and shuts down the OTLP pipeline on drop. Keep it alive in
/// `main` for the life of the process.
#[derive(Default)]
pub struct TelemetryGuard {
    #[cfg(feature = "otel")]
    providers: Option<OtlpProviders>,
}

#[cfg(feature = "otel")]
struct OtlpProviders {
    traces: opentelemetry_sdk::trace::SdkTracerProvider,
    logs: opentelemetry_sdk::logs::SdkLoggerProvider,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        #[cfg(feature = "otel")]
        {
            if let Some(p) = self.providers.take() {
                if let Err(e) = p.traces.shutdown() {
                    eprintln!("treesync: trace export shutdown failed: {e}");
                }
                if let Err(e) = p.logs.shutdown() {
                    eprintln!("treesync: log export shutdown failed: {e}");
                }
            }
        }
    }
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER))
}

/// Install the global subscriber for a process running as `role`.
///
/// Installing twice is harmless: the second call leaves the first
/// subscriber in place.
#[must_use]
pub fn init(role: &'static str) -> TelemetryGuard {
    match Sink::from_env() {
        Sink::Compact => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .compact()
                        .with_writer(std::io::stderr),
                )
                .try_init();
            TelemetryGuard::default()
        }
        Sink::Json => {
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_current_span(true)
                        .with_writer(std::io::stderr)
                        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE),
                )
                .try_init();
            TelemetryGuard::default()
        }
        #[cfg(feature = "otel")]
        Sink::Otlp(endpoint) => otlp::init(role, &endpoint),
        #[cfg(not(feature = "otel"))]
        Sink::Otlp(endpoint) => {
            eprintln!(
                "treesync: OTLP endpoint {endpoint} ignored ({role} built without the 'otel' feature)"
            );
            let _ = tracing_subscriber::registry()
                .with(env_filter())
                .with(tracing_subscriber::fmt::layer().compact().with_writer(std::io::stderr))
                .try_init();
            TelemetryGuard::default()
        }
    }
}

#[cfg(feature = "otel")]
mod otlp {
    use opentelemetry::KeyValue;
    use opentelemetry::propagation::TextMapPropagator as _;
    use opentelemetry::trace::TracerProvider as _;
    use opentelemetry_sdk::Resource;
    use opentelemetry_sdk::logs::SdkLoggerProvider;
    use opentelemetry_sdk::propagation::TraceContextPropagator;
    use opentelemetry_sdk::trace::SdkTracerProvider;
    use tracing_subscriber::layer::SubscriberExt as _;
    use tracing_subscriber::util::SubscriberInitExt as _;

    use super::{OtlpProviders, TelemetryGuard, env_filter};

    /// Batch exporters run on their own threads, so the blocking HTTP
    /// client never lands on a tokio worker. The SDK reads the endpoint
    /// from the environment and appends `/v1/traces` and `/v1/logs`.
    pub(super) fn init(role: &'static str, endpoint: &str) -> TelemetryGuard {
        let spans = match opentelemetry_otlp::SpanExporter::builder().with_http().build() {
            Ok(e) => e,
            Err(e) => {
                eprintln!("treesync: OTLP span export to {endpoint} disabled: {e}");
                return TelemetryGuard::default();
            }
        };
        let logs = match opentelemetry_otlp::LogExporter::builder().with_http().build() {
            Ok(e) => e,
            Err(e) => {
                eprintln!("treesync: OTLP log export to {endpoint} disabled: {e}");
                return TelemetryGuard::default();
            }
        };

        let resource = Resource::builder()
            .with_attribute(KeyValue::new("service.name", "treesync"))
            .with_attribute(KeyValue::new("service.version", env!("CARGO_PKG_VERSION")))
            .with_attribute(KeyValue::new("service.role", role))
            .build();
        let traces = SdkTracerProvider::builder()
            .with_batch_exporter(spans)
            .with_resource(resource.clone())
            .build();
        let logs = SdkLoggerProvider::builder()
            .with_batch_exporter(logs)
            .with_resource(resource)
            .build();

        let _ = tracing_subscriber::registry()
            .with(env_filter())
            .with(tracing_opentelemetry::layer().with_tracer(traces.tracer("treesync")))
            .with(opentelemetry_appender_tracing::layer::OpenTelemetryTracingBridge::new(&logs))
            .try_init();
        join_remote_trace();

        TelemetryGuard {
            providers: Some(OtlpProviders { traces, logs }),
        }
    }

    /// A `TRACEPARENT` from the launching process becomes the parent of
    /// every root span here.
    fn join_remote_trace() {
        let Ok(traceparent) = std::env::var("TRACEPARENT") else {
            return;
        };
        let carrier = std::collections::HashMap::from([("traceparent".to_owned(), traceparent)]);
        let cx = TraceContextPropagator::new().extract(&carrier);
        // Held for the life of the process.
        std::mem::forget(cx.attach());
    }
}
