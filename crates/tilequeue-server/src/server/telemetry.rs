//! # Telemetry
//!
//! Logging is always on: a `tracing_subscriber::fmt` layer writes to stderr,
//! filtered by `RUST_LOG` (default `info`). Stdout stays free because pool
//! workers use it as their control channel.
//!
//! OpenTelemetry export is opt-in:
//!
//! - `traces`: exports the per-request `dispatch` spans.
//! - `metrics`: exports the counters and histograms below.
//! - `stdout`: the stdout exporter, skipped in workers. Needs `traces` or
//!   `metrics`.
//!
//! ```bash
//! cargo run -p tilequeue-server --features traces,metrics,stdout -- serve
//! ```
//!
//! Metric helpers compile to no-ops without `metrics`, so call sites never
//! need a `cfg`.

#[cfg(all(feature = "stdout", not(any(feature = "traces", feature = "metrics"))))]
compile_error!("The 'stdout' feature requires at least one of 'traces' or 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::metrics::{Counter, Histogram, Meter, UpDownCounter};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::metrics as sdkmetrics;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry::{InstrumentationScope, KeyValue};
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_sdk::Resource;
#[cfg(any(feature = "metrics", feature = "traces"))]
use opentelemetry_semantic_conventions as semvcns;

#[cfg(feature = "traces")]
use opentelemetry::trace::TracerProvider;
#[cfg(feature = "traces")]
use opentelemetry_sdk::propagation::TraceContextPropagator;
#[cfg(feature = "traces")]
use opentelemetry_sdk::trace as sdktrace;

pub struct TelemetryProviders {
    #[cfg(feature = "traces")]
    pub tracer_provider: sdktrace::SdkTracerProvider,
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and shuts down the exporters. Logging stays up.
    pub fn shutdown(&self) {
        #[cfg(feature = "traces")]
        {
            if let Err(err) = self.tracer_provider.force_flush() {
                eprintln!("Error flushing traces: {err:#?}");
            }
            if let Err(err) = self.tracer_provider.shutdown() {
                eprintln!("Error shutting down tracer: {err:#?}");
            }
        }

        #[cfg(feature = "metrics")]
        {
            if let Err(err) = self.meter_provider.force_flush() {
                eprintln!("Error flushing metrics: {err:#?}");
            }
            if let Err(err) = self.meter_provider.shutdown() {
                eprintln!("Error shutting down meter: {err:#?}");
            }
        }
    }
}

/// Installs the global subscriber. `role` is stamped on the OpenTelemetry
/// resource so master, dispatcher and worker telemetry can be told apart.
pub fn init_telemetry(role: &'static str) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "traces")]
    opentelemetry::global::set_text_map_propagator(TraceContextPropagator::new());

    #[cfg(feature = "traces")]
    let tracer_provider = init_tracer(role)?;

    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics(role)?;

    #[cfg(any(feature = "metrics", feature = "traces"))]
    let scope = InstrumentationScope::builder("tilequeue")
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_schema_url(semvcns::SCHEMA_URL)
        .build();

    #[cfg(not(any(feature = "metrics", feature = "traces")))]
    let _ = role;

    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_thread_ids(true)
                .with_line_number(true)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339())
                .with_file(true),
        );

    #[cfg(feature = "traces")]
    let registry = {
        opentelemetry::global::set_tracer_provider(tracer_provider.clone());
        registry.with(
            tracing_opentelemetry::layer()
                .with_tracer(tracer_provider.tracer_with_scope(scope.clone()))
                .with_error_records_to_exceptions(true),
        )
    };

    #[cfg(feature = "metrics")]
    let registry = {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let meter = opentelemetry::global::meter_with_scope(scope);
        init_metric_handles(&meter);

        registry.with(tracing_opentelemetry::MetricsLayer::new(
            meter_provider.clone(),
        ))
    };

    registry.init();

    Ok(TelemetryProviders {
        #[cfg(feature = "traces")]
        tracer_provider,
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "stdout")]
const WORKER_ROLE: &str = "worker";

#[cfg(any(feature = "metrics", feature = "traces"))]
fn resource(role: &'static str) -> Resource {
    Resource::builder()
        .with_service_name("tilequeue")
        .with_schema_url(
            [
                KeyValue::new(semvcns::resource::SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
                KeyValue::new("tilequeue.role", role),
            ],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(role: &'static str) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource(role));

    // A worker's stdout is its control channel.
    #[cfg(feature = "stdout")]
    let builder = if role == WORKER_ROLE {
        builder
    } else {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = opentelemetry_sdk::metrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    Ok(builder.build())
}

#[cfg(feature = "traces")]
fn init_tracer(role: &'static str) -> anyhow::Result<sdktrace::SdkTracerProvider> {
    let builder = sdktrace::SdkTracerProvider::builder().with_resource(resource(role));

    #[cfg(feature = "stdout")]
    let builder = if role == WORKER_ROLE {
        builder
    } else {
        use opentelemetry_stdout::SpanExporter;
        let exporter = SpanExporter::default();
        let batch = sdktrace::BatchSpanProcessor::builder(exporter)
            .with_batch_config(
                sdktrace::BatchConfigBuilder::default()
                    .with_scheduled_delay(std::time::Duration::from_secs(5))
                    .with_max_queue_size(2048)
                    .build(),
            )
            .build();
        builder.with_span_processor(batch)
    };

    Ok(builder.build())
}

#[cfg(feature = "metrics")]
static REQUESTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUED: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static IN_FLIGHT: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static BACKEND_ERRORS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static DISCONNECTS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static QUEUE_WAIT_MS: OnceLock<Histogram<f64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WORKER_RESPAWNS: OnceLock<Counter<u64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: &Meter) {
    let _ = REQUESTS.set(
        meter
            .u64_counter("requests")
            .with_description("Requests received by the dispatcher")
            .build(),
    );

    let _ = QUEUED.set(
        meter
            .i64_up_down_counter("requests_queued")
            .with_description("Requests waiting for an admission slot")
            .build(),
    );

    let _ = IN_FLIGHT.set(
        meter
            .i64_up_down_counter("requests_inflight")
            .with_description("Requests holding an admission slot")
            .build(),
    );

    let _ = BACKEND_ERRORS.set(
        meter
            .u64_counter("backend_errors")
            .with_description("Forwards that failed to reach the backend")
            .build(),
    );

    let _ = DISCONNECTS.set(
        meter
            .u64_counter("client_disconnects")
            .with_description("Requests abandoned by their client")
            .build(),
    );

    let _ = QUEUE_WAIT_MS.set(
        meter
            .f64_histogram("queue_wait")
            .with_unit("ms")
            .with_description("Time from arrival to admission")
            .build(),
    );

    let _ = WORKER_RESPAWNS.set(
        meter
            .u64_counter("worker_respawns")
            .with_description("Workers replaced after exiting")
            .build(),
    );
}

#[cfg(feature = "metrics")]
pub fn increment_requests() {
    if let Some(counter) = REQUESTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_requests() {}

#[cfg(feature = "metrics")]
pub fn add_queued(delta: i64) {
    if let Some(counter) = QUEUED.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_queued(_delta: i64) {}

#[cfg(feature = "metrics")]
pub fn add_inflight(delta: i64) {
    if let Some(counter) = IN_FLIGHT.get() {
        counter.add(delta, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn add_inflight(_delta: i64) {}

#[cfg(feature = "metrics")]
pub fn increment_backend_errors() {
    if let Some(counter) = BACKEND_ERRORS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_backend_errors() {}

#[cfg(feature = "metrics")]
pub fn increment_disconnects() {
    if let Some(counter) = DISCONNECTS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_disconnects() {}

#[cfg(feature = "metrics")]
pub fn record_queue_wait(duration_ms: f64) {
    if let Some(histogram) = QUEUE_WAIT_MS.get() {
        histogram.record(duration_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_queue_wait(_duration_ms: f64) {}

#[cfg(feature = "metrics")]
pub fn increment_worker_respawns() {
    if let Some(counter) = WORKER_RESPAWNS.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_worker_respawns() {}
