//! # Telemetry Features
//!
//! Logging is always on: `tracing` events are formatted by
//! `tracing_subscriber::fmt` and written to stderr. Worker processes use their
//! stdout for the control protocol, so nothing else may write there.
//!
//! ## Feature matrix
//!
//! - `metrics`: Enables OpenTelemetry metrics for pool lifecycle events.
//! - `stdout`: Enables the stdout metrics exporter.
//!
//! Metrics are recorded by the supervisor only.
//!
//! ## Example usage
//!
//! ```bash
//! RUST_LOG=debug cargo run --features metrics,stdout
//! ```

// Disallow using `stdout` without `metrics`
#[cfg(all(feature = "stdout", not(feature = "metrics")))]
compile_error!("The 'stdout' feature requires 'metrics' to be enabled.");

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "metrics")]
use opentelemetry::{
    InstrumentationScope, KeyValue,
    metrics::{Counter, Histogram, Meter, UpDownCounter},
};
#[cfg(feature = "metrics")]
use opentelemetry_sdk::{Resource, metrics as sdkmetrics};
#[cfg(feature = "metrics")]
use opentelemetry_semantic_conventions as semvcns;
#[cfg(feature = "metrics")]
use std::sync::OnceLock;

pub struct TelemetryProviders {
    #[cfg(feature = "metrics")]
    pub meter_provider: sdkmetrics::SdkMeterProvider,
}

impl TelemetryProviders {
    /// Flushes and stops the exporters. Errors are printed, not returned, so
    /// a failing exporter never changes the exit code.
    pub fn shutdown(self) {
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

/// Which side of the pool this process is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker,
}

impl Role {
    const fn as_str(self) -> &'static str {
        match self {
            Self::Supervisor => "supervisor",
            Self::Worker => "worker",
        }
    }
}

/// Installs the global subscriber, and the meter provider for the supervisor.
pub fn init_telemetry(role: Role) -> anyhow::Result<TelemetryProviders> {
    #[cfg(feature = "metrics")]
    let meter_provider = init_metrics(role)?;

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(false)
                .with_timer(tracing_subscriber::fmt::time::ChronoLocal::rfc_3339()),
        )
        .try_init()?;

    #[cfg(feature = "metrics")]
    {
        opentelemetry::global::set_meter_provider(meter_provider.clone());
        let scope = InstrumentationScope::builder("forkpool")
            .with_version(env!("CARGO_PKG_VERSION"))
            .with_schema_url(semvcns::SCHEMA_URL)
            .build();
        init_metric_handles(opentelemetry::global::meter_with_scope(scope));
    }

    tracing::debug!("Telemetry initialised for the {}", role.as_str());

    Ok(TelemetryProviders {
        #[cfg(feature = "metrics")]
        meter_provider,
    })
}

#[cfg(feature = "metrics")]
fn resource() -> Resource {
    Resource::builder()
        .with_service_name("forkpool")
        .with_schema_url(
            [KeyValue::new(
                semvcns::resource::SERVICE_VERSION,
                env!("CARGO_PKG_VERSION"),
            )],
            semvcns::SCHEMA_URL,
        )
        .build()
}

#[cfg(feature = "metrics")]
fn init_metrics(role: Role) -> anyhow::Result<sdkmetrics::SdkMeterProvider> {
    let builder = sdkmetrics::SdkMeterProvider::builder().with_resource(resource());

    // A worker's stdout carries the control protocol.
    if role == Role::Worker {
        return Ok(builder.build());
    }

    #[cfg(feature = "stdout")]
    let builder = {
        use opentelemetry_stdout::MetricExporter;
        let exporter = MetricExporter::default();
        let reader = sdkmetrics::PeriodicReader::builder(exporter)
            .with_interval(std::time::Duration::from_secs(5))
            .build();

        builder.with_reader(reader)
    };

    Ok(builder.build())
}

// Metric handles - only compiled when metrics feature is enabled
#[cfg(feature = "metrics")]
static WORKERS_SPAWNED: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WORKERS_LIVE: OnceLock<UpDownCounter<i64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WORKER_EXITS: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static SPAWN_FAILURES: OnceLock<Counter<u64>> = OnceLock::new();
#[cfg(feature = "metrics")]
static WORKER_LIFETIME_MS: OnceLock<Histogram<f64>> = OnceLock::new();

#[cfg(feature = "metrics")]
fn init_metric_handles(meter: Meter) {
    let _ = WORKERS_SPAWNED.set(
        meter
            .u64_counter("workers_spawned")
            .with_description("Worker processes launched, including replacements")
            .build(),
    );

    let _ = WORKERS_LIVE.set(
        meter
            .i64_up_down_counter("workers_live")
            .with_description("Worker processes currently running")
            .build(),
    );

    let _ = WORKER_EXITS.set(
        meter
            .u64_counter("worker_exits")
            .with_description("Worker process exits, by whether the supervisor asked for them")
            .build(),
    );

    let _ = SPAWN_FAILURES.set(
        meter
            .u64_counter("spawn_failures")
            .with_description("Workers that could not be launched or missed their startup deadline")
            .build(),
    );

    let _ = WORKER_LIFETIME_MS.set(
        meter
            .f64_histogram("worker_lifetime")
            .with_unit("ms")
            .with_description("Time from launch to exit of a worker process")
            .build(),
    );
}

// Convenience functions that compile to no-ops when metrics are disabled
#[cfg(feature = "metrics")]
pub fn increment_workers_spawned() {
    if let Some(counter) = WORKERS_SPAWNED.get() {
        counter.add(1, &[]);
    }
    if let Some(counter) = WORKERS_LIVE.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_workers_spawned() {}

#[cfg(feature = "metrics")]
pub fn record_worker_exit(was_requested: bool, lifetime_ms: Option<f64>) {
    if let Some(counter) = WORKER_EXITS.get() {
        counter.add(1, &[KeyValue::new("requested", was_requested)]);
    }
    if let Some(counter) = WORKERS_LIVE.get() {
        counter.add(-1, &[]);
    }
    if let (Some(histogram), Some(lifetime_ms)) = (WORKER_LIFETIME_MS.get(), lifetime_ms) {
        histogram.record(lifetime_ms, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn record_worker_exit(_was_requested: bool, _lifetime_ms: Option<f64>) {}

#[cfg(feature = "metrics")]
pub fn increment_spawn_failures() {
    if let Some(counter) = SPAWN_FAILURES.get() {
        counter.add(1, &[]);
    }
}

#[cfg(not(feature = "metrics"))]
pub fn increment_spawn_failures() {}
