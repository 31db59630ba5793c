// Telemetry module for structured logging, metrics, and tracing

use anyhow::Result;
use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::{
    trace::{RandomIdGenerator, Sampler, TracerProvider},
    Resource,
};
use std::net::SocketAddr;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use crate::models::{StepOutcome, StepType};

/// Initialize structured logging with JSON formatting and trace context
///
/// RUST_LOG overrides the configured level. When a tracing endpoint is
/// given, spans are also exported over OTLP.
#[tracing::instrument(skip_all)]
pub fn init_logging(
    service_name: &'static str,
    log_level: &str,
    tracing_endpoint: Option<&str>,
) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to create env filter: {}", e))?;

    let json_layer = fmt::layer()
        .json()
        .with_current_span(true)
        .with_span_list(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_filter(env_filter);

    let registry = tracing_subscriber::registry().with(json_layer);

    if let Some(endpoint) = tracing_endpoint {
        let tracer = init_tracer(service_name, endpoint)?;
        let telemetry_layer = tracing_opentelemetry::layer().with_tracer(tracer);
        registry
            .with(telemetry_layer)
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    } else {
        registry
            .try_init()
            .map_err(|e| anyhow::anyhow!("Failed to initialize tracing subscriber: {}", e))?;
    }

    tracing::info!(
        service = service_name,
        log_level = log_level,
        tracing_endpoint = tracing_endpoint,
        "Structured logging initialized"
    );

    Ok(())
}

/// Initialize OpenTelemetry tracer with OTLP exporter
#[tracing::instrument(skip_all)]
fn init_tracer(
    service_name: &'static str,
    endpoint: &str,
) -> Result<opentelemetry_sdk::trace::Tracer> {
    use opentelemetry_sdk::runtime::Tokio;

    let exporter = opentelemetry_otlp::new_exporter()
        .tonic()
        .with_endpoint(endpoint)
        .build_span_exporter()
        .map_err(|e| anyhow::anyhow!("Failed to build span exporter: {}", e))?;

    let tracer_provider = TracerProvider::builder()
        .with_batch_exporter(exporter, Tokio)
        .with_config(
            opentelemetry_sdk::trace::Config::default()
                .with_sampler(Sampler::AlwaysOn)
                .with_id_generator(RandomIdGenerator::default())
                .with_resource(Resource::new(vec![
                    KeyValue::new("service.name", service_name),
                    KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
                ])),
        )
        .build();

    global::set_tracer_provider(tracer_provider.clone());
    let tracer = tracer_provider.tracer(service_name);

    tracing::info!(endpoint = endpoint, "OpenTelemetry tracer initialized");

    Ok(tracer)
}

/// Shutdown OpenTelemetry tracer provider
///
/// This should be called on graceful shutdown to flush remaining spans
pub fn shutdown_tracer() {
    global::shutdown_tracer_provider();
}

/// Initialize Prometheus metrics exporter and describe the step metrics
#[tracing::instrument(skip_all)]
pub fn init_metrics(metrics_port: u16) -> Result<()> {
    let addr: SocketAddr = format!("0.0.0.0:{}", metrics_port)
        .parse()
        .map_err(|e| anyhow::anyhow!("Invalid metrics port: {}", e))?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| anyhow::anyhow!("Failed to install Prometheus exporter: {}", e))?;

    describe_counter!(
        "step_attempt_total",
        "Total number of finished step attempts by step type and result"
    );
    describe_histogram!(
        "step_attempt_duration_seconds",
        "Duration of step attempts in seconds"
    );
    describe_counter!(
        "step_status_poll_total",
        "Total number of remote status polls"
    );
    describe_counter!(
        "step_remote_cancel_failed_total",
        "Remote cancellations that failed and may have left an operation running"
    );

    tracing::info!(
        metrics_port = metrics_port,
        "Prometheus metrics exporter initialized"
    );

    Ok(())
}

/// Record a finished step attempt
#[inline]
pub fn record_attempt(step_type: StepType, outcome: StepOutcome, duration_seconds: f64) {
    counter!(
        "step_attempt_total",
        "step_type" => step_type.as_str(),
        "result" => outcome.to_string()
    )
    .increment(1);
    histogram!("step_attempt_duration_seconds", "step_type" => step_type.as_str())
        .record(duration_seconds);
}

#[inline]
pub fn record_status_poll(step_type: StepType) {
    counter!("step_status_poll_total", "step_type" => step_type.as_str()).increment(1);
}

#[inline]
pub fn record_remote_cancel_failure(step_type: StepType) {
    counter!("step_remote_cancel_failed_total", "step_type" => step_type.as_str()).increment(1);
}
