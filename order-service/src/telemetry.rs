//! Process-wide observability sinks.
//!
//! Both sinks are built once in `main` and handed to the pipeline and handlers
//! explicitly. [`Metrics`] owns its own Prometheus registry rather than the
//! crate-global default one, and [`init_tracing`] returns a guard that flushes
//! exported spans when the process stops.

use std::time::Duration;

use anyhow::Result;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::SERVICE_NAME;

const DEFAULT_LOG_FILTER: &str = "order_service=info,tower_http=info";

#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    requests_total: IntCounterVec,
    request_duration: HistogramVec,
    orders_created: IntCounter,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            Opts::new("order_service_requests_total", "Total number of requests"),
            &["method", "endpoint", "status_code"],
        )?;
        let request_duration = HistogramVec::new(
            HistogramOpts::new("order_service_request_duration_seconds", "Request duration in seconds"),
            &["method", "endpoint"],
        )?;
        let orders_created = IntCounter::new("order_service_orders_created_total", "Total number of orders created")?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;
        registry.register(Box::new(orders_created.clone()))?;

        Ok(Self {
            registry,
            requests_total,
            request_duration,
            orders_created,
        })
    }

    pub fn observe_request(&self, method: &str, endpoint: &str, status_code: u16, elapsed: Duration) {
        let status_code = status_code.to_string();
        self.requests_total
            .with_label_values(&[method, endpoint, status_code.as_str()])
            .inc();
        self.request_duration
            .with_label_values(&[method, endpoint])
            .observe(elapsed.as_secs_f64());
    }

    pub fn order_created(&self) {
        self.orders_created.inc();
    }

    pub fn content_type(&self) -> String {
        TextEncoder::new().format_type().to_string()
    }

    /// Prometheus text exposition of everything in the registry.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Keeps the span exporter alive; call [`TracingGuard::shutdown`] before exit.
pub struct TracingGuard {
    provider: Option<TracerProvider>,
}

impl TracingGuard {
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                error!("Error shutting down tracer provider: {}", e);
            }
        }
    }
}

/// Installs the global subscriber: env-filtered console logs plus, when an
/// endpoint is configured, OTLP span export.
pub fn init_tracing(otlp_endpoint: &str, version: &str) -> TracingGuard {
    let (provider, export_error) = if otlp_endpoint.is_empty() {
        (None, None)
    } else {
        match build_tracer_provider(otlp_endpoint, version) {
            Ok(provider) => (Some(provider), None),
            Err(e) => (None, Some(e)),
        }
    };

    let otel_layer = provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(SERVICE_NAME)));

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()))
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
        .init();

    match (&provider, export_error) {
        (Some(_), _) => info!("Exporting spans to {}", otlp_endpoint),
        (None, Some(e)) => warn!("Failed to create OTLP exporter, spans will not be exported: {:#}", e),
        (None, None) => info!("Span export disabled"),
    }

    TracingGuard { provider }
}

fn build_tracer_provider(endpoint: &str, version: &str) -> Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new(vec![
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", version.to_string()),
        ]))
        .build();

    Ok(provider)
}
