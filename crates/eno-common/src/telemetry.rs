//! Logging and OpenTelemetry export for the eno controller
//!
//! Logs go to stdout as JSON (or plain text for local runs). When an OTLP
//! endpoint is configured, reconcile spans and the lifecycle counters in
//! [`crate::metrics`] are pushed to it as well.

use std::str::FromStr;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry::{global, KeyValue};
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::metrics::{PeriodicReader, SdkMeterProvider};
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use opentelemetry_semantic_conventions::resource::{
    SERVICE_INSTANCE_ID, SERVICE_NAME, SERVICE_VERSION,
};
use thiserror::Error;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log directives used when neither the config nor `RUST_LOG` provides any
pub const DEFAULT_LOG_FILTER: &str =
    "info,eno_synthesis=debug,eno_reconstitution=debug,kube_runtime=warn,kube_client=warn";

/// Resource attribute naming the namespace synthesizer pods run in
pub const POD_NAMESPACE_ATTRIBUTE: &str = "eno.synthesis.pod_namespace";

/// Errors raised while installing telemetry
#[derive(Debug, Error)]
pub enum TelemetryError {
    /// The log filter did not parse
    #[error("invalid log filter {filter:?}: {message}")]
    Filter {
        /// Directives as given
        filter: String,
        /// Parser message
        message: String,
    },

    /// Unknown log format name
    #[error("unknown log format {0:?}, expected json or text")]
    Format(String),

    /// An OTLP exporter could not be built
    #[error("failed to build OTLP {signal} exporter: {message}")]
    Exporter {
        /// "span" or "metric"
        signal: &'static str,
        /// Exporter message
        message: String,
    },

    /// A global subscriber was already installed
    #[error("failed to install tracing subscriber: {0}")]
    Subscriber(String),
}

/// Log line encoding
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line
    #[default]
    Json,
    /// Human readable lines
    Text,
}

impl FromStr for LogFormat {
    type Err = TelemetryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(Self::Json),
            "text" => Ok(Self::Text),
            _ => Err(TelemetryError::Format(s.to_string())),
        }
    }
}

/// Telemetry settings for the controller process
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Reported as `service.name`
    pub service_name: String,
    /// Replica identity, reported as `service.instance.id`
    pub instance: Option<String>,
    /// Namespace synthesizer pods run in
    pub synthesis_pod_namespace: Option<String>,
    /// OTLP gRPC endpoint; logs only when unset
    pub otlp_endpoint: Option<String>,
    /// Log directives, taking precedence over `RUST_LOG`
    pub log_filter: Option<String>,
    /// Log line encoding
    pub log_format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "eno-controller".to_string(),
            instance: std::env::var("POD_NAME").ok(),
            synthesis_pod_namespace: None,
            otlp_endpoint: std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").ok(),
            log_filter: None,
            log_format: LogFormat::default(),
        }
    }
}

/// Flushes exporters when dropped; hold it for the life of the process
#[must_use = "dropping the guard shuts telemetry export down"]
pub struct TelemetryGuard {
    tracer_provider: Option<TracerProvider>,
    meter_provider: Option<SdkMeterProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush spans: {e}");
            }
        }
        if let Some(provider) = self.meter_provider.take() {
            if let Err(e) = provider.shutdown() {
                eprintln!("failed to flush metrics: {e}");
            }
        }
    }
}

/// Install the global subscriber and, when configured, OTLP export
pub fn init_telemetry(config: &TelemetryConfig) -> Result<TelemetryGuard, TelemetryError> {
    let filter = log_filter(config.log_filter.as_deref(), std::env::var("RUST_LOG").ok())?;

    let (tracer_provider, meter_provider) = match &config.otlp_endpoint {
        Some(endpoint) => {
            let resource = resource(config);
            (
                Some(span_pipeline(endpoint, resource.clone())?),
                Some(metric_pipeline(endpoint, resource)?),
            )
        }
        None => (None, None),
    };

    let fmt_layer = match config.log_format {
        LogFormat::Json => tracing_subscriber::fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(false)
            .boxed(),
        LogFormat::Text => tracing_subscriber::fmt::layer().with_target(true).boxed(),
    };
    let otel_layer = tracer_provider
        .as_ref()
        .map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer("eno")));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .with(otel_layer)
        .try_init()
        .map_err(|e| TelemetryError::Subscriber(e.to_string()))?;

    if let Some(provider) = &meter_provider {
        global::set_meter_provider(provider.clone());
    }

    Ok(TelemetryGuard {
        tracer_provider,
        meter_provider,
    })
}

/// Resolve log directives: explicit config, then `RUST_LOG`, then the default
fn log_filter(explicit: Option<&str>, from_env: Option<String>) -> Result<EnvFilter, TelemetryError> {
    let directives = explicit
        .map(str::to_string)
        .or(from_env.filter(|s| !s.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());
    EnvFilter::try_new(&directives).map_err(|e| TelemetryError::Filter {
        filter: directives.clone(),
        message: e.to_string(),
    })
}

fn resource(config: &TelemetryConfig) -> Resource {
    let mut attributes = vec![
        KeyValue::new(SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(SERVICE_VERSION, env!("CARGO_PKG_VERSION")),
    ];
    if let Some(instance) = &config.instance {
        attributes.push(KeyValue::new(SERVICE_INSTANCE_ID, instance.clone()));
    }
    if let Some(namespace) = &config.synthesis_pod_namespace {
        attributes.push(KeyValue::new(POD_NAMESPACE_ATTRIBUTE, namespace.clone()));
    }
    Resource::new(attributes)
}

fn span_pipeline(endpoint: &str, resource: Resource) -> Result<TracerProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "span",
            message: e.to_string(),
        })?;
    Ok(TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(resource)
        .build())
}

fn metric_pipeline(endpoint: &str, resource: Resource) -> Result<SdkMeterProvider, TelemetryError> {
    let exporter = opentelemetry_otlp::MetricExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .map_err(|e| TelemetryError::Exporter {
            signal: "metric",
            message: e.to_string(),
        })?;
    let reader = PeriodicReader::builder(exporter, runtime::Tokio).build();
    Ok(SdkMeterProvider::builder()
        .with_reader(reader)
        .with_resource(resource)
        .build())
}
