//! Command line configuration for the controller

use std::time::Duration;

use clap::Args;

use eno_common::telemetry::{LogFormat, TelemetryConfig};
use eno_synthesis::config::{DEFAULT_CONTAINER_CREATION_TIMEOUT, DEFAULT_EXECUTOR_IMAGE};
use eno_synthesis::SynthesisConfig;

/// Controller settings; each flag falls back to an `ENO_*` environment variable
#[derive(Args, Debug, Clone, PartialEq)]
pub struct ControllerArgs {
    /// Image providing the executor binary for synthesizer pods
    #[arg(long, env = "ENO_EXECUTOR_IMAGE", default_value = DEFAULT_EXECUTOR_IMAGE)]
    pub executor_image: String,

    /// Namespace synthesizer pods are created in
    #[arg(long, env = "ENO_POD_NAMESPACE", default_value = "default")]
    pub pod_namespace: String,

    /// Service account synthesizer pods run as
    #[arg(long, env = "ENO_POD_SERVICE_ACCOUNT")]
    pub pod_service_account: Option<String>,

    /// Taint key synthesizer pods tolerate
    #[arg(long, env = "ENO_TAINT_TOLERATION_KEY")]
    pub taint_toleration_key: Option<String>,

    /// Taint value synthesizer pods tolerate
    #[arg(long, env = "ENO_TAINT_TOLERATION_VALUE", requires = "taint_toleration_key")]
    pub taint_toleration_value: Option<String>,

    /// Node label key synthesizer pods require
    #[arg(long, env = "ENO_NODE_AFFINITY_KEY")]
    pub node_affinity_key: Option<String>,

    /// Node label value synthesizer pods require
    #[arg(long, env = "ENO_NODE_AFFINITY_VALUE", requires = "node_affinity_key")]
    pub node_affinity_value: Option<String>,

    /// Seconds a scheduled pod may go without container statuses before it is replaced
    #[arg(
        long,
        env = "ENO_CONTAINER_CREATION_TIMEOUT_SECONDS",
        default_value_t = DEFAULT_CONTAINER_CREATION_TIMEOUT.as_secs()
    )]
    pub container_creation_timeout_seconds: u64,

    /// Install or update the eno CRDs on startup
    #[arg(long, env = "ENO_INSTALL_CRDS")]
    pub install_crds: bool,
}

impl ControllerArgs {
    /// Settings for the pod lifecycle controller
    pub fn synthesis_config(&self) -> SynthesisConfig {
        SynthesisConfig {
            executor_image: self.executor_image.clone(),
            pod_namespace: self.pod_namespace.clone(),
            pod_service_account: self.pod_service_account.clone(),
            taint_toleration_key: self.taint_toleration_key.clone(),
            taint_toleration_value: self.taint_toleration_value.clone(),
            node_affinity_key: self.node_affinity_key.clone(),
            node_affinity_value: self.node_affinity_value.clone(),
            container_creation_timeout: Duration::from_secs(
                self.container_creation_timeout_seconds,
            ),
        }
    }
}

/// Logging and export settings
#[derive(Args, Debug, Clone)]
pub struct TelemetryArgs {
    /// Log directives; overrides RUST_LOG
    #[arg(long, env = "ENO_LOG_FILTER")]
    pub log_filter: Option<String>,

    /// Log line encoding: json or text
    #[arg(long, env = "ENO_LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// OTLP gRPC endpoint receiving spans and metrics
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    pub otlp_endpoint: Option<String>,
}

impl TelemetryArgs {
    /// Telemetry settings for a controller running synthesizer pods in `pod_namespace`
    pub fn telemetry_config(&self, pod_namespace: &str) -> TelemetryConfig {
        TelemetryConfig {
            synthesis_pod_namespace: Some(pod_namespace.to_string()),
            otlp_endpoint: self.otlp_endpoint.clone(),
            log_filter: self.log_filter.clone(),
            log_format: self.log_format,
            ..TelemetryConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct TestCli {
        #[command(flatten)]
        args: ControllerArgs,

        #[command(flatten)]
        telemetry: TelemetryArgs,
    }

    fn parse_telemetry(argv: &[&str]) -> Result<TelemetryArgs, clap::Error> {
        let argv = std::iter::once("eno-controller").chain(argv.iter().copied());
        TestCli::try_parse_from(argv).map(|cli| cli.telemetry)
    }

    fn parse(argv: &[&str]) -> Result<ControllerArgs, clap::Error> {
        let argv = std::iter::once("eno-controller").chain(argv.iter().copied());
        TestCli::try_parse_from(argv).map(|cli| cli.args)
    }

    #[test]
    fn defaults_match_synthesis_defaults() {
        let args = parse(&[]).unwrap();
        assert!(!args.install_crds);
        assert_eq!(args.synthesis_config(), SynthesisConfig::default());
    }

    #[test]
    fn flags_flow_into_synthesis_config() {
        let args = parse(&[
            "--pod-namespace",
            "eno-system",
            "--pod-service-account",
            "eno-synth",
            "--taint-toleration-key",
            "dedicated",
            "--taint-toleration-value",
            "eno",
            "--container-creation-timeout-seconds",
            "45",
        ])
        .unwrap();
        let config = args.synthesis_config();
        assert_eq!(config.pod_namespace, "eno-system");
        assert_eq!(config.pod_service_account.as_deref(), Some("eno-synth"));
        assert_eq!(config.taint_toleration_key.as_deref(), Some("dedicated"));
        assert_eq!(config.taint_toleration_value.as_deref(), Some("eno"));
        assert_eq!(config.container_creation_timeout, Duration::from_secs(45));
    }

    #[test]
    fn values_require_their_keys() {
        assert!(parse(&["--node-affinity-value", "synth"]).is_err());
    }

    #[test]
    fn telemetry_flags_reach_the_config() {
        let telemetry = parse_telemetry(&[
            "--log-format",
            "text",
            "--log-filter",
            "eno_synthesis=trace",
            "--otlp-endpoint",
            "http://collector:4317",
        ])
        .unwrap();
        let config = telemetry.telemetry_config("eno-system");
        assert_eq!(config.log_format, LogFormat::Text);
        assert_eq!(config.log_filter.as_deref(), Some("eno_synthesis=trace"));
        assert_eq!(config.otlp_endpoint.as_deref(), Some("http://collector:4317"));
        assert_eq!(config.synthesis_pod_namespace.as_deref(), Some("eno-system"));
    }

    #[test]
    fn unknown_log_format_is_rejected() {
        assert!(parse_telemetry(&["--log-format", "yaml"]).is_err());
    }
}
