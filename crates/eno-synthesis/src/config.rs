//! Synthesizer pod configuration

use std::time::Duration;

/// Default image providing the executor binary injected into synthesizer pods
pub const DEFAULT_EXECUTOR_IMAGE: &str = "mcr.microsoft.com/aks/eno/eno-controller:latest";

/// Default time a scheduled pod may go unobserved by its kubelet
pub const DEFAULT_CONTAINER_CREATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for synthesizer pods created by the lifecycle controller
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesisConfig {
    /// Image providing the executor binary
    pub executor_image: String,
    /// Namespace synthesizer pods are created in
    pub pod_namespace: String,
    /// Service account synthesizer pods run as
    pub pod_service_account: Option<String>,
    /// Taint key tolerated by synthesizer pods
    pub taint_toleration_key: Option<String>,
    /// Taint value tolerated by synthesizer pods
    pub taint_toleration_value: Option<String>,
    /// Node label key synthesizer pods require
    pub node_affinity_key: Option<String>,
    /// Node label value synthesizer pods require
    pub node_affinity_value: Option<String>,
    /// How long a scheduled pod may go without container statuses before it is replaced
    pub container_creation_timeout: Duration,
}

impl Default for SynthesisConfig {
    fn default() -> Self {
        Self {
            executor_image: DEFAULT_EXECUTOR_IMAGE.to_string(),
            pod_namespace: "default".to_string(),
            pod_service_account: None,
            taint_toleration_key: None,
            taint_toleration_value: None,
            node_affinity_key: None,
            node_affinity_value: None,
            container_creation_timeout: DEFAULT_CONTAINER_CREATION_TIMEOUT,
        }
    }
}
