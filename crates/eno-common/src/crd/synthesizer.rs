//! Synthesizer CRD types
//!
//! A `Synthesizer` names the container image that renders compositions and
//! bounds how long a synthesizer pod may live.

use std::time::Duration;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Pod timeout applied when a Synthesizer does not set one
pub const DEFAULT_POD_TIMEOUT: Duration = Duration::from_secs(120);

/// Synthesizer spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Synthesizer",
    plural = "synthesizers",
    printcolumn = r#"{"name":"Image","type":"string","jsonPath":".spec.image"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SynthesizerSpec {
    /// Container image that performs synthesis
    pub image: String,

    /// Command run inside the synthesizer image
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,

    /// Maximum lifetime of a synthesizer pod, in seconds
    ///
    /// When set, running pods are also re-checked at this interval.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_timeout_seconds: Option<u64>,

    /// Maximum duration of a single synthesizer execution, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_timeout_seconds: Option<u64>,
}

impl Synthesizer {
    /// Whether a deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Generation of the spec, zero when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// Pod timeout as explicitly configured
    pub fn configured_pod_timeout(&self) -> Option<Duration> {
        self.spec.pod_timeout_seconds.map(Duration::from_secs)
    }

    /// Effective pod timeout, falling back to [`DEFAULT_POD_TIMEOUT`]
    pub fn pod_timeout(&self) -> Duration {
        self.configured_pod_timeout().unwrap_or(DEFAULT_POD_TIMEOUT)
    }

    /// Check the spec can produce a runnable pod
    pub fn validate(&self) -> crate::Result<()> {
        let resource = format!("synthesizer {}", self.name_any());
        if self.spec.image.trim().is_empty() {
            return Err(crate::Error::validation(resource, "spec.image must not be empty"));
        }
        if self.spec.pod_timeout_seconds == Some(0) {
            return Err(crate::Error::validation(
                resource,
                "spec.podTimeoutSeconds must be greater than zero",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pod_timeout_defaults_when_unset() {
        let syn = Synthesizer::new("helm", SynthesizerSpec::default());
        assert_eq!(syn.configured_pod_timeout(), None);
        assert_eq!(syn.pod_timeout(), DEFAULT_POD_TIMEOUT);
    }

    #[test]
    fn pod_timeout_uses_configured_value() {
        let syn = Synthesizer::new(
            "helm",
            SynthesizerSpec {
                image: "example.com/helm:v1".to_string(),
                pod_timeout_seconds: Some(30),
                ..Default::default()
            },
        );
        assert_eq!(syn.configured_pod_timeout(), Some(Duration::from_secs(30)));
        assert_eq!(syn.pod_timeout(), Duration::from_secs(30));
    }

    #[test]
    fn validate_accepts_image_with_timeout() {
        let syn = Synthesizer::new(
            "helm",
            SynthesizerSpec {
                image: "example.com/helm:v1".to_string(),
                pod_timeout_seconds: Some(60),
                ..Default::default()
            },
        );
        assert!(syn.validate().is_ok());
    }

    #[test]
    fn validate_rejects_missing_image_and_zero_timeout() {
        let no_image = Synthesizer::new("helm", SynthesizerSpec::default());
        let err = no_image.validate().unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("synthesizer helm"));

        let zero = Synthesizer::new(
            "helm",
            SynthesizerSpec {
                image: "example.com/helm:v1".to_string(),
                pod_timeout_seconds: Some(0),
                ..Default::default()
            },
        );
        assert!(zero
            .validate()
            .unwrap_err()
            .to_string()
            .contains("podTimeoutSeconds"));
    }
}
