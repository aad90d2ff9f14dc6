//! Composition CRD types
//!
//! A `Composition` is the desired-state object whose resources are produced
//! by running its `Synthesizer`. Each synthesis attempt is tracked in status:
//! `currentSynthesis` is the attempt being worked on (or the latest finished
//! one), `previousSynthesis` the one it superseded.

use std::fmt;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::CLEANUP_FINALIZER;

/// Composition spec: which synthesizer renders this composition
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "Composition",
    plural = "compositions",
    namespaced,
    status = "CompositionStatus",
    printcolumn = r#"{"name":"Synthesizer","type":"string","jsonPath":".spec.synthesizer.name"}"#,
    printcolumn = r#"{"name":"Synthesis","type":"string","jsonPath":".status.currentSynthesis.uuid"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct CompositionSpec {
    /// Reference to the cluster-scoped Synthesizer
    pub synthesizer: SynthesizerRef,
}

/// Reference to a Synthesizer by name
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct SynthesizerRef {
    /// Synthesizer name
    pub name: String,
}

/// Observed state of a Composition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CompositionStatus {
    /// The synthesis in progress, or the most recent completed one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_synthesis: Option<Synthesis>,

    /// The synthesis that `current_synthesis` replaced
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_synthesis: Option<Synthesis>,
}

/// One synthesis attempt
///
/// `attempts`, `podCreation` and `synthesized` are always serialized, even
/// when unset, so field-level JSON patches can `test` and `replace` them.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Synthesis {
    /// Unique identifier of this attempt
    #[serde(default)]
    pub uuid: String,

    /// Number of synthesizer pods created for this attempt
    #[serde(default)]
    pub attempts: i64,

    /// When the most recent synthesizer pod was created
    #[serde(default)]
    pub pod_creation: Option<DateTime<Utc>>,

    /// When synthesis completed; unset while still synthesizing
    #[serde(default)]
    pub synthesized: Option<DateTime<Utc>>,

    /// When every output resource was reconciled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled: Option<DateTime<Utc>>,

    /// When every output resource became ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ready: Option<DateTime<Utc>>,

    /// Composition generation this synthesis was produced for
    #[serde(default)]
    pub observed_composition_generation: i64,

    /// Synthesizer generation this synthesis was produced with
    #[serde(default)]
    pub observed_synthesizer_generation: i64,

    /// Resource slices holding the output of this synthesis
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resource_slices: Vec<ResourceSliceRef>,
}

impl Synthesis {
    /// Whether the synthesizer has finished producing output
    pub fn is_synthesized(&self) -> bool {
        self.synthesized.is_some()
    }
}

/// Reference to a ResourceSlice in the composition's namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub struct ResourceSliceRef {
    /// ResourceSlice name
    pub name: String,
}

/// Namespaced identity of a Composition
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CompositionKey {
    /// Composition namespace
    pub namespace: String,
    /// Composition name
    pub name: String,
}

impl CompositionKey {
    /// Create a key from namespace and name
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CompositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl Composition {
    /// Namespaced key of this composition
    pub fn key(&self) -> CompositionKey {
        CompositionKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Whether a deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }

    /// Generation of the spec, zero when unset
    pub fn generation(&self) -> i64 {
        self.metadata.generation.unwrap_or(0)
    }

    /// The current synthesis, if any
    pub fn current_synthesis(&self) -> Option<&Synthesis> {
        self.status.as_ref()?.current_synthesis.as_ref()
    }

    /// The previous synthesis, if any
    pub fn previous_synthesis(&self) -> Option<&Synthesis> {
        self.status.as_ref()?.previous_synthesis.as_ref()
    }

    /// UUID of the current synthesis, empty when there is none
    pub fn current_synthesis_uuid(&self) -> &str {
        self.current_synthesis()
            .map(|s| s.uuid.as_str())
            .unwrap_or_default()
    }

    /// Whether the given synthesis UUID is still referenced by status
    pub fn references_synthesis(&self, uuid: &str) -> bool {
        self.current_synthesis().is_some_and(|s| s.uuid == uuid)
            || self.previous_synthesis().is_some_and(|s| s.uuid == uuid)
    }

    /// Whether the cleanup finalizer is present
    pub fn has_cleanup_finalizer(&self) -> bool {
        self.finalizers().iter().any(|f| f == CLEANUP_FINALIZER)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    fn sample(uuid: &str) -> Composition {
        let mut comp = Composition::new(
            "app",
            CompositionSpec {
                synthesizer: SynthesizerRef {
                    name: "helm".to_string(),
                },
            },
        );
        comp.metadata.namespace = Some("default".to_string());
        comp.status = Some(CompositionStatus {
            current_synthesis: Some(Synthesis {
                uuid: uuid.to_string(),
                ..Default::default()
            }),
            previous_synthesis: Some(Synthesis {
                uuid: "old".to_string(),
                synthesized: Some(Utc::now()),
                ..Default::default()
            }),
        });
        comp
    }

    #[test]
    fn key_is_namespace_and_name() {
        let comp = sample("u1");
        assert_eq!(comp.key(), CompositionKey::new("default", "app"));
        assert_eq!(comp.key().to_string(), "default/app");
    }

    #[test]
    fn references_current_and_previous() {
        let comp = sample("u1");
        assert!(comp.references_synthesis("u1"));
        assert!(comp.references_synthesis("old"));
        assert!(!comp.references_synthesis("other"));
        assert_eq!(comp.current_synthesis_uuid(), "u1");
    }

    #[test]
    fn deletion_and_finalizer_helpers() {
        let mut comp = sample("u1");
        assert!(!comp.is_deleting());
        assert!(!comp.has_cleanup_finalizer());

        comp.metadata.deletion_timestamp = Some(Time(Utc::now()));
        comp.metadata.finalizers = Some(vec![CLEANUP_FINALIZER.to_string()]);
        assert!(comp.is_deleting());
        assert!(comp.has_cleanup_finalizer());
    }

    /// Fields guarded by the post-creation JSON patch must exist as null
    #[test]
    fn unset_patch_targets_serialize_as_null() {
        let synthesis = Synthesis {
            uuid: "u1".to_string(),
            ..Default::default()
        };
        let value = serde_json::to_value(&synthesis).unwrap();
        assert!(value.get("synthesized").unwrap().is_null());
        assert!(value.get("podCreation").unwrap().is_null());
        assert_eq!(value["attempts"], 0);
        assert!(value.get("reconciled").is_none());
    }
}
