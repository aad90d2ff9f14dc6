//! ResourceSlice CRD types
//!
//! A `ResourceSlice` holds one batch of serialized manifests produced by a
//! synthesis. A synthesis may spread its output over several slices.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// ResourceSlice spec
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "eno.azure.io",
    version = "v1",
    kind = "ResourceSlice",
    plural = "resourceslices",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSliceSpec {
    /// Serialized output resources, addressed by their index
    #[serde(default)]
    pub resources: Vec<Manifest>,
}

/// One serialized resource
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct Manifest {
    /// JSON encoded Kubernetes object
    pub manifest: String,

    /// The resource was removed by a newer synthesis and should be deleted
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub deleted: bool,
}

impl ResourceSlice {
    /// Whether a deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.metadata.deletion_timestamp.is_some()
    }
}
