//! Synthesized resource model
//!
//! A [`Resource`] is one manifest from a `ResourceSlice`, decoded and
//! annotated with everything the cache indexes on.

use std::fmt;

use kube::api::DynamicObject;
use kube::ResourceExt;
use serde_json::Value;

use eno_common::crd::{CompositionKey, ResourceSlice};
use eno_common::READINESS_GROUP_ANNOTATION;

use crate::error::ReconstitutionError;

/// API group of CustomResourceDefinition
const APIEXTENSIONS_GROUP: &str = "apiextensions.k8s.io";

/// A Kubernetes API group and kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct GroupKind {
    /// API group, empty for the core group
    pub group: String,
    /// Kind
    pub kind: String,
}

impl GroupKind {
    /// Create a group/kind pair
    pub fn new(group: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            kind: kind.into(),
        }
    }
}

impl fmt::Display for GroupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(&self.kind)
        } else {
            write!(f, "{}.{}", self.kind, self.group)
        }
    }
}

/// A Kubernetes API group, version and kind
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Gvk {
    /// API group, empty for the core group
    pub group: String,
    /// API version
    pub version: String,
    /// Kind
    pub kind: String,
}

impl Gvk {
    /// Split an `apiVersion` such as `apps/v1` or `v1` into group and version
    pub fn from_api_version(api_version: &str, kind: impl Into<String>) -> Self {
        let (group, version) = match api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", api_version),
        };
        Self {
            group: group.to_string(),
            version: version.to_string(),
            kind: kind.into(),
        }
    }

    /// Drop the version
    pub fn group_kind(&self) -> GroupKind {
        GroupKind::new(self.group.clone(), self.kind.clone())
    }
}

/// Stable identity of a resource within a synthesis
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ref {
    /// API group
    pub group: String,
    /// Kind
    pub kind: String,
    /// Namespace, empty for cluster-scoped resources
    pub namespace: String,
    /// Name
    pub name: String,
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/", GroupKind::new(self.group.clone(), self.kind.clone()))?;
        if !self.namespace.is_empty() {
            write!(f, "{}/", self.namespace)?;
        }
        f.write_str(&self.name)
    }
}

/// Namespaced identity of a ResourceSlice
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SliceRef {
    /// Slice namespace
    pub namespace: String,
    /// Slice name
    pub name: String,
}

/// Position of a manifest: the slice holding it and its index in that slice
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct ManifestRef {
    /// Slice holding the manifest
    pub slice: SliceRef,
    /// Index within `spec.resources`
    pub index: usize,
}

impl ManifestRef {
    /// Address manifest `index` of the named slice
    pub fn new(namespace: impl Into<String>, slice: impl Into<String>, index: usize) -> Self {
        Self {
            slice: SliceRef {
                namespace: namespace.into(),
                name: slice.into(),
            },
            index,
        }
    }
}

/// Cache partition key: one synthesis of one composition
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SynthesisRef {
    /// Composition name
    pub composition_name: String,
    /// Composition namespace
    pub namespace: String,
    /// Synthesis UUID
    pub uuid: String,
}

impl SynthesisRef {
    /// Key the given synthesis of a composition
    pub fn new(composition: &CompositionKey, uuid: impl Into<String>) -> Self {
        Self {
            composition_name: composition.name.clone(),
            namespace: composition.namespace.clone(),
            uuid: uuid.into(),
        }
    }
}

/// Notification that a resource needs reconciling
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Request {
    /// Resource to reconcile
    pub resource: Ref,
    /// Composition that produced it
    pub composition: CompositionKey,
}

/// Assigns readiness groups and recognizes CRD-defining resources
pub trait ReadinessEvaluator: Send + Sync {
    /// Readiness group of a manifest; lower groups roll out first
    fn readiness_group(&self, manifest: &DynamicObject) -> Result<i64, String>;

    /// The group/kind a manifest defines, when it is a CRD
    fn defined_group_kind(&self, gvk: &Gvk, manifest: &DynamicObject) -> Option<GroupKind> {
        crd_group_kind(gvk, manifest)
    }
}

/// Reads the readiness group from the `eno.azure.io/readiness-group` annotation.
///
/// Missing means group 0; anything that is not an integer is rejected.
#[derive(Clone, Copy, Debug, Default)]
pub struct AnnotationReadinessGroup;

impl ReadinessEvaluator for AnnotationReadinessGroup {
    fn readiness_group(&self, manifest: &DynamicObject) -> Result<i64, String> {
        match manifest.annotations().get(READINESS_GROUP_ANNOTATION) {
            None => Ok(0),
            Some(raw) => raw
                .trim()
                .parse()
                .map_err(|_| format!("invalid readiness group {:?}", raw)),
        }
    }
}

/// Group/kind defined by a CustomResourceDefinition manifest
pub fn crd_group_kind(gvk: &Gvk, manifest: &DynamicObject) -> Option<GroupKind> {
    if gvk.group != APIEXTENSIONS_GROUP || gvk.kind != "CustomResourceDefinition" {
        return None;
    }
    let spec = manifest.data.get("spec")?;
    let group = spec.get("group").and_then(Value::as_str)?;
    let kind = spec
        .get("names")
        .and_then(|n| n.get("kind"))
        .and_then(Value::as_str)?;
    Some(GroupKind::new(group, kind))
}

/// One decoded output resource of a synthesis
#[derive(Clone, Debug)]
pub struct Resource {
    /// Stable identity
    pub reference: Ref,
    /// Group, version and kind of the manifest
    pub gvk: Gvk,
    /// Rollout ordering key
    pub readiness_group: i64,
    /// Where the manifest lives
    pub manifest_ref: ManifestRef,
    /// Set when this resource is a CRD defining that group/kind
    pub defined_group_kind: Option<GroupKind>,
    /// The decoded manifest
    pub manifest: DynamicObject,
    /// The resource was removed by a later synthesis
    pub deleted: bool,
}

impl Resource {
    /// Decode manifest `index` of `slice`
    pub fn from_slice(
        slice: &ResourceSlice,
        index: usize,
        evaluator: &dyn ReadinessEvaluator,
    ) -> Result<Self, ReconstitutionError> {
        let slice_name = slice.name_any();
        let invalid = |message: String| {
            ReconstitutionError::invalid_resource(slice_name.clone(), index, message)
        };

        let entry = slice
            .spec
            .resources
            .get(index)
            .ok_or_else(|| invalid("index out of range".to_string()))?;

        let manifest: DynamicObject = serde_json::from_str(&entry.manifest)
            .map_err(|e| invalid(format!("decoding manifest: {}", e)))?;

        let types = manifest
            .types
            .as_ref()
            .filter(|t| !t.api_version.is_empty() && !t.kind.is_empty())
            .ok_or_else(|| invalid("manifest has no apiVersion or kind".to_string()))?;
        let gvk = Gvk::from_api_version(&types.api_version, types.kind.clone());

        let name = manifest
            .metadata
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .ok_or_else(|| invalid("manifest has no name".to_string()))?;

        let readiness_group = evaluator.readiness_group(&manifest).map_err(invalid)?;
        let defined_group_kind = evaluator.defined_group_kind(&gvk, &manifest);

        Ok(Self {
            reference: Ref {
                group: gvk.group.clone(),
                kind: gvk.kind.clone(),
                namespace: manifest.metadata.namespace.clone().unwrap_or_default(),
                name,
            },
            gvk,
            readiness_group,
            manifest_ref: ManifestRef::new(
                slice.namespace().unwrap_or_default(),
                slice_name.clone(),
                index,
            ),
            defined_group_kind,
            manifest,
            deleted: entry.deleted,
        })
    }
}
