//! Reconstitution cache
//!
//! Indexes the output of each synthesis so downstream reconciliation can
//! look resources up by identity, walk readiness groups in order, and find
//! the CRD defining a kind.
//!
//! A single mutex guards all index state. Partitions are built before the
//! lock is taken and installed whole, so readers never see a half-built
//! partition.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound::{Excluded, Unbounded};
use std::sync::Arc;

use kube::ResourceExt;
use parking_lot::Mutex;
use tracing::{debug, info};

use eno_common::crd::{Composition, CompositionKey, ResourceSlice, Synthesis};

use crate::error::ReconstitutionError;
use crate::resource::{
    GroupKind, ManifestRef, ReadinessEvaluator, Ref, Request, Resource, SynthesisRef,
};

/// Direction of a readiness group walk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RangeDirection {
    /// Toward higher groups (rollout order)
    Ascending,
    /// Toward lower groups (teardown order)
    Descending,
}

/// Indexed resources of one synthesis. Immutable once built.
#[derive(Debug, Default)]
struct Partition {
    resources: Vec<Arc<Resource>>,
    by_ref: HashMap<Ref, Arc<Resource>>,
    by_readiness_group: BTreeMap<i64, Vec<Arc<Resource>>>,
    by_group_kind: HashMap<GroupKind, Vec<Arc<Resource>>>,
    crds_by_group_kind: HashMap<GroupKind, Arc<Resource>>,
}

impl Partition {
    fn insert(&mut self, resource: Resource) {
        let resource = Arc::new(resource);
        self.by_ref
            .insert(resource.reference.clone(), Arc::clone(&resource));
        self.by_readiness_group
            .entry(resource.readiness_group)
            .or_default()
            .push(Arc::clone(&resource));
        self.by_group_kind
            .entry(resource.gvk.group_kind())
            .or_default()
            .push(Arc::clone(&resource));
        if let Some(gk) = &resource.defined_group_kind {
            self.crds_by_group_kind
                .insert(gk.clone(), Arc::clone(&resource));
        }
        self.resources.push(resource);
    }
}

#[derive(Debug, Default)]
struct CacheState {
    partitions: HashMap<SynthesisRef, Partition>,
    synthesis_uuids_by_composition: HashMap<CompositionKey, Vec<String>>,
    by_index: HashMap<ManifestRef, Arc<Resource>>,
}

impl CacheState {
    /// Remove a partition and the manifest-index entries pointing into it
    fn remove_partition(&mut self, key: &SynthesisRef) {
        let Some(partition) = self.partitions.remove(key) else {
            return;
        };
        for resource in &partition.resources {
            let owned = self
                .by_index
                .get(&resource.manifest_ref)
                .is_some_and(|indexed| Arc::ptr_eq(indexed, resource));
            if owned {
                self.by_index.remove(&resource.manifest_ref);
            }
        }
    }
}

/// Multi-index store of synthesized resources, partitioned by synthesis
pub struct Cache {
    evaluator: Arc<dyn ReadinessEvaluator>,
    state: Mutex<CacheState>,
}

impl Cache {
    /// Create an empty cache using `evaluator` to classify resources
    pub fn new(evaluator: Arc<dyn ReadinessEvaluator>) -> Self {
        Self {
            evaluator,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Whether the output of this synthesis is already cached
    pub fn has_synthesis(&self, composition: &CompositionKey, uuid: &str) -> bool {
        let key = SynthesisRef::new(composition, uuid);
        self.state.lock().partitions.contains_key(&key)
    }

    /// Index every resource of `synthesis` and install it as one partition.
    ///
    /// All or nothing: a stale slice or an undecodable manifest leaves the
    /// cache untouched. Filling an already cached synthesis replaces it.
    /// Returns one request per resource for downstream enqueueing.
    pub fn fill(
        &self,
        composition: &Composition,
        synthesis: &Synthesis,
        slices: &[ResourceSlice],
    ) -> Result<Vec<Request>, ReconstitutionError> {
        let comp_key = composition.key();
        let (partition, requests) = self.build_partition(composition, &comp_key, slices)?;
        let key = SynthesisRef::new(&comp_key, synthesis.uuid.clone());
        let count = partition.resources.len();

        let mut state = self.state.lock();
        state.remove_partition(&key);
        for resource in &partition.resources {
            state
                .by_index
                .insert(resource.manifest_ref.clone(), Arc::clone(resource));
        }
        state.partitions.insert(key, partition);
        let uuids = state
            .synthesis_uuids_by_composition
            .entry(comp_key.clone())
            .or_default();
        if !uuids.contains(&synthesis.uuid) {
            uuids.push(synthesis.uuid.clone());
        }
        drop(state);

        info!(
            composition = %comp_key,
            synthesis = %synthesis.uuid,
            resources = count,
            "cache filled"
        );
        Ok(requests)
    }

    fn build_partition(
        &self,
        composition: &Composition,
        comp_key: &CompositionKey,
        slices: &[ResourceSlice],
    ) -> Result<(Partition, Vec<Request>), ReconstitutionError> {
        let mut partition = Partition::default();
        let mut requests = Vec::new();
        for slice in slices {
            if !slice.is_deleting() && composition.is_deleting() {
                return Err(ReconstitutionError::StaleRead {
                    composition: comp_key.to_string(),
                    slice: slice.name_any(),
                });
            }
            for index in 0..slice.spec.resources.len() {
                let resource = Resource::from_slice(slice, index, self.evaluator.as_ref())?;
                requests.push(Request {
                    resource: resource.reference.clone(),
                    composition: comp_key.clone(),
                });
                partition.insert(resource);
            }
        }
        Ok((partition, requests))
    }

    /// Drop partitions no longer referenced by the composition.
    ///
    /// With a composition, partitions for its current and previous synthesis
    /// are kept. Without one (it no longer exists), every partition under
    /// `key` is removed.
    pub fn purge(&self, key: &CompositionKey, composition: Option<&Composition>) {
        let mut state = self.state.lock();
        let Some(uuids) = state.synthesis_uuids_by_composition.remove(key) else {
            return;
        };

        let (kept, dropped): (Vec<String>, Vec<String>) = uuids
            .into_iter()
            .partition(|uuid| composition.is_some_and(|c| c.references_synthesis(uuid)));

        for uuid in &dropped {
            state.remove_partition(&SynthesisRef::new(key, uuid.clone()));
        }
        if !kept.is_empty() {
            state.synthesis_uuids_by_composition.insert(key.clone(), kept);
        }
        drop(state);

        if !dropped.is_empty() {
            debug!(composition = %key, purged = dropped.len(), "purged stale syntheses");
        }
    }

    /// Look up a resource by identity
    pub fn get(&self, synthesis: &SynthesisRef, reference: &Ref) -> Option<Arc<Resource>> {
        let state = self.state.lock();
        state.partitions.get(synthesis)?.by_ref.get(reference).cloned()
    }

    /// Resources of the nearest populated readiness group strictly above
    /// (ascending) or below (descending) `group`.
    ///
    /// Groups are sparse; `group` itself need not be populated. Empty when
    /// there is no such neighbor.
    pub fn range_by_readiness_group(
        &self,
        synthesis: &SynthesisRef,
        group: i64,
        direction: RangeDirection,
    ) -> Vec<Arc<Resource>> {
        let state = self.state.lock();
        let Some(partition) = state.partitions.get(synthesis) else {
            return Vec::new();
        };
        let groups = &partition.by_readiness_group;
        let neighbor = match direction {
            RangeDirection::Ascending => groups.range((Excluded(group), Unbounded)).next(),
            RangeDirection::Descending => groups.range((Unbounded, Excluded(group))).next_back(),
        };
        neighbor.map(|(_, resources)| resources.clone()).unwrap_or_default()
    }

    /// The resource defining the given custom group/kind, if synthesized
    pub fn get_defining_crd(
        &self,
        synthesis: &SynthesisRef,
        group_kind: &GroupKind,
    ) -> Option<Arc<Resource>> {
        let state = self.state.lock();
        state
            .partitions
            .get(synthesis)?
            .crds_by_group_kind
            .get(group_kind)
            .cloned()
    }

    /// Look up a resource by its position in a slice
    pub fn get_by_manifest_index(&self, manifest: &ManifestRef) -> Option<Arc<Resource>> {
        self.state.lock().by_index.get(manifest).cloned()
    }

    /// All resources of a group/kind within a synthesis
    pub fn get_by_group_kind(
        &self,
        synthesis: &SynthesisRef,
        group_kind: &GroupKind,
    ) -> Vec<Arc<Resource>> {
        let state = self.state.lock();
        state
            .partitions
            .get(synthesis)
            .and_then(|p| p.by_group_kind.get(group_kind))
            .cloned()
            .unwrap_or_default()
    }
}
