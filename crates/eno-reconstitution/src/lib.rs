//! Reconstitution cache for eno
//!
//! Turns the resource slices written by a synthesis back into typed,
//! indexed resources:
//! - Point lookups by resource identity and by manifest position
//! - Ordered walks across sparse readiness groups
//! - Lookup of the CRD defining a custom kind
//!
//! Partitions are keyed by synthesis and purged as soon as the owning
//! composition stops referencing them.

pub mod cache;
pub mod controller;
pub mod error;
pub mod resource;

pub use cache::{Cache, RangeDirection};
pub use controller::{
    error_policy, reconcile, reconcile_composition, KubeSliceReader, ReconstitutionContext,
    SliceReader,
};
pub use error::ReconstitutionError;
pub use resource::{
    AnnotationReadinessGroup, GroupKind, Gvk, ManifestRef, ReadinessEvaluator, Ref, Request,
    Resource, SliceRef, SynthesisRef,
};
