//! Common types for eno: CRDs, errors, metrics, and telemetry

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod metrics;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// API group shared by all eno resources
pub const API_GROUP: &str = "eno.azure.io";

/// Finalizer that keeps a Composition around until its resources are cleaned up
pub const CLEANUP_FINALIZER: &str = "eno.azure.io/cleanup";

/// Label carried by synthesizer pods identifying the synthesis they run
pub const SYNTHESIS_UUID_LABEL: &str = "eno.azure.io/synthesis-uuid";

/// Label carried by synthesizer pods naming their owning Composition
pub const COMPOSITION_NAME_LABEL: &str = "eno.azure.io/composition-name";

/// Label carried by synthesizer pods naming their owning Composition's namespace
pub const COMPOSITION_NAMESPACE_LABEL: &str = "eno.azure.io/composition-namespace";

/// Annotation assigning a synthesized resource to a readiness group
pub const READINESS_GROUP_ANNOTATION: &str = "eno.azure.io/readiness-group";

/// Annotation recording the Composition generation a pod was created for
pub const COMPOSITION_GENERATION_ANNOTATION: &str = "eno.azure.io/composition-generation";

/// Annotation recording the Synthesizer generation a pod was created for
pub const SYNTHESIZER_GENERATION_ANNOTATION: &str = "eno.azure.io/synthesizer-generation";

/// Field manager used for writes performed by eno controllers
pub const FIELD_MANAGER: &str = "eno-controller";
