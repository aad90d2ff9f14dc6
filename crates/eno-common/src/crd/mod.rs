//! Custom Resource Definitions for eno
//!
//! This module contains all CRD definitions shared by the eno controllers.

mod composition;
mod resource_slice;
mod synthesizer;

pub use composition::{
    Composition, CompositionKey, CompositionSpec, CompositionStatus, ResourceSliceRef, Synthesis,
    SynthesizerRef,
};
pub use resource_slice::{Manifest, ResourceSlice, ResourceSliceSpec};
pub use synthesizer::{Synthesizer, SynthesizerSpec, DEFAULT_POD_TIMEOUT};
