//! Synthesizer pod lifecycle for eno
//!
//! Decides when a synthesizer pod must be created, left running, or deleted
//! for each Composition:
//! - At most one active pod per synthesis, plus one replacement while a
//!   single predecessor is terminating
//! - Linear backoff between attempts
//! - Verify-before-create against the authoritative API to avoid duplicates
//! - A deletion state machine that lets deleting compositions release their
//!   cleanup finalizer even when synthesis can never run

pub mod client;
pub mod config;
pub mod controller;
pub mod decision;
pub mod deletion;
pub mod locks;
pub mod metrics;
pub mod pod;

pub use client::{KubeClient, KubeClientImpl, SynthesisAttemptPatch};
pub use config::SynthesisConfig;
pub use controller::{error_policy, reconcile, reconcile_composition, Context};
pub use decision::{should_delete_pod, DeletionReason, PodDecision};
pub use metrics::{LifecycleMetrics, OtelLifecycleMetrics};
pub use pod::pod_to_composition;
