//! Deletion sequencing for compositions
//!
//! A deleting composition advances one step per reconcile. Each step is a
//! whole-object update, so the next step only runs once the previous write
//! has been observed.

use chrono::{DateTime, Utc};

use eno_common::crd::{Composition, CompositionStatus, Synthesis};
use eno_common::CLEANUP_FINALIZER;

/// The transition a deleting composition should take next
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionStep {
    /// Restore the previous synthesis over an unfinished current one
    RevertSwap,
    /// Mark a synthesis as complete without running the synthesizer
    MarkDeletedSynthesized,
    /// Reconciliation finished; release the cleanup finalizer
    RemoveFinalizer,
    /// Still reconciling; nothing to do until the next event
    Wait,
}

/// Pick the single transition to apply to a deleting composition
pub fn next_deletion_step(composition: &Composition) -> DeletionStep {
    let current = composition.current_synthesis();

    if composition.previous_synthesis().is_some()
        && current.map_or(true, |c| !c.is_synthesized())
    {
        return DeletionStep::RevertSwap;
    }

    let generation = composition.generation();
    let needs_synthesis = current.is_some_and(|c| {
        c.observed_composition_generation != generation || !c.is_synthesized()
    });
    if needs_synthesis {
        return DeletionStep::MarkDeletedSynthesized;
    }

    let reconciling = current.is_some_and(|c| {
        c.reconciled.is_none() || c.observed_composition_generation != generation
    });
    if !reconciling && composition.has_cleanup_finalizer() {
        return DeletionStep::RemoveFinalizer;
    }

    DeletionStep::Wait
}

/// Undo an in-flight promotion: `current = previous`, `previous = None`
pub fn revert_swap(composition: &mut Composition) {
    let status = composition.status.get_or_insert_with(CompositionStatus::default);
    if let Some(previous) = status.previous_synthesis.take() {
        status.current_synthesis = Some(previous);
    }
}

/// Record a synthesis that never ran as synthesized.
///
/// `reconciled` is only stamped when neither the previous nor the current
/// synthesis ever produced output, since nothing would ever reconcile it.
pub fn mark_deleted_synthesized(composition: &mut Composition, uuid: String, now: DateTime<Utc>) {
    let generation = composition.generation();
    let status = composition.status.get_or_insert_with(CompositionStatus::default);

    let never_synthesized = status
        .previous_synthesis
        .as_ref()
        .map_or(true, |p| !p.is_synthesized())
        && status
            .current_synthesis
            .as_ref()
            .map_or(true, |c| !c.is_synthesized());

    let current = status.current_synthesis.get_or_insert_with(Synthesis::default);
    current.uuid = uuid;
    current.ready = None;
    current.synthesized = Some(now);
    current.observed_composition_generation = generation;
    current.reconciled = never_synthesized.then_some(now);
}

/// Drop the cleanup finalizer, leaving any others in place
pub fn remove_cleanup_finalizer(composition: &mut Composition) {
    if let Some(finalizers) = composition.metadata.finalizers.as_mut() {
        finalizers.retain(|f| f != CLEANUP_FINALIZER);
    }
}

/// Add the cleanup finalizer if missing; returns whether it was added
pub fn add_cleanup_finalizer(composition: &mut Composition) -> bool {
    if composition.has_cleanup_finalizer() {
        return false;
    }
    composition
        .metadata
        .finalizers
        .get_or_insert_with(Vec::new)
        .push(CLEANUP_FINALIZER.to_string());
    true
}
