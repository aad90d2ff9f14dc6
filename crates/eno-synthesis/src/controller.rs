//! Pod lifecycle reconciliation
//!
//! Each reconcile makes at most one change for a composition, in priority
//! order:
//! - Clean up pods of compositions that no longer exist
//! - Add the cleanup finalizer
//! - Delete a pod selected by [`should_delete_pod`]
//! - Advance the deletion state machine of a deleting composition
//! - Create a synthesizer pod once backoff has elapsed and no pod exists
//!
//! Waiting is always expressed as a requeue, never a sleep.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::runtime::controller::Action;
use kube::ResourceExt;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use eno_common::crd::{Composition, CompositionKey, Synthesizer};
use eno_common::Error;

use crate::client::{KubeClient, SynthesisAttemptPatch};
use crate::config::SynthesisConfig;
use crate::decision::{remaining_backoff, should_delete_pod, DeletionReason, PodDecision};
use crate::deletion::{
    add_cleanup_finalizer, mark_deleted_synthesized, next_deletion_step,
    remove_cleanup_finalizer, revert_swap, DeletionStep,
};
use crate::locks::KeyedLocks;
use crate::metrics::{LifecycleMetrics, OtelLifecycleMetrics};
use crate::pod::{build_synthesizer_pod, is_terminating};

/// Requeue delay after a conflict, which usually resolves on the next read
const CONFLICT_REQUEUE: Duration = Duration::from_secs(1);

/// Requeue delay after any other error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Shared state for the pod lifecycle controller
pub struct Context {
    /// Kubernetes access
    pub kube: Arc<dyn KubeClient>,
    /// Synthesizer pod settings
    pub config: SynthesisConfig,
    /// Per-composition mutual exclusion
    pub locks: KeyedLocks,
    /// Lifecycle counters
    pub metrics: Arc<dyn LifecycleMetrics>,
}

impl Context {
    /// Create a context around a client and pod configuration
    pub fn new(kube: Arc<dyn KubeClient>, config: SynthesisConfig) -> Self {
        Self {
            kube,
            config,
            locks: KeyedLocks::new(),
            metrics: Arc::new(OtelLifecycleMetrics),
        }
    }

    /// Replace the lifecycle counters
    pub fn with_metrics(mut self, metrics: Arc<dyn LifecycleMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Controller entrypoint for a composition delivered by a watch
#[instrument(skip(composition, ctx), fields(composition = %composition.key()))]
pub async fn reconcile(composition: Arc<Composition>, ctx: Arc<Context>) -> Result<Action, Error> {
    reconcile_composition(&composition.key(), &ctx).await
}

/// Reconcile the composition identified by `key`, which may no longer exist
pub async fn reconcile_composition(key: &CompositionKey, ctx: &Context) -> Result<Action, Error> {
    let guard = ctx.locks.lock(key).await;
    let result = reconcile_locked(key, ctx, Utc::now()).await;
    drop(guard);
    ctx.locks.prune();
    result
}

/// Error policy: log and requeue, sooner for conflicts
///
/// Errors that only a spec change can fix wait for the next watch event.
pub fn error_policy(composition: Arc<Composition>, error: &Error, _ctx: Arc<Context>) -> Action {
    if !error.is_retryable() {
        warn!(
            composition = %composition.key(),
            error = %error,
            "pod lifecycle reconcile failed, waiting for a spec change"
        );
        return Action::await_change();
    }
    warn!(
        composition = %composition.key(),
        error = %error,
        "pod lifecycle reconcile failed, will retry"
    );
    if error.is_conflict() {
        Action::requeue(CONFLICT_REQUEUE)
    } else {
        Action::requeue(ERROR_REQUEUE)
    }
}

async fn reconcile_locked(
    key: &CompositionKey,
    ctx: &Context,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let kube = ctx.kube.as_ref();

    let Some(mut composition) = kube.get_composition(key).await? else {
        return delete_orphaned_pod(key, kube).await;
    };

    if !composition.is_deleting() && add_cleanup_finalizer(&mut composition) {
        kube.update_composition(&composition).await?;
        debug!(composition = %key, "added cleanup finalizer");
        return Ok(Action::await_change());
    }

    let pods = kube.list_composition_pods(key).await?;
    let synthesizer = resolve_synthesizer(&composition, kube).await?;

    let decision = should_delete_pod(
        &pods,
        &composition,
        synthesizer.as_ref(),
        ctx.config.container_creation_timeout,
        now,
    );
    if let PodDecision::Delete { pod, reason } = decision {
        let name = pod.name_any();
        kube.delete_pod(&name).await?;
        if reason == DeletionReason::Timeout {
            ctx.metrics.pod_recreated();
        }
        info!(composition = %key, pod = %name, reason = %reason, "deleted synthesizer pod");
        return Ok(Action::await_change());
    }

    if composition.is_deleting() {
        return reconcile_deleting(composition, kube, now).await;
    }

    if decision.blocks_creation() {
        let recheck = synthesizer.as_ref().and_then(Synthesizer::configured_pod_timeout);
        return Ok(recheck.map_or_else(Action::await_change, Action::requeue));
    }

    let Some(synthesizer) = synthesizer else {
        return Ok(Action::await_change());
    };

    let Some(synthesis) = composition
        .current_synthesis()
        .filter(|s| !s.uuid.is_empty() && !s.is_synthesized())
    else {
        return Ok(Action::await_change());
    };

    if let Some(wait) = remaining_backoff(synthesis, now) {
        debug!(
            composition = %key,
            attempts = synthesis.attempts,
            wait_ms = wait.as_millis() as u64,
            "backing off pod creation"
        );
        return Ok(Action::requeue(wait));
    }

    let existing = kube.list_synthesis_pods_uncached(&synthesis.uuid).await?;
    if let Some(pod) = existing.iter().find(|p| !is_terminating(p)) {
        debug!(
            composition = %key,
            pod = %pod.name_any(),
            "synthesizer pod already exists, refusing to create another"
        );
        return Ok(Action::await_change());
    }

    synthesizer.validate()?;
    let pod = build_synthesizer_pod(&ctx.config, &composition, &synthesizer);
    let created = kube.create_pod(&pod).await?;
    ctx.metrics.pod_created();
    info!(
        composition = %key,
        pod = %created.name_any(),
        synthesis = %synthesis.uuid,
        "created synthesizer pod"
    );

    let pod_creation = created
        .metadata
        .creation_timestamp
        .as_ref()
        .map_or(now, |t| t.0);
    let patch = SynthesisAttemptPatch::next(&synthesis.uuid, synthesis.attempts, pod_creation);
    if let Err(e) = kube.patch_synthesis_attempt(key, &patch).await {
        warn!(
            composition = %key,
            error = %e,
            "failed to record synthesis attempt, pod will be rediscovered"
        );
    }

    Ok(Action::await_change())
}

/// Delete the first live pod left behind by a composition that no longer exists
async fn delete_orphaned_pod(key: &CompositionKey, kube: &dyn KubeClient) -> Result<Action, Error> {
    let pods = kube.list_composition_pods(key).await?;
    if let Some(pod) = pods.iter().find(|p| !is_terminating(p)) {
        let name = pod.name_any();
        kube.delete_pod(&name).await?;
        info!(
            composition = %key,
            pod = %name,
            reason = "CompositionDoesNotExist",
            "deleted synthesizer pod"
        );
    }
    Ok(Action::await_change())
}

/// Look up the composition's synthesizer.
///
/// A missing or deleting synthesizer resolves to None once synthesis has
/// started. Before that a missing one is an error, since it may simply not
/// be visible yet.
async fn resolve_synthesizer(
    composition: &Composition,
    kube: &dyn KubeClient,
) -> Result<Option<Synthesizer>, Error> {
    let name = &composition.spec.synthesizer.name;
    let started = composition.current_synthesis().is_some();
    match kube.get_synthesizer(name).await? {
        Some(syn) if syn.is_deleting() && started => Ok(None),
        Some(syn) => Ok(Some(syn)),
        None if started => Ok(None),
        None => Err(Error::missing_synthesizer(
            name.as_str(),
            composition.key().to_string(),
        )),
    }
}

/// Apply one step of the deletion state machine
async fn reconcile_deleting(
    mut composition: Composition,
    kube: &dyn KubeClient,
    now: DateTime<Utc>,
) -> Result<Action, Error> {
    let key = composition.key();
    match next_deletion_step(&composition) {
        DeletionStep::RevertSwap => {
            revert_swap(&mut composition);
            kube.update_composition_status(&composition).await?;
            info!(composition = %key, "reverted swapped status for deletion");
        }
        DeletionStep::MarkDeletedSynthesized => {
            mark_deleted_synthesized(&mut composition, Uuid::new_v4().to_string(), now);
            kube.update_composition_status(&composition).await?;
            info!(composition = %key, "updated composition status to reflect deletion");
        }
        DeletionStep::RemoveFinalizer => {
            remove_cleanup_finalizer(&mut composition);
            kube.update_composition(&composition).await?;
            info!(composition = %key, "removed cleanup finalizer");
        }
        DeletionStep::Wait => {
            debug!(composition = %key, "composition is still reconciling, keeping finalizer");
        }
    }
    Ok(Action::await_change())
}
