//! Pod deletion and backoff policy
//!
//! Pure functions over observed state. Nothing here talks to the API server,
//! which keeps the policy testable without mocks.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;

use eno_common::crd::{Composition, Synthesis, Synthesizer};

use crate::pod::{
    has_succeeded, is_terminating, pod_scheduled_time, pod_synthesis_uuid, seen_by_kubelet,
};

/// Base unit of the linear backoff between synthesis attempts
pub const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Attempts above this no longer qualify for container creation timeouts
pub const MAX_CONTAINER_CREATION_RETRIES: i64 = 3;

/// Why a pod was chosen for deletion
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionReason {
    /// The synthesizer is missing or being deleted
    SynthesizerDeleted,
    /// The composition is being deleted
    CompositionDeleted,
    /// All containers exited successfully
    Complete,
    /// The pod belongs to a synthesis other than the current one
    Superseded,
    /// The current synthesis already finished
    Success,
    /// Scheduled but never picked up by the kubelet
    ContainerCreationTimeout,
    /// The pod outlived the synthesizer's pod timeout
    Timeout,
}

impl DeletionReason {
    /// Stable name used in logs
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SynthesizerDeleted => "SynthesizerDeleted",
            Self::CompositionDeleted => "CompositionDeleted",
            Self::Complete => "Complete",
            Self::Superseded => "Superseded",
            Self::Success => "Success",
            Self::ContainerCreationTimeout => "ContainerCreationTimeout",
            Self::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for DeletionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of evaluating a composition's pods
#[derive(Debug, PartialEq)]
pub enum PodDecision<'a> {
    /// No pods exist for the composition
    None,
    /// A single pod is terminating; a replacement may be created
    Terminating,
    /// Two or more pods are terminating; no further pod may be created
    Saturated,
    /// A pod is legitimately running
    Running(&'a Pod),
    /// The given pod should be deleted
    Delete {
        /// Pod to delete
        pod: &'a Pod,
        /// Why it was selected
        reason: DeletionReason,
    },
}

impl PodDecision<'_> {
    /// Whether a pod exists that prevents creating another one
    pub fn blocks_creation(&self) -> bool {
        matches!(self, Self::Running(_) | Self::Saturated)
    }

    /// Whether any pod exists for the composition
    pub fn pod_exists(&self) -> bool {
        !matches!(self, Self::None)
    }
}

/// Decide whether one of the composition's pods should be deleted.
///
/// Terminating pods are never targets. With two or more already terminating
/// the result is [`PodDecision::Saturated`], so at most one replacement ever
/// coexists with a deleting predecessor. Otherwise the first non-terminating
/// pod (in listed order) matching a deletion rule is returned; the first pod
/// matching none of them ends the scan as [`PodDecision::Running`].
pub fn should_delete_pod<'a>(
    pods: &'a [Pod],
    composition: &Composition,
    synthesizer: Option<&Synthesizer>,
    creation_ttl: Duration,
    now: DateTime<Utc>,
) -> PodDecision<'a> {
    if pods.is_empty() {
        return PodDecision::None;
    }

    let terminating = pods.iter().filter(|p| is_terminating(p)).count();
    if terminating >= 2 {
        return PodDecision::Saturated;
    }

    let Some(pod) = pods.iter().find(|p| !is_terminating(p)) else {
        return PodDecision::Terminating;
    };

    match deletion_reason(
        pod,
        composition,
        synthesizer,
        terminating > 0,
        creation_ttl,
        now,
    ) {
        Some(reason) => PodDecision::Delete { pod, reason },
        None => PodDecision::Running(pod),
    }
}

fn deletion_reason(
    pod: &Pod,
    composition: &Composition,
    synthesizer: Option<&Synthesizer>,
    another_terminating: bool,
    creation_ttl: Duration,
    now: DateTime<Utc>,
) -> Option<DeletionReason> {
    let Some(synthesizer) = synthesizer.filter(|s| !s.is_deleting()) else {
        return Some(DeletionReason::SynthesizerDeleted);
    };
    if composition.is_deleting() {
        return Some(DeletionReason::CompositionDeleted);
    }
    if has_succeeded(pod) {
        return Some(DeletionReason::Complete);
    }
    if pod_synthesis_uuid(pod) != Some(composition.current_synthesis_uuid()) {
        return Some(DeletionReason::Superseded);
    }
    if composition
        .current_synthesis()
        .is_some_and(Synthesis::is_synthesized)
    {
        return Some(DeletionReason::Success);
    }

    let attempts = composition.current_synthesis().map_or(0, |s| s.attempts);
    if !another_terminating
        && !seen_by_kubelet(pod)
        && attempts <= MAX_CONTAINER_CREATION_RETRIES
        && pod_scheduled_time(pod).is_some_and(|at| exceeded(at, creation_ttl, now))
    {
        return Some(DeletionReason::ContainerCreationTimeout);
    }

    let created = pod.metadata.creation_timestamp.as_ref().map(|t| t.0);
    if created.is_some_and(|at| exceeded(at, synthesizer.pod_timeout(), now)) {
        return Some(DeletionReason::Timeout);
    }

    None
}

fn exceeded(since: DateTime<Utc>, limit: Duration, now: DateTime<Utc>) -> bool {
    now.signed_duration_since(since)
        .to_std()
        .is_ok_and(|elapsed| elapsed > limit)
}

/// Total wait required after the last pod creation: `250ms × attempts`
pub fn backoff_wait(attempts: i64) -> Duration {
    let attempts = u32::try_from(attempts.max(0)).unwrap_or(u32::MAX);
    BACKOFF_BASE.saturating_mul(attempts)
}

/// How much longer creation must wait before the next attempt.
///
/// None when no attempt has been made yet or the backoff already elapsed.
pub fn remaining_backoff(synthesis: &Synthesis, now: DateTime<Utc>) -> Option<Duration> {
    if synthesis.attempts <= 0 {
        return None;
    }
    let last = synthesis.pod_creation?;
    let wait = backoff_wait(synthesis.attempts);
    let elapsed = now.signed_duration_since(last).to_std().unwrap_or_default();
    wait.checked_sub(elapsed).filter(|d| !d.is_zero())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use eno_common::crd::{CompositionSpec, CompositionStatus, SynthesizerRef, SynthesizerSpec};
    use eno_common::SYNTHESIS_UUID_LABEL;
    use k8s_openapi::api::core::v1::{ContainerStatus, PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

    const TTL: Duration = Duration::from_secs(30);

    fn composition(uuid: &str, attempts: i64) -> Composition {
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
                attempts,
                ..Default::default()
            }),
            previous_synthesis: None,
        });
        comp
    }

    fn synthesizer() -> Synthesizer {
        Synthesizer::new(
            "helm",
            SynthesizerSpec {
                image: "example.com/helm:v1".to_string(),
                pod_timeout_seconds: Some(60),
                ..Default::default()
            },
        )
    }

    fn pod(uuid: &str, created: DateTime<Utc>) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("synthesis-{}", uuid));
        pod.metadata.creation_timestamp = Some(Time(created));
        pod.metadata.labels = Some([(SYNTHESIS_UUID_LABEL.to_string(), uuid.to_string())].into());
        pod
    }

    fn terminating(mut pod: Pod) -> Pod {
        pod.metadata.deletion_timestamp = Some(Time(Utc::now()));
        pod
    }

    fn scheduled(mut pod: Pod, at: DateTime<Utc>) -> Pod {
        pod.status = Some(PodStatus {
            conditions: Some(vec![PodCondition {
                type_: "PodScheduled".to_string(),
                status: "True".to_string(),
                last_transition_time: Some(Time(at)),
                ..Default::default()
            }]),
            ..Default::default()
        });
        pod
    }

    fn with_container_status(mut pod: Pod) -> Pod {
        pod.status
            .get_or_insert_with(Default::default)
            .container_statuses = Some(vec![ContainerStatus {
            name: "synthesizer".to_string(),
            ..Default::default()
        }]);
        pod
    }

    fn reason(decision: PodDecision<'_>) -> Option<DeletionReason> {
        match decision {
            PodDecision::Delete { reason, .. } => Some(reason),
            _ => None,
        }
    }

    #[test]
    fn no_pods_means_nothing_exists() {
        let now = Utc::now();
        let decision = should_delete_pod(&[], &composition("u1", 0), Some(&synthesizer()), TTL, now);
        assert_eq!(decision, PodDecision::None);
        assert!(!decision.pod_exists());
        assert!(!decision.blocks_creation());
    }

    #[test]
    fn healthy_pod_is_running() {
        let now = Utc::now();
        let pods = [pod("u1", now)];
        let decision = should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now);
        assert_eq!(decision, PodDecision::Running(&pods[0]));
        assert!(decision.blocks_creation());
    }

    #[test]
    fn single_pod_always_reports_existence() {
        let now = Utc::now();
        let comp = composition("u1", 1);
        let syn = synthesizer();
        let candidates = [
            pod("u1", now),
            pod("other", now),
            terminating(pod("u1", now)),
            pod("u1", now - ChronoDuration::hours(1)),
        ];
        for candidate in candidates {
            let pods = [candidate];
            let decision = should_delete_pod(&pods, &comp, Some(&syn), TTL, now);
            assert!(decision.pod_exists());
        }
    }

    #[test]
    fn one_terminating_pod_allows_replacement() {
        let now = Utc::now();
        let pods = [terminating(pod("u1", now))];
        let decision = should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now);
        assert_eq!(decision, PodDecision::Terminating);
        assert!(!decision.blocks_creation());
    }

    #[test]
    fn two_terminating_pods_saturate() {
        let now = Utc::now();
        let pods = [terminating(pod("u1", now)), terminating(pod("u0", now))];
        let decision = should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now);
        assert_eq!(decision, PodDecision::Saturated);
        assert!(decision.blocks_creation());
    }

    #[test]
    fn missing_or_deleting_synthesizer_takes_precedence() {
        let now = Utc::now();
        let pods = [pod("u1", now)];
        let comp = composition("u1", 1);
        assert_eq!(
            reason(should_delete_pod(&pods, &comp, None, TTL, now)),
            Some(DeletionReason::SynthesizerDeleted)
        );

        let mut syn = synthesizer();
        syn.metadata.deletion_timestamp = Some(Time(now));
        assert_eq!(
            reason(should_delete_pod(&pods, &comp, Some(&syn), TTL, now)),
            Some(DeletionReason::SynthesizerDeleted)
        );
    }

    #[test]
    fn deleting_composition_deletes_pod() {
        let now = Utc::now();
        let pods = [pod("u1", now)];
        let mut comp = composition("u1", 1);
        comp.metadata.deletion_timestamp = Some(Time(now));
        assert_eq!(
            reason(should_delete_pod(&pods, &comp, Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::CompositionDeleted)
        );
    }

    #[test]
    fn succeeded_pod_is_complete() {
        let now = Utc::now();
        let mut done = pod("u1", now);
        done.status = Some(PodStatus {
            phase: Some("Succeeded".to_string()),
            ..Default::default()
        });
        let pods = [done];
        assert_eq!(
            reason(should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::Complete)
        );
    }

    #[test]
    fn superseded_wins_over_age() {
        let now = Utc::now();
        let pods = [pod("u0", now - ChronoDuration::hours(2))];
        assert_eq!(
            reason(should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::Superseded)
        );
    }

    #[test]
    fn finished_synthesis_deletes_its_pod() {
        let now = Utc::now();
        let pods = [pod("u1", now)];
        let mut comp = composition("u1", 1);
        comp.status
            .as_mut()
            .and_then(|s| s.current_synthesis.as_mut())
            .unwrap()
            .synthesized = Some(now);
        assert_eq!(
            reason(should_delete_pod(&pods, &comp, Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::Success)
        );
    }

    #[test]
    fn container_creation_timeout_respects_retry_pressure() {
        let now = Utc::now();
        let scheduled_at = now - ChronoDuration::seconds(31);
        let pods = [scheduled(pod("u1", now - ChronoDuration::seconds(40)), scheduled_at)];

        assert_eq!(
            reason(should_delete_pod(&pods, &composition("u1", 2), Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::ContainerCreationTimeout)
        );
        assert_eq!(
            should_delete_pod(&pods, &composition("u1", 4), Some(&synthesizer()), TTL, now),
            PodDecision::Running(&pods[0])
        );
    }

    #[test]
    fn container_creation_timeout_still_fires_at_retry_limit() {
        let now = Utc::now();
        let scheduled_at = now - ChronoDuration::seconds(31);
        let pods = [scheduled(pod("u1", now - ChronoDuration::seconds(40)), scheduled_at)];
        let at_limit = composition("u1", 3);

        assert_eq!(
            reason(should_delete_pod(&pods, &at_limit, Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::ContainerCreationTimeout)
        );
    }

    #[test]
    fn container_creation_timeout_skipped_when_kubelet_reported() {
        let now = Utc::now();
        let scheduled_at = now - ChronoDuration::seconds(31);
        let pods = [with_container_status(scheduled(pod("u1", now), scheduled_at))];
        assert_eq!(
            should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now),
            PodDecision::Running(&pods[0])
        );
    }

    #[test]
    fn container_creation_timeout_skipped_while_another_pod_terminates() {
        let now = Utc::now();
        let scheduled_at = now - ChronoDuration::seconds(31);
        let pods = [
            terminating(pod("u1", now)),
            scheduled(pod("u1", now), scheduled_at),
        ];
        assert_eq!(
            should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now),
            PodDecision::Running(&pods[1])
        );
    }

    #[test]
    fn old_pod_times_out() {
        let now = Utc::now();
        let pods = [with_container_status(pod("u1", now - ChronoDuration::seconds(61)))];
        assert_eq!(
            reason(should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now)),
            Some(DeletionReason::Timeout)
        );
    }

    #[test]
    fn unset_pod_timeout_uses_default() {
        let now = Utc::now();
        let syn = Synthesizer::new("helm", SynthesizerSpec::default());
        let young = [pod("u1", now - ChronoDuration::seconds(90))];
        assert!(matches!(
            should_delete_pod(&young, &composition("u1", 1), Some(&syn), TTL, now),
            PodDecision::Running(_)
        ));
        let old = [pod("u1", now - ChronoDuration::seconds(121))];
        assert_eq!(
            reason(should_delete_pod(&old, &composition("u1", 1), Some(&syn), TTL, now)),
            Some(DeletionReason::Timeout)
        );
    }

    #[test]
    fn scan_stops_at_first_running_pod() {
        let now = Utc::now();
        let pods = [pod("u1", now), pod("stale", now)];
        assert_eq!(
            should_delete_pod(&pods, &composition("u1", 1), Some(&synthesizer()), TTL, now),
            PodDecision::Running(&pods[0])
        );
    }

    #[test]
    fn backoff_grows_with_attempts() {
        assert_eq!(backoff_wait(0), Duration::ZERO);
        assert_eq!(backoff_wait(1), Duration::from_millis(250));
        assert!(backoff_wait(2) > backoff_wait(1));
        assert_eq!(backoff_wait(-3), Duration::ZERO);
    }

    #[test]
    fn remaining_backoff_counts_down_from_last_creation() {
        let now = Utc::now();
        let mut synthesis = Synthesis {
            uuid: "u1".to_string(),
            attempts: 4,
            pod_creation: Some(now - ChronoDuration::milliseconds(400)),
            ..Default::default()
        };
        assert_eq!(remaining_backoff(&synthesis, now), Some(Duration::from_millis(600)));

        synthesis.pod_creation = Some(now - ChronoDuration::seconds(2));
        assert_eq!(remaining_backoff(&synthesis, now), None);

        synthesis.pod_creation = None;
        assert_eq!(remaining_backoff(&synthesis, now), None);
    }
}
