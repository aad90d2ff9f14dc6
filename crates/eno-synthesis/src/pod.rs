//! Synthesizer pod construction and inspection
//!
//! Builds the pods that run a Synthesizer against one Composition. Every pod
//! carries labels naming its synthesis UUID and owning Composition so it can
//! be correlated without owner references.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{
    Affinity, Container, EmptyDirVolumeSource, EnvVar, NodeAffinity, NodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, Pod, PodSecurityContext, PodSpec, Toleration,
    Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::runtime::reflector::ObjectRef;
use kube::ResourceExt;

use eno_common::crd::{Composition, CompositionKey, Synthesizer};
use eno_common::{
    COMPOSITION_GENERATION_ANNOTATION, COMPOSITION_NAMESPACE_LABEL, COMPOSITION_NAME_LABEL,
    SYNTHESIS_UUID_LABEL, SYNTHESIZER_GENERATION_ANNOTATION,
};

use crate::config::SynthesisConfig;

/// Mount path of the shared volume holding the executor binary
const EXECUTOR_MOUNT_PATH: &str = "/eno";

/// Name of the shared executor volume
const EXECUTOR_VOLUME: &str = "executor";

/// Build the pod that runs `synthesizer` for the composition's current synthesis.
///
/// The pod:
/// - Copies the executor binary into a shared `emptyDir` from an init container
/// - Runs the synthesizer image with the executor as its entrypoint
/// - Is labeled with the synthesis UUID and composition identity
/// - Tolerates the configured taint and requires the configured node label
pub fn build_synthesizer_pod(
    config: &SynthesisConfig,
    composition: &Composition,
    synthesizer: &Synthesizer,
) -> Pod {
    let key = composition.key();
    let uuid = composition.current_synthesis_uuid().to_string();

    let labels = BTreeMap::from([
        (SYNTHESIS_UUID_LABEL.to_string(), uuid.clone()),
        (COMPOSITION_NAME_LABEL.to_string(), key.name.clone()),
        (COMPOSITION_NAMESPACE_LABEL.to_string(), key.namespace.clone()),
    ]);
    let annotations = BTreeMap::from([
        (
            COMPOSITION_GENERATION_ANNOTATION.to_string(),
            composition.generation().to_string(),
        ),
        (
            SYNTHESIZER_GENERATION_ANNOTATION.to_string(),
            synthesizer.generation().to_string(),
        ),
    ]);

    let mut env = vec![
        env_var("COMPOSITION_NAME", &key.name),
        env_var("COMPOSITION_NAMESPACE", &key.namespace),
        env_var("SYNTHESIS_UUID", &uuid),
        env_var("SYNTHESIZER_NAME", &synthesizer.name_any()),
    ];
    if let Some(timeout) = synthesizer.spec.exec_timeout_seconds {
        env.push(env_var("EXEC_TIMEOUT", &format!("{}s", timeout)));
    }
    if !synthesizer.spec.command.is_empty() {
        env.push(env_var("SYNTHESIZER_COMMAND", &synthesizer.spec.command.join(" ")));
    }

    let executor_mount = VolumeMount {
        name: EXECUTOR_VOLUME.to_string(),
        mount_path: EXECUTOR_MOUNT_PATH.to_string(),
        ..Default::default()
    };

    let setup = Container {
        name: "setup".to_string(),
        image: Some(config.executor_image.clone()),
        command: Some(vec![
            "cp".to_string(),
            "/eno-executor".to_string(),
            format!("{}/executor", EXECUTOR_MOUNT_PATH),
        ]),
        volume_mounts: Some(vec![executor_mount.clone()]),
        ..Default::default()
    };

    let synthesizer_container = Container {
        name: "synthesizer".to_string(),
        image: Some(synthesizer.spec.image.clone()),
        command: Some(vec![format!("{}/executor", EXECUTOR_MOUNT_PATH)]),
        env: Some(env),
        volume_mounts: Some(vec![executor_mount]),
        ..Default::default()
    };

    let tolerations = config.taint_toleration_key.as_ref().map(|key| {
        vec![Toleration {
            key: Some(key.clone()),
            operator: Some("Equal".to_string()),
            value: config.taint_toleration_value.clone(),
            effect: Some("NoSchedule".to_string()),
            ..Default::default()
        }]
    });

    let affinity = config.node_affinity_key.as_ref().map(|key| Affinity {
        node_affinity: Some(NodeAffinity {
            required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                node_selector_terms: vec![NodeSelectorTerm {
                    match_expressions: Some(vec![NodeSelectorRequirement {
                        key: key.clone(),
                        operator: "In".to_string(),
                        values: Some(config.node_affinity_value.iter().cloned().collect()),
                    }]),
                    ..Default::default()
                }],
            }),
            ..Default::default()
        }),
        ..Default::default()
    });

    Pod {
        metadata: ObjectMeta {
            generate_name: Some("synthesis-".to_string()),
            namespace: Some(config.pod_namespace.clone()),
            labels: Some(labels),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: Some(vec![setup]),
            containers: vec![synthesizer_container],
            volumes: Some(vec![Volume {
                name: EXECUTOR_VOLUME.to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            service_account_name: config.pod_service_account.clone(),
            restart_policy: Some("OnFailure".to_string()),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                ..Default::default()
            }),
            tolerations,
            affinity,
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn env_var(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

/// Check if a pod has been marked for deletion
pub fn is_terminating(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_some()
}

/// The synthesis UUID a pod was created for
pub fn pod_synthesis_uuid(pod: &Pod) -> Option<&str> {
    pod.labels().get(SYNTHESIS_UUID_LABEL).map(String::as_str)
}

/// The composition a pod was created for
pub fn pod_composition_key(pod: &Pod) -> Option<CompositionKey> {
    let labels = pod.labels();
    let name = labels.get(COMPOSITION_NAME_LABEL)?;
    let namespace = labels.get(COMPOSITION_NAMESPACE_LABEL)?;
    Some(CompositionKey::new(namespace.clone(), name.clone()))
}

/// Label selector matching every pod created for a composition
pub fn composition_selector(key: &CompositionKey) -> String {
    format!(
        "{}={},{}={}",
        COMPOSITION_NAME_LABEL, key.name, COMPOSITION_NAMESPACE_LABEL, key.namespace
    )
}

/// Label selector matching every pod created for a synthesis
pub fn synthesis_selector(uuid: &str) -> String {
    format!("{}={}", SYNTHESIS_UUID_LABEL, uuid)
}

/// When the scheduler bound the pod to a node.
///
/// Returns None when the pod is unscheduled or the condition is absent.
pub fn pod_scheduled_time(pod: &Pod) -> Option<DateTime<Utc>> {
    let condition = pod
        .status
        .as_ref()?
        .conditions
        .as_ref()?
        .iter()
        .find(|c| c.type_ == "PodScheduled")?;
    if condition.status == "False" {
        return None;
    }
    condition.last_transition_time.as_ref().map(|t| t.0)
}

/// Whether the kubelet has reported on any container of the pod
pub fn seen_by_kubelet(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref())
        .is_some_and(|statuses| !statuses.is_empty())
}

/// Whether all containers of the pod exited successfully
pub fn has_succeeded(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .is_some_and(|phase| phase == "Succeeded")
}

/// Watch mapper: route pod events to the composition they were created for
pub fn pod_to_composition(pod: Pod) -> Option<ObjectRef<Composition>> {
    let key = pod_composition_key(&pod)?;
    Some(ObjectRef::new(&key.name).within(&key.namespace))
}
