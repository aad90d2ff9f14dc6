//! Kubernetes access for the pod lifecycle controller
//!
//! Everything the controller reads or writes goes through [`KubeClient`] so
//! reconcile logic can be exercised against mocks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use json_patch::{PatchOperation, ReplaceOperation, TestOperation};
use jsonptr::PointerBuf;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Client, ResourceExt};
use serde_json::{json, Value};
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use eno_common::crd::{Composition, CompositionKey, Synthesizer};
use eno_common::error::is_not_found;
use eno_common::{Error, COMPOSITION_NAMESPACE_LABEL, COMPOSITION_NAME_LABEL};

use crate::pod::{composition_selector, synthesis_selector};

/// Field-level compare-and-swap recording a new synthesis attempt.
///
/// Applies only while the composition's current synthesis still has `uuid`
/// and has not been synthesized; otherwise the server rejects the patch and
/// the caller sees [`Error::Conflict`].
#[derive(Clone, Debug, PartialEq)]
pub struct SynthesisAttemptPatch {
    /// Expected current synthesis UUID
    pub uuid: String,
    /// New attempt count
    pub attempts: i64,
    /// When the pod was created
    pub pod_creation: DateTime<Utc>,
}

impl SynthesisAttemptPatch {
    /// Attempt that follows `previous_attempts`
    pub fn next(uuid: impl Into<String>, previous_attempts: i64, now: DateTime<Utc>) -> Self {
        Self {
            uuid: uuid.into(),
            attempts: previous_attempts + 1,
            pod_creation: now,
        }
    }

    /// Render as a JSON patch with `test` guards ahead of the writes
    pub fn to_json_patch(&self) -> json_patch::Patch {
        let field = |name: &str| PointerBuf::from_tokens(["status", "currentSynthesis", name]);
        json_patch::Patch(vec![
            PatchOperation::Test(TestOperation {
                path: field("uuid"),
                value: Value::String(self.uuid.clone()),
            }),
            PatchOperation::Test(TestOperation {
                path: field("synthesized"),
                value: Value::Null,
            }),
            PatchOperation::Replace(ReplaceOperation {
                path: field("attempts"),
                value: json!(self.attempts),
            }),
            PatchOperation::Replace(ReplaceOperation {
                path: field("podCreation"),
                value: json!(self.pod_creation),
            }),
        ])
    }
}

/// Trait abstracting Kubernetes operations for the pod lifecycle controller
///
/// Lookups return `Ok(None)` for objects that do not exist.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait KubeClient: Send + Sync {
    /// Fetch a composition
    async fn get_composition(&self, key: &CompositionKey) -> Result<Option<Composition>, Error>;

    /// Fetch a cluster-scoped synthesizer
    async fn get_synthesizer(&self, name: &str) -> Result<Option<Synthesizer>, Error>;

    /// Pods created for a composition, from the local cache when available
    async fn list_composition_pods(&self, key: &CompositionKey) -> Result<Vec<Pod>, Error>;

    /// Pods created for a synthesis, read straight from the API server
    async fn list_synthesis_pods_uncached(&self, uuid: &str) -> Result<Vec<Pod>, Error>;

    /// Create a pod
    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error>;

    /// Delete a pod; a missing pod is not an error
    async fn delete_pod(&self, name: &str) -> Result<(), Error>;

    /// Replace the whole composition, guarded by its resourceVersion
    async fn update_composition(&self, composition: &Composition) -> Result<(), Error>;

    /// Replace the composition status, guarded by its resourceVersion
    async fn update_composition_status(&self, composition: &Composition) -> Result<(), Error>;

    /// Apply a synthesis attempt compare-and-swap
    async fn patch_synthesis_attempt(
        &self,
        key: &CompositionKey,
        patch: &SynthesisAttemptPatch,
    ) -> Result<(), Error>;
}

/// Real Kubernetes client implementation
///
/// Reads are served from reflector stores when they are attached, the same
/// view the controller's watches maintain. Only
/// [`KubeClient::list_synthesis_pods_uncached`] always goes to the API server.
pub struct KubeClientImpl {
    client: Client,
    pod_namespace: String,
    pod_store: Option<Store<Pod>>,
    composition_store: Option<Store<Composition>>,
    synthesizer_store: Option<Store<Synthesizer>>,
}

impl KubeClientImpl {
    /// Create a client that reads everything from the API server
    pub fn new(client: Client, pod_namespace: impl Into<String>) -> Self {
        Self {
            client,
            pod_namespace: pod_namespace.into(),
            pod_store: None,
            composition_store: None,
            synthesizer_store: None,
        }
    }

    /// Serve composition pod listings from a reflector store
    pub fn with_pod_store(mut self, pods: Store<Pod>) -> Self {
        self.pod_store = Some(pods);
        self
    }

    /// Serve composition lookups from the controller's store
    pub fn with_composition_store(mut self, compositions: Store<Composition>) -> Self {
        self.composition_store = Some(compositions);
        self
    }

    /// Serve synthesizer lookups from a reflector store
    pub fn with_synthesizer_store(mut self, synthesizers: Store<Synthesizer>) -> Self {
        self.synthesizer_store = Some(synthesizers);
        self
    }

    fn compositions(&self, namespace: &str) -> Api<Composition> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.pod_namespace)
    }
}

fn cached_pods_for(store: &Store<Pod>, namespace: &str, key: &CompositionKey) -> Vec<Pod> {
    store
        .state()
        .iter()
        .filter(|pod| pod.namespace().as_deref() == Some(namespace))
        .filter(|pod| {
            let labels = pod.labels();
            labels.get(COMPOSITION_NAME_LABEL) == Some(&key.name)
                && labels.get(COMPOSITION_NAMESPACE_LABEL) == Some(&key.namespace)
        })
        .map(|pod| Pod::clone(pod))
        .collect()
}

fn cached_composition(store: &Store<Composition>, key: &CompositionKey) -> Option<Composition> {
    let reference = ObjectRef::new(&key.name).within(&key.namespace);
    store.get(&reference).map(|comp| Composition::clone(&comp))
}

fn cached_synthesizer(store: &Store<Synthesizer>, name: &str) -> Option<Synthesizer> {
    store
        .get(&ObjectRef::new(name))
        .map(|syn| Synthesizer::clone(&syn))
}

fn guard_failed(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 422 || ae.code == 409)
}

#[async_trait]
impl KubeClient for KubeClientImpl {
    async fn get_composition(&self, key: &CompositionKey) -> Result<Option<Composition>, Error> {
        if let Some(store) = &self.composition_store {
            return Ok(cached_composition(store, key));
        }
        self.compositions(&key.namespace)
            .get_opt(&key.name)
            .await
            .map_err(|e| Error::kube(format!("getting composition {}", key), e))
    }

    async fn get_synthesizer(&self, name: &str) -> Result<Option<Synthesizer>, Error> {
        if let Some(store) = &self.synthesizer_store {
            return Ok(cached_synthesizer(store, name));
        }
        let api: Api<Synthesizer> = Api::all(self.client.clone());
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("getting synthesizer {}", name), e))
    }

    async fn list_composition_pods(&self, key: &CompositionKey) -> Result<Vec<Pod>, Error> {
        if let Some(store) = &self.pod_store {
            return Ok(cached_pods_for(store, &self.pod_namespace, key));
        }
        let params = ListParams::default().labels(&composition_selector(key));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| Error::kube(format!("listing pods for {}", key), e))?;
        Ok(pods.items)
    }

    async fn list_synthesis_pods_uncached(&self, uuid: &str) -> Result<Vec<Pod>, Error> {
        let params = ListParams::default().labels(&synthesis_selector(uuid));
        let pods = self
            .pods()
            .list(&params)
            .await
            .map_err(|e| Error::kube(format!("listing pods for synthesis {}", uuid), e))?;
        Ok(pods.items)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, Error> {
        self.pods()
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::kube("creating synthesizer pod", e))
    }

    async fn delete_pod(&self, name: &str) -> Result<(), Error> {
        match self.pods().delete(name, &DeleteParams::background()).await {
            Ok(_) => Ok(()),
            Err(e) if is_not_found(&e) => {
                debug!(pod = %name, "pod already deleted");
                Ok(())
            }
            Err(e) => Err(Error::kube(format!("deleting pod {}", name), e)),
        }
    }

    async fn update_composition(&self, composition: &Composition) -> Result<(), Error> {
        let key = composition.key();
        self.compositions(&key.namespace)
            .replace(&key.name, &PostParams::default(), composition)
            .await
            .map_err(|e| Error::kube(format!("updating composition {}", key), e))?;
        Ok(())
    }

    async fn update_composition_status(&self, composition: &Composition) -> Result<(), Error> {
        let key = composition.key();
        let body = serde_json::to_vec(composition).map_err(|e| {
            Error::serialization("Composition", format!("encoding status: {}", e))
        })?;
        self.compositions(&key.namespace)
            .replace_status(&key.name, &PostParams::default(), body)
            .await
            .map_err(|e| Error::kube(format!("updating status of {}", key), e))?;
        Ok(())
    }

    async fn patch_synthesis_attempt(
        &self,
        key: &CompositionKey,
        patch: &SynthesisAttemptPatch,
    ) -> Result<(), Error> {
        let json_patch = patch.to_json_patch();
        match self
            .compositions(&key.namespace)
            .patch_status(
                &key.name,
                &PatchParams::default(),
                &Patch::Json::<()>(json_patch),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if guard_failed(&e) => Err(Error::conflict(
                key.to_string(),
                format!("synthesis {} changed before attempt was recorded", patch.uuid),
            )),
            Err(e) => Err(Error::kube(format!("recording attempt for {}", key), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use eno_common::crd::{CompositionSpec, SynthesizerRef, SynthesizerSpec};
    use kube::core::ErrorResponse;
    use kube::runtime::{reflector, watcher};

    fn stored_composition(namespace: &str, name: &str) -> Composition {
        let mut comp = Composition::new(
            name,
            CompositionSpec {
                synthesizer: SynthesizerRef {
                    name: "helm".to_string(),
                },
            },
        );
        comp.metadata.namespace = Some(namespace.to_string());
        comp
    }

    fn labeled_pod(namespace: &str, comp_name: &str, comp_namespace: &str) -> Pod {
        let mut pod = Pod::default();
        pod.metadata.name = Some(format!("synthesis-{}", comp_name));
        pod.metadata.namespace = Some(namespace.to_string());
        pod.metadata.labels = Some(
            [
                (COMPOSITION_NAME_LABEL.to_string(), comp_name.to_string()),
                (COMPOSITION_NAMESPACE_LABEL.to_string(), comp_namespace.to_string()),
            ]
            .into(),
        );
        pod
    }

    #[test]
    fn compositions_are_read_from_the_store() {
        let (store, mut writer) = reflector::store::<Composition>();
        writer.apply_watcher_event(&watcher::Event::Apply(stored_composition("team-a", "app")));

        let found = cached_composition(&store, &CompositionKey::new("team-a", "app"));
        assert_eq!(found.map(|c| c.key()), Some(CompositionKey::new("team-a", "app")));
        assert!(cached_composition(&store, &CompositionKey::new("team-b", "app")).is_none());
    }

    #[test]
    fn synthesizer_missing_from_store_reads_as_none() {
        let (store, mut writer) = reflector::store::<Synthesizer>();
        writer.apply_watcher_event(&watcher::Event::Apply(Synthesizer::new(
            "helm",
            SynthesizerSpec {
                image: "example.com/helm:v1".to_string(),
                ..Default::default()
            },
        )));

        let found = cached_synthesizer(&store, "helm");
        assert_eq!(found.map(|s| s.spec.image), Some("example.com/helm:v1".to_string()));
        assert!(cached_synthesizer(&store, "kustomize").is_none());
    }

    #[test]
    fn cached_pods_match_both_composition_labels() {
        let (store, mut writer) = reflector::store::<Pod>();
        for pod in [
            labeled_pod("eno", "app", "team-a"),
            labeled_pod("eno", "app", "team-b"),
            labeled_pod("other", "app", "team-a"),
        ] {
            writer.apply_watcher_event(&watcher::Event::Apply(pod));
        }

        let pods = cached_pods_for(&store, "eno", &CompositionKey::new("team-a", "app"));
        assert_eq!(pods.len(), 1);
        assert_eq!(pods[0].namespace().as_deref(), Some("eno"));
    }

    #[test]
    fn attempt_patch_guards_before_writing() {
        let now = Utc::now();
        let patch = SynthesisAttemptPatch::next("u1", 2, now);
        assert_eq!(patch.attempts, 3);

        let value = serde_json::to_value(patch.to_json_patch()).unwrap();
        let ops = value.as_array().unwrap();
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0]["op"], "test");
        assert_eq!(ops[0]["path"], "/status/currentSynthesis/uuid");
        assert_eq!(ops[0]["value"], "u1");
        assert_eq!(ops[1]["op"], "test");
        assert_eq!(ops[1]["path"], "/status/currentSynthesis/synthesized");
        assert!(ops[1]["value"].is_null());
        assert_eq!(ops[2]["op"], "replace");
        assert_eq!(ops[2]["value"], 3);
        assert_eq!(ops[3]["path"], "/status/currentSynthesis/podCreation");
        assert_eq!(ops[3]["value"], json!(now));
    }

    #[test]
    fn attempt_patch_applies_only_to_matching_synthesis() {
        let now = Utc::now();
        let patch = SynthesisAttemptPatch::next("u1", 0, now).to_json_patch();

        let mut matching = json!({"status": {"currentSynthesis": {
            "uuid": "u1", "attempts": 0, "podCreation": null, "synthesized": null
        }}});
        json_patch::patch(&mut matching, &patch.0).unwrap();
        assert_eq!(matching["status"]["currentSynthesis"]["attempts"], 1);

        let mut swapped = json!({"status": {"currentSynthesis": {
            "uuid": "u2", "attempts": 0, "podCreation": null, "synthesized": null
        }}});
        assert!(json_patch::patch(&mut swapped, &patch.0).is_err());

        let mut finished = json!({"status": {"currentSynthesis": {
            "uuid": "u1", "attempts": 0, "podCreation": null, "synthesized": "2024-01-01T00:00:00Z"
        }}});
        assert!(json_patch::patch(&mut finished, &patch.0).is_err());
    }

    #[test]
    fn guard_failures_are_422_or_409() {
        let api = |code| {
            kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: "test failed".to_string(),
                reason: "Invalid".to_string(),
                code,
            })
        };
        assert!(guard_failed(&api(422)));
        assert!(guard_failed(&api(409)));
        assert!(!guard_failed(&api(500)));
    }
}
