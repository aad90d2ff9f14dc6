//! Controller wiring
//!
//! Builds the long-running futures for the pod lifecycle controller and the
//! reconstitution cache. Each builder returns futures that run until the
//! process receives a shutdown signal.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures::{FutureExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Config as WatcherConfig};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use eno_common::crd::{Composition, Synthesizer};
use eno_common::COMPOSITION_NAME_LABEL;
use eno_reconstitution::{AnnotationReadinessGroup, Cache, KubeSliceReader, ReconstitutionContext};
use eno_synthesis::pod::{is_terminating, pod_composition_key, pod_to_composition};
use eno_synthesis::{Context, KubeClientImpl, SynthesisConfig};

/// Watch timeout, kept below the API server's default idle timeout
const WATCH_TIMEOUT_SECS: u32 = 25;

/// A controller future ready to be driven by the runtime
pub type ControllerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

fn watcher_config() -> WatcherConfig {
    WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS)
}

/// Build the pod lifecycle controller and its sweeps
///
/// Returns:
/// - The composition controller, also triggered by synthesizer pod changes.
///   It starts once the pod and synthesizer stores hold a full listing, and
///   sweeps pods orphaned while the controller was down
/// - The pod reflector, which also cleans up pods whose composition is gone
/// - The synthesizer reflector
/// - A composition deletion sweep that removes pods left by a deleted composition
pub fn build_synthesis_controllers(client: Client, config: SynthesisConfig) -> Vec<ControllerFuture> {
    let compositions: Api<Composition> = Api::all(client.clone());
    let synthesizers: Api<Synthesizer> = Api::all(client.clone());
    let pods: Api<Pod> = Api::namespaced(client.clone(), &config.pod_namespace);
    let pod_watcher_config = watcher_config().labels(COMPOSITION_NAME_LABEL);

    let controller = Controller::new(compositions.clone(), watcher_config()).watches(
        pods.clone(),
        pod_watcher_config.clone(),
        pod_to_composition,
    );
    let composition_store = controller.store();
    let (pod_store, pod_writer) = reflector::store::<Pod>();
    let (synthesizer_store, synthesizer_writer) = reflector::store::<Synthesizer>();

    let kube = KubeClientImpl::new(client, config.pod_namespace.clone())
        .with_pod_store(pod_store.clone())
        .with_composition_store(composition_store.clone())
        .with_synthesizer_store(synthesizer_store.clone());
    let ctx = Arc::new(Context::new(Arc::new(kube), config));

    let lifecycle_ctx = ctx.clone();
    let lifecycle_pods = pod_store.clone();
    let lifecycle_compositions = composition_store.clone();
    let lifecycle = async move {
        if lifecycle_pods.wait_until_ready().await.is_err()
            || synthesizer_store.wait_until_ready().await.is_err()
        {
            warn!("pod lifecycle stores were dropped before syncing");
            return;
        }
        info!("pod lifecycle stores synced, starting controller");
        let sweep_ctx = lifecycle_ctx.clone();
        let run = controller
            .shutdown_on_signal()
            .run(
                eno_synthesis::reconcile,
                eno_synthesis::error_policy,
                lifecycle_ctx,
            )
            .for_each(log_reconcile_result("PodLifecycle"));
        // The composition store is fed by the controller, so the sweep runs alongside it
        futures::join!(
            run,
            sweep_startup_orphans(lifecycle_pods, lifecycle_compositions, sweep_ctx)
        );
    };

    let sweep_ctx = ctx.clone();
    let sweep_compositions = composition_store.clone();
    let pod_sweep = watcher::watcher(pods, pod_watcher_config)
        .default_backoff()
        .reflect(pod_writer)
        .applied_objects()
        .for_each(move |pod| {
            let ctx = sweep_ctx.clone();
            let compositions = sweep_compositions.clone();
            async move {
                match pod {
                    Ok(pod) => {
                        // Until the composition store has synced, every pod looks orphaned
                        let synced = compositions.wait_until_ready().now_or_never();
                        if !matches!(synced, Some(Ok(()))) {
                            return;
                        }
                        sweep_orphaned_pod(&pod, &compositions, &ctx).await;
                    }
                    Err(e) => warn!(error = %e, "synthesizer pod watch failed"),
                }
            }
        });

    let synthesizer_reflector = watcher::watcher(synthesizers, watcher_config())
        .default_backoff()
        .reflect(synthesizer_writer)
        .for_each(|event| {
            if let Err(e) = event {
                warn!(error = %e, "synthesizer watch failed");
            }
            std::future::ready(())
        });

    let deletion_sweep = composition_deletions(compositions).for_each(move |composition| {
        let ctx = ctx.clone();
        async move {
            let key = composition.key();
            if let Err(e) = eno_synthesis::reconcile_composition(&key, &ctx).await {
                warn!(composition = %key, error = %e, "failed to clean up after deleted composition");
            }
        }
    });

    vec![
        Box::pin(lifecycle),
        Box::pin(pod_sweep),
        Box::pin(synthesizer_reflector),
        Box::pin(deletion_sweep),
    ]
}

/// Build the reconstitution controller
///
/// Returns the composition controller filling the cache, a sweep purging
/// partitions of deleted compositions, and a drain for the requests the
/// cache produces.
pub fn build_reconstitution_controllers(client: Client) -> Vec<ControllerFuture> {
    let compositions: Api<Composition> = Api::all(client.clone());
    let (requests, mut pending) = mpsc::unbounded_channel();
    let cache = Arc::new(Cache::new(Arc::new(AnnotationReadinessGroup)));
    let ctx = Arc::new(ReconstitutionContext::new(
        Arc::new(KubeSliceReader::new(client)),
        cache,
        requests,
    ));

    let reconstitution = Controller::new(compositions.clone(), watcher_config())
        .shutdown_on_signal()
        .run(
            eno_reconstitution::reconcile,
            eno_reconstitution::error_policy,
            ctx.clone(),
        )
        .for_each(log_reconcile_result("Reconstitution"));

    let purge = composition_deletions(compositions).for_each(move |composition| {
        let ctx = ctx.clone();
        async move {
            let key = composition.key();
            if let Err(e) = eno_reconstitution::reconcile_composition(&key, &ctx).await {
                warn!(composition = %key, error = %e, "failed to purge deleted composition");
            }
        }
    });

    let drain = async move {
        while let Some(request) = pending.recv().await {
            debug!(
                composition = %request.composition,
                resource = %request.resource,
                "resource ready for reconciliation"
            );
        }
        info!("reconstitution request channel closed");
    };

    vec![Box::pin(reconstitution), Box::pin(purge), Box::pin(drain)]
}

/// Compositions as they are removed from the API server
fn composition_deletions(api: Api<Composition>) -> impl Stream<Item = Composition> + Send {
    watcher::watcher(api, watcher_config())
        .default_backoff()
        .filter_map(|event| async move {
            match event {
                Ok(watcher::Event::Delete(composition)) => Some(composition),
                Ok(_) => None,
                Err(e) => {
                    warn!(error = %e, "composition watch failed");
                    None
                }
            }
        })
}

/// Sweep every cached pod once the composition store has synced
async fn sweep_startup_orphans(
    pods: Store<Pod>,
    compositions: Store<Composition>,
    ctx: Arc<Context>,
) {
    if compositions.wait_until_ready().await.is_err() {
        return;
    }
    for pod in pods.state() {
        sweep_orphaned_pod(&pod, &compositions, &ctx).await;
    }
    debug!("startup orphan sweep finished");
}

/// Reconcile the composition of a pod that no longer has one in the store
///
/// The controller never reconciles objects missing from its store, so pods
/// outliving their composition are handled here. Callers must only invoke
/// this once the composition store has synced.
async fn sweep_orphaned_pod(pod: &Pod, compositions: &Store<Composition>, ctx: &Context) {
    if is_terminating(pod) {
        return;
    }
    let Some(key) = pod_composition_key(pod) else {
        return;
    };
    let reference = ObjectRef::new(&key.name).within(&key.namespace);
    if compositions.get(&reference).is_some() {
        return;
    }

    debug!(composition = %key, "synthesizer pod has no known composition");
    if let Err(e) = eno_synthesis::reconcile_composition(&key, ctx).await {
        warn!(composition = %key, error = %e, "failed to clean up orphaned synthesizer pod");
    }
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(action) => debug!(?action, "{} reconciliation completed", controller_name),
            Err(e) => tracing::error!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
