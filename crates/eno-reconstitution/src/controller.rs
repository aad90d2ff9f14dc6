//! Reconstitution reconciler
//!
//! Keeps the cache in step with composition status: purges syntheses that
//! are no longer referenced, then fills any synthesized one not yet cached.
//! Requests produced by a fill are forwarded to downstream consumers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kube::api::Api;
use kube::runtime::controller::Action;
use kube::Client;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, instrument, warn};

#[cfg(test)]
use mockall::automock;

use eno_common::crd::{Composition, CompositionKey, ResourceSlice, Synthesis};
use eno_common::Error;

use crate::cache::Cache;
use crate::error::ReconstitutionError;
use crate::resource::Request;

/// Requeue delay while a referenced slice is not visible yet
const MISSING_SLICE_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue delay after an error
const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Reads the objects the reconstitution reconciler consumes
#[cfg_attr(test, automock)]
#[async_trait]
pub trait SliceReader: Send + Sync {
    /// Fetch a composition, None when it does not exist
    async fn get_composition(&self, key: &CompositionKey) -> Result<Option<Composition>, Error>;

    /// Fetch a resource slice, None when it does not exist
    async fn get_slice(&self, namespace: &str, name: &str)
        -> Result<Option<ResourceSlice>, Error>;
}

/// [`SliceReader`] backed by the API server
pub struct KubeSliceReader {
    client: Client,
}

impl KubeSliceReader {
    /// Create a reader using the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SliceReader for KubeSliceReader {
    async fn get_composition(&self, key: &CompositionKey) -> Result<Option<Composition>, Error> {
        let api: Api<Composition> = Api::namespaced(self.client.clone(), &key.namespace);
        api.get_opt(&key.name)
            .await
            .map_err(|e| Error::kube(format!("getting composition {}", key), e))
    }

    async fn get_slice(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ResourceSlice>, Error> {
        let api: Api<ResourceSlice> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| Error::kube(format!("getting resource slice {}/{}", namespace, name), e))
    }
}

/// Shared state for the reconstitution reconciler
pub struct ReconstitutionContext {
    /// Object access
    pub reader: Arc<dyn SliceReader>,
    /// The cache being maintained
    pub cache: Arc<Cache>,
    /// Where fill requests are sent
    pub requests: UnboundedSender<Request>,
}

impl ReconstitutionContext {
    /// Create a context
    pub fn new(
        reader: Arc<dyn SliceReader>,
        cache: Arc<Cache>,
        requests: UnboundedSender<Request>,
    ) -> Self {
        Self {
            reader,
            cache,
            requests,
        }
    }
}

/// Controller entrypoint for a composition delivered by a watch
#[instrument(skip(composition, ctx), fields(composition = %composition.key()))]
pub async fn reconcile(
    composition: Arc<Composition>,
    ctx: Arc<ReconstitutionContext>,
) -> Result<Action, ReconstitutionError> {
    sync_composition(&composition.key(), Some(&composition), &ctx).await
}

/// Reconcile by key, fetching the composition; a missing one purges the cache
pub async fn reconcile_composition(
    key: &CompositionKey,
    ctx: &ReconstitutionContext,
) -> Result<Action, ReconstitutionError> {
    let composition = ctx.reader.get_composition(key).await?;
    sync_composition(key, composition.as_ref(), ctx).await
}

/// Error policy: requeue transient failures, wait for a change otherwise
pub fn error_policy(
    composition: Arc<Composition>,
    error: &ReconstitutionError,
    _ctx: Arc<ReconstitutionContext>,
) -> Action {
    if !error.is_retryable() {
        warn!(
            composition = %composition.key(),
            error = %error,
            "reconstitution failed, waiting for the synthesis to change"
        );
        return Action::await_change();
    }
    warn!(
        composition = %composition.key(),
        error = %error,
        "reconstitution failed, will retry"
    );
    Action::requeue(ERROR_REQUEUE)
}

async fn sync_composition(
    key: &CompositionKey,
    composition: Option<&Composition>,
    ctx: &ReconstitutionContext,
) -> Result<Action, ReconstitutionError> {
    ctx.cache.purge(key, composition);
    let Some(composition) = composition else {
        debug!(composition = %key, "composition is gone, purged cache");
        return Ok(Action::await_change());
    };

    let syntheses = [composition.current_synthesis(), composition.previous_synthesis()];
    for synthesis in syntheses.into_iter().flatten() {
        if !synthesis.is_synthesized() || synthesis.uuid.is_empty() {
            continue;
        }
        if ctx.cache.has_synthesis(key, &synthesis.uuid) {
            continue;
        }
        let Some(slices) = read_slices(key, synthesis, ctx.reader.as_ref()).await? else {
            return Ok(Action::requeue(MISSING_SLICE_REQUEUE));
        };
        let requests = ctx.cache.fill(composition, synthesis, &slices)?;
        forward(requests, &ctx.requests);
    }

    Ok(Action::await_change())
}

/// Read every slice of a synthesis; None when any is not visible yet
async fn read_slices(
    key: &CompositionKey,
    synthesis: &Synthesis,
    reader: &dyn SliceReader,
) -> Result<Option<Vec<ResourceSlice>>, ReconstitutionError> {
    let mut slices = Vec::with_capacity(synthesis.resource_slices.len());
    for slice_ref in &synthesis.resource_slices {
        match reader.get_slice(&key.namespace, &slice_ref.name).await? {
            Some(slice) => slices.push(slice),
            None => {
                debug!(
                    composition = %key,
                    slice = %slice_ref.name,
                    "resource slice not found yet"
                );
                return Ok(None);
            }
        }
    }
    Ok(Some(slices))
}

fn forward(requests: Vec<Request>, sink: &UnboundedSender<Request>) {
    for request in requests {
        if sink.send(request).is_err() {
            warn!("request receiver dropped, discarding remaining requests");
            return;
        }
    }
}
