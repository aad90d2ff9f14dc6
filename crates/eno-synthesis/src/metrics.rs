//! Lifecycle counters recorded by the reconciler

#[cfg(test)]
use mockall::automock;

/// Records pod lifecycle events
#[cfg_attr(test, automock)]
pub trait LifecycleMetrics: Send + Sync {
    /// A synthesizer pod was created
    fn pod_created(&self);

    /// A synthesizer pod was deleted for outliving its timeout
    fn pod_recreated(&self);
}

/// [`LifecycleMetrics`] backed by the global OpenTelemetry counters
pub struct OtelLifecycleMetrics;

impl LifecycleMetrics for OtelLifecycleMetrics {
    fn pod_created(&self) {
        eno_common::metrics::record_pod_created();
    }

    fn pod_recreated(&self) {
        eno_common::metrics::record_pod_recreated();
    }
}
