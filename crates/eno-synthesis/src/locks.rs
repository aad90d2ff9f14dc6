//! Per-composition mutual exclusion
//!
//! `kube::runtime::Controller` never runs two reconciles for the same object,
//! but the orphan sweep invokes reconcile directly. Both paths take the same
//! per-key lock so the guarantee holds regardless of caller.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use eno_common::crd::CompositionKey;

/// Async mutexes keyed by composition
#[derive(Debug, Default)]
pub struct KeyedLocks {
    locks: DashMap<CompositionKey, Arc<Mutex<()>>>,
}

impl KeyedLocks {
    /// Create an empty lock table
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &CompositionKey) -> OwnedMutexGuard<()> {
        // Shard guard must be released before awaiting
        let lock = self.locks.entry(key.clone()).or_default().value().clone();
        lock.lock_owned().await
    }

    /// Forget locks nobody holds or waits on
    pub fn prune(&self) {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    /// Whether no keys are tracked
    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
