//! Keyed store of materialized backends: at most one instance per id.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::contracts::BackendRef;
use crate::errors::{DisposeError, DisposeFailure, ErrorInfo};
use crate::registry::BackendRegistry;

pub struct BackendCache {
    registry: Arc<BackendRegistry>,
    instances: DashMap<String, BackendRef>,
}

impl std::fmt::Debug for BackendCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendCache")
            .field("instances", &self.ids())
            .finish()
    }
}

impl BackendCache {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            instances: DashMap::new(),
        }
    }

    /// Return the instance for `id`, invoking the registry factory the first time.
    ///
    /// The existing instance is returned whatever its lifecycle state. The factory
    /// runs while the map slot for `id` is held, so interleaved callers for the same
    /// unseen id receive the same instance. Factories must not call back into the
    /// cache.
    pub fn get_or_create(&self, id: &str) -> Result<BackendRef, ErrorInfo> {
        if let Some(existing) = self.instances.get(id) {
            return Ok(Arc::clone(existing.value()));
        }

        let descriptor = self
            .registry
            .resolve(id)
            .map_err(|_| ErrorInfo::unsupported(id))?;

        let instance = match self.instances.entry(id.to_string()) {
            Entry::Occupied(e) => Arc::clone(e.get()),
            Entry::Vacant(v) => {
                tracing::debug!(backend = %id, "materializing backend instance");
                let instance = descriptor.instantiate();
                v.insert(Arc::clone(&instance));
                instance
            }
        };
        Ok(instance)
    }

    pub fn get(&self, id: &str) -> Option<BackendRef> {
        self.instances.get(id).map(|e| Arc::clone(e.value()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Cached ids, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Dispose every cached instance and empty the cache.
    ///
    /// A failure disposing one backend does not stop the others; all failures are
    /// returned together. Returns the ids disposed cleanly.
    pub async fn dispose_all(&self) -> Result<Vec<String>, DisposeError> {
        let drained: Vec<(String, BackendRef)> = self
            .ids()
            .into_iter()
            .filter_map(|id| self.instances.remove(&id))
            .collect();

        let mut disposed = Vec::with_capacity(drained.len());
        let mut failures = Vec::new();

        for (id, backend) in drained {
            match backend.dispose().await {
                Ok(()) => {
                    tracing::debug!(backend = %id, "backend disposed");
                    disposed.push(id);
                }
                Err(error) => {
                    tracing::warn!(backend = %id, error = %error, "failed to dispose backend");
                    failures.push(DisposeFailure { backend: id, error });
                }
            }
        }

        if failures.is_empty() {
            Ok(disposed)
        } else {
            Err(DisposeError { disposed, failures })
        }
    }
}
