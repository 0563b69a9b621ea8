//! Backend lifecycle state machine.
//!
//! [`LoadGate`] implements the load/dispose rules every backend must follow:
//! loads are idempotent, interleaved callers share one in-flight load, a failed
//! load reverts to `Unloaded`, and `Disposed` is terminal.

use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::errors::{ErrorInfo, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum LifecycleState {
    Unloaded,
    Loading,
    Loaded,
    Disposed,
}

type SharedLoad = Shared<BoxFuture<'static, Result<(), ErrorInfo>>>;

struct GateInner {
    backend: String,
    state: RwLock<LifecycleState>,
    // lock order: in_flight, then state
    in_flight: Mutex<Option<SharedLoad>>,
}

impl GateInner {
    fn settle(&self, outcome: Result<(), ErrorInfo>) -> Result<(), ErrorInfo> {
        let mut in_flight = self.in_flight.lock();
        in_flight.take();
        let mut state = self.state.write();

        if *state == LifecycleState::Disposed {
            tracing::debug!(backend = %self.backend, "load finished after dispose; discarding");
            return Err(ErrorInfo::disposed(&self.backend, ErrorKind::LoadFailure));
        }

        match &outcome {
            Ok(()) => {
                *state = LifecycleState::Loaded;
                tracing::debug!(backend = %self.backend, "backend loaded");
            }
            Err(e) => {
                *state = LifecycleState::Unloaded;
                tracing::warn!(backend = %self.backend, error = %e, "backend load failed");
            }
        }
        outcome
    }
}

/// Shared load/dispose state for one backend instance.
///
/// The initialization future is spawned onto the Tokio runtime, so it keeps running
/// to completion even when every caller stops waiting for it. Must be used from
/// within a Tokio runtime.
#[derive(Clone)]
pub struct LoadGate {
    inner: Arc<GateInner>,
}

impl LoadGate {
    pub fn new(backend: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GateInner {
                backend: backend.into(),
                state: RwLock::new(LifecycleState::Unloaded),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn backend(&self) -> &str {
        &self.inner.backend
    }

    pub fn state(&self) -> LifecycleState {
        *self.inner.state.read()
    }

    pub fn is_loaded(&self) -> bool {
        self.state() == LifecycleState::Loaded
    }

    pub fn is_disposed(&self) -> bool {
        self.state() == LifecycleState::Disposed
    }

    /// Run `init` unless the backend is already loaded or a load is in flight.
    ///
    /// `init` is invoked at most once per load attempt; callers arriving while a load
    /// is running await that load's outcome instead.
    pub async fn load_with<F, Fut>(&self, init: F) -> Result<(), ErrorInfo>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), ErrorInfo>> + Send + 'static,
    {
        let pending = {
            let mut in_flight = self.inner.in_flight.lock();
            match self.state() {
                LifecycleState::Loaded => return Ok(()),
                LifecycleState::Disposed => {
                    return Err(ErrorInfo::disposed(
                        &self.inner.backend,
                        ErrorKind::LoadFailure,
                    ))
                }
                LifecycleState::Unloaded | LifecycleState::Loading => {}
            }

            match in_flight.as_ref() {
                Some(pending) => {
                    tracing::debug!(backend = %self.inner.backend, "joining in-flight load");
                    pending.clone()
                }
                None => {
                    *self.inner.state.write() = LifecycleState::Loading;
                    let pending = self.spawn_load(init());
                    *in_flight = Some(pending.clone());
                    pending
                }
            }
        };

        pending.await
    }

    fn spawn_load<Fut>(&self, init: Fut) -> SharedLoad
    where
        Fut: Future<Output = Result<(), ErrorInfo>> + Send + 'static,
    {
        tracing::debug!(backend = %self.inner.backend, "starting backend load");

        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = init.await;
            inner.settle(outcome)
        });

        let inner = Arc::clone(&self.inner);
        async move {
            match task.await {
                Ok(outcome) => outcome,
                Err(join_err) => inner.settle(Err(ErrorInfo::load_failure(
                    &inner.backend,
                    format!("load task failed: {join_err}"),
                ))),
            }
        }
        .boxed()
        .shared()
    }

    /// Move to `Disposed`. Returns true on the first call only.
    pub fn dispose(&self) -> bool {
        let _in_flight = self.inner.in_flight.lock();
        let mut state = self.inner.state.write();
        if *state == LifecycleState::Disposed {
            return false;
        }
        *state = LifecycleState::Disposed;
        true
    }

    /// Error describing why `execute` cannot run right now, if it cannot.
    pub fn execute_guard(&self) -> Option<ErrorInfo> {
        match self.state() {
            LifecycleState::Loaded => None,
            LifecycleState::Disposed => Some(ErrorInfo::disposed(
                &self.inner.backend,
                ErrorKind::ExecutionFailure,
            )),
            LifecycleState::Unloaded | LifecycleState::Loading => {
                Some(ErrorInfo::not_loaded(&self.inner.backend))
            }
        }
    }
}

impl std::fmt::Debug for LoadGate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadGate")
            .field("backend", &self.inner.backend)
            .field("state", &self.state())
            .finish()
    }
}
