//! Runtime Manager - owns the backend cache and the active-backend pointer.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

use crate::contracts::BackendRef;
use crate::errors::{DisposeError, ErrorInfo, ErrorKind};
use crate::lifecycle::LifecycleState;
use crate::registry::{AccessTier, BackendDescriptor, BackendInfo, BackendRegistry, LoadHint};
use crate::result::{ExecOptions, ExecutionResult};
use crate::runtime::cache::BackendCache;
use crate::runtime::multiplexer::OutputMultiplexer;
use crate::sink::{EventSink, StreamKind};

/// Policy knobs for a [`RuntimeManager`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// When false, restricted-tier backends are unavailable.
    pub allow_restricted: bool,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            allow_restricted: true,
        }
    }
}

/// What a successful `switch_to` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwitchOutcome {
    /// The requested backend was already active.
    AlreadyActive,
    /// The requested backend is now active.
    Activated,
    /// The backend loaded, but a newer `switch_to` claimed the active pointer first.
    Superseded,
}

/// Result of loading the eager backends at startup.
#[derive(Debug, Default, Clone)]
pub struct WarmUpReport {
    pub loaded: Vec<String>,
    pub failed: Vec<(String, ErrorInfo)>,
}

struct ActiveBackend {
    id: String,
    backend: BackendRef,
}

/// Façade over registry, cache and multiplexer.
///
/// Construct one per process and share it by reference (or `Arc`).
pub struct RuntimeManager {
    registry: Arc<BackendRegistry>,
    cache: BackendCache,
    mux: OutputMultiplexer,
    active: RwLock<Option<ActiveBackend>>,
    // request tickets; `claimed_seq` is the ticket of the latest switch that succeeded
    switch_seq: AtomicU64,
    claimed_seq: AtomicU64,
    disposed: AtomicBool,
    options: RuntimeOptions,
}

impl std::fmt::Debug for RuntimeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeManager")
            .field("registry", &self.registry)
            .field("cache", &self.cache)
            .field("active", &self.active_id())
            .field("disposed", &self.disposed.load(Ordering::SeqCst))
            .field("options", &self.options)
            .finish()
    }
}

impl RuntimeManager {
    pub fn new(registry: BackendRegistry) -> Self {
        Self::with_options(registry, RuntimeOptions::default())
    }

    pub fn with_options(registry: BackendRegistry, options: RuntimeOptions) -> Self {
        let registry = Arc::new(registry);
        Self {
            cache: BackendCache::new(Arc::clone(&registry)),
            registry,
            mux: OutputMultiplexer::new(),
            active: RwLock::new(None),
            switch_seq: AtomicU64::new(0),
            claimed_seq: AtomicU64::new(0),
            disposed: AtomicBool::new(false),
            options,
        }
    }

    pub fn registry(&self) -> &BackendRegistry {
        &self.registry
    }

    pub fn options(&self) -> &RuntimeOptions {
        &self.options
    }

    fn permits(&self, descriptor: &BackendDescriptor) -> bool {
        self.options.allow_restricted || descriptor.access_tier != AccessTier::Restricted
    }

    /// Backends the current policy allows, ordered by id.
    pub fn list_available(&self) -> Vec<BackendInfo> {
        self.registry
            .descriptors()
            .iter()
            .filter(|d| self.permits(d))
            .map(BackendDescriptor::info)
            .collect()
    }

    pub fn is_available(&self, id: &str) -> bool {
        self.registry
            .resolve(id)
            .map(|d| self.permits(d))
            .unwrap_or(false)
    }

    /// Attach the single consumer of forwarded output events.
    pub fn register_output_sink(&self, sink: EventSink) -> bool {
        self.mux.register_sink(StreamKind::Output, sink)
    }

    /// Attach the single consumer of forwarded error events.
    pub fn register_error_sink(&self, sink: EventSink) -> bool {
        self.mux.register_sink(StreamKind::Error, sink)
    }

    pub fn output_channel(&self) -> mpsc::UnboundedReceiver<String> {
        self.mux.channel(StreamKind::Output)
    }

    pub fn error_channel(&self) -> mpsc::UnboundedReceiver<String> {
        self.mux.channel(StreamKind::Error)
    }

    pub fn active_id(&self) -> Option<String> {
        self.active.read().as_ref().map(|a| a.id.clone())
    }

    /// Lifecycle state of a materialized backend; `None` if never materialized.
    pub fn backend_state(&self, id: &str) -> Option<LifecycleState> {
        self.cache.get(id).map(|b| b.state())
    }

    pub fn materialized_ids(&self) -> Vec<String> {
        self.cache.ids()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn ensure_live(&self) -> Result<(), ErrorInfo> {
        if self.is_disposed() {
            return Err(ErrorInfo::new(
                ErrorKind::LoadFailure,
                "runtime has been disposed",
            ));
        }
        Ok(())
    }

    /// Registry and policy checks that precede any cache or load work.
    fn admit(&self, id: &str) -> Result<(), ErrorInfo> {
        let descriptor = self
            .registry
            .resolve(id)
            .map_err(|_| ErrorInfo::unsupported(id))?;
        if !self.permits(descriptor) {
            return Err(ErrorInfo::restricted(id));
        }
        Ok(())
    }

    fn next_ticket(&self) -> u64 {
        self.switch_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Resolve, create-or-reuse, load if needed, and wire subscriptions.
    async fn materialize(&self, id: &str) -> Result<BackendRef, ErrorInfo> {
        self.admit(id)?;

        let backend = self.cache.get_or_create(id)?;
        if !backend.is_loaded() {
            info!(backend = %id, "loading backend");
            backend
                .load()
                .await
                .map_err(|e| as_load_failure(id, e))?;
        }

        self.mux.wire(backend.as_ref());

        // dispose() may have drained the cache while this backend was loading.
        if self.is_disposed() {
            if let Err(e) = backend.dispose().await {
                warn!(backend = %id, error = %e, "failed to dispose backend loaded during shutdown");
            }
            self.ensure_live()?;
        }
        Ok(backend)
    }

    /// Make `id` the active backend, loading it first if necessary.
    ///
    /// On any failure the previously active backend stays active. When several
    /// switches overlap, the most recently requested one that succeeds wins; a
    /// failed switch never displaces another request.
    #[instrument(name = "runtime.switch_to", skip(self))]
    pub async fn switch_to(&self, id: &str) -> Result<SwitchOutcome, ErrorInfo> {
        self.ensure_live()?;
        self.admit(id).inspect_err(|e| {
            warn!(backend = %id, error = %e, "switch rejected; active backend unchanged");
        })?;

        {
            let active = self.active.write();
            if active.as_ref().is_some_and(|a| a.id == id) {
                let ticket = self.next_ticket();
                self.claimed_seq.fetch_max(ticket, Ordering::SeqCst);
                return Ok(SwitchOutcome::AlreadyActive);
            }
        }

        let ticket = self.next_ticket();
        let backend = self.materialize(id).await.inspect_err(|e| {
            warn!(backend = %id, error = %e, "switch failed; active backend unchanged");
        })?;

        let mut active = self.active.write();
        self.ensure_live()?;
        if self.claimed_seq.load(Ordering::SeqCst) > ticket {
            info!(backend = %id, "switch superseded by a newer request");
            return Ok(SwitchOutcome::Superseded);
        }
        self.claimed_seq.store(ticket, Ordering::SeqCst);

        let previous = active.replace(ActiveBackend {
            id: id.to_string(),
            backend,
        });
        info!(
            backend = %id,
            previous = ?previous.as_ref().map(|p| p.id.as_str()),
            "active backend switched"
        );
        Ok(SwitchOutcome::Activated)
    }

    /// `switch_to` bounded by a caller deadline. An abandoned load keeps running.
    pub async fn switch_to_with_deadline(
        &self,
        id: &str,
        deadline: Duration,
    ) -> Result<SwitchOutcome, ErrorInfo> {
        match tokio::time::timeout(deadline, self.switch_to(id)).await {
            Ok(outcome) => outcome,
            Err(_) => {
                warn!(backend = %id, ?deadline, "switch deadline elapsed");
                Err(ErrorInfo::timeout(
                    format!("loading backend '{id}'"),
                    deadline,
                ))
            }
        }
    }

    /// Run `code` on the active backend and return its result unchanged.
    ///
    /// Fails only when no backend is active; guest failures are inside the result.
    #[instrument(name = "runtime.execute", skip(self, code, options), fields(backend = tracing::field::Empty, bytes = code.len()))]
    pub async fn execute_code(
        &self,
        code: &str,
        options: &ExecOptions,
    ) -> Result<ExecutionResult, ErrorInfo> {
        let (id, backend) = {
            let active = self.active.read();
            match active.as_ref() {
                Some(a) => (a.id.clone(), Arc::clone(&a.backend)),
                None => return Err(ErrorInfo::no_active_backend()),
            }
        };
        tracing::Span::current().record("backend", id.as_str());

        match AssertUnwindSafe(backend.execute(code, options))
            .catch_unwind()
            .await
        {
            Ok(result) => {
                debug!(
                    success = result.success(),
                    elapsed_ms = result.execution_time_ms(),
                    "execution finished"
                );
                Ok(result)
            }
            Err(panic) => {
                let detail = panic_message(panic.as_ref());
                tracing::error!(backend = %id, panic = %detail, "backend panicked during execute");
                Ok(ExecutionResult::rejected(ErrorInfo::execution_failure(
                    format!("backend '{id}' panicked during execution: {detail}"),
                )))
            }
        }
    }

    /// `execute_code` bounded by a caller deadline; elapsing yields a `Timeout` result.
    pub async fn execute_with_deadline(
        &self,
        code: &str,
        options: &ExecOptions,
        deadline: Duration,
    ) -> Result<ExecutionResult, ErrorInfo> {
        let id = self.active_id().ok_or_else(ErrorInfo::no_active_backend)?;
        match tokio::time::timeout(deadline, self.execute_code(code, options)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(backend = %id, ?deadline, "execution deadline elapsed");
                Ok(ExecutionResult::failed(
                    ErrorInfo::timeout(format!("execution on backend '{id}'"), deadline),
                    String::new(),
                    deadline,
                ))
            }
        }
    }

    /// Load every eager backend. Failures are reported, never fatal, and the active
    /// pointer is not touched.
    #[instrument(name = "runtime.warm_up", skip(self))]
    pub async fn warm_up(&self) -> Result<WarmUpReport, ErrorInfo> {
        self.ensure_live()?;
        let eager: Vec<String> = self
            .registry
            .descriptors()
            .iter()
            .filter(|d| d.load_hint == LoadHint::Eager && self.permits(d))
            .map(|d| d.id.clone())
            .collect();

        let outcomes = futures::future::join_all(
            eager
                .iter()
                .map(|id| async move { (id.clone(), self.materialize(id).await) }),
        )
        .await;

        let mut report = WarmUpReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(_) => report.loaded.push(id),
                Err(e) => {
                    warn!(backend = %id, error = %e, "eager backend failed to load");
                    report.failed.push((id, e));
                }
            }
        }
        info!(loaded = ?report.loaded, failed = report.failed.len(), "warm-up finished");
        Ok(report)
    }

    /// Dispose every materialized backend, clear the active pointer and detach sinks.
    /// Safe to call more than once.
    #[instrument(name = "runtime.dispose", skip(self))]
    pub async fn dispose(&self) -> Result<(), DisposeError> {
        if !self.disposed.swap(true, Ordering::SeqCst) {
            info!("disposing runtime");
        }

        let result = self.cache.dispose_all().await;
        self.active.write().take();
        self.mux.detach();

        match &result {
            Ok(disposed) => debug!(?disposed, "all backends disposed"),
            Err(e) => warn!(error = %e, "runtime disposed with failures"),
        }
        result.map(|_| ())
    }
}

fn as_load_failure(id: &str, err: ErrorInfo) -> ErrorInfo {
    if err.kind == ErrorKind::LoadFailure && err.message.contains(id) {
        return err;
    }
    ErrorInfo {
        kind: ErrorKind::LoadFailure,
        message: format!("failed to load backend '{id}': {}", err.message),
        cause: err.cause,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
