//! Configurable in-crate backend double for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::contracts::{Backend, BackendRef};
use crate::errors::ErrorInfo;
use crate::lifecycle::{LifecycleState, LoadGate};
use crate::result::{ExecOptions, ExecutionResult};
use crate::sink::{EventSink, SinkSlot};

pub(crate) struct ScriptedBackend {
    id: String,
    gate: LoadGate,
    output: SinkSlot,
    errors: SinkSlot,
    load_failure: Option<String>,
    load_delay: Duration,
    dispose_fails: bool,
    panics: bool,
    pub(crate) load_calls: AtomicUsize,
    pub(crate) execute_calls: AtomicUsize,
    pub(crate) dispose_calls: AtomicUsize,
}

impl ScriptedBackend {
    pub(crate) fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            gate: LoadGate::new(id),
            output: SinkSlot::new(),
            errors: SinkSlot::new(),
            load_failure: None,
            load_delay: Duration::ZERO,
            dispose_fails: false,
            panics: false,
            load_calls: AtomicUsize::new(0),
            execute_calls: AtomicUsize::new(0),
            dispose_calls: AtomicUsize::new(0),
        }
    }

    pub(crate) fn shared(id: &str) -> BackendRef {
        Arc::new(Self::new(id))
    }

    pub(crate) fn failing_load(mut self, reason: &str) -> Self {
        self.load_failure = Some(reason.to_string());
        self
    }

    pub(crate) fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    pub(crate) fn failing_dispose(mut self) -> Self {
        self.dispose_fails = true;
        self
    }

    pub(crate) fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }

    /// Push an event as if emitted asynchronously by the guest program.
    pub(crate) fn emit_output(&self, text: &str) -> bool {
        self.output.emit(text)
    }
}

#[async_trait]
impl Backend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.gate.state()
    }

    async fn load(&self) -> Result<(), ErrorInfo> {
        let failure = self.load_failure.clone();
        let delay = self.load_delay;
        self.gate
            .load_with(|| {
                self.load_calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    match failure {
                        Some(reason) => Err(ErrorInfo::new(
                            crate::errors::ErrorKind::LoadFailure,
                            reason,
                        )),
                        None => Ok(()),
                    }
                }
            })
            .await
    }

    async fn execute(&self, code: &str, _options: &ExecOptions) -> ExecutionResult {
        if let Some(err) = self.gate.execute_guard() {
            return ExecutionResult::rejected(err);
        }
        self.execute_calls.fetch_add(1, Ordering::SeqCst);
        if self.panics {
            panic!("scripted panic in {}", self.id);
        }

        let started = Instant::now();
        if let Some(msg) = code.strip_prefix("fail:") {
            self.errors.emit(msg);
            return ExecutionResult::failed(
                ErrorInfo::execution_failure(msg.to_string()),
                "",
                started.elapsed(),
            );
        }
        self.output.emit(code);
        ExecutionResult::ok(format!("{}:{}", self.id, code), started.elapsed())
    }

    fn subscribe_output(&self, sink: EventSink) {
        self.output.replace(sink);
    }

    fn subscribe_error(&self, sink: EventSink) {
        self.errors.replace(sink);
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.dispose_calls.fetch_add(1, Ordering::SeqCst);
        self.gate.dispose();
        self.output.clear();
        self.errors.clear();
        if self.dispose_fails {
            anyhow::bail!("{} refused to shut down", self.id);
        }
        Ok(())
    }
}
