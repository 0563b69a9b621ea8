use std::sync::Arc;

use async_trait::async_trait;

use crate::errors::ErrorInfo;
use crate::lifecycle::LifecycleState;
use crate::result::{ExecOptions, ExecutionResult};
use crate::sink::EventSink;

/// Contract every code-execution backend satisfies.
///
/// Implementations are usually built around a [`crate::LoadGate`] (state machine)
/// and two [`crate::SinkSlot`]s (output and error subscriptions).
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Registry id this instance was created for.
    fn id(&self) -> &str;

    /// Current lifecycle state. Pure query.
    fn state(&self) -> LifecycleState;

    fn is_loaded(&self) -> bool {
        self.state() == LifecycleState::Loaded
    }

    /// Materialize the backend. Returns immediately when already loaded; callers
    /// arriving while a load is running await that load instead of starting another.
    /// On failure the backend returns to `Unloaded` so the load can be retried.
    async fn load(&self) -> Result<(), ErrorInfo>;

    /// Run `code`. Never panics across this boundary: every failure, including
    /// "not loaded" and "disposed", is reported through `ExecutionResult::error`.
    async fn execute(&self, code: &str, options: &ExecOptions) -> ExecutionResult;

    /// Attach the single output consumer, replacing any previous one.
    fn subscribe_output(&self, sink: EventSink);

    /// Attach the single error consumer, replacing any previous one.
    fn subscribe_error(&self, sink: EventSink);

    /// Release held resources. Idempotent; afterwards `load` and `execute` fail
    /// with a "disposed" error.
    async fn dispose(&self) -> anyhow::Result<()>;
}

/// Shared handle to a materialized backend.
pub type BackendRef = Arc<dyn Backend>;
