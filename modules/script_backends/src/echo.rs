//! In-process backend that hands code straight back. Useful as a warm default and
//! for exercising sinks without an interpreter installed.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use runkit::{
    Backend, BackendRef, ErrorInfo, EventSink, ExecOptions, ExecutionResult, LifecycleState,
    LoadGate, SinkSlot,
};

pub struct EchoBackend {
    id: String,
    gate: LoadGate,
    output: SinkSlot,
    errors: SinkSlot,
}

impl EchoBackend {
    pub fn new(id: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            gate: LoadGate::new(id.clone()),
            id,
            output: SinkSlot::new(),
            errors: SinkSlot::new(),
        }
    }

    pub fn shared(id: impl Into<String>) -> BackendRef {
        Arc::new(Self::new(id))
    }
}

#[async_trait]
impl Backend for EchoBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.gate.state()
    }

    async fn load(&self) -> Result<(), ErrorInfo> {
        self.gate.load_with(|| async { Ok(()) }).await
    }

    async fn execute(&self, code: &str, _options: &ExecOptions) -> ExecutionResult {
        if let Some(err) = self.gate.execute_guard() {
            return ExecutionResult::rejected(err);
        }
        let started = Instant::now();
        for line in code.lines() {
            self.output.emit(line);
        }
        ExecutionResult::ok(code, started.elapsed())
            .with_return_value(serde_json::Value::String(code.to_string()))
    }

    fn subscribe_output(&self, sink: EventSink) {
        self.output.replace(sink);
    }

    fn subscribe_error(&self, sink: EventSink) {
        self.errors.replace(sink);
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        self.gate.dispose();
        self.output.clear();
        self.errors.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use runkit::ErrorKind;

    #[tokio::test]
    async fn echoes_code_and_streams_each_line() {
        let echo = EchoBackend::new("echo");
        let (sink, mut rx) = EventSink::channel();
        echo.subscribe_output(sink);
        echo.load().await.unwrap();

        let r = echo.execute("a\nb", &ExecOptions::new()).await;

        assert!(r.success());
        assert_eq!(r.output(), "a\nb");
        assert!(r.execution_time_ms() > 0.0);
        assert_eq!(r.return_value(), Some(&serde_json::json!("a\nb")));
        assert_eq!(rx.recv().await.as_deref(), Some("a"));
        assert_eq!(rx.recv().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn rejects_execute_before_load_and_after_dispose() {
        let echo = EchoBackend::new("echo");
        let r = echo.execute("x", &ExecOptions::new()).await;
        assert_eq!(r.error_kind(), Some(ErrorKind::ExecutionFailure));

        echo.load().await.unwrap();
        echo.dispose().await.unwrap();
        assert_eq!(echo.state(), LifecycleState::Disposed);
        assert!(!echo.execute("x", &ExecOptions::new()).await.success());
        assert!(echo.load().await.is_err());
    }
}
