//! Per-call execution outcome.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use crate::errors::{ErrorInfo, ErrorKind};

/// Free-form per-call options passed verbatim to the backend.
pub type ExecOptions = HashMap<String, serde_json::Value>;

/// Structured result of a single `execute` call.
///
/// `success` is false exactly when `error` is present; the constructors are the
/// only way to build one, so the pairing cannot drift.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    success: bool,
    output: String,
    return_value: Option<serde_json::Value>,
    error: Option<ErrorInfo>,
    execution_time_ms: f64,
}

impl ExecutionResult {
    pub fn ok(output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: true,
            output: output.into(),
            return_value: None,
            error: None,
            execution_time_ms: millis(elapsed),
        }
    }

    pub fn failed(error: ErrorInfo, output: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            success: false,
            output: output.into(),
            return_value: None,
            error: Some(error),
            execution_time_ms: millis(elapsed),
        }
    }

    /// Failure that happened before any guest code ran.
    pub fn rejected(error: ErrorInfo) -> Self {
        Self::failed(error, String::new(), Duration::ZERO)
    }

    pub fn with_return_value(mut self, value: serde_json::Value) -> Self {
        self.return_value = Some(value);
        self
    }

    pub fn success(&self) -> bool {
        self.success
    }

    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn return_value(&self) -> Option<&serde_json::Value> {
        self.return_value.as_ref()
    }

    pub fn error(&self) -> Option<&ErrorInfo> {
        self.error.as_ref()
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    pub fn execution_time_ms(&self) -> f64 {
        self.execution_time_ms
    }
}

fn millis(elapsed: Duration) -> f64 {
    elapsed.as_secs_f64() * 1000.0
}
