//! Error types crossing the backend contract boundary.

use std::fmt;
use std::sync::Arc;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use thiserror::Error;

/// Shared, cloneable error used as the underlying cause of an [`ErrorInfo`].
pub type ErrorCause = Arc<dyn std::error::Error + Send + Sync + 'static>;

/// Failure taxonomy for everything the runtime reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    /// A backend's `load` was rejected (network or initialization problem).
    LoadFailure,
    /// The requested backend id is unknown, not permitted, or nothing is active.
    UnsupportedBackend,
    /// The guest code itself failed inside the backend.
    ExecutionFailure,
    /// A caller-side deadline elapsed.
    Timeout,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::LoadFailure => "LoadFailure",
            ErrorKind::UnsupportedBackend => "UnsupportedBackend",
            ErrorKind::ExecutionFailure => "ExecutionFailure",
            ErrorKind::Timeout => "Timeout",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed error carried by failed loads, switches and execution results.
///
/// `ErrorInfo` is `Clone` so that a single load outcome can be handed to every
/// caller that was waiting on the same in-flight load.
#[derive(Clone)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    pub cause: Option<ErrorCause>,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            cause: None,
        }
    }

    /// Attach the underlying error.
    pub fn with_cause<E>(mut self, cause: E) -> Self
    where
        E: Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    {
        self.cause = Some(Arc::from(cause.into()));
        self
    }

    pub fn load_failure(backend: &str, reason: impl fmt::Display) -> Self {
        Self::new(
            ErrorKind::LoadFailure,
            format!("failed to load backend '{backend}': {reason}"),
        )
    }

    pub fn unsupported(backend: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedBackend,
            format!("backend '{backend}' is not registered"),
        )
    }

    pub fn restricted(backend: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedBackend,
            format!("backend '{backend}' is restricted and restricted backends are not allowed"),
        )
    }

    pub fn no_active_backend() -> Self {
        Self::new(
            ErrorKind::UnsupportedBackend,
            "no active backend; switch to a backend before executing code",
        )
    }

    pub fn execution_failure(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ExecutionFailure, message)
    }

    pub fn not_loaded(backend: &str) -> Self {
        Self::new(
            ErrorKind::ExecutionFailure,
            format!("backend '{backend}' is not loaded; load it before executing code"),
        )
    }

    /// Error for any operation attempted on a disposed backend.
    pub fn disposed(backend: &str, kind: ErrorKind) -> Self {
        Self::new(kind, format!("backend '{backend}' has been disposed"))
    }

    pub fn timeout(what: impl fmt::Display, after: std::time::Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!("{what} did not complete within {} ms", after.as_millis()),
        )
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Debug for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorInfo")
            .field("kind", &self.kind)
            .field("message", &self.message)
            .field("cause", &self.cause.as_ref().map(|c| c.to_string()))
            .finish()
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({cause})")?;
        }
        Ok(())
    }
}

impl std::error::Error for ErrorInfo {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

impl Serialize for ErrorInfo {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut s = serializer.serialize_struct("ErrorInfo", 3)?;
        s.serialize_field("kind", &self.kind)?;
        s.serialize_field("message", &self.message)?;
        s.serialize_field("cause", &self.cause.as_ref().map(|c| c.to_string()))?;
        s.end()
    }
}

/// A single backend that failed to dispose.
#[derive(Debug)]
pub struct DisposeFailure {
    pub backend: String,
    pub error: anyhow::Error,
}

/// Collected teardown failures. Every other backend was still disposed.
#[derive(Debug, Error)]
#[error(
    "failed to dispose {} backend(s): {}",
    .failures.len(),
    .failures.iter().map(|f| format!("'{}': {:#}", f.backend, f.error)).collect::<Vec<_>>().join("; ")
)]
pub struct DisposeError {
    pub disposed: Vec<String>,
    pub failures: Vec<DisposeFailure>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn load_failure_names_backend_and_reason() {
        let err = ErrorInfo::load_failure("python", "net down");
        assert_eq!(err.kind, ErrorKind::LoadFailure);
        assert!(err.message.contains("python"));
        assert!(err.message.contains("net down"));
        assert!(err.to_string().starts_with("LoadFailure: "));
    }

    #[test]
    fn cause_is_exposed_as_source() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such binary");
        let err = ErrorInfo::load_failure("lua", "spawn failed").with_cause(io);

        let source = err.source().expect("cause should be the source");
        assert!(source.to_string().contains("no such binary"));
        assert!(err.to_string().contains("no such binary"));
    }

    #[test]
    fn anyhow_errors_can_be_causes() {
        let err = ErrorInfo::execution_failure("boom").with_cause(anyhow::anyhow!("inner"));
        assert!(err.cause.is_some());
        assert_eq!(err.clone().cause.unwrap().to_string(), "inner");
    }

    #[test]
    fn serializes_cause_as_text() {
        let err = ErrorInfo::unsupported("cobol").with_cause(anyhow::anyhow!("missing"));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "UnsupportedBackend");
        assert_eq!(json["cause"], "missing");
    }

    #[test]
    fn dispose_error_lists_every_failure() {
        let err = DisposeError {
            disposed: vec!["a".into()],
            failures: vec![
                DisposeFailure {
                    backend: "b".into(),
                    error: anyhow::anyhow!("stuck"),
                },
                DisposeFailure {
                    backend: "c".into(),
                    error: anyhow::anyhow!("gone"),
                },
            ],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 backend(s)"));
        assert!(msg.contains("'b': stuck"));
        assert!(msg.contains("'c': gone"));
    }
}
