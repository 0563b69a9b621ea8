//! The built-in catalog driven through the runtime manager.

use runkit::{BackendRegistry, ErrorKind, ExecOptions, RuntimeManager, RuntimeOptions};

// Referencing the crate keeps its inventory submissions linked into this test binary.
use script_backends::MODULE_NAME as _;

#[tokio::test]
async fn echo_end_to_end() {
    let runtime = RuntimeManager::new(BackendRegistry::discover().unwrap());
    let mut out = runtime.output_channel();

    runtime.switch_to("echo").await.unwrap();
    let result = runtime
        .execute_code("hello", &ExecOptions::new())
        .await
        .unwrap();

    assert!(result.success());
    assert_eq!(result.output(), "hello");
    assert!(result.execution_time_ms() > 0.0);
    assert_eq!(out.recv().await.as_deref(), Some("hello"));

    runtime.dispose().await.unwrap();
}

#[tokio::test]
async fn warm_up_materializes_echo_only() {
    let runtime = RuntimeManager::new(BackendRegistry::discover().unwrap());

    let report = runtime.warm_up().await.unwrap();

    assert_eq!(report.loaded, vec!["echo".to_string()]);
    assert!(report.failed.is_empty());
    assert_eq!(runtime.materialized_ids(), vec!["echo".to_string()]);
    assert!(runtime.active_id().is_none());
}

#[tokio::test]
async fn restricted_builtins_can_be_locked_out() {
    let runtime = RuntimeManager::with_options(
        BackendRegistry::discover().unwrap(),
        RuntimeOptions {
            allow_restricted: false,
        },
    );

    assert!(!runtime.is_available("sqlite"));
    assert!(!runtime.is_available("ruby"));
    assert!(runtime.is_available("python"));

    let err = runtime.switch_to("sqlite").await.unwrap_err();
    assert_eq!(err.kind, ErrorKind::UnsupportedBackend);
}

#[tokio::test]
async fn missing_interpreter_keeps_echo_active() {
    let mut builder = BackendRegistry::builder();
    script_backends::register_builtins(&mut builder);
    builder.register(runkit::BackendDescriptor::new("ghost", "Ghost", || {
        script_backends::ProcessBackend::shared(
            "ghost",
            script_backends::InterpreterSpec::new("no-such-interpreter-9c1e"),
        )
    }));
    let runtime = RuntimeManager::new(builder.build().unwrap());

    runtime.switch_to("echo").await.unwrap();
    let err = runtime.switch_to("ghost").await.unwrap_err();

    assert_eq!(err.kind, ErrorKind::LoadFailure);
    assert!(err.message.contains("no-such-interpreter-9c1e"));
    assert_eq!(runtime.active_id().as_deref(), Some("echo"));
}
