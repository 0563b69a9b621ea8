//! Interpreter backends that run each execution in a fresh child process.
//!
//! Code is written to the child's stdin. Stdout and stderr are read line by line and
//! forwarded to the output and error sinks as they arrive.

use std::collections::HashMap;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use runkit::{
    Backend, BackendRef, ErrorInfo, ErrorKind, EventSink, ExecOptions, ExecutionResult,
    LifecycleState, LoadGate, SinkSlot,
};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How to start an interpreter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterpreterSpec {
    pub program: String,
    /// Arguments that make the interpreter read a program from stdin.
    pub args: Vec<String>,
    /// Arguments for the availability probe run during `load`.
    pub version_args: Vec<String>,
    pub env: HashMap<String, String>,
}

impl InterpreterSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            version_args: vec!["--version".to_string()],
            env: HashMap::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_version_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.version_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }
}

/// Per-call options recognised in `ExecOptions`.
#[derive(Debug, Default)]
struct CallOptions {
    args: Vec<String>,
    env: Vec<(String, String)>,
}

impl CallOptions {
    fn parse(options: &ExecOptions) -> Result<Self, String> {
        let mut parsed = CallOptions::default();
        for (key, value) in options {
            match key.as_str() {
                "args" => {
                    let items = value
                        .as_array()
                        .ok_or("option 'args' must be an array of strings")?;
                    for item in items {
                        let s = item
                            .as_str()
                            .ok_or("option 'args' must be an array of strings")?;
                        parsed.args.push(s.to_string());
                    }
                }
                "env" => {
                    let map = value
                        .as_object()
                        .ok_or("option 'env' must be an object of strings")?;
                    for (k, v) in map {
                        let s = v
                            .as_str()
                            .ok_or_else(|| format!("env var '{k}' must be a string"))?;
                        parsed.env.push((k.clone(), s.to_string()));
                    }
                }
                other => debug!(option = %other, "ignoring unknown execution option"),
            }
        }
        Ok(parsed)
    }
}

pub struct ProcessBackend {
    id: String,
    spec: InterpreterSpec,
    gate: LoadGate,
    output: Arc<SinkSlot>,
    errors: Arc<SinkSlot>,
    shutdown: CancellationToken,
}

impl ProcessBackend {
    pub fn new(id: impl Into<String>, spec: InterpreterSpec) -> Self {
        let id = id.into();
        Self {
            gate: LoadGate::new(id.clone()),
            id,
            spec,
            output: Arc::new(SinkSlot::new()),
            errors: Arc::new(SinkSlot::new()),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn shared(id: impl Into<String>, spec: InterpreterSpec) -> BackendRef {
        Arc::new(Self::new(id, spec))
    }

    pub fn spec(&self) -> &InterpreterSpec {
        &self.spec
    }
}

/// Spawn the interpreter with its version flag and require a clean exit.
async fn probe(id: String, spec: InterpreterSpec) -> Result<(), ErrorInfo> {
    let status = Command::new(&spec.program)
        .args(&spec.version_args)
        .envs(&spec.env)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .kill_on_drop(true)
        .status()
        .await
        .map_err(|e| {
            ErrorInfo::load_failure(&id, format!("cannot start '{}': {e}", spec.program))
                .with_cause(e)
        })?;

    if !status.success() {
        return Err(ErrorInfo::load_failure(
            &id,
            format!("'{}' probe exited with {status}", spec.program),
        ));
    }
    info!(backend = %id, program = %spec.program, "interpreter available");
    Ok(())
}

type PumpTask = JoinHandle<std::io::Result<Vec<String>>>;

/// Forward every line of `stream` to `sink` until EOF, returning what was read.
/// Bytes that are not valid UTF-8 are replaced, never fatal.
async fn pump<R>(stream: R, sink: Arc<SinkSlot>) -> std::io::Result<Vec<String>>
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut seen = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        if buf.last() == Some(&b'\n') {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        let line = String::from_utf8_lossy(&buf).into_owned();
        sink.emit(&line);
        seen.push(line);
    }
    Ok(seen)
}

/// Wait for a pump to finish; a read failure is reported against the interpreter.
async fn drain(task: PumpTask, stream: &str, program: &str) -> Result<Vec<String>, ErrorInfo> {
    match task.await {
        Ok(Ok(lines)) => Ok(lines),
        Ok(Err(e)) => Err(ErrorInfo::execution_failure(format!(
            "failed reading {stream} of '{program}': {e}"
        ))
        .with_cause(e)),
        Err(e) => Err(ErrorInfo::execution_failure(format!(
            "{stream} reader for '{program}' stopped: {e}"
        ))
        .with_cause(e)),
    }
}

fn describe_exit(program: &str, status: ExitStatus, stderr: &[String]) -> String {
    match stderr.last() {
        Some(last) => format!("'{program}' exited with {status}: {last}"),
        None => format!("'{program}' exited with {status}"),
    }
}

#[async_trait]
impl Backend for ProcessBackend {
    fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> LifecycleState {
        self.gate.state()
    }

    async fn load(&self) -> Result<(), ErrorInfo> {
        let id = self.id.clone();
        let spec = self.spec.clone();
        self.gate.load_with(move || probe(id, spec)).await
    }

    async fn execute(&self, code: &str, options: &ExecOptions) -> ExecutionResult {
        if let Some(err) = self.gate.execute_guard() {
            return ExecutionResult::rejected(err);
        }
        let call = match CallOptions::parse(options) {
            Ok(call) => call,
            Err(msg) => return ExecutionResult::rejected(ErrorInfo::execution_failure(msg)),
        };

        let run_id = Uuid::now_v7();
        let started = Instant::now();
        debug!(backend = %self.id, %run_id, bytes = code.len(), "spawning interpreter");

        let spawned = Command::new(&self.spec.program)
            .args(&self.spec.args)
            .args(&call.args)
            .envs(&self.spec.env)
            .envs(call.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                return ExecutionResult::failed(
                    ErrorInfo::execution_failure(format!(
                        "cannot start '{}': {e}",
                        self.spec.program
                    ))
                    .with_cause(e),
                    "",
                    started.elapsed(),
                )
            }
        };

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return ExecutionResult::failed(
                ErrorInfo::execution_failure("interpreter stdio was not captured"),
                "",
                started.elapsed(),
            );
        };

        let out_task = tokio::spawn(pump(stdout, Arc::clone(&self.output)));
        let err_task = tokio::spawn(pump(stderr, Arc::clone(&self.errors)));

        let code = code.to_string();
        let feed = async move {
            stdin.write_all(code.as_bytes()).await?;
            if !code.ends_with('\n') {
                stdin.write_all(b"\n").await?;
            }
            stdin.shutdown().await
        };

        let waited = tokio::select! {
            status = async {
                if let Err(e) = feed.await {
                    // The interpreter may exit before reading all of stdin.
                    debug!(%run_id, error = %e, "stdin closed early");
                }
                child.wait().await
            } => Some(status),
            _ = self.shutdown.cancelled() => None,
        };

        let status = match waited {
            Some(status) => status,
            None => {
                if let Err(e) = child.kill().await {
                    warn!(backend = %self.id, %run_id, error = %e, "failed to kill interpreter");
                }
                out_task.abort();
                err_task.abort();
                return ExecutionResult::failed(
                    ErrorInfo::disposed(&self.id, ErrorKind::ExecutionFailure),
                    "",
                    started.elapsed(),
                );
            }
        };

        let program = self.spec.program.as_str();
        let (stdout_lines, stderr_lines) = tokio::join!(
            drain(out_task, "stdout", program),
            drain(err_task, "stderr", program),
        );
        let (stdout_lines, stderr_lines) = match (stdout_lines, stderr_lines) {
            (Ok(out), Ok(err)) => (out, err),
            (Err(e), _) | (_, Err(e)) => {
                warn!(backend = %self.id, %run_id, error = %e, "lost interpreter output");
                return ExecutionResult::failed(e, "", started.elapsed());
            }
        };
        let output = stdout_lines.join("\n");
        let elapsed = started.elapsed();

        match status {
            Ok(status) if status.success() => {
                debug!(backend = %self.id, %run_id, ?elapsed, "interpreter finished");
                ExecutionResult::ok(output, elapsed)
            }
            Ok(status) => {
                debug!(backend = %self.id, %run_id, %status, "interpreter reported failure");
                ExecutionResult::failed(
                    ErrorInfo::execution_failure(describe_exit(
                        &self.spec.program,
                        status,
                        &stderr_lines,
                    )),
                    output,
                    elapsed,
                )
            }
            Err(e) => ExecutionResult::failed(
                ErrorInfo::execution_failure(format!(
                    "failed waiting for '{}': {e}",
                    self.spec.program
                ))
                .with_cause(e),
                output,
                elapsed,
            ),
        }
    }

    fn subscribe_output(&self, sink: EventSink) {
        self.output.replace(sink);
    }

    fn subscribe_error(&self, sink: EventSink) {
        self.errors.replace(sink);
    }

    async fn dispose(&self) -> anyhow::Result<()> {
        if self.gate.dispose() {
            debug!(backend = %self.id, "disposing interpreter backend");
        }
        self.shutdown.cancel();
        self.output.clear();
        self.errors.clear();
        Ok(())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    fn sh() -> InterpreterSpec {
        InterpreterSpec::new("sh")
            .with_args(["-s", "--"])
            .with_version_args(["-c", "exit 0"])
    }

    async fn loaded(spec: InterpreterSpec) -> ProcessBackend {
        let backend = ProcessBackend::new("sh", spec);
        backend.load().await.unwrap();
        backend
    }

    #[tokio::test]
    async fn load_probes_the_program() {
        let backend = ProcessBackend::new("sh", sh());
        backend.load().await.unwrap();
        assert_eq!(backend.state(), LifecycleState::Loaded);
    }

    #[tokio::test]
    async fn missing_program_is_a_load_failure() {
        let backend = ProcessBackend::new(
            "ghost",
            InterpreterSpec::new("definitely-not-an-interpreter-7f3a"),
        );
        let err = backend.load().await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::LoadFailure);
        assert!(err.message.contains("definitely-not-an-interpreter-7f3a"));
        assert_eq!(backend.state(), LifecycleState::Unloaded);
    }

    #[tokio::test]
    async fn failing_probe_is_a_load_failure() {
        let backend = ProcessBackend::new("sh", sh().with_version_args(["-c", "exit 4"]));
        let err = backend.load().await.unwrap_err();
        assert!(err.message.contains("probe exited"), "{err}");
    }

    #[tokio::test]
    async fn streams_stdout_and_stderr_to_sinks() {
        let backend = loaded(sh()).await;
        let (out, mut out_rx) = EventSink::channel();
        let (err, mut err_rx) = EventSink::channel();
        backend.subscribe_output(out);
        backend.subscribe_error(err);

        let r = backend
            .execute("echo one\necho two\necho oops >&2", &ExecOptions::new())
            .await;

        assert!(r.success(), "{:?}", r.error());
        assert_eq!(r.output(), "one\ntwo");
        assert_eq!(out_rx.recv().await.as_deref(), Some("one"));
        assert_eq!(out_rx.recv().await.as_deref(), Some("two"));
        assert_eq!(err_rx.recv().await.as_deref(), Some("oops"));
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_execution_failure() {
        let backend = loaded(sh()).await;
        let r = backend
            .execute("echo partial\necho bad input >&2\nexit 3", &ExecOptions::new())
            .await;

        assert!(!r.success());
        assert_eq!(r.output(), "partial");
        let err = r.error().unwrap();
        assert_eq!(err.kind, ErrorKind::ExecutionFailure);
        assert!(err.message.contains("bad input"), "{}", err.message);
    }

    #[tokio::test]
    async fn invalid_utf8_output_is_replaced_not_fatal() {
        let backend = loaded(sh()).await;
        let (out, mut out_rx) = EventSink::channel();
        backend.subscribe_output(out);

        let r = backend
            .execute("echo before\nprintf '\\377\\n'\necho after", &ExecOptions::new())
            .await;

        assert!(r.success(), "{:?}", r.error());
        assert_eq!(r.output(), "before\n\u{FFFD}\nafter");
        assert_eq!(out_rx.recv().await.as_deref(), Some("before"));
        assert_eq!(out_rx.recv().await.as_deref(), Some("\u{FFFD}"));
        assert_eq!(out_rx.recv().await.as_deref(), Some("after"));
    }

    #[tokio::test]
    async fn options_supply_args_and_env() {
        let backend = loaded(sh()).await;
        let mut options = ExecOptions::new();
        options.insert("args".into(), serde_json::json!(["alpha", "beta"]));
        options.insert("env".into(), serde_json::json!({ "GREETING": "hi" }));

        let r = backend.execute("echo \"$GREETING $1 $2\"", &options).await;
        assert_eq!(r.output(), "hi alpha beta");
    }

    #[tokio::test]
    async fn malformed_options_are_rejected() {
        let backend = loaded(sh()).await;
        let mut options = ExecOptions::new();
        options.insert("args".into(), serde_json::json!("not-a-list"));

        let r = backend.execute("true", &options).await;
        assert_eq!(r.error_kind(), Some(ErrorKind::ExecutionFailure));
        assert!(r.error().unwrap().message.contains("'args'"));
    }

    #[tokio::test]
    async fn dispose_cancels_running_execution() {
        let backend = Arc::new(loaded(sh()).await);
        let runner = Arc::clone(&backend);
        let run = tokio::spawn(async move { runner.execute("sleep 30", &ExecOptions::new()).await });

        tokio::time::sleep(Duration::from_millis(100)).await;
        let started = Instant::now();
        backend.dispose().await.unwrap();
        let r = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();

        assert!(!r.success());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(r.error().unwrap().message.contains("disposed"));
    }
}
