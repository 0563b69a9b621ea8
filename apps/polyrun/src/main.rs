use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mimalloc::MiMalloc;
use runkit::{
    AccessTier, ErrorInfo, ExecOptions, ExecutionResult, RuntimeManager, StreamKind,
    SwitchOutcome,
};
use runkit_bootstrap::{AppConfig, AppConfigProvider, CliArgs, RuntimeConfig};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::task::JoinHandle;

mod repl;

use repl::ReplCommand;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

/// Exit status when the guest program failed (the tool itself worked).
const EXIT_CODE_FAILED: u8 = 1;
/// Exit status for configuration, registry or backend loading problems.
const EXIT_TOOL_FAILED: u8 = 2;

/// polyrun - run code on pluggable interpreter backends
#[derive(Parser)]
#[command(name = "polyrun")]
#[command(about = "polyrun - run code on pluggable interpreter backends")]
#[command(version = "0.1.0")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Print effective configuration (YAML) and exit
    #[arg(long)]
    print_config: bool,

    /// Log verbosity level (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// List registered backends
    List,
    /// Execute a program once
    Run {
        /// Backend id (defaults to runtime.default_backend)
        #[arg(short, long)]
        backend: Option<String>,
        /// Read the program from a file
        #[arg(short, long, conflicts_with = "code")]
        file: Option<PathBuf>,
        /// Program text; stdin is read when neither --file nor --code is given
        #[arg(short = 'e', long)]
        code: Option<String>,
        /// Print the execution result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Interactive session
    Repl {
        #[arg(short, long)]
        backend: Option<String>,
    },
    /// Validate configuration and backend catalog, then exit
    Check,
}

impl Commands {
    fn backend(&self) -> Option<&str> {
        match self {
            Commands::Run { backend, .. } | Commands::Repl { backend } => backend.as_deref(),
            Commands::List | Commands::Check => None,
        }
    }

    /// Whether guest output is forwarded to the terminal.
    fn streams(&self) -> bool {
        matches!(
            self,
            Commands::Run { json: false, .. } | Commands::Repl { .. }
        )
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run_cli().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "polyrun failed");
            eprintln!("error: {e:#}");
            ExitCode::from(EXIT_TOOL_FAILED)
        }
    }
}

async fn run_cli() -> Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::List);

    let args = CliArgs {
        verbose: cli.verbose,
        backend: command.backend().map(str::to_string),
    };

    // Layered config:
    // 1) defaults -> 2) YAML (if provided) -> 3) env (POLYRUN__*) -> 4) CLI overrides
    let mut config = AppConfig::load_or_default(cli.config.as_deref())?;
    config.apply_cli_overrides(&args);

    let logging_config = config
        .logging
        .clone()
        .unwrap_or_else(runkit_bootstrap::default_logging_config);
    runkit_bootstrap::init_logging_unified(&logging_config, &config.home_path());

    if cli.print_config {
        println!("{}", config.to_yaml()?);
        return Ok(ExitCode::SUCCESS);
    }

    let runtime = build_runtime(&config)?;
    tracing::info!(backends = runtime.registry().len(), "polyrun starting");

    let printers = command.streams().then(|| attach_console(&runtime));

    let outcome = match command {
        Commands::List => list_backends(&runtime),
        Commands::Check => check_config(&config, &runtime),
        Commands::Run {
            file, code, json, ..
        } => run_once(&runtime, &config.runtime, file, code, json).await,
        Commands::Repl { .. } => repl_session(&runtime, &config.runtime).await,
    };

    if let Err(e) = runtime.dispose().await {
        tracing::warn!(error = %e, "backend teardown incomplete");
        eprintln!("warning: {e}");
    }
    // Sinks were detached by dispose; drain whatever is still buffered.
    if let Some(printers) = printers {
        for handle in printers {
            let _ = handle.await;
        }
    }

    outcome
}

fn build_runtime(config: &AppConfig) -> Result<RuntimeManager> {
    let provider = AppConfigProvider::new(config.clone());
    let mut builder = script_backends::discovered_with_config(&provider)?;
    builder.with_overrides(config.catalog.iter().cloned());
    let registry = builder.build().context("Invalid backend catalog")?;
    Ok(RuntimeManager::with_options(
        registry,
        config.runtime.runtime_options(),
    ))
}

/// Forward guest output to stdout and guest errors to stderr.
fn attach_console(runtime: &RuntimeManager) -> Vec<JoinHandle<()>> {
    [StreamKind::Output, StreamKind::Error]
        .into_iter()
        .map(|kind| {
            let mut rx = match kind {
                StreamKind::Output => runtime.output_channel(),
                StreamKind::Error => runtime.error_channel(),
            };
            tokio::spawn(async move {
                while let Some(line) = rx.recv().await {
                    match kind {
                        StreamKind::Output => println!("{line}"),
                        StreamKind::Error => eprintln!("{line}"),
                    }
                }
            })
        })
        .collect()
}

fn list_backends(runtime: &RuntimeManager) -> Result<ExitCode> {
    println!("{:<12} {:<20} {:<10} AVAILABLE", "ID", "NAME", "TIER");
    for info in runtime.registry().list() {
        let tier = match info.access_tier {
            AccessTier::Free => "free",
            AccessTier::Restricted => "restricted",
        };
        let available = if runtime.is_available(&info.id) {
            "yes"
        } else {
            "no"
        };
        println!(
            "{:<12} {:<20} {:<10} {}",
            info.id, info.display_name, tier, available
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn check_config(config: &AppConfig, runtime: &RuntimeManager) -> Result<ExitCode> {
    tracing::info!("Checking configuration…");
    if let Some(id) = &config.runtime.default_backend {
        if !runtime.is_available(id) {
            bail!("runtime.default_backend '{id}' is not an available backend");
        }
    }
    println!(
        "Configuration is valid ({} backends, {} available)",
        runtime.registry().len(),
        runtime.list_available().len()
    );
    println!("{}", config.to_yaml()?);
    Ok(ExitCode::SUCCESS)
}

async fn prepare(runtime: &RuntimeManager, rt: &RuntimeConfig) -> Result<()> {
    if rt.warm_up {
        let report = runtime.warm_up().await?;
        for (id, err) in &report.failed {
            tracing::warn!(backend = %id, error = %err, "warm-up skipped backend");
        }
    }
    Ok(())
}

async fn activate(
    runtime: &RuntimeManager,
    rt: &RuntimeConfig,
    id: &str,
) -> Result<(), ErrorInfo> {
    let outcome = match rt.load_timeout {
        Some(deadline) => runtime.switch_to_with_deadline(id, deadline).await?,
        None => runtime.switch_to(id).await?,
    };
    if outcome == SwitchOutcome::Superseded {
        tracing::debug!(backend = %id, "switch superseded");
    }
    Ok(())
}

async fn execute(
    runtime: &RuntimeManager,
    rt: &RuntimeConfig,
    code: &str,
) -> Result<ExecutionResult, ErrorInfo> {
    let options = ExecOptions::new();
    match rt.execute_timeout {
        Some(deadline) => runtime.execute_with_deadline(code, &options, deadline).await,
        None => runtime.execute_code(code, &options).await,
    }
}

async fn read_program(file: Option<PathBuf>, code: Option<String>) -> Result<String> {
    if let Some(code) = code {
        return Ok(code);
    }
    if let Some(path) = file {
        return tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Failed to read {}", path.display()));
    }
    let mut buf = String::new();
    tokio::io::stdin()
        .read_to_string(&mut buf)
        .await
        .context("Failed to read program from stdin")?;
    Ok(buf)
}

async fn run_once(
    runtime: &RuntimeManager,
    rt: &RuntimeConfig,
    file: Option<PathBuf>,
    code: Option<String>,
    json: bool,
) -> Result<ExitCode> {
    let Some(backend) = rt.default_backend.clone() else {
        bail!("no backend selected: pass --backend or set runtime.default_backend");
    };
    let program = read_program(file, code).await?;

    prepare(runtime, rt).await?;
    activate(runtime, rt, &backend).await?;
    let result = execute(runtime, rt, &program).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else if let Some(err) = result.error() {
        eprintln!("{}: {}", err.kind, err.message);
    }
    tracing::info!(
        backend = %backend,
        success = result.success(),
        elapsed_ms = result.execution_time_ms(),
        "run finished"
    );

    Ok(if result.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_CODE_FAILED)
    })
}

async fn repl_session(runtime: &RuntimeManager, rt: &RuntimeConfig) -> Result<ExitCode> {
    prepare(runtime, rt).await?;
    if let Some(id) = &rt.default_backend {
        if let Err(e) = activate(runtime, rt, id).await {
            eprintln!("{}: {}", e.kind, e.message);
        }
    }
    eprintln!("{}", repl::HELP);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let shutdown = runkit_bootstrap::wait_for_shutdown();
    tokio::pin!(shutdown);

    loop {
        eprint!("{}> ", runtime.active_id().as_deref().unwrap_or("-"));
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read from stdin")?,
            signal = &mut shutdown => {
                let signal = signal?;
                eprintln!();
                tracing::info!(%signal, "leaving interactive session");
                break;
            }
        };
        let Some(line) = line else { break };

        match ReplCommand::parse(&line) {
            ReplCommand::Empty => {}
            ReplCommand::Quit => break,
            ReplCommand::Help => eprintln!("{}", repl::HELP),
            ReplCommand::List => {
                for info in runtime.list_available() {
                    let marker = if runtime.active_id().as_deref() == Some(info.id.as_str()) {
                        "*"
                    } else {
                        " "
                    };
                    eprintln!("{marker} {:<12} {}", info.id, info.display_name);
                }
            }
            ReplCommand::Use(id) => {
                if let Err(e) = activate(runtime, rt, &id).await {
                    eprintln!("{}: {}", e.kind, e.message);
                }
            }
            ReplCommand::Unknown(text) => eprintln!("unknown command '{text}', try :help"),
            ReplCommand::Code(code) => match execute(runtime, rt, &code).await {
                Ok(result) => {
                    if let Some(err) = result.error() {
                        eprintln!("{}: {}", err.kind, err.message);
                    }
                }
                Err(e) => eprintln!("{}: {}", e.kind, e.message),
            },
        }
        // Let the console printers catch up before the next prompt.
        tokio::task::yield_now().await;
    }

    Ok(ExitCode::SUCCESS)
}
