use crate::config::{LoggingConfig, Section};
use std::collections::HashMap;
use std::io::{IsTerminal, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::level_filters::LevelFilter;
use tracing::Level;
use tracing_subscriber::filter::Targets;
use tracing_subscriber::{fmt, util::SubscriberInitExt, Layer};

use file_rotate::{
    compression::Compression,
    suffix::{AppendTimestamp, FileLimit},
    ContentLimit, FileRotate,
};

// Keep the non-blocking console worker alive for the life of the process.
static CONSOLE_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

const DEFAULT_SECTION: &str = "default";
const DEFAULT_MAX_SIZE_MB: u64 = 100;

// ================= level helpers =================

fn parse_tracing_level(s: &str) -> Option<Level> {
    match s.to_ascii_lowercase().as_str() {
        "trace" => Some(Level::TRACE),
        "debug" => Some(Level::DEBUG),
        "info" => Some(Level::INFO),
        "warn" => Some(Level::WARN),
        "error" => Some(Level::ERROR),
        "off" | "none" => None,
        _ => Some(Level::INFO),
    }
}

fn level_filter(s: &str) -> LevelFilter {
    parse_tracing_level(s)
        .map(LevelFilter::from_level)
        .unwrap_or(LevelFilter::OFF)
}

/// Returns true if target == crate_name or target starts with "crate_name::"
fn matches_crate_prefix(target: &str, crate_name: &str) -> bool {
    target
        .strip_prefix(crate_name)
        .is_some_and(|rest| rest.is_empty() || rest.starts_with("::"))
}

// ================= rotating writer for files =================

type SharedRotate = Arc<Mutex<FileRotate<AppendTimestamp>>>;

/// Clonable handle onto one rotating file; `None` swallows writes.
#[derive(Clone, Default)]
struct FileHandle(Option<SharedRotate>);

impl Write for FileHandle {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match &self.0 {
            Some(file) => file.lock().unwrap_or_else(PoisonError::into_inner).write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match &self.0 {
            Some(file) => file.lock().unwrap_or_else(PoisonError::into_inner).flush(),
            None => Ok(()),
        }
    }
}

/// Routes records to per-target files, falling back to the "default" file.
#[derive(Clone, Default)]
struct FileRouter {
    default: Option<SharedRotate>,
    by_prefix: Vec<(String, SharedRotate)>,
}

impl FileRouter {
    fn build(cfg: &LoggingConfig, base_dir: &Path) -> Self {
        let mut router = FileRouter::default();
        for (name, section) in cfg {
            let Some(writer) = open_rotating(name, section, base_dir) else {
                continue;
            };
            if name == DEFAULT_SECTION {
                router.default = Some(writer);
            } else {
                router.by_prefix.push((name.clone(), writer));
            }
        }
        // Longest prefix first so `runkit::runtime` beats `runkit`.
        router
            .by_prefix
            .sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        router
    }

    fn resolve_for(&self, target: &str) -> FileHandle {
        let routed = self
            .by_prefix
            .iter()
            .find(|(prefix, _)| matches_crate_prefix(target, prefix))
            .map(|(_, w)| Arc::clone(w));
        FileHandle(routed.or_else(|| self.default.clone()))
    }

    fn is_empty(&self) -> bool {
        self.default.is_none() && self.by_prefix.is_empty()
    }
}

impl<'a> fmt::MakeWriter<'a> for FileRouter {
    type Writer = FileHandle;

    fn make_writer(&'a self) -> Self::Writer {
        FileHandle(self.default.clone())
    }

    fn make_writer_for(&'a self, meta: &tracing::Metadata<'_>) -> Self::Writer {
        self.resolve_for(meta.target())
    }
}

fn resolve_log_path(file: &str, base_dir: &Path) -> PathBuf {
    let p = Path::new(file);
    if p.is_absolute() {
        p.to_path_buf()
    } else {
        base_dir.join(p)
    }
}

fn open_rotating(name: &str, section: &Section, base_dir: &Path) -> Option<SharedRotate> {
    if section.file.trim().is_empty() {
        return None;
    }
    let log_path = resolve_log_path(&section.file, base_dir);

    if let Some(parent) = log_path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            eprintln!(
                "Failed to create log directory for '{}': {} ({})",
                name,
                parent.display(),
                e
            );
            return None;
        }
    }

    // Prefer a file-count limit when configured, else an age limit
    let limit = match section.max_backups {
        Some(n) => FileLimit::MaxFiles(n),
        None => FileLimit::Age(chrono::Duration::days(
            section.max_age_days.unwrap_or(1) as i64,
        )),
    };
    let max_bytes = section.max_size_mb.unwrap_or(DEFAULT_MAX_SIZE_MB) as usize * 1024 * 1024;

    let rot = FileRotate::new(
        &log_path,
        AppendTimestamp::default(limit),
        ContentLimit::BytesSurpassed(max_bytes),
        Compression::None,
        None,
    );
    Some(Arc::new(Mutex::new(rot)))
}

// ================= targets =================

enum Sink {
    Console,
    File,
}

fn build_targets(cfg: &LoggingConfig, sink: Sink) -> Targets {
    let default_level = cfg
        .get(DEFAULT_SECTION)
        .map(|s| match sink {
            Sink::Console => level_filter(&s.console_level),
            Sink::File if s.file.trim().is_empty() => LevelFilter::OFF,
            Sink::File => level_filter(&s.file_level),
        })
        .unwrap_or(match sink {
            Sink::Console => LevelFilter::INFO,
            Sink::File => LevelFilter::OFF,
        });

    let mut targets = Targets::new().with_default(default_level);
    for (name, section) in cfg.iter().filter(|(k, _)| k.as_str() != DEFAULT_SECTION) {
        let level = match sink {
            Sink::Console => level_filter(&section.console_level),
            Sink::File if section.file.trim().is_empty() => continue,
            Sink::File => level_filter(&section.file_level),
        };
        targets = targets.with_target(name.clone(), level);
    }
    targets
}

// ================= public init =================

/// Install the global subscriber: human console output on stderr, JSON lines in
/// rotating files under `base_dir`, `RUST_LOG` as an upper bound.
///
/// Safe to call more than once; later calls are no-ops.
pub fn init_logging_unified(cfg: &LoggingConfig, base_dir: &Path) {
    // Bridge `log` → `tracing` *before* installing the subscriber
    if let Err(e) = tracing_log::LogTracer::init() {
        eprintln!("LogTracer init skipped: {e}");
    }

    if cfg.is_empty() {
        init_minimal();
        return;
    }

    install_subscriber(
        build_targets(cfg, Sink::Console),
        build_targets(cfg, Sink::File),
        FileRouter::build(cfg, base_dir),
    );
}

fn install_subscriber(console_targets: Targets, file_targets: Targets, router: FileRouter) {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env: Option<EnvFilter> = EnvFilter::try_from_default_env().ok();

    let (nb_stderr, guard) = tracing_appender::non_blocking(std::io::stderr());
    let _ = CONSOLE_GUARD.set(guard);

    let console_layer = fmt::layer()
        .with_writer(nb_stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .with_target(true)
        .with_level(true)
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_filter(console_targets);

    let file_layer = (!router.is_empty()).then(|| {
        fmt::layer()
            .json()
            .with_ansi(false)
            .with_target(true)
            .with_level(true)
            .with_timer(fmt::time::UtcTime::rfc_3339())
            .with_writer(router)
            .with_filter(file_targets)
    });

    let _ = Registry::default()
        .with(env)
        .with(console_layer)
        .with(file_layer)
        .try_init();
}

fn init_minimal() {
    use tracing_subscriber::{layer::SubscriberExt, EnvFilter, Registry};

    let env = EnvFilter::try_from_default_env().ok();
    let fmt_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_timer(fmt::time::UtcTime::rfc_3339());

    let _ = Registry::default().with(env).with(fmt_layer).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_logging_config;
    use tempfile::tempdir;

    fn section(console: &str, file: &str, file_level: &str) -> Section {
        Section {
            console_level: console.into(),
            file: file.into(),
            file_level: file_level.into(),
            max_age_days: None,
            max_backups: Some(2),
            max_size_mb: Some(1),
        }
    }

    #[test]
    fn crate_prefix_matching_respects_path_boundaries() {
        assert!(matches_crate_prefix("runkit", "runkit"));
        assert!(matches_crate_prefix("runkit::runtime::manager", "runkit"));
        assert!(!matches_crate_prefix("runkit_bootstrap::config", "runkit"));
        assert!(!matches_crate_prefix("run", "runkit"));
    }

    #[test]
    fn unknown_levels_default_to_info_and_off_disables() {
        assert_eq!(parse_tracing_level("DEBUG"), Some(Level::DEBUG));
        assert_eq!(parse_tracing_level("loud"), Some(Level::INFO));
        assert_eq!(parse_tracing_level("off"), None);
        assert_eq!(level_filter("none"), LevelFilter::OFF);
    }

    #[test]
    fn relative_log_paths_land_under_base_dir() {
        let base = Path::new("/srv/polyrun");
        assert_eq!(
            resolve_log_path("logs/a.log", base),
            PathBuf::from("/srv/polyrun/logs/a.log")
        );
        assert_eq!(
            resolve_log_path("/var/log/a.log", base),
            PathBuf::from("/var/log/a.log")
        );
    }

    #[test]
    fn router_prefers_longest_matching_prefix() {
        let tmp = tempdir().unwrap();
        let mut cfg = default_logging_config();
        cfg.insert("runkit".into(), section("info", "logs/runkit.log", "debug"));
        cfg.insert(
            "runkit::runtime".into(),
            section("info", "logs/runtime.log", "trace"),
        );
        cfg.insert("script_backends".into(), section("info", "", "debug"));

        let router = FileRouter::build(&cfg, tmp.path());
        assert!(!router.is_empty());
        assert_eq!(router.by_prefix[0].0, "runkit::runtime");
        assert_eq!(router.by_prefix.len(), 2);

        let runtime = router.resolve_for("runkit::runtime::manager").0.unwrap();
        let core = router.resolve_for("runkit::registry").0.unwrap();
        let other = router.resolve_for("polyrun").0.unwrap();
        assert!(!Arc::ptr_eq(&runtime, &core));
        assert!(Arc::ptr_eq(&other, router.default.as_ref().unwrap()));
        assert!(tmp.path().join("logs").is_dir());
    }

    #[test]
    fn file_writes_reach_disk() {
        let tmp = tempdir().unwrap();
        let mut cfg = LoggingConfig::new();
        cfg.insert(
            DEFAULT_SECTION.into(),
            section("off", "logs/out.log", "info"),
        );

        let router = FileRouter::build(&cfg, tmp.path());
        let mut handle = router.resolve_for("anything");
        handle.write_all(b"{\"msg\":\"hello\"}\n").unwrap();
        handle.flush().unwrap();

        let written = std::fs::read_to_string(tmp.path().join("logs/out.log")).unwrap();
        assert!(written.contains("hello"));
    }

    #[test]
    fn empty_router_discards_writes() {
        let mut handle = FileRouter::default().resolve_for("runkit");
        assert_eq!(handle.write(b"dropped").unwrap(), 7);
    }

    #[test]
    fn file_targets_are_off_without_default_file() {
        let mut cfg = LoggingConfig::new();
        cfg.insert(DEFAULT_SECTION.into(), section("info", "", "debug"));
        let targets = build_targets(&cfg, Sink::File);
        assert!(!targets.would_enable("polyrun", &Level::ERROR));

        let console = build_targets(&cfg, Sink::Console);
        assert!(console.would_enable("polyrun", &Level::INFO));
        assert!(!console.would_enable("polyrun", &Level::DEBUG));
    }
}
