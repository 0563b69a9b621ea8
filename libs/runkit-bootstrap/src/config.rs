use anyhow::{Context, Result};
use runkit::{CatalogOverride, RuntimeOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::home_dir::{resolve_home_dir, DEFAULT_SUBDIR};

/// Environment prefix for overrides, e.g. `POLYRUN__RUNTIME__DEFAULT_BACKEND=python`.
pub const ENV_PREFIX: &str = "POLYRUN__";

/// Main application configuration with strongly-typed global sections
/// and a flexible per-module configuration bag.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Directory for logs and backend state; normalized to an absolute path on load.
    #[serde(default)]
    pub home_dir: String,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    /// Registry overrides applied when the backend catalog is built.
    #[serde(default)]
    pub catalog: Vec<CatalogOverride>,
    /// Logging configuration (optional, uses defaults if None).
    pub logging: Option<LoggingConfig>,
    /// Directory containing per-module YAML files (optional).
    #[serde(default)]
    pub modules_dir: Option<String>,
    /// Per-module configuration bag: module_name → arbitrary JSON/YAML value.
    #[serde(default)]
    pub modules: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RuntimeConfig {
    /// Backend selected on startup when the command does not name one.
    #[serde(default)]
    pub default_backend: Option<String>,
    #[serde(default = "default_true")]
    pub allow_restricted: bool,
    /// Load eager backends before the first command runs.
    #[serde(default = "default_true")]
    pub warm_up: bool,
    #[serde(default, with = "humantime_serde")]
    pub load_timeout: Option<Duration>,
    #[serde(default, with = "humantime_serde")]
    pub execute_timeout: Option<Duration>,
}

fn default_true() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            default_backend: None,
            allow_restricted: true,
            warm_up: true,
            load_timeout: None,
            execute_timeout: None,
        }
    }
}

impl RuntimeConfig {
    pub fn runtime_options(&self) -> RuntimeOptions {
        RuntimeOptions {
            allow_restricted: self.allow_restricted,
        }
    }
}

/// Logging configuration - maps subsystem names to their logging settings.
/// Key "default" is the catch-all for logs that don't match explicit subsystems.
pub type LoggingConfig = HashMap<String, Section>;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Section {
    pub console_level: String, // "info", "debug", "error", "off"
    pub file: String,          // "logs/polyrun.log"
    #[serde(default)]
    pub file_level: String,
    pub max_age_days: Option<u32>,
    #[serde(default)]
    pub max_backups: Option<usize>,
    #[serde(default)]
    pub max_size_mb: Option<u64>,
}

/// Create a default logging configuration.
///
/// The console stays quiet by default: guest program output shares the terminal.
pub fn default_logging_config() -> LoggingConfig {
    let mut logging = HashMap::new();
    logging.insert(
        "default".to_string(),
        Section {
            console_level: "warn".to_string(),
            file: "logs/polyrun.log".to_string(),
            file_level: "debug".to_string(),
            max_age_days: Some(7),
            max_backups: Some(3),
            max_size_mb: Some(100),
        },
    );
    logging
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            // Empty => platform default resolved by resolve_home_dir()
            home_dir: String::new(),
            runtime: RuntimeConfig::default(),
            catalog: Vec::new(),
            logging: Some(default_logging_config()),
            modules_dir: None,
            modules: HashMap::new(),
        }
    }
}

impl AppConfig {
    /// Load configuration with layered loading: defaults → YAML file → environment variables.
    /// Also normalizes `home_dir` into an absolute path and creates the directory.
    pub fn load_layered<P: AsRef<Path>>(config_path: P) -> Result<Self> {
        Self::extract_layers(Some(config_path.as_ref()))
    }

    /// Same layering with the YAML file skipped when no path is given.
    pub fn load_or_default<P: AsRef<Path>>(config_path: Option<P>) -> Result<Self> {
        Self::extract_layers(config_path.as_ref().map(|p| p.as_ref()))
    }

    fn extract_layers(config_path: Option<&Path>) -> Result<Self> {
        use figment::{
            providers::{Env, Format, Serialized, Yaml},
            Figment,
        };

        // Optional sections stay None unless YAML/ENV provides them.
        let base = AppConfig {
            logging: None,
            ..AppConfig::default()
        };

        let mut figment = Figment::new().merge(Serialized::defaults(base));
        if let Some(path) = config_path {
            figment = figment.merge(Yaml::file(path));
        }
        // Example: POLYRUN__RUNTIME__WARM_UP=false maps to runtime.warm_up
        let figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: AppConfig = figment.extract().with_context(|| match config_path {
            Some(p) => format!("Failed to extract config from {}", p.display()),
            None => "Failed to extract config from defaults and environment".to_string(),
        })?;

        normalize_home_dir_inplace(&mut config).context("Failed to resolve home_dir")?;

        if let Some(dir) = config.modules_dir.clone() {
            merge_module_files(&mut config.modules, dir)?;
        }

        Ok(config)
    }

    /// Serialize configuration to YAML.
    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize config to YAML")
    }

    /// Apply overrides from command line arguments.
    pub fn apply_cli_overrides(&mut self, args: &CliArgs) {
        if let Some(backend) = &args.backend {
            self.runtime.default_backend = Some(backend.clone());
        }

        // Set logging level based on verbose flags for "default" section.
        let logging = self.logging.get_or_insert_with(default_logging_config);
        if let Some(default_section) = logging.get_mut("default") {
            default_section.console_level = match args.verbose {
                0 => default_section.console_level.clone(), // keep
                1 => "debug".to_string(),
                _ => "trace".to_string(),
            };
        }
    }

    pub fn home_path(&self) -> PathBuf {
        PathBuf::from(&self.home_dir)
    }

    /// Where a module keeps its own files.
    pub fn module_home(&self, module_name: &str) -> PathBuf {
        self.home_path().join(module_name)
    }
}

/// Command line arguments the configuration layer cares about.
#[derive(Debug, Clone, Default)]
pub struct CliArgs {
    pub verbose: u8,
    pub backend: Option<String>,
}

fn normalize_home_dir_inplace(config: &mut AppConfig) -> Result<()> {
    let opt = if config.home_dir.trim().is_empty() {
        None
    } else {
        Some(config.home_dir.clone())
    };

    let resolved: PathBuf = resolve_home_dir(opt, DEFAULT_SUBDIR, /*create*/ true)
        .context("home_dir normalization failed")?;

    config.home_dir = resolved.to_string_lossy().to_string();
    Ok(())
}

fn merge_module_files(
    bag: &mut HashMap<String, serde_json::Value>,
    dir: impl AsRef<Path>,
) -> Result<()> {
    use std::fs;
    let dir = dir.as_ref();
    if !dir.exists() {
        return Ok(());
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() {
            continue;
        }
        let ext = path
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_ascii_lowercase();
        if ext != "yml" && ext != "yaml" {
            continue;
        }
        let name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("")
            .to_string();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read module config {}", path.display()))?;
        let val: serde_yaml::Value = serde_yaml::from_str(&raw)
            .with_context(|| format!("Invalid YAML in {}", path.display()))?;
        bag.insert(name, serde_json::to_value(val)?);
    }
    Ok(())
}

#[cfg(test)]
mod tests;
