use super::*;
use runkit::{AccessTier, LoadHint};
use std::sync::MutexGuard;
use std::{env, fs};
use tempfile::{tempdir, TempDir};

/// Point HOME at a scratch dir and clear POLYRUN__* for the duration of a test.
struct EnvScope {
    _guard: MutexGuard<'static, ()>,
    original_home: Option<std::ffi::OsString>,
    home: TempDir,
}

impl EnvScope {
    fn new() -> Self {
        let guard = crate::ENV_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let home = tempdir().unwrap();
        let original_home = env::var_os("HOME");
        env::set_var("HOME", home.path());
        #[cfg(target_os = "windows")]
        env::set_var("APPDATA", home.path());
        for (key, _) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                env::remove_var(key);
            }
        }
        Self {
            _guard: guard,
            original_home,
            home,
        }
    }

    fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.home.path().join(name);
        fs::write(&path, body).unwrap();
        path
    }
}

impl Drop for EnvScope {
    fn drop(&mut self) {
        for (key, _) in env::vars() {
            if key.starts_with(ENV_PREFIX) {
                env::remove_var(key);
            }
        }
        match self.original_home.take() {
            Some(v) => env::set_var("HOME", v),
            None => env::remove_var("HOME"),
        }
    }
}

#[test]
fn test_default_config_structure() {
    let config = AppConfig::default();

    // raw (not yet normalized)
    assert_eq!(config.home_dir, "");
    assert_eq!(config.runtime, RuntimeConfig::default());
    assert!(config.runtime.allow_restricted);
    assert!(config.runtime.warm_up);
    assert!(config.catalog.is_empty());

    let logging = config.logging.as_ref().unwrap();
    let default_section = &logging["default"];
    assert_eq!(default_section.console_level, "warn");
    assert_eq!(default_section.file, "logs/polyrun.log");

    assert!(config.modules.is_empty());
}

#[test]
fn test_load_layered_full_yaml() {
    let scope = EnvScope::new();
    let cfg_path = scope.write(
        "polyrun.yaml",
        r#"
home_dir: "~/.test_polyrun"

runtime:
  default_backend: python
  allow_restricted: false
  warm_up: false
  load_timeout: 30s
  execute_timeout: 2m

catalog:
  - id: lua
    display_name: "Lua 5.4"
    load_hint: eager
  - id: ruby
    enabled: false

logging:
  default:
    console_level: debug
    file: "logs/default.log"

modules:
  script_backends:
    extra: []
"#,
    );

    let config = AppConfig::load_layered(&cfg_path).unwrap();

    assert!(config.home_path().is_absolute());
    assert!(config.home_dir.ends_with(".test_polyrun"));
    assert!(config.home_path().exists());

    assert_eq!(config.runtime.default_backend.as_deref(), Some("python"));
    assert!(!config.runtime.allow_restricted);
    assert!(!config.runtime.warm_up);
    assert_eq!(config.runtime.load_timeout, Some(Duration::from_secs(30)));
    assert_eq!(config.runtime.execute_timeout, Some(Duration::from_secs(120)));
    assert!(!config.runtime.runtime_options().allow_restricted);

    assert_eq!(config.catalog.len(), 2);
    assert_eq!(config.catalog[0].display_name.as_deref(), Some("Lua 5.4"));
    assert_eq!(config.catalog[0].load_hint, Some(LoadHint::Eager));
    assert!(config.catalog[0].enabled);
    assert!(!config.catalog[1].enabled);

    let def = &config.logging.as_ref().unwrap()["default"];
    assert_eq!(def.console_level, "debug");
    assert!(config.modules.contains_key("script_backends"));
}

#[test]
fn test_minimal_yaml_uses_defaults() {
    let scope = EnvScope::new();
    let cfg_path = scope.write("minimal.yaml", "runtime: {}\n");

    let config = AppConfig::load_layered(&cfg_path).unwrap();

    assert!(config.home_dir.ends_with(DEFAULT_SUBDIR));
    assert_eq!(config.runtime, RuntimeConfig::default());
    assert!(config.logging.is_none());
}

#[test]
fn test_missing_file_is_treated_as_empty() {
    let scope = EnvScope::new();
    let config = AppConfig::load_layered(scope.home.path().join("absent.yaml")).unwrap();
    assert_eq!(config.runtime, RuntimeConfig::default());
}

#[test]
fn test_env_overrides_yaml() {
    let scope = EnvScope::new();
    let cfg_path = scope.write(
        "env.yaml",
        r#"
runtime:
  default_backend: python
"#,
    );
    env::set_var("POLYRUN__RUNTIME__DEFAULT_BACKEND", "lua");
    env::set_var("POLYRUN__RUNTIME__WARM_UP", "false");

    let config = AppConfig::load_layered(&cfg_path).unwrap();

    assert_eq!(config.runtime.default_backend.as_deref(), Some("lua"));
    assert!(!config.runtime.warm_up);
}

#[test]
fn test_load_or_default_without_file_applies_env() {
    let _scope = EnvScope::new();
    env::set_var("POLYRUN__RUNTIME__ALLOW_RESTRICTED", "false");

    let config = AppConfig::load_or_default(None::<&str>).unwrap();

    assert!(config.home_dir.ends_with(DEFAULT_SUBDIR));
    assert!(!config.runtime.allow_restricted);
}

#[test]
fn test_unknown_field_is_rejected() {
    let scope = EnvScope::new();
    let cfg_path = scope.write(
        "bad.yaml",
        r#"
runtime:
  default_backend: python
  turbo: true
"#,
    );

    let err = AppConfig::load_layered(&cfg_path).unwrap_err();
    assert!(format!("{err:#}").contains("turbo"), "{err:#}");
}

#[test]
fn test_catalog_override_rejects_bad_tier() {
    let yaml = r#"
catalog:
  - id: sqlite
    access_tier: premium
"#;
    let result: Result<AppConfig, _> = serde_yaml::from_str(yaml);
    assert!(result.is_err());

    let ok: AppConfig = serde_yaml::from_str("catalog:\n  - id: sqlite\n    access_tier: free\n")
        .unwrap();
    assert_eq!(ok.catalog[0].access_tier, Some(AccessTier::Free));
}

#[test]
fn test_cli_overrides() {
    let mut config = AppConfig::default();
    let args = CliArgs {
        verbose: 2,
        backend: Some("node".into()),
        ..CliArgs::default()
    };

    config.apply_cli_overrides(&args);

    assert_eq!(config.runtime.default_backend.as_deref(), Some("node"));
    let default_section = &config.logging.as_ref().unwrap()["default"];
    assert_eq!(default_section.console_level, "trace");
}

#[test]
fn test_cli_verbose_levels_matrix() {
    for (verbose, expected) in [(0, "warn"), (1, "debug"), (2, "trace"), (3, "trace")] {
        let mut config = AppConfig::default();
        config.apply_cli_overrides(&CliArgs {
            verbose,
            ..CliArgs::default()
        });
        let default_section = &config.logging.as_ref().unwrap()["default"];
        assert_eq!(default_section.console_level, expected, "verbose={verbose}");
    }
}

#[test]
fn test_cli_verbose_creates_logging_section_when_absent() {
    let mut config = AppConfig {
        logging: None,
        ..AppConfig::default()
    };
    config.apply_cli_overrides(&CliArgs {
        verbose: 1,
        ..CliArgs::default()
    });
    assert_eq!(
        config.logging.as_ref().unwrap()["default"].console_level,
        "debug"
    );
}

#[test]
fn test_layered_config_loading_with_modules_dir() {
    let scope = EnvScope::new();
    let modules_dir = scope.home.path().join("modules");
    fs::create_dir_all(&modules_dir).unwrap();
    fs::write(
        modules_dir.join("script_backends.yaml"),
        r#"
extra:
  - id: tcl
    display_name: Tcl
    program: tclsh
"#,
    )
    .unwrap();
    fs::write(modules_dir.join("notes.txt"), "ignored").unwrap();

    // Forward slashes keep Windows paths valid inside YAML
    let modules_dir_str = modules_dir.to_string_lossy().replace('\\', "/");
    let cfg_path = scope.write(
        "modules_dir.yaml",
        &format!(
            r#"
modules_dir: "{modules_dir_str}"
modules:
  existing_module:
    key: "value"
"#
        ),
    );

    let config = AppConfig::load_layered(&cfg_path).unwrap();

    assert!(config.modules.contains_key("existing_module"));
    assert!(!config.modules.contains_key("notes"));
    let sb = &config.modules["script_backends"];
    assert_eq!(sb["extra"][0]["program"], "tclsh");
}

#[test]
fn test_to_yaml_roundtrip_basic() {
    let mut config = AppConfig::default();
    config.runtime.load_timeout = Some(Duration::from_secs(5));
    config.catalog.push(CatalogOverride::new("lua"));

    let yaml = config.to_yaml().unwrap();
    assert!(yaml.contains("runtime:"));
    assert!(yaml.contains("catalog:"));
    assert!(yaml.contains("logging:"));
    assert!(yaml.contains("5s"));

    let roundtrip: AppConfig = serde_yaml::from_str(&yaml).unwrap();
    assert_eq!(roundtrip.runtime, config.runtime);
    assert_eq!(roundtrip.catalog, config.catalog);
}

#[test]
fn test_module_home_is_under_home_dir() {
    let config = AppConfig {
        home_dir: "/var/lib/polyrun".into(),
        ..AppConfig::default()
    };
    assert_eq!(
        config.module_home("script_backends"),
        PathBuf::from("/var/lib/polyrun/script_backends")
    );
}
