use std::collections::HashMap;

use anyhow::{Context, Result};
use runkit::{AccessTier, LoadHint};
use serde::{Deserialize, Serialize};

use crate::process::InterpreterSpec;

/// Configuration for the script_backends module (`modules.script_backends`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ScriptBackendsConfig {
    /// Additional interpreters beyond the built-in set.
    #[serde(default)]
    pub extra: Vec<ExtraBackend>,
}

/// A subprocess interpreter declared in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtraBackend {
    pub id: String,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Executable name or path; `${VAR}` references are expanded from the environment.
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_version_args")]
    pub version_args: Vec<String>,
    #[serde(default)]
    pub access_tier: AccessTier,
    #[serde(default)]
    pub load_hint: LoadHint,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_version_args() -> Vec<String> {
    vec!["--version".to_string()]
}

impl ExtraBackend {
    pub fn display_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }

    /// Resolve the launch recipe, expanding `${VAR}` in `program`.
    pub fn interpreter_spec(&self) -> Result<InterpreterSpec> {
        let program = expand_env(&self.program)
            .with_context(|| format!("backend '{}': invalid program", self.id))?;
        Ok(InterpreterSpec::new(program)
            .with_args(self.args.iter().cloned())
            .with_version_args(self.version_args.iter().cloned())
            .with_env(self.env.clone()))
    }
}

/// Replace `${VARNAME}` with the variable's value; a missing variable is an error.
pub fn expand_env(raw: &str) -> Result<String> {
    let re = regex::Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")?;

    let mut result = raw.to_string();
    for cap in re.captures_iter(raw) {
        let var_name = &cap[1];
        let value = std::env::var(var_name)
            .with_context(|| format!("Environment variable '{var_name}' is not set"))?;
        result = result.replace(&cap[0], &value);
    }
    Ok(result)
}
