//! Static registration of the built-in backends plus config-declared extras.

use anyhow::{Context, Result};
use runkit::{AccessTier, BackendDescriptor, LoadHint, Registrator, RegistryBuilder};
use runkit_bootstrap::{module_config_typed, ConfigProvider};

use crate::config::ScriptBackendsConfig;
use crate::echo::EchoBackend;
use crate::process::{InterpreterSpec, ProcessBackend};

/// Key of this module's section in the `modules` configuration bag.
pub const MODULE_NAME: &str = "script_backends";

/// A built-in interpreter recipe.
#[derive(Debug, Clone, Copy)]
pub struct BuiltinSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub program: &'static str,
    pub args: &'static [&'static str],
    pub access_tier: AccessTier,
}

impl BuiltinSpec {
    pub fn interpreter(&self) -> InterpreterSpec {
        InterpreterSpec::new(self.program).with_args(self.args.iter().copied())
    }
}

const BUILTINS: &[BuiltinSpec] = &[
    BuiltinSpec {
        id: "python",
        display_name: "Python 3",
        program: "python3",
        args: &["-"],
        access_tier: AccessTier::Free,
    },
    BuiltinSpec {
        id: "node",
        display_name: "Node.js",
        program: "node",
        args: &["-"],
        access_tier: AccessTier::Free,
    },
    BuiltinSpec {
        id: "bash",
        display_name: "Bash",
        program: "bash",
        args: &["-s"],
        access_tier: AccessTier::Free,
    },
    BuiltinSpec {
        id: "ruby",
        display_name: "Ruby",
        program: "ruby",
        args: &["-"],
        access_tier: AccessTier::Restricted,
    },
    BuiltinSpec {
        id: "lua",
        display_name: "Lua",
        program: "lua",
        args: &["-"],
        access_tier: AccessTier::Free,
    },
    BuiltinSpec {
        id: "sqlite",
        display_name: "SQLite",
        program: "sqlite3",
        args: &[":memory:"],
        access_tier: AccessTier::Restricted,
    },
];

pub fn builtin_specs() -> &'static [BuiltinSpec] {
    BUILTINS
}

/// Register `echo` and the built-in interpreters.
pub fn register_builtins(b: &mut RegistryBuilder) {
    b.register(
        BackendDescriptor::new("echo", "Echo", || EchoBackend::shared("echo"))
            .with_load_hint(LoadHint::Eager),
    );

    for spec in BUILTINS {
        let id = spec.id;
        let interpreter = spec.interpreter();
        b.register(
            BackendDescriptor::new(id, spec.display_name, move || {
                ProcessBackend::shared(id, interpreter.clone())
            })
            .with_access_tier(spec.access_tier),
        );
    }
}

inventory::submit! {
    Registrator(register_builtins)
}

/// Register the extra interpreters declared under `modules.script_backends.extra`.
pub fn register_configured(
    b: &mut RegistryBuilder,
    provider: &dyn ConfigProvider,
) -> Result<usize> {
    let cfg: ScriptBackendsConfig = module_config_typed(provider, MODULE_NAME)?;

    for extra in &cfg.extra {
        let interpreter = extra.interpreter_spec()?;
        let id = extra.id.clone();
        tracing::debug!(
            backend = %id,
            program = %interpreter.program,
            "registering configured interpreter"
        );
        b.register(
            BackendDescriptor::new(id.clone(), extra.display_name(), move || {
                ProcessBackend::shared(id.clone(), interpreter.clone())
            })
            .with_access_tier(extra.access_tier)
            .with_load_hint(extra.load_hint),
        );
    }
    Ok(cfg.extra.len())
}

/// Full catalog builder for a configured process: discovered built-ins plus extras.
pub fn discovered_with_config(provider: &dyn ConfigProvider) -> Result<RegistryBuilder> {
    let mut b = RegistryBuilder::discovered();
    register_configured(&mut b, provider).context("Failed to register configured backends")?;
    Ok(b)
}
