//! Built-in backends for the polyrun runtime: an in-process `echo` backend and
//! interpreters driven as child processes.

pub mod catalog;
pub mod config;
pub mod echo;
pub mod process;

pub use catalog::{
    builtin_specs, discovered_with_config, register_builtins, register_configured, BuiltinSpec,
    MODULE_NAME,
};
pub use config::{ExtraBackend, ScriptBackendsConfig};
pub use echo::EchoBackend;
pub use process::{InterpreterSpec, ProcessBackend};
