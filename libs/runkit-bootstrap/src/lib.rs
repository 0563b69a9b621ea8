pub mod config;
pub mod config_provider;
pub mod logging;
pub mod paths;
pub mod signals;

pub use config::*;
pub use config_provider::*;
pub use logging::*;
pub use signals::*;

// HOME and POLYRUN__* are process-global; tests that touch them serialize here.
#[cfg(test)]
pub(crate) static ENV_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());
