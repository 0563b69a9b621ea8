//! # RunKit - Runtime Lifecycle Orchestrator
//!
//! Hosts a family of code-execution backends (language interpreters) behind one
//! façade, the [`RuntimeManager`].
//!
//! ## Features
//!
//! - **Registry**: backends are discovered via `inventory` and resolved by id
//! - **Lazy**: a backend is constructed on first selection and loaded at most once
//! - **Single active backend**: `execute_code` always targets the current selection
//! - **Multiplexed output**: one output sink and one error sink, whatever backend runs
//!
//! ## Registering a backend
//!
//! ```rust,ignore
//! use runkit::{BackendDescriptor, Registrator, RegistryBuilder};
//!
//! fn register(b: &mut RegistryBuilder) {
//!     b.register(BackendDescriptor::new("echo", "Echo", || EchoBackend::shared()));
//! }
//!
//! runkit::inventory::submit! { Registrator(register) }
//! ```
//!
//! ## Driving the runtime
//!
//! ```rust,ignore
//! let runtime = RuntimeManager::new(BackendRegistry::discover()?);
//! let mut out = runtime.output_channel();
//! runtime.switch_to("python").await?;
//! let result = runtime.execute_code("print(1 + 1)", &ExecOptions::new()).await?;
//! runtime.dispose().await?;
//! ```

pub use anyhow::Result;
pub use async_trait::async_trait;

// Re-export inventory for backend crates
pub use inventory;

pub mod contracts;
pub mod errors;
pub mod lifecycle;
pub mod registry;
pub mod result;
pub mod runtime;
pub mod sink;

#[cfg(test)]
mod test_support;

pub use contracts::{Backend, BackendRef};
pub use errors::{DisposeError, DisposeFailure, ErrorInfo, ErrorKind};
pub use lifecycle::{LifecycleState, LoadGate};
pub use registry::{
    AccessTier, BackendDescriptor, BackendFactory, BackendInfo, BackendRegistry, CatalogOverride,
    LoadHint, Registrator, RegistryBuilder, RegistryError,
};
pub use result::{ExecOptions, ExecutionResult};
pub use runtime::{
    BackendCache, OutputMultiplexer, RuntimeManager, RuntimeOptions, SwitchOutcome, WarmUpReport,
};
pub use sink::{EventSink, SinkSlot, StreamKind};
