mod cache;
mod manager;
mod multiplexer;

pub use cache::BackendCache;
pub use manager::{RuntimeManager, RuntimeOptions, SwitchOutcome, WarmUpReport};
pub use multiplexer::OutputMultiplexer;
