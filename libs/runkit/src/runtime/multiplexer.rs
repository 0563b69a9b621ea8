//! Forwards every materialized backend's output and error events onto one
//! downstream consumer per stream.
//!
//! Backends that were loaded earlier keep their forwarding subscription after the
//! user switches away, so late events from a previous run still reach the consumer.

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::contracts::Backend;
use crate::sink::{EventSink, SinkSlot, StreamKind};

#[derive(Debug, Default)]
pub struct OutputMultiplexer {
    output: Arc<SinkSlot>,
    error: Arc<SinkSlot>,
}

impl OutputMultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, kind: StreamKind) -> &Arc<SinkSlot> {
        match kind {
            StreamKind::Output => &self.output,
            StreamKind::Error => &self.error,
        }
    }

    /// Attach the downstream consumer for `kind`. Returns true if one was replaced.
    pub fn register_sink(&self, kind: StreamKind, sink: EventSink) -> bool {
        let replaced = self.slot(kind).replace(sink);
        if replaced {
            tracing::debug!(stream = %kind, "downstream sink replaced");
        }
        replaced
    }

    /// Attach a fresh unbounded channel as the consumer for `kind`.
    pub fn channel(&self, kind: StreamKind) -> mpsc::UnboundedReceiver<String> {
        let (sink, rx) = EventSink::channel();
        self.register_sink(kind, sink);
        rx
    }

    /// Point both of `backend`'s subscriptions at this multiplexer.
    pub fn wire(&self, backend: &dyn Backend) {
        backend.subscribe_output(self.forwarder(StreamKind::Output, backend.id()));
        backend.subscribe_error(self.forwarder(StreamKind::Error, backend.id()));
    }

    fn forwarder(&self, kind: StreamKind, backend: &str) -> EventSink {
        let slot = Arc::clone(self.slot(kind));
        let backend = backend.to_string();
        EventSink::new(move |text| {
            if !slot.emit(text) {
                tracing::trace!(backend = %backend, stream = %kind, "no downstream sink; event dropped");
            }
        })
    }

    /// Drop both downstream consumers. Later events are discarded.
    pub fn detach(&self) {
        self.output.clear();
        self.error.clear();
    }
}
