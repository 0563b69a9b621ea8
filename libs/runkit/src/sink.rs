//! Single-consumer event sinks for the output and error streams.
//!
//! Both backends and the multiplexer hold one [`SinkSlot`] per stream. Attaching a
//! new sink to a slot replaces the previous one explicitly; there is never more
//! than one consumer per stream.

use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tokio::sync::mpsc;

/// Which of the two streams an event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Output,
    Error,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Output => f.write_str("output"),
            StreamKind::Error => f.write_str("error"),
        }
    }
}

/// Cloneable handle to a consumer of text events.
#[derive(Clone)]
pub struct EventSink {
    f: Arc<dyn Fn(&str) + Send + Sync>,
}

impl EventSink {
    pub fn new<F>(f: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        Self { f: Arc::new(f) }
    }

    /// Sink that forwards every event into an unbounded channel.
    /// Events sent after the receiver is dropped are discarded.
    pub fn from_sender(tx: mpsc::UnboundedSender<String>) -> Self {
        Self::new(move |text| {
            let _ = tx.send(text.to_owned());
        })
    }

    /// Convenience: a fresh channel and the sink feeding it.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::from_sender(tx), rx)
    }

    pub fn emit(&self, text: &str) {
        (self.f)(text)
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventSink").finish_non_exhaustive()
    }
}

/// Holder of the one active sink for a stream.
#[derive(Default)]
pub struct SinkSlot {
    current: ArcSwapOption<EventSink>,
}

impl SinkSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `sink`, returning true if a previous sink was displaced.
    pub fn replace(&self, sink: EventSink) -> bool {
        self.current.swap(Some(Arc::new(sink))).is_some()
    }

    /// Detach the current sink, returning true if one was attached.
    pub fn clear(&self) -> bool {
        self.current.swap(None).is_some()
    }

    pub fn is_attached(&self) -> bool {
        self.current.load().is_some()
    }

    /// Deliver `text` to the attached sink. Returns false when nothing is attached.
    pub fn emit(&self, text: &str) -> bool {
        match self.current.load_full() {
            Some(sink) => {
                sink.emit(text);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for SinkSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SinkSlot")
            .field("attached", &self.is_attached())
            .finish()
    }
}
