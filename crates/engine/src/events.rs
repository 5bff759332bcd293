//! Event emission: every event lands in the execution's trace and,
//! when streaming, on the subscriber channel.

use aster_execution::{EngineEvent, ExecutionContext};
use tokio::sync::mpsc;

/// Fan-out sink for engine events.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<EngineEvent>>,
}

impl EventSink {
    /// A sink that only records into the trace.
    #[must_use]
    pub fn trace_only() -> Self {
        Self { tx: None }
    }

    /// A sink that also forwards to a streaming subscriber.
    #[must_use]
    pub fn with_subscriber(tx: mpsc::UnboundedSender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Record an event in the trace and forward it to any subscriber.
    pub fn emit(&self, ctx: &ExecutionContext, event: EngineEvent) {
        ctx.append_event(event.clone());
        if let Some(tx) = &self.tx {
            // A departed subscriber must not stall the execution.
            let _ = tx.send(event);
        }
    }
}

impl std::fmt::Debug for EventSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSink")
            .field("streaming", &self.tx.is_some())
            .finish()
    }
}
