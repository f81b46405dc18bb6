//! Trace event stream for external observability sinks.
//!
//! The engine emits one-directional lifecycle events to an optional sink.
//! Absence of a sink never alters or blocks core behavior; the sink is
//! consumed by debug clients (TUI, REPL) outside the core.

use crate::ProcessId;

/// A lifecycle event emitted by the scheduler or agent runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceEvent {
    /// A process was created and enqueued Ready
    ProcessCreated(ProcessId),
    /// A Waiting process was promoted back to Ready
    ProcessResumed(ProcessId),
    /// A process suspended on an external event
    ProcessSuspended(ProcessId),
    /// A process reached a terminal state
    ProcessTerminated {
        /// The terminated process
        pid: ProcessId,
        /// True if the process ended `Failed`
        failed: bool,
    },
    /// An agent request was submitted to the transport
    AgentSent(ProcessId),
    /// An agent response was received and applied
    AgentReceived(ProcessId),
}

/// Receiver of trace events.
///
/// Implementations must be cheap and must not fail; the engine calls
/// `record` synchronously from the scheduler thread.
pub trait TraceSink {
    /// Records one event.
    fn record(&mut self, event: &TraceEvent);
}

/// A sink that stores every event, for tests and debug clients.
///
/// # Examples
///
/// ```
/// use core_types::{ProcessId, RecordingSink, TraceEvent, TraceSink};
///
/// let mut sink = RecordingSink::new();
/// sink.record(&TraceEvent::ProcessCreated(ProcessId(1)));
/// assert_eq!(sink.events().len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Vec<TraceEvent>,
}

impl RecordingSink {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// All events recorded so far, in emission order.
    pub fn events(&self) -> &[TraceEvent] {
        &self.events
    }
}

impl TraceSink for RecordingSink {
    fn record(&mut self, event: &TraceEvent) {
        self.events.push(event.clone());
    }
}
