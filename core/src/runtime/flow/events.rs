use crate::errors::FlowError;
use crate::runtime::scheduler::Scheduler;

/// The fixed set of events a flow can emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FlowEvent {
    /// The flow has no tasks, no pending internal promises, and no active
    /// queues. Deferred one microtask so late-arriving work cancels it.
    Idle,
    /// A rejection went unhandled for a full microtask turn, or a
    /// discarded frame had nowhere to deliver its failure.
    UncaughtException,
    /// The flow's state was cleared by `reset`.
    Reset,
}

/// Handle returned by `on`/`once`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub(crate) u64);

pub(crate) type EventCallback = Box<dyn FnMut(&mut Scheduler, Option<&FlowError>)>;

pub(crate) struct Listener {
    pub id: ListenerId,
    pub event: FlowEvent,
    pub once: bool,
    /// Taken while the callback runs so emission can re-enter the table.
    pub callback: Option<EventCallback>,
}
