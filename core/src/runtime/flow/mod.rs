mod arena;
mod events;
mod frame;
mod queue;
mod task;

use crate::errors::FlowError;

pub(crate) use arena::Arena;
pub(crate) use events::{EventCallback, Listener};
pub(crate) use frame::{Frame, FrameId, Node};
pub(crate) use queue::{QueueId, QueueState, TaskQueue};
pub(crate) use task::{CallbackKind, Task, TaskBody, TaskId, TaskKind, TaskState};

pub use events::{FlowEvent, ListenerId};

/// Handle to a control flow owned by a [`Scheduler`].
///
/// [`Scheduler`]: crate::runtime::scheduler::Scheduler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub(crate) usize);

/// Per-flow scheduler state: the queue lanes, the frame/task arenas
/// backing them, event listeners, and idle bookkeeping.
pub(crate) struct ControlFlow {
    /// Unfinished queues, oldest first.
    pub queues: Vec<QueueId>,
    pub queue_arena: Arena<TaskQueue>,
    pub frames: Arena<Frame>,
    pub tasks: Arena<Task>,
    pub listeners: Vec<Listener>,
    /// Outstanding flow-attributed timers (delayed promises, wait polls);
    /// the flow is not idle while any remain.
    pub pending_timers: usize,
    /// Bumped on every schedule; stale idle emissions check it and bail.
    pub epoch: u64,
    /// An idle emission is already enqueued.
    pub idle_pending: bool,
    /// An uncaught exception with no listener to deliver it to; surfaced
    /// by the drivers.
    pub parked_error: Option<FlowError>,
}

impl ControlFlow {
    pub fn new() -> Self {
        Self {
            queues: Vec::new(),
            queue_arena: Arena::new(),
            frames: Arena::new(),
            tasks: Arena::new(),
            listeners: Vec::new(),
            pending_timers: 0,
            epoch: 0,
            idle_pending: false,
            parked_error: None,
        }
    }

    /// The queue still collecting this turn's task batch, if any.
    pub fn new_queue(&self) -> Option<QueueId> {
        self.queues
            .iter()
            .copied()
            .find(|qid| match self.queue_arena.get(qid.0) {
                Some(queue) => queue.state == QueueState::New,
                None => false,
            })
    }
}
