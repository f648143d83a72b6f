use crate::runtime::flow::FrameId;
use crate::runtime::promise::PromiseRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct QueueId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueState {
    /// Created but not yet drained; tasks scheduled in the same turn
    /// batch join its root frame.
    New,
    /// The pump has dequeued at least one task.
    Started,
    Finished,
}

/// A top-level lane of the frame tree. Several may coexist on one flow;
/// their pumps interleave one task per microtask turn.
#[derive(Debug)]
pub(crate) struct TaskQueue {
    pub root: FrameId,
    pub state: QueueState,
    /// Deepest open frame; where the pump looks for the next task.
    pub active_frame: FrameId,
    /// A pump microtask is already enqueued.
    pub pump_scheduled: bool,
    /// The pending promise this queue is waiting on, if any.
    pub parked_on: Option<PromiseRef>,
}

impl TaskQueue {
    pub fn new(root: FrameId) -> Self {
        Self {
            root,
            state: QueueState::New,
            active_frame: root,
            pump_scheduled: false,
            parked_on: None,
        }
    }
}
