use std::fmt;

use crate::errors::FlowError;
use crate::runtime::flow::FrameId;
use crate::runtime::promise::{OnFulfilled, OnRejected, OnSettled, PromiseRef};
use crate::runtime::scheduler::Scheduler;
use crate::runtime::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct TaskId(pub(crate) usize);

pub(crate) type TaskBody = Box<dyn FnOnce(&mut Scheduler) -> Result<Value, FlowError>>;

/// The handler pair carried by a callback task.
pub(crate) enum CallbackKind {
    Then {
        on_fulfilled: Option<OnFulfilled>,
        on_rejected: Option<OnRejected>,
    },
    Finally {
        body: OnSettled,
    },
}

pub(crate) enum TaskKind {
    /// A unit of user work submitted through `execute` (or a wait poll).
    User { body: Option<TaskBody> },
    /// A promise handler scheduled as a task; parked until `source`
    /// settles.
    Callback {
        source: PromiseRef,
        handler: Option<CallbackKind>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskState {
    Pending,
    Running,
    Cancelled,
}

pub(crate) struct Task {
    pub kind: TaskKind,
    pub promise: PromiseRef,
    pub description: String,
    /// The frame whose FIFO this task was queued in.
    pub frame: FrameId,
    pub state: TaskState,
    /// The frame opened for this task's sub-work, once it has run.
    pub child_frame: Option<FrameId>,
    /// Whether starting this task appends to the scheduler history.
    pub log: bool,
    /// Body return value parked until the task's frame drains.
    pub result: Option<Value>,
    /// Formatted scheduling chain, captured when long stack traces are on.
    pub trace: Option<String>,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Task {{ description: {:?}, state: {:?} }}",
            self.description, self.state
        )
    }
}
