use std::collections::VecDeque;

use crate::runtime::flow::{QueueId, TaskId};
use crate::runtime::promise::PromiseRef;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FrameId(pub(crate) usize);

/// An entry in a frame's FIFO: a task awaiting execution, or a nested
/// frame (a callback slot) whose contents run before later siblings.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Node {
    Task(TaskId),
    Frame(FrameId),
}

/// A stack frame of the scheduler: the universe of sub-work belonging to
/// one in-flight task (or to a queue root, or a callback slot).
///
/// Frames live in a per-flow arena; `parent` is an arena handle and the
/// handle is freed when the frame is popped.
#[derive(Debug)]
pub(crate) struct Frame {
    pub parent: Option<FrameId>,
    pub queue: QueueId,
    pub fifo: VecDeque<Node>,
    /// The task whose body opened this frame. `None` for queue roots and
    /// callback slots.
    pub owner_task: Option<TaskId>,
    /// Promises rejected during this frame's lifetime whose rejection has
    /// not been handled yet; the frame cannot close while any remain.
    pub pending_rejections: Vec<PromiseRef>,
}

impl Frame {
    pub fn root(queue: QueueId) -> Self {
        Self {
            parent: None,
            queue,
            fifo: VecDeque::new(),
            owner_task: None,
            pending_rejections: Vec::new(),
        }
    }

    pub fn child_of(parent: FrameId, queue: QueueId, owner_task: Option<TaskId>) -> Self {
        Self {
            parent: Some(parent),
            queue,
            fifo: VecDeque::new(),
            owner_task,
            pending_rejections: Vec::new(),
        }
    }
}
