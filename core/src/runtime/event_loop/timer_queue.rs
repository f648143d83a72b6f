use std::fmt;

use crate::runtime::flow::FlowId;
use crate::runtime::promise::PromiseRef;
use crate::runtime::scheduler::Scheduler;

pub type TimerPayload = Box<dyn FnOnce(&mut Scheduler)>;

pub struct TimerTask {
    pub id: u64,
    pub due_at: u64,
    /// Flow this timer counts against for idle detection, if any.
    pub flow: Option<FlowId>,
    /// Promise settled by this timer, rejected if the timer is torn down
    /// by a flow reset.
    pub promise: Option<PromiseRef>,
    pub payload: TimerPayload,
}

impl fmt::Debug for TimerTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TimerTask {{ id: {}, due_at: {} }}", self.id, self.due_at)
    }
}

#[derive(Default)]
pub struct TimerQueue {
    tasks: Vec<TimerTask>,
}

impl TimerQueue {
    pub fn add(&mut self, task: TimerTask) {
        self.tasks.push(task);
    }

    pub fn clear(&mut self, id: u64) -> Option<TimerTask> {
        let idx = self.tasks.iter().position(|task| task.id == id)?;
        Some(self.tasks.remove(idx))
    }

    pub fn clear_for_flow(&mut self, flow: FlowId) -> Vec<TimerTask> {
        let mut removed = Vec::new();
        let mut i = 0;
        while i < self.tasks.len() {
            if self.tasks[i].flow == Some(flow) {
                removed.push(self.tasks.remove(i));
            } else {
                i += 1;
            }
        }
        removed
    }

    /// Index of the earliest-due timer at or before `now_ms`, breaking
    /// ties by insertion order.
    pub fn next_ready_index(&self, now_ms: u64) -> Option<usize> {
        let mut best: Option<(usize, u64)> = None;
        for (idx, task) in self.tasks.iter().enumerate() {
            if task.due_at > now_ms {
                continue;
            }
            match best {
                Some((_, best_due)) if task.due_at >= best_due => {}
                _ => best = Some((idx, task.due_at)),
            }
        }
        best.map(|(idx, _)| idx)
    }

    pub fn next_due_time(&self) -> Option<u64> {
        self.tasks.iter().map(|task| task.due_at).min()
    }

    pub fn take(&mut self, idx: usize) -> TimerTask {
        self.tasks.remove(idx)
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
