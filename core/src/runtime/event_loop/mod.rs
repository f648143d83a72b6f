mod microtask_queue;
mod timer_queue;

use std::time::{Duration, Instant};

use crate::runtime::flow::{FlowId, QueueId};
use crate::runtime::promise::{Reaction, Settlement};

pub use microtask_queue::MicrotaskQueue;
pub use timer_queue::{TimerPayload, TimerQueue, TimerTask};

/// Work drained before the next timer fires. One pump entry executes at
/// most one task body, which is how sibling queues interleave.
pub(crate) enum Microtask {
    PumpQueue { flow: FlowId, queue: QueueId },
    RunReaction { reaction: Reaction, settlement: Settlement },
    RejectionSweep,
    EmitIdle { flow: FlowId, epoch: u64 },
}

enum Clock {
    /// Deterministic clock that jumps to the next due timer. Always moves
    /// by at least 1ms per timer turn, so 0-delay poll loops still reach
    /// their deadlines.
    Virtual { now_ms: u64 },
    Realtime { origin: Instant },
}

/// The host side of the scheduler: a microtask FIFO, a timer queue, and a
/// clock. Everything above this module is clock-agnostic.
pub struct EventLoop {
    clock: Clock,
    next_timer_id: u64,
    microtasks: MicrotaskQueue,
    timers: TimerQueue,
}

impl EventLoop {
    pub fn new(realtime: bool) -> Self {
        Self {
            clock: if realtime {
                Clock::Realtime {
                    origin: Instant::now(),
                }
            } else {
                Clock::Virtual { now_ms: 0 }
            },
            next_timer_id: 1,
            microtasks: MicrotaskQueue::default(),
            timers: TimerQueue::default(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        match &self.clock {
            Clock::Virtual { now_ms } => *now_ms,
            Clock::Realtime { origin } => origin.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn enqueue_microtask(&mut self, task: Microtask) {
        self.microtasks.enqueue(task);
    }

    pub(crate) fn pop_microtask(&mut self) -> Option<Microtask> {
        self.microtasks.pop()
    }

    pub fn has_microtasks(&self) -> bool {
        !self.microtasks.is_empty()
    }

    pub(crate) fn schedule_timer(
        &mut self,
        delay_ms: u64,
        flow: Option<FlowId>,
        promise: Option<crate::runtime::promise::PromiseRef>,
        payload: TimerPayload,
    ) -> u64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        self.timers.add(TimerTask {
            id,
            due_at: self.now_ms().saturating_add(delay_ms),
            flow,
            promise,
            payload,
        });
        id
    }

    pub(crate) fn clear_timer(&mut self, id: u64) -> Option<TimerTask> {
        self.timers.clear(id)
    }

    pub(crate) fn clear_timers_for_flow(&mut self, flow: FlowId) -> Vec<TimerTask> {
        self.timers.clear_for_flow(flow)
    }

    pub fn has_timers(&self) -> bool {
        !self.timers.is_empty()
    }

    /// Move the clock to the next due timer: a jump for the virtual clock,
    /// a sleep for the realtime one.
    pub fn advance_to_next_timer(&mut self) {
        let Some(next_due) = self.timers.next_due_time() else {
            return;
        };
        match &mut self.clock {
            Clock::Virtual { now_ms } => {
                *now_ms = next_due.max(*now_ms + 1);
            }
            Clock::Realtime { origin } => {
                let now = origin.elapsed().as_millis() as u64;
                if next_due > now {
                    std::thread::sleep(Duration::from_millis(next_due - now));
                }
            }
        }
    }

    pub(crate) fn pop_due_timer(&mut self) -> Option<TimerTask> {
        let now = self.now_ms();
        let idx = self.timers.next_ready_index(now)?;
        Some(self.timers.take(idx))
    }
}
