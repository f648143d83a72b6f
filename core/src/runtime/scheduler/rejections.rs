use crate::errors::FlowError;
use crate::runtime::event_loop::Microtask;
use crate::runtime::flow::{FlowEvent, FlowId, QueueId};
use crate::runtime::promise::{PromiseRef, PromiseState};
use crate::runtime::scheduler::Scheduler;

/// Rejected promises awaiting their one-microtask grace period. A sweep
/// runs after the current turn; whatever is still unhandled escalates.
#[derive(Default)]
pub(crate) struct RejectionTracker {
    pub pending: Vec<PromiseRef>,
    pub sweep_scheduled: bool,
}

impl Scheduler {
    pub(crate) fn track_rejection(&mut self, promise: &PromiseRef) {
        self.tracker.pending.push(promise.clone());
        if !self.tracker.sweep_scheduled {
            self.tracker.sweep_scheduled = true;
            self.event_loop.enqueue_microtask(Microtask::RejectionSweep);
        }
    }

    pub(crate) fn tracker_has_flow(&self, flow: FlowId) -> bool {
        self.tracker.pending.iter().any(|promise| {
            let cell = promise.borrow();
            cell.flow == Some(flow)
                && !cell.handled
                && matches!(cell.state, PromiseState::Rejected(_))
        })
    }

    /// The deferred "handled?" check. Unhandled rejections are grouped
    /// per flow, coalesced when there are several, their origin queues
    /// aborted, and the result delivered as an uncaught exception.
    pub(crate) fn rejection_sweep(&mut self) {
        self.tracker.sweep_scheduled = false;
        let entries = std::mem::take(&mut self.tracker.pending);
        let mut groups: Vec<(Option<FlowId>, Vec<FlowError>, Vec<(FlowId, QueueId)>)> = Vec::new();
        for promise in entries {
            let noted = {
                let cell = promise.borrow();
                if cell.handled {
                    None
                } else if let PromiseState::Rejected(reason) = &cell.state {
                    Some((cell.flow, reason.clone(), cell.origin_queue))
                } else {
                    None
                }
            };
            let Some((flow, reason, origin)) = noted else {
                continue;
            };
            promise.borrow_mut().handled = true;
            match groups.iter_mut().find(|(group, _, _)| *group == flow) {
                Some((_, reasons, origins)) => {
                    reasons.push(reason);
                    if let Some(origin) = origin {
                        origins.push(origin);
                    }
                }
                None => groups.push((flow, vec![reason], origin.into_iter().collect())),
            }
        }
        for (flow, mut reasons, origins) in groups {
            let error = if reasons.len() == 1 {
                reasons.remove(0)
            } else {
                FlowError::MultipleUnhandled { errors: reasons }
            };
            for (origin_flow, queue) in origins {
                let discard = FlowError::Discarded {
                    message: "task queue aborted by an unhandled rejection".into(),
                };
                self.teardown_queue(origin_flow, queue, &discard);
            }
            match flow {
                Some(flow) => self.deliver_uncaught(flow, error),
                None => {
                    if self.orphan_error.is_none() {
                        self.orphan_error = Some(error);
                    }
                }
            }
        }
    }

    pub(crate) fn deliver_uncaught(&mut self, flow: FlowId, error: FlowError) {
        if self.listener_count(flow, FlowEvent::UncaughtException) > 0 {
            self.emit(flow, FlowEvent::UncaughtException, Some(error));
        } else {
            let state = self.flow_state_mut(flow);
            if state.parked_error.is_none() {
                state.parked_error = Some(error);
            }
        }
        self.maybe_schedule_idle(flow);
    }
}
