use crate::errors::FlowError;
use crate::runtime::event_loop::Microtask;
use crate::runtime::promise::PromiseRef;
use crate::runtime::scheduler::Scheduler;

impl Scheduler {
    /// Drives the event loop until nothing is pending: microtasks are
    /// drained, then the clock advances to the next timer, repeating.
    /// An uncaught exception with no listener surfaces as the error.
    pub fn run_until_idle(&mut self) -> Result<(), FlowError> {
        loop {
            self.drain_microtasks();
            if let Some(error) = self.take_parked_error() {
                return Err(error);
            }
            if self.event_loop.has_timers() {
                self.event_loop.advance_to_next_timer();
                self.fire_due_timer();
                continue;
            }
            if !self.event_loop.has_microtasks() {
                break;
            }
        }
        match self.take_parked_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    /// Same loop, stopping as soon as `promise` settles.
    pub fn run_until_settled(&mut self, promise: &PromiseRef) -> Result<(), FlowError> {
        while promise.borrow().is_pending() {
            if self.event_loop.has_microtasks() {
                self.drain_microtasks();
            } else if self.event_loop.has_timers() {
                self.event_loop.advance_to_next_timer();
                self.fire_due_timer();
            } else {
                break;
            }
            if let Some(error) = self.take_parked_error() {
                return Err(error);
            }
        }
        Ok(())
    }

    /// Drains the microtask queue without touching timers.
    pub fn run_microtasks_only(&mut self) -> Result<(), FlowError> {
        self.drain_microtasks();
        match self.take_parked_error() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn drain_microtasks(&mut self) {
        while let Some(microtask) = self.event_loop.pop_microtask() {
            self.dispatch(microtask);
        }
    }

    fn dispatch(&mut self, microtask: Microtask) {
        match microtask {
            Microtask::PumpQueue { flow, queue } => self.pump_queue(flow, queue),
            Microtask::RunReaction {
                reaction,
                settlement,
            } => self.run_reaction(reaction, settlement),
            Microtask::RejectionSweep => self.rejection_sweep(),
            Microtask::EmitIdle { flow, epoch } => self.handle_emit_idle(flow, epoch),
        }
    }

    fn fire_due_timer(&mut self) {
        let Some(timer) = self.event_loop.pop_due_timer() else {
            return;
        };
        if let Some(flow) = timer.flow {
            let state = self.flow_state_mut(flow);
            state.pending_timers = state.pending_timers.saturating_sub(1);
        }
        (timer.payload)(self);
        if let Some(flow) = timer.flow {
            self.maybe_schedule_idle(flow);
        }
    }

    pub(crate) fn take_parked_error(&mut self) -> Option<FlowError> {
        if let Some(error) = self.orphan_error.take() {
            return Some(error);
        }
        for state in self.flows.iter_mut() {
            if let Some(error) = state.parked_error.take() {
                return Some(error);
            }
        }
        None
    }
}
