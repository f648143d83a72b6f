use crate::errors::FlowError;
use crate::runtime::event_loop::Microtask;
use crate::runtime::flow::{EventCallback, FlowEvent, FlowId, Listener, ListenerId};
use crate::runtime::scheduler::Scheduler;

impl Scheduler {
    pub fn on<F>(&mut self, flow: FlowId, event: FlowEvent, callback: F) -> ListenerId
    where
        F: FnMut(&mut Scheduler, Option<&FlowError>) + 'static,
    {
        self.subscribe(flow, event, false, Box::new(callback))
    }

    /// Like `on`, but the subscription is dropped after the first
    /// delivery.
    pub fn once<F>(&mut self, flow: FlowId, event: FlowEvent, callback: F) -> ListenerId
    where
        F: FnMut(&mut Scheduler, Option<&FlowError>) + 'static,
    {
        self.subscribe(flow, event, true, Box::new(callback))
    }

    fn subscribe(
        &mut self,
        flow: FlowId,
        event: FlowEvent,
        once: bool,
        callback: EventCallback,
    ) -> ListenerId {
        let id = ListenerId(self.next_listener());
        let state = self.flow_state_mut(flow);
        state.listeners.push(Listener {
            id,
            event,
            once,
            callback: Some(callback),
        });
        id
    }

    pub fn off(&mut self, flow: FlowId, id: ListenerId) -> bool {
        let state = self.flow_state_mut(flow);
        let before = state.listeners.len();
        state.listeners.retain(|listener| listener.id != id);
        before != state.listeners.len()
    }

    pub(crate) fn listener_count(&self, flow: FlowId, event: FlowEvent) -> usize {
        self.flow_state(flow)
            .listeners
            .iter()
            .filter(|listener| listener.event == event && listener.callback.is_some())
            .count()
    }

    pub(crate) fn emit(&mut self, flow: FlowId, event: FlowEvent, payload: Option<FlowError>) {
        let ids: Vec<ListenerId> = self
            .flow_state(flow)
            .listeners
            .iter()
            .filter(|listener| listener.event == event)
            .map(|listener| listener.id)
            .collect();
        for id in ids {
            let taken = {
                let state = self.flow_state_mut(flow);
                state
                    .listeners
                    .iter_mut()
                    .find(|listener| listener.id == id)
                    .and_then(|listener| listener.callback.take())
            };
            let Some(mut callback) = taken else {
                continue;
            };
            callback(self, payload.as_ref());
            let state = self.flow_state_mut(flow);
            let mut drop_listener = false;
            if let Some(listener) = state
                .listeners
                .iter_mut()
                .find(|listener| listener.id == id)
            {
                if listener.once {
                    drop_listener = true;
                } else {
                    listener.callback = Some(callback);
                }
            }
            if drop_listener {
                state.listeners.retain(|listener| listener.id != id);
            }
        }
    }

    /// Cancels every task in every queue, clears the flow's timers, emits
    /// `reset`, and emits `idle` on the next microtask.
    pub fn reset(&mut self, flow: FlowId) {
        let error = FlowError::cancelled("ControlFlow was reset");
        let queues = self.flow_state(flow).queues.clone();
        for queue in queues {
            self.teardown_queue(flow, queue, &error);
        }
        let timers = self.event_loop.clear_timers_for_flow(flow);
        for timer in timers {
            if let Some(promise) = timer.promise {
                promise.borrow_mut().handled = true;
                self.reject_promise(&promise, error.clone());
            }
        }
        {
            let state = self.flow_state_mut(flow);
            state.queues.clear();
            state.pending_timers = 0;
            state.parked_error = None;
            state.epoch += 1;
            state.idle_pending = false;
        }
        self.tracker
            .pending
            .retain(|promise| promise.borrow().flow != Some(flow));
        self.emit(flow, FlowEvent::Reset, None);
        self.maybe_schedule_idle(flow);
    }

    pub(crate) fn flow_is_idle(&self, flow: FlowId) -> bool {
        let state = self.flow_state(flow);
        state.queues.is_empty()
            && state.pending_timers == 0
            && state.parked_error.is_none()
            && !self.tracker_has_flow(flow)
    }

    /// Defers the idle emission one microtask; work arriving in between
    /// bumps the epoch and invalidates it.
    pub(crate) fn maybe_schedule_idle(&mut self, flow: FlowId) {
        if !self.flow_is_idle(flow) {
            return;
        }
        let epoch = {
            let state = self.flow_state_mut(flow);
            if state.idle_pending {
                return;
            }
            state.idle_pending = true;
            state.epoch
        };
        self.event_loop
            .enqueue_microtask(Microtask::EmitIdle { flow, epoch });
    }

    pub(crate) fn handle_emit_idle(&mut self, flow: FlowId, epoch: u64) {
        let fresh = {
            let state = self.flow_state_mut(flow);
            state.idle_pending = false;
            state.epoch == epoch
        };
        if fresh && self.flow_is_idle(flow) {
            self.emit(flow, FlowEvent::Idle, None);
        }
    }
}
