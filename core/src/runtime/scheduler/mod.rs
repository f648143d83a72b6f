mod driver;
mod events;
mod execute;
mod promise_ops;
mod rejections;
mod wait;

use crate::diagnostics::ScheduleTrace;
use crate::errors::FlowError;
use crate::runtime::event_loop::EventLoop;
use crate::runtime::flow::{Arena, ControlFlow, FlowEvent, FlowId, FrameId};
use crate::runtime::promise::{Promise, PromiseRef};
use crate::runtime::value::Value;

pub use wait::Condition;
pub(crate) use rejections::RejectionTracker;
pub(crate) use wait::WaitState;

/// The scheduler: owns the event loop, every control flow, and the
/// active-flow binding. All promise and task operations live here, with
/// `&mut Scheduler` threaded through every user callback.
pub struct Scheduler {
    pub(crate) event_loop: EventLoop,
    /// Flows are never dropped, so a `FlowId` stays valid for the
    /// scheduler's lifetime.
    pub(crate) flows: Vec<ControlFlow>,
    default_flow: FlowId,
    /// Active-flow bindings, innermost last. A `None` entry is a detached
    /// scope: promises created there have no owning flow.
    active_stack: Vec<Option<FlowId>>,
    /// The (flow, frame) scheduling context while a task body runs.
    pub(crate) task_stack: Vec<(FlowId, FrameId)>,
    pub(crate) tracker: RejectionTracker,
    /// Unhandled rejection with no flow to deliver it to.
    pub(crate) orphan_error: Option<FlowError>,
    pub(crate) waits: Arena<WaitState>,
    history: Vec<String>,
    long_traces: bool,
    pub(crate) trace: ScheduleTrace,
    next_listener_id: u64,
    /// Task bodies currently on the stack; never exceeds one.
    pub(crate) running_bodies: usize,
}

impl Scheduler {
    /// A scheduler with a deterministic virtual clock; timers fire by
    /// jumping the clock, so runs are instant and repeatable.
    pub fn new() -> Self {
        Self::with_options(false, false)
    }

    /// A scheduler whose timers wait on the wall clock.
    pub fn new_with_realtime_timers(realtime: bool) -> Self {
        Self::with_options(realtime, false)
    }

    pub(crate) fn with_options(realtime: bool, long_traces: bool) -> Self {
        Self {
            event_loop: EventLoop::new(realtime),
            flows: vec![ControlFlow::new()],
            default_flow: FlowId(0),
            active_stack: Vec::new(),
            task_stack: Vec::new(),
            tracker: RejectionTracker::default(),
            orphan_error: None,
            waits: Arena::new(),
            history: Vec::new(),
            long_traces,
            trace: ScheduleTrace::default(),
            next_listener_id: 1,
            running_bodies: 0,
        }
    }

    /// Descriptions of the tasks that have started, in execution order.
    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub(crate) fn record_history(&mut self, entry: &str) {
        if !entry.is_empty() {
            self.history.push(entry.to_string());
        }
    }

    pub fn now_ms(&self) -> u64 {
        self.event_loop.now_ms()
    }

    pub(crate) fn long_traces(&self) -> bool {
        self.long_traces
    }

    pub(crate) fn next_listener(&mut self) -> u64 {
        let id = self.next_listener_id;
        self.next_listener_id += 1;
        id
    }

    /// The flow new work lands on: the innermost binding, or the default
    /// flow outside any `create_flow`/`detached` scope.
    pub fn active_flow(&self) -> FlowId {
        match self.active_stack.last() {
            Some(Some(flow)) => *flow,
            Some(None) => self.default_flow,
            None => self.default_flow,
        }
    }

    /// Owner captured by promise factories; `None` inside a detached
    /// scope.
    pub(crate) fn current_owner(&self) -> Option<FlowId> {
        match self.active_stack.last() {
            Some(binding) => *binding,
            None => Some(self.default_flow),
        }
    }

    pub(crate) fn push_binding(&mut self, binding: Option<FlowId>) {
        self.active_stack.push(binding);
    }

    pub(crate) fn pop_binding(&mut self) {
        self.active_stack.pop();
    }

    /// Runs `f` with no active flow: promises created inside have no
    /// owner, so their handlers run as raw microtasks and their
    /// rejections are never decorated.
    pub fn detached<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.push_binding(None);
        let result = f(self);
        self.pop_binding();
        result
    }

    /// Constructs a new flow, binds it active, and runs `f` against it
    /// synchronously. The returned promise (owned by the previously
    /// active flow) fulfills when the new flow goes idle and rejects on
    /// its first uncaught exception.
    pub fn create_flow<F>(&mut self, f: F) -> PromiseRef
    where
        F: FnOnce(&mut Scheduler, FlowId) -> Result<(), FlowError>,
    {
        let owner = self.current_owner();
        self.flows.push(ControlFlow::new());
        let flow = FlowId(self.flows.len() - 1);
        let result = Promise::pending(owner);

        let done = result.clone();
        self.once(flow, FlowEvent::Idle, move |scheduler, _| {
            scheduler.resolve_promise(&done, Value::Null);
        });
        let failed = result.clone();
        self.once(flow, FlowEvent::UncaughtException, move |scheduler, error| {
            if let Some(error) = error {
                let error = error.clone();
                scheduler.reject_promise(&failed, error);
            }
        });

        self.push_binding(Some(flow));
        let outcome = f(self, flow);
        self.pop_binding();

        match outcome {
            Ok(()) => self.maybe_schedule_idle(flow),
            Err(error) => self.reject_promise(&result, error),
        }
        result
    }

    pub(crate) fn flow_state(&self, flow: FlowId) -> &ControlFlow {
        &self.flows[flow.0]
    }

    pub(crate) fn flow_state_mut(&mut self, flow: FlowId) -> &mut ControlFlow {
        &mut self.flows[flow.0]
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}
