use std::cell::RefCell;
use std::rc::Rc;

use crate::errors::FlowError;
use crate::runtime::event_loop::Microtask;
use crate::runtime::flow::{
    CallbackKind, FlowId, Frame, FrameId, Node, Task, TaskId, TaskKind, TaskState,
};
use crate::runtime::promise::{
    Deferred, Observer, OnFulfilled, OnRejected, Promise, PromiseRef, PromiseState, Reaction,
    Settlement,
};
use crate::runtime::scheduler::Scheduler;
use crate::runtime::value::Value;

/// True if `start` transitively waits on `target` through assimilation.
pub(crate) fn promise_depends_on(start: &PromiseRef, target: &PromiseRef) -> bool {
    let mut cursor = start.clone();
    loop {
        let next = cursor.borrow().blocked_on.clone();
        match next {
            Some(next) => {
                if Rc::ptr_eq(&next, target) {
                    return true;
                }
                cursor = next;
            }
            None => return false,
        }
    }
}

#[derive(Debug, Clone)]
enum PathSeg {
    Index(usize),
    Key(String),
}

struct ResolveJoin {
    root: Value,
    remaining: usize,
    failed: bool,
}

impl ResolveJoin {
    fn write(&mut self, path: &[PathSeg], value: Value) {
        let mut cursor = &mut self.root;
        for seg in path {
            match (seg, cursor) {
                (PathSeg::Index(idx), Value::List(items)) => match items.get_mut(*idx) {
                    Some(item) => cursor = item,
                    None => return,
                },
                (PathSeg::Key(key), Value::Map(entries)) => match entries.get_mut(key) {
                    Some(entry) => cursor = entry,
                    None => return,
                },
                _ => return,
            }
        }
        *cursor = value;
    }
}

impl Scheduler {
    /// Chains handlers onto `promise`. On a flow-owned promise the
    /// handlers run as a task slotted into the owning flow's scheduling
    /// frame at attachment time; on a flowless promise they run as raw
    /// microtasks when it settles.
    pub fn then(
        &mut self,
        promise: &PromiseRef,
        on_fulfilled: Option<OnFulfilled>,
        on_rejected: Option<OnRejected>,
    ) -> PromiseRef {
        self.attach(
            promise,
            CallbackKind::Then {
                on_fulfilled,
                on_rejected,
            },
        )
    }

    pub fn catch<F>(&mut self, promise: &PromiseRef, on_rejected: F) -> PromiseRef
    where
        F: FnOnce(&mut Scheduler, FlowError) -> Result<Value, FlowError> + 'static,
    {
        self.attach(
            promise,
            CallbackKind::Then {
                on_fulfilled: None,
                on_rejected: Some(Box::new(on_rejected)),
            },
        )
    }

    pub fn finally<F>(&mut self, promise: &PromiseRef, body: F) -> PromiseRef
    where
        F: FnOnce(&mut Scheduler) -> Result<(), FlowError> + 'static,
    {
        self.attach(
            promise,
            CallbackKind::Finally {
                body: Box::new(body),
            },
        )
    }

    fn attach(&mut self, source: &PromiseRef, handler: CallbackKind) -> PromiseRef {
        let owner = source.borrow().flow;
        source.borrow_mut().handled = true;
        match owner {
            Some(flow) => {
                let child = Promise::pending(Some(flow));
                let frame = self.schedule_target(flow);
                let Some(queue) = self.frame_queue(flow, frame) else {
                    return child;
                };
                let tid = {
                    let state = self.flow_state_mut(flow);
                    let slot = FrameId(state.frames.insert(Frame::child_of(frame, queue, None)));
                    let task = Task {
                        kind: TaskKind::Callback {
                            source: source.clone(),
                            handler: Some(handler),
                        },
                        promise: child.clone(),
                        description: String::new(),
                        frame: slot,
                        state: TaskState::Pending,
                        child_frame: None,
                        log: false,
                        result: None,
                        trace: None,
                    };
                    let tid = TaskId(state.tasks.insert(task));
                    if let Some(f) = state.frames.get_mut(slot.0) {
                        f.fifo.push_back(Node::Task(tid));
                    }
                    if let Some(f) = state.frames.get_mut(frame.0) {
                        f.fifo.push_back(Node::Frame(slot));
                    }
                    state.epoch += 1;
                    state.idle_pending = false;
                    tid
                };
                {
                    let mut cell = child.borrow_mut();
                    cell.task = Some((flow, tid));
                    cell.origin_queue = Some((flow, queue));
                }
                self.kick_queue(flow, queue);
                child
            }
            None => {
                let child = Promise::pending(None);
                let reaction = match handler {
                    CallbackKind::Then {
                        on_fulfilled,
                        on_rejected,
                    } => Reaction::Then {
                        on_fulfilled,
                        on_rejected,
                        child: child.clone(),
                    },
                    CallbackKind::Finally { body } => Reaction::Finally {
                        body,
                        child: child.clone(),
                    },
                };
                let settlement = source.borrow().settlement();
                match settlement {
                    Some(settlement) => self
                        .event_loop
                        .enqueue_microtask(Microtask::RunReaction {
                            reaction,
                            settlement,
                        }),
                    None => source.borrow_mut().reactions.push(reaction),
                }
                child
            }
        }
    }

    /// Rejects a pending promise with a `CancellationError`. If the
    /// promise is an unstarted task's result, the task body is dropped
    /// without running; a running task has its remaining sub-work
    /// cancelled. Settled promises are untouched.
    pub fn cancel(&mut self, promise: &PromiseRef, reason: impl Into<String>) {
        self.cancel_with(promise, FlowError::cancelled(reason.into()));
    }

    pub(crate) fn cancel_with(&mut self, promise: &PromiseRef, error: FlowError) {
        if promise.borrow().state.is_settled() {
            return;
        }
        let task = promise.borrow().task;
        if let Some((flow, tid)) = task {
            let child_frame = {
                let state = self.flow_state_mut(flow);
                match state.tasks.get_mut(tid.0) {
                    Some(task) => {
                        task.state = TaskState::Cancelled;
                        match &mut task.kind {
                            TaskKind::User { body } => {
                                body.take();
                            }
                            TaskKind::Callback { handler, .. } => {
                                handler.take();
                            }
                        }
                        task.child_frame
                    }
                    None => None,
                }
            };
            if let Some(frame) = child_frame {
                self.cancel_frame_contents(flow, frame, &error);
                self.cancel_inflight_descendants(flow, frame, &error);
            }
            promise.borrow_mut().task = None;
            self.kick_flow(flow);
        }
        promise.borrow_mut().handled = true;
        self.reject_promise(promise, error);
    }

    /// Sub-tasks that already started and are blocked below `frame` sit
    /// on the queue's active path, not in any FIFO; cancel their
    /// promises so the queue can unwind past them.
    fn cancel_inflight_descendants(&mut self, flow: FlowId, frame: FrameId, error: &FlowError) {
        let descendants = {
            let state = self.flow_state(flow);
            let queue = state.frames.get(frame.0).map(|f| f.queue);
            let mut chain = Vec::new();
            if let Some(queue) = queue {
                if let Some(q) = state.queue_arena.get(queue.0) {
                    let mut path = Vec::new();
                    let mut cursor = Some(q.active_frame);
                    let mut reaches = false;
                    while let Some(fid) = cursor {
                        if fid == frame {
                            reaches = true;
                            break;
                        }
                        path.push(fid);
                        cursor = state.frames.get(fid.0).and_then(|f| f.parent);
                    }
                    if reaches {
                        chain = path;
                    }
                }
            }
            chain
        };
        for fid in descendants {
            let owner_promise = {
                let state = self.flow_state(flow);
                state
                    .frames
                    .get(fid.0)
                    .and_then(|f| f.owner_task)
                    .and_then(|tid| state.tasks.get(tid.0).map(|task| task.promise.clone()))
            };
            if let Some(promise) = owner_promise {
                if promise.borrow().is_pending() {
                    promise.borrow_mut().handled = true;
                    self.cancel_with(&promise, error.clone());
                }
            }
        }
    }

    pub(crate) fn fulfill_promise(&mut self, promise: &PromiseRef, value: Value) {
        self.settle(promise, Settlement::Fulfilled(value));
    }

    pub(crate) fn reject_promise(&mut self, promise: &PromiseRef, reason: FlowError) {
        self.settle(promise, Settlement::Rejected(reason));
    }

    /// Resolves `promise` with `value`, assimilating it when the value is
    /// itself a promise. Self-dependency rejects with a cycle error.
    pub(crate) fn resolve_promise(&mut self, promise: &PromiseRef, value: Value) {
        if promise.borrow().state.is_settled() {
            return;
        }
        match value {
            Value::Promise(inner) => {
                if Rc::ptr_eq(&inner, promise) || promise_depends_on(&inner, promise) {
                    self.reject_promise(
                        promise,
                        FlowError::Cycle {
                            message: "promise resolved with a value that depends on itself".into(),
                        },
                    );
                    return;
                }
                let settlement = inner.borrow().settlement();
                match settlement {
                    Some(Settlement::Fulfilled(value)) => self.resolve_promise(promise, value),
                    Some(Settlement::Rejected(reason)) => self.reject_promise(promise, reason),
                    None => {
                        {
                            let mut cell = promise.borrow_mut();
                            cell.state = PromiseState::Blocked;
                            cell.blocked_on = Some(inner.clone());
                        }
                        let mut source = inner.borrow_mut();
                        source.handled = true;
                        source.reactions.push(Reaction::Assimilate {
                            target: promise.clone(),
                            context: None,
                        });
                    }
                }
            }
            other => self.settle(promise, Settlement::Fulfilled(other)),
        }
    }

    fn settle(&mut self, promise: &PromiseRef, settlement: Settlement) {
        let reactions = {
            let mut cell = promise.borrow_mut();
            if cell.state.is_settled() {
                return;
            }
            cell.state = match &settlement {
                Settlement::Fulfilled(value) => PromiseState::Fulfilled(value.clone()),
                Settlement::Rejected(reason) => PromiseState::Rejected(reason.clone()),
            };
            cell.blocked_on = None;
            std::mem::take(&mut cell.reactions)
        };
        if matches!(settlement, Settlement::Rejected(_)) && !promise.borrow().handled {
            self.track_rejection(promise);
        }
        for reaction in reactions {
            match reaction {
                Reaction::Assimilate { target, context } => match &settlement {
                    Settlement::Fulfilled(value) => self.resolve_promise(&target, value.clone()),
                    Settlement::Rejected(reason) => {
                        let error = match context {
                            Some(context) => FlowError::InTask {
                                context,
                                source: Box::new(reason.clone()),
                            },
                            None => reason.clone(),
                        };
                        self.reject_promise(&target, error);
                    }
                },
                Reaction::KickQueue { flow, queue } => self.wake_queue(flow, queue, promise),
                other => self.event_loop.enqueue_microtask(Microtask::RunReaction {
                    reaction: other,
                    settlement: settlement.clone(),
                }),
            }
        }
    }

    /// Dispatch for reactions that run a microtask behind the settlement:
    /// flowless handlers and internal observers.
    pub(crate) fn run_reaction(&mut self, reaction: Reaction, settlement: Settlement) {
        match reaction {
            Reaction::Then {
                on_fulfilled,
                on_rejected,
                child,
            } => {
                let outcome = match settlement {
                    Settlement::Fulfilled(value) => match on_fulfilled {
                        Some(handler) => handler(self, value),
                        None => Ok(value),
                    },
                    Settlement::Rejected(reason) => match on_rejected {
                        Some(handler) => handler(self, reason),
                        None => Err(reason),
                    },
                };
                self.complete_child(&child, outcome);
            }
            Reaction::Finally { body, child } => {
                let side = body(self);
                let outcome = match side {
                    Ok(()) => settlement.into_result(),
                    Err(error) => Err(error),
                };
                self.complete_child(&child, outcome);
            }
            Reaction::Assimilate { target, context } => match settlement {
                Settlement::Fulfilled(value) => self.resolve_promise(&target, value),
                Settlement::Rejected(reason) => {
                    let error = match context {
                        Some(context) => FlowError::InTask {
                            context,
                            source: Box::new(reason),
                        },
                        None => reason,
                    };
                    self.reject_promise(&target, error);
                }
            },
            Reaction::KickQueue { flow, queue } => self.kick_queue(flow, queue),
            Reaction::Observe { observer } => observer(self, settlement),
        }
    }

    fn complete_child(&mut self, child: &PromiseRef, outcome: Result<Value, FlowError>) {
        match outcome {
            Ok(value) => self.resolve_promise(child, value),
            Err(error) => self.reject_promise(child, error),
        }
    }

    /// Registers an internal settlement observer. `mark_handled` decides
    /// whether the observation counts as consuming a rejection.
    pub(crate) fn observe(&mut self, promise: &PromiseRef, mark_handled: bool, observer: Observer) {
        if mark_handled {
            promise.borrow_mut().handled = true;
        }
        let settlement = promise.borrow().settlement();
        match settlement {
            Some(settlement) => self.event_loop.enqueue_microtask(Microtask::RunReaction {
                reaction: Reaction::Observe { observer },
                settlement,
            }),
            None => promise
                .borrow_mut()
                .reactions
                .push(Reaction::Observe { observer }),
        }
    }

    /// A promise already fulfilled with `value` (after assimilation),
    /// owned by the currently active flow.
    pub fn fulfilled(&mut self, value: Value) -> PromiseRef {
        let promise = Promise::pending(self.current_owner());
        self.resolve_promise(&promise, value);
        promise
    }

    /// A promise already rejected with `reason`. Like any rejection, it
    /// is reported as uncaught unless a handler is attached within one
    /// microtask turn.
    pub fn rejected(&mut self, reason: FlowError) -> PromiseRef {
        let promise = Promise::pending(self.current_owner());
        self.reject_promise(&promise, reason);
        promise
    }

    pub fn defer(&mut self) -> Deferred {
        Deferred {
            promise: Promise::pending(self.current_owner()),
        }
    }

    /// A promise that fulfills with `Null` after `delay_ms`.
    pub fn delayed(&mut self, delay_ms: u64) -> PromiseRef {
        let owner = self.current_owner();
        let promise = Promise::pending(owner);
        if let Some(flow) = owner {
            let state = self.flow_state_mut(flow);
            state.pending_timers += 1;
            state.epoch += 1;
            state.idle_pending = false;
        }
        let target = promise.clone();
        self.event_loop.schedule_timer(
            delay_ms,
            owner,
            Some(promise.clone()),
            Box::new(move |scheduler| {
                scheduler.resolve_promise(&target, Value::Null);
            }),
        );
        promise
    }

    /// Deeply awaits every promise nested in `value`'s lists and maps
    /// (including promises discovered inside fulfillment values). The
    /// first nested rejection rejects the whole result.
    pub fn fully_resolved(&mut self, value: Value) -> PromiseRef {
        let result = Promise::pending(self.current_owner());
        let join = Rc::new(RefCell::new(ResolveJoin {
            root: value.clone(),
            remaining: 0,
            failed: false,
        }));
        self.collect_nested(&join, &result, &value, Vec::new());
        let immediate = {
            let join = join.borrow();
            if join.remaining == 0 && !join.failed {
                Some(join.root.clone())
            } else {
                None
            }
        };
        if let Some(root) = immediate {
            self.settle(&result, Settlement::Fulfilled(root));
        }
        result
    }

    fn collect_nested(
        &mut self,
        join: &Rc<RefCell<ResolveJoin>>,
        result: &PromiseRef,
        value: &Value,
        path: Vec<PathSeg>,
    ) {
        match value {
            Value::List(items) => {
                for (idx, item) in items.iter().enumerate() {
                    let mut item_path = path.clone();
                    item_path.push(PathSeg::Index(idx));
                    self.collect_nested(join, result, item, item_path);
                }
            }
            Value::Map(entries) => {
                for (key, entry) in entries.iter() {
                    let mut entry_path = path.clone();
                    entry_path.push(PathSeg::Key(key.clone()));
                    self.collect_nested(join, result, entry, entry_path);
                }
            }
            Value::Promise(nested) => {
                join.borrow_mut().remaining += 1;
                let join = join.clone();
                let result = result.clone();
                self.observe(
                    nested,
                    true,
                    Box::new(move |scheduler, settlement| match settlement {
                        Settlement::Rejected(reason) => {
                            let first = {
                                let mut join = join.borrow_mut();
                                if join.failed {
                                    false
                                } else {
                                    join.failed = true;
                                    true
                                }
                            };
                            if first {
                                scheduler.reject_promise(&result, reason);
                            }
                        }
                        Settlement::Fulfilled(value) => {
                            join.borrow_mut().write(&path, value.clone());
                            scheduler.collect_nested(&join, &result, &value, path.clone());
                            let finished = {
                                let mut join = join.borrow_mut();
                                join.remaining -= 1;
                                if join.remaining == 0 && !join.failed {
                                    Some(join.root.clone())
                                } else {
                                    None
                                }
                            };
                            if let Some(root) = finished {
                                scheduler.fulfill_promise(&result, root);
                            }
                        }
                    }),
                );
            }
            _ => {}
        }
    }
}
