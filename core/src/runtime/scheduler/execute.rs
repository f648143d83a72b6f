use std::rc::Rc;

use crate::errors::FlowError;
use crate::runtime::event_loop::Microtask;
use crate::runtime::flow::{
    CallbackKind, FlowId, Frame, FrameId, Node, QueueId, QueueState, Task, TaskBody, TaskId,
    TaskKind, TaskQueue, TaskState,
};
use crate::runtime::promise::{Promise, PromiseRef, PromiseState, Reaction, Settlement};
use crate::runtime::scheduler::promise_ops::promise_depends_on;
use crate::runtime::scheduler::Scheduler;
use crate::runtime::value::Value;

enum Work {
    Body(TaskBody),
    Callback {
        settlement: Settlement,
        handler: Option<CallbackKind>,
    },
}

enum Disposition {
    Run,
    Skip,
    Park(PromiseRef),
}

pub(crate) enum TaskSettle {
    Settled,
    Blocked {
        source: PromiseRef,
        result_promise: PromiseRef,
    },
}

impl Scheduler {
    /// Submits a unit of work to `flow`. The body runs strictly after
    /// every previously scheduled task in the same frame has fully
    /// settled; the returned promise carries the body's (assimilated)
    /// result.
    pub fn execute<F>(
        &mut self,
        flow: FlowId,
        description: impl Into<String>,
        body: F,
    ) -> PromiseRef
    where
        F: FnOnce(&mut Scheduler) -> Result<Value, FlowError> + 'static,
    {
        self.submit_task(flow, description.into(), true, Box::new(body), None)
    }

    pub(crate) fn submit_task(
        &mut self,
        flow: FlowId,
        description: String,
        log: bool,
        body: TaskBody,
        target: Option<FrameId>,
    ) -> PromiseRef {
        let frame = match target {
            Some(frame) => frame,
            None => self.schedule_target(flow),
        };
        let promise = Promise::pending(Some(flow));
        let Some(queue) = self.frame_queue(flow, frame) else {
            return promise;
        };
        let trace = if self.long_traces() && !self.trace.is_empty() {
            Some(self.trace.format_trace())
        } else {
            None
        };
        let tid = {
            let state = self.flow_state_mut(flow);
            let task = Task {
                kind: TaskKind::User { body: Some(body) },
                promise: promise.clone(),
                description,
                frame,
                state: TaskState::Pending,
                child_frame: None,
                log,
                result: None,
                trace,
            };
            let tid = TaskId(state.tasks.insert(task));
            if let Some(f) = state.frames.get_mut(frame.0) {
                f.fifo.push_back(Node::Task(tid));
            }
            state.epoch += 1;
            state.idle_pending = false;
            tid
        };
        {
            let mut cell = promise.borrow_mut();
            cell.task = Some((flow, tid));
            cell.origin_queue = Some((flow, queue));
        }
        self.kick_queue(flow, queue);
        promise
    }

    /// Where new work for `flow` lands: the frame of the task currently
    /// on the stack, the root of a queue still collecting this turn's
    /// batch, or a fresh sibling queue.
    pub(crate) fn schedule_target(&mut self, flow: FlowId) -> FrameId {
        if let Some((active_flow, frame)) = self.task_stack.last().copied() {
            if active_flow == flow {
                return frame;
            }
        }
        let existing = {
            let state = self.flow_state(flow);
            state
                .new_queue()
                .and_then(|qid| state.queue_arena.get(qid.0).map(|queue| queue.root))
        };
        match existing {
            Some(root) => root,
            None => self.open_queue(flow),
        }
    }

    pub(crate) fn open_queue(&mut self, flow: FlowId) -> FrameId {
        let (queue, root) = {
            let state = self.flow_state_mut(flow);
            let qid = QueueId(state.queue_arena.insert(TaskQueue::new(FrameId(usize::MAX))));
            let root = FrameId(state.frames.insert(Frame::root(qid)));
            if let Some(queue) = state.queue_arena.get_mut(qid.0) {
                queue.root = root;
                queue.active_frame = root;
            }
            state.queues.push(qid);
            state.epoch += 1;
            state.idle_pending = false;
            (qid, root)
        };
        self.kick_queue(flow, queue);
        root
    }

    pub(crate) fn frame_queue(&self, flow: FlowId, frame: FrameId) -> Option<QueueId> {
        self.flow_state(flow).frames.get(frame.0).map(|f| f.queue)
    }

    pub(crate) fn kick_queue(&mut self, flow: FlowId, queue: QueueId) {
        {
            let state = self.flow_state_mut(flow);
            let Some(q) = state.queue_arena.get_mut(queue.0) else {
                return;
            };
            if q.state == QueueState::Finished || q.pump_scheduled {
                return;
            }
            q.pump_scheduled = true;
        }
        self.event_loop
            .enqueue_microtask(Microtask::PumpQueue { flow, queue });
    }

    pub(crate) fn kick_flow(&mut self, flow: FlowId) {
        let queues = self.flow_state(flow).queues.clone();
        for queue in queues {
            self.kick_queue(flow, queue);
        }
    }

    /// One pump turn: frame bookkeeping until the queue either executes a
    /// single task body, parks on a pending promise, blocks on an
    /// unhandled rejection, or finishes.
    pub(crate) fn pump_queue(&mut self, flow: FlowId, queue: QueueId) {
        {
            let state = self.flow_state_mut(flow);
            let Some(q) = state.queue_arena.get_mut(queue.0) else {
                return;
            };
            q.pump_scheduled = false;
            match q.state {
                QueueState::Finished => return,
                QueueState::New => q.state = QueueState::Started,
                QueueState::Started => {}
            }
        }
        loop {
            let Some(frame) = self.active_frame_of(flow, queue) else {
                return;
            };
            let head = self
                .flow_state(flow)
                .frames
                .get(frame.0)
                .and_then(|f| f.fifo.front().copied());
            match head {
                Some(Node::Task(tid)) => {
                    let disposition = {
                        let state = self.flow_state(flow);
                        match state.tasks.get(tid.0) {
                            None => Disposition::Skip,
                            Some(task) if task.state == TaskState::Cancelled => Disposition::Skip,
                            Some(task) => match &task.kind {
                                TaskKind::Callback { source, .. }
                                    if source.borrow().is_pending() =>
                                {
                                    Disposition::Park(source.clone())
                                }
                                _ => Disposition::Run,
                            },
                        }
                    };
                    match disposition {
                        Disposition::Skip => {
                            let state = self.flow_state_mut(flow);
                            if let Some(f) = state.frames.get_mut(frame.0) {
                                f.fifo.pop_front();
                            }
                            state.tasks.remove(tid.0);
                            continue;
                        }
                        Disposition::Park(source) => {
                            self.park_queue(flow, queue, &source);
                            return;
                        }
                        Disposition::Run => {
                            {
                                let state = self.flow_state_mut(flow);
                                if let Some(f) = state.frames.get_mut(frame.0) {
                                    f.fifo.pop_front();
                                }
                            }
                            self.run_task(flow, queue, frame, tid);
                            self.kick_queue(flow, queue);
                            return;
                        }
                    }
                }
                Some(Node::Frame(child)) => {
                    let empty = self
                        .flow_state(flow)
                        .frames
                        .get(child.0)
                        .map(|f| f.fifo.is_empty())
                        .unwrap_or(true);
                    let state = self.flow_state_mut(flow);
                    if empty {
                        if let Some(f) = state.frames.get_mut(frame.0) {
                            f.fifo.pop_front();
                        }
                        state.frames.remove(child.0);
                    } else if let Some(q) = state.queue_arena.get_mut(queue.0) {
                        q.active_frame = child;
                    }
                    continue;
                }
                None => {
                    self.prune_pending_rejections(flow, frame);
                    let (rejections_open, owner, parent) = {
                        let state = self.flow_state(flow);
                        match state.frames.get(frame.0) {
                            Some(f) => (
                                !f.pending_rejections.is_empty(),
                                f.owner_task,
                                f.parent,
                            ),
                            None => return,
                        }
                    };
                    if rejections_open {
                        // the rejection sweep either aborts this queue or
                        // a handler attachment re-kicks it
                        return;
                    }
                    match (owner, parent) {
                        (Some(tid), Some(parent)) => match self.try_settle_task(flow, tid) {
                            TaskSettle::Blocked {
                                source,
                                result_promise,
                            } => {
                                self.park_queue(flow, queue, &source);
                                self.kick_on_settle(&result_promise, flow, queue);
                                return;
                            }
                            TaskSettle::Settled => {
                                let state = self.flow_state_mut(flow);
                                state.frames.remove(frame.0);
                                if let Some(q) = state.queue_arena.get_mut(queue.0) {
                                    q.active_frame = parent;
                                }
                                continue;
                            }
                        },
                        (None, Some(parent)) => {
                            let state = self.flow_state_mut(flow);
                            if let Some(pf) = state.frames.get_mut(parent.0) {
                                if let Some(Node::Frame(front)) = pf.fifo.front() {
                                    if *front == frame {
                                        pf.fifo.pop_front();
                                    }
                                }
                            }
                            state.frames.remove(frame.0);
                            if let Some(q) = state.queue_arena.get_mut(queue.0) {
                                q.active_frame = parent;
                            }
                            continue;
                        }
                        (_, None) => {
                            self.finish_queue(flow, queue);
                            return;
                        }
                    }
                }
            }
        }
    }

    fn active_frame_of(&self, flow: FlowId, queue: QueueId) -> Option<FrameId> {
        let state = self.flow_state(flow);
        let q = state.queue_arena.get(queue.0)?;
        if q.state == QueueState::Finished {
            return None;
        }
        Some(q.active_frame)
    }

    fn prune_pending_rejections(&mut self, flow: FlowId, frame: FrameId) {
        let state = self.flow_state_mut(flow);
        if let Some(f) = state.frames.get_mut(frame.0) {
            f.pending_rejections.retain(|p| {
                let cell = p.borrow();
                !cell.handled && matches!(cell.state, PromiseState::Rejected(_))
            });
        }
    }

    fn run_task(&mut self, flow: FlowId, queue: QueueId, parent: FrameId, tid: TaskId) {
        let child = {
            let state = self.flow_state_mut(flow);
            let frame = FrameId(state.frames.insert(Frame::child_of(parent, queue, Some(tid))));
            if let Some(q) = state.queue_arena.get_mut(queue.0) {
                q.active_frame = frame;
            }
            frame
        };

        let Some((work, description, log)) = ({
            let state = self.flow_state_mut(flow);
            state.tasks.get_mut(tid.0).and_then(|task| {
                task.state = TaskState::Running;
                task.child_frame = Some(child);
                let description = task.description.clone();
                let log = task.log;
                let work = match &mut task.kind {
                    TaskKind::User { body } => Work::Body(body.take()?),
                    TaskKind::Callback { source, handler } => {
                        let settlement = source.borrow().settlement()?;
                        Work::Callback {
                            settlement,
                            handler: handler.take(),
                        }
                    }
                };
                Some((work, description, log))
            })
        }) else {
            return;
        };

        if log {
            self.record_history(&description);
        }

        self.task_stack.push((flow, child));
        self.push_binding(Some(flow));
        if self.long_traces() {
            let site = if description.is_empty() {
                "<callback>".to_string()
            } else {
                description.clone()
            };
            self.trace.push_site(site);
        }
        debug_assert_eq!(self.running_bodies, 0, "task bodies must not nest");
        self.running_bodies += 1;

        let outcome: Result<Value, FlowError> = match work {
            Work::Body(body) => body(self),
            Work::Callback {
                settlement,
                handler,
            } => match handler {
                Some(CallbackKind::Then {
                    on_fulfilled,
                    on_rejected,
                }) => match settlement {
                    Settlement::Fulfilled(value) => match on_fulfilled {
                        Some(handler) => handler(self, value),
                        None => Ok(value),
                    },
                    Settlement::Rejected(reason) => match on_rejected {
                        Some(handler) => handler(self, reason),
                        None => Err(reason),
                    },
                },
                Some(CallbackKind::Finally { body }) => {
                    let side = body(self);
                    match side {
                        Ok(()) => settlement.into_result(),
                        Err(error) => Err(error),
                    }
                }
                None => settlement.into_result(),
            },
        };

        self.running_bodies -= 1;
        if self.long_traces() {
            self.trace.pop_site();
        }
        self.pop_binding();
        self.task_stack.pop();

        match outcome {
            Ok(value) => {
                // a returned promise is consumed by this task's settlement,
                // so its rejection is no longer "unhandled"
                if let Value::Promise(inner) = &value {
                    inner.borrow_mut().handled = true;
                }
                let state = self.flow_state_mut(flow);
                if let Some(task) = state.tasks.get_mut(tid.0) {
                    task.result = Some(value);
                }
            }
            Err(error) => self.task_failed(flow, queue, tid, child, error),
        }
    }

    /// A task body threw: its sub-frame is discarded wholesale and the
    /// task's promise rejects with the annotated reason.
    fn task_failed(
        &mut self,
        flow: FlowId,
        queue: QueueId,
        tid: TaskId,
        child: FrameId,
        error: FlowError,
    ) {
        let discard = FlowError::Discarded {
            message: "task abandoned after a failure in its frame".into(),
        };
        self.cancel_frame_contents(flow, child, &discard);
        {
            let state = self.flow_state_mut(flow);
            let parent = state.frames.get(child.0).and_then(|f| f.parent);
            state.frames.remove(child.0);
            if let (Some(q), Some(parent)) = (state.queue_arena.get_mut(queue.0), parent) {
                q.active_frame = parent;
            }
        }
        let Some((promise, context, parent_frame)) = ({
            let state = self.flow_state(flow);
            state.tasks.get(tid.0).map(|task| {
                let context = if task.description.is_empty() {
                    None
                } else {
                    Some(self.task_context(&task.description, task.trace.as_deref()))
                };
                (task.promise.clone(), context, task.frame)
            })
        }) else {
            return;
        };
        let annotated = match context {
            Some(context) => FlowError::InTask {
                context,
                source: Box::new(error),
            },
            None => error,
        };
        self.reject_promise(&promise, annotated);
        self.note_unhandled_in_frame(flow, parent_frame, &promise);
        self.finish_task(flow, tid, &promise);
    }

    /// The task's sub-frame has drained; settle its promise from the
    /// stored body result, assimilating a returned promise.
    pub(crate) fn try_settle_task(&mut self, flow: FlowId, tid: TaskId) -> TaskSettle {
        let Some((promise, result, described)) = ({
            let state = self.flow_state_mut(flow);
            state.tasks.get_mut(tid.0).map(|task| {
                (
                    task.promise.clone(),
                    task.result.take(),
                    if task.description.is_empty() {
                        None
                    } else {
                        Some((task.description.clone(), task.trace.clone(), task.frame))
                    },
                )
            })
        }) else {
            return TaskSettle::Settled;
        };
        let parent_frame = {
            let state = self.flow_state(flow);
            state.tasks.get(tid.0).map(|task| task.frame)
        };
        let context =
            described.map(|(description, trace, _)| self.task_context(&description, trace.as_deref()));

        if promise.borrow().state.is_settled() {
            self.finish_task(flow, tid, &promise);
            return TaskSettle::Settled;
        }
        if matches!(promise.borrow().state, PromiseState::Blocked) {
            let source = promise.borrow().blocked_on.clone();
            if let Some(source) = source {
                return TaskSettle::Blocked {
                    source,
                    result_promise: promise,
                };
            }
        }

        match result {
            Some(Value::Promise(inner)) => {
                if Rc::ptr_eq(&inner, &promise) || promise_depends_on(&inner, &promise) {
                    self.reject_promise(
                        &promise,
                        FlowError::Cycle {
                            message: "task result depends on the task's own promise".into(),
                        },
                    );
                    if let Some(frame) = parent_frame {
                        self.note_unhandled_in_frame(flow, frame, &promise);
                    }
                    self.finish_task(flow, tid, &promise);
                    return TaskSettle::Settled;
                }
                let settlement = inner.borrow().settlement();
                match settlement {
                    Some(Settlement::Fulfilled(value)) => {
                        self.resolve_promise(&promise, value);
                        self.finish_task(flow, tid, &promise);
                        TaskSettle::Settled
                    }
                    Some(Settlement::Rejected(reason)) => {
                        let annotated = match context {
                            Some(context) => FlowError::InTask {
                                context,
                                source: Box::new(reason),
                            },
                            None => reason,
                        };
                        self.reject_promise(&promise, annotated);
                        if let Some(frame) = parent_frame {
                            self.note_unhandled_in_frame(flow, frame, &promise);
                        }
                        self.finish_task(flow, tid, &promise);
                        TaskSettle::Settled
                    }
                    None => {
                        {
                            let mut cell = promise.borrow_mut();
                            cell.state = PromiseState::Blocked;
                            cell.blocked_on = Some(inner.clone());
                        }
                        {
                            let mut source = inner.borrow_mut();
                            source.handled = true;
                            source.reactions.push(Reaction::Assimilate {
                                target: promise.clone(),
                                context,
                            });
                        }
                        TaskSettle::Blocked {
                            source: inner,
                            result_promise: promise,
                        }
                    }
                }
            }
            Some(value) => {
                self.resolve_promise(&promise, value);
                self.finish_task(flow, tid, &promise);
                TaskSettle::Settled
            }
            None => {
                self.resolve_promise(&promise, Value::Null);
                self.finish_task(flow, tid, &promise);
                TaskSettle::Settled
            }
        }
    }

    pub(crate) fn finish_task(&mut self, flow: FlowId, tid: TaskId, promise: &PromiseRef) {
        let state = self.flow_state_mut(flow);
        state.tasks.remove(tid.0);
        promise.borrow_mut().task = None;
    }

    pub(crate) fn note_unhandled_in_frame(
        &mut self,
        flow: FlowId,
        frame: FrameId,
        promise: &PromiseRef,
    ) {
        if promise.borrow().handled {
            return;
        }
        let state = self.flow_state_mut(flow);
        if let Some(f) = state.frames.get_mut(frame.0) {
            f.pending_rejections.push(promise.clone());
        }
    }

    pub(crate) fn task_context(&self, description: &str, trace: Option<&str>) -> String {
        let mut context = format!("task \"{description}\"");
        if let Some(trace) = trace {
            if !trace.is_empty() {
                context.push_str("\n    scheduled at:\n");
                context.push_str(trace);
            }
        }
        context
    }

    pub(crate) fn park_queue(&mut self, flow: FlowId, queue: QueueId, promise: &PromiseRef) {
        if promise.borrow().state.is_settled() {
            self.kick_queue(flow, queue);
            return;
        }
        {
            let state = self.flow_state_mut(flow);
            let Some(q) = state.queue_arena.get_mut(queue.0) else {
                return;
            };
            if let Some(existing) = &q.parked_on {
                if Rc::ptr_eq(existing, promise) {
                    return;
                }
            }
            q.parked_on = Some(promise.clone());
        }
        promise
            .borrow_mut()
            .reactions
            .push(Reaction::KickQueue { flow, queue });
    }

    fn kick_on_settle(&mut self, promise: &PromiseRef, flow: FlowId, queue: QueueId) {
        if promise.borrow().state.is_settled() {
            self.kick_queue(flow, queue);
            return;
        }
        promise
            .borrow_mut()
            .reactions
            .push(Reaction::KickQueue { flow, queue });
    }

    pub(crate) fn wake_queue(&mut self, flow: FlowId, queue: QueueId, promise: &PromiseRef) {
        {
            let state = self.flow_state_mut(flow);
            if let Some(q) = state.queue_arena.get_mut(queue.0) {
                if let Some(parked) = &q.parked_on {
                    if Rc::ptr_eq(parked, promise) {
                        q.parked_on = None;
                    }
                }
            }
        }
        self.kick_queue(flow, queue);
    }

    pub(crate) fn finish_queue(&mut self, flow: FlowId, queue: QueueId) {
        {
            let state = self.flow_state_mut(flow);
            let Some(q) = state.queue_arena.get_mut(queue.0) else {
                return;
            };
            if q.state == QueueState::Finished {
                return;
            }
            q.state = QueueState::Finished;
            q.parked_on = None;
            let root = q.root;
            state.frames.remove(root.0);
            state.queues.retain(|qid| *qid != queue);
        }
        self.maybe_schedule_idle(flow);
    }

    /// Cancels everything still scheduled on a queue and finishes it.
    /// Used by the unhandled-rejection escalation and by `reset`.
    pub(crate) fn teardown_queue(&mut self, flow: FlowId, queue: QueueId, error: &FlowError) {
        let chain = {
            let state = self.flow_state(flow);
            let Some(q) = state.queue_arena.get(queue.0) else {
                return;
            };
            if q.state == QueueState::Finished {
                return;
            }
            let mut chain = Vec::new();
            let mut cursor = Some(q.active_frame);
            while let Some(frame) = cursor {
                chain.push(frame);
                if frame == q.root {
                    break;
                }
                cursor = state.frames.get(frame.0).and_then(|f| f.parent);
            }
            if chain.last() != Some(&q.root) {
                chain.push(q.root);
            }
            chain
        };
        for frame in chain {
            self.cancel_frame_contents(flow, frame, error);
            let owner = {
                self.flow_state(flow)
                    .frames
                    .get(frame.0)
                    .and_then(|f| f.owner_task)
            };
            if let Some(tid) = owner {
                let promise = {
                    self.flow_state(flow)
                        .tasks
                        .get(tid.0)
                        .map(|task| task.promise.clone())
                };
                if let Some(promise) = promise {
                    promise.borrow_mut().handled = true;
                    self.reject_promise(&promise, error.clone());
                    self.finish_task(flow, tid, &promise);
                }
            }
            self.flow_state_mut(flow).frames.remove(frame.0);
        }
        {
            let state = self.flow_state_mut(flow);
            if let Some(q) = state.queue_arena.get_mut(queue.0) {
                q.state = QueueState::Finished;
                q.parked_on = None;
            }
            state.queues.retain(|qid| *qid != queue);
        }
        self.maybe_schedule_idle(flow);
    }

    /// Rejects and removes every task reachable from `frame`'s FIFO. The
    /// rejections are pre-marked handled, so they only reach handlers
    /// attached from outside the frame.
    pub(crate) fn cancel_frame_contents(
        &mut self,
        flow: FlowId,
        frame: FrameId,
        error: &FlowError,
    ) {
        let nodes: Vec<Node> = {
            let state = self.flow_state_mut(flow);
            match state.frames.get_mut(frame.0) {
                Some(f) => f.fifo.drain(..).collect(),
                None => return,
            }
        };
        for node in nodes {
            match node {
                Node::Task(tid) => {
                    let removed = self.flow_state_mut(flow).tasks.remove(tid.0);
                    let Some(task) = removed else {
                        continue;
                    };
                    let promise = task.promise.clone();
                    {
                        let mut cell = promise.borrow_mut();
                        cell.task = None;
                        cell.handled = true;
                    }
                    self.reject_promise(&promise, error.clone());
                }
                Node::Frame(child) => {
                    self.cancel_frame_contents(flow, child, error);
                    self.flow_state_mut(flow).frames.remove(child.0);
                }
            }
        }
    }

    /// Schedules `callback` on the host timer queue. Not tied to any
    /// flow; work it submits lands on a fresh queue.
    pub fn set_timeout(
        &mut self,
        delay_ms: u64,
        callback: impl FnOnce(&mut Scheduler) + 'static,
    ) -> u64 {
        self.event_loop
            .schedule_timer(delay_ms, None, None, Box::new(callback))
    }

    pub fn clear_timeout(&mut self, id: u64) {
        if let Some(timer) = self.event_loop.clear_timer(id) {
            if let Some(flow) = timer.flow {
                let state = self.flow_state_mut(flow);
                state.pending_timers = state.pending_timers.saturating_sub(1);
            }
        }
    }
}
