use crate::errors::FlowError;
use crate::runtime::flow::{FlowId, FrameId, QueueId};
use crate::runtime::promise::{Promise, PromiseRef};
use crate::runtime::scheduler::Scheduler;
use crate::runtime::value::Value;

pub type PollFn = Box<dyn FnMut(&mut Scheduler) -> Result<Value, FlowError>>;

/// What a wait blocks on: a condition polled until truthy, or a single
/// promise. The two valid forms are the whole surface; there is no
/// ill-typed condition to reject at runtime.
pub enum Condition {
    Poll(PollFn),
    Promise(PromiseRef),
}

impl Condition {
    pub fn poll<F>(poll: F) -> Condition
    where
        F: FnMut(&mut Scheduler) -> Result<Value, FlowError> + 'static,
    {
        Condition::Poll(Box::new(poll))
    }

    pub fn promise(promise: &PromiseRef) -> Condition {
        Condition::Promise(promise.clone())
    }
}

/// Book-keeping for one polled wait, stored on the scheduler so the
/// 0-delay re-arm timers can find it again.
pub(crate) struct WaitState {
    pub poll: Option<PollFn>,
    pub probe: PromiseRef,
    pub flow: FlowId,
    pub frame: Option<FrameId>,
    pub queue: Option<QueueId>,
    pub description: String,
    pub started_at: u64,
    pub timeout_ms: u64,
    pub deadline: Option<u64>,
    pub next_poll: usize,
}

fn timeout_error(description: &str, elapsed: u64) -> FlowError {
    let message = if description.is_empty() {
        format!("Wait timed out after {elapsed}ms")
    } else {
        format!("{description}\nWait timed out after {elapsed}ms")
    };
    FlowError::Timeout { message }
}

impl Scheduler {
    /// Schedules a task that resolves once `condition` is met. A
    /// `timeout_ms` of 0 waits without bound. Polled conditions run each
    /// poll in its own sub-frame, so work the condition schedules drains
    /// before the next poll; a poll error or promise rejection rejects
    /// the wait immediately.
    pub fn wait(
        &mut self,
        flow: FlowId,
        condition: Condition,
        timeout_ms: u64,
        description: impl Into<String>,
    ) -> PromiseRef {
        let description = description.into();
        match condition {
            Condition::Promise(source) => {
                self.wait_on_promise(flow, source, timeout_ms, description)
            }
            Condition::Poll(poll) => self.wait_on_poll(flow, poll, timeout_ms, description),
        }
    }

    fn wait_on_promise(
        &mut self,
        flow: FlowId,
        source: PromiseRef,
        timeout_ms: u64,
        description: String,
    ) -> PromiseRef {
        let body_source = source;
        let outer = self.submit_task(
            flow,
            description.clone(),
            false,
            Box::new(move |_| Ok(Value::Promise(body_source))),
            None,
        );
        if timeout_ms > 0 {
            let started = self.event_loop.now_ms();
            {
                let state = self.flow_state_mut(flow);
                state.pending_timers += 1;
                state.epoch += 1;
                state.idle_pending = false;
            }
            let target = outer.clone();
            let id = self.event_loop.schedule_timer(
                timeout_ms,
                Some(flow),
                None,
                Box::new(move |scheduler| {
                    if target.borrow().is_pending() {
                        let elapsed = scheduler.now_ms().saturating_sub(started);
                        let error = timeout_error(&description, elapsed);
                        scheduler.reject_promise(&target, error);
                    }
                }),
            );
            self.observe(
                &outer,
                false,
                Box::new(move |scheduler, _| scheduler.clear_timeout(id)),
            );
        }
        outer
    }

    fn wait_on_poll(
        &mut self,
        flow: FlowId,
        poll: PollFn,
        timeout_ms: u64,
        description: String,
    ) -> PromiseRef {
        let probe = Promise::pending(None);
        let wait_id = self.waits.insert(WaitState {
            poll: Some(poll),
            probe: probe.clone(),
            flow,
            frame: None,
            queue: None,
            description: description.clone(),
            started_at: 0,
            timeout_ms,
            deadline: None,
            next_poll: 0,
        });
        let body_probe = probe;
        let outer = self.submit_task(
            flow,
            description,
            false,
            Box::new(move |scheduler| {
                scheduler.begin_wait(wait_id);
                Ok(Value::Promise(body_probe))
            }),
            None,
        );
        self.observe(
            &outer,
            false,
            Box::new(move |scheduler, _| scheduler.finish_wait(wait_id)),
        );
        outer
    }

    fn begin_wait(&mut self, wait_id: usize) {
        let Some((flow, frame)) = self.task_stack.last().copied() else {
            return;
        };
        let queue = self.frame_queue(flow, frame);
        let now = self.event_loop.now_ms();
        {
            let Some(wait) = self.waits.get_mut(wait_id) else {
                return;
            };
            wait.frame = Some(frame);
            wait.queue = queue;
            wait.started_at = now;
            wait.deadline = if wait.timeout_ms > 0 {
                Some(now + wait.timeout_ms)
            } else {
                None
            };
        }
        self.schedule_poll(wait_id);
    }

    fn schedule_poll(&mut self, wait_id: usize) {
        let Some((flow, frame, label)) = ({
            self.waits.get(wait_id).and_then(|wait| {
                wait.frame
                    .map(|frame| (wait.flow, frame, format!("{}: {}", wait.next_poll, wait.description)))
            })
        }) else {
            return;
        };
        if let Some(wait) = self.waits.get_mut(wait_id) {
            wait.next_poll += 1;
        }
        self.submit_task(
            flow,
            label,
            true,
            Box::new(move |scheduler| scheduler.run_wait_poll(wait_id)),
            Some(frame),
        );
    }

    fn run_wait_poll(&mut self, wait_id: usize) -> Result<Value, FlowError> {
        let Some(mut poll) = self.waits.get_mut(wait_id).and_then(|wait| wait.poll.take()) else {
            return Ok(Value::Null);
        };
        let outcome = poll(self);
        if let Some(wait) = self.waits.get_mut(wait_id) {
            wait.poll = Some(poll);
        }
        let Some((probe, flow, deadline, started, description)) = ({
            self.waits.get(wait_id).map(|wait| {
                (
                    wait.probe.clone(),
                    wait.flow,
                    wait.deadline,
                    wait.started_at,
                    wait.description.clone(),
                )
            })
        }) else {
            return Ok(Value::Null);
        };
        match outcome {
            Err(error) => self.reject_promise(&probe, error),
            Ok(value) if value.is_truthy() => self.resolve_promise(&probe, value),
            Ok(_) => {
                let now = self.event_loop.now_ms();
                if let Some(deadline) = deadline {
                    if now >= deadline {
                        let error = timeout_error(&description, now.saturating_sub(started));
                        self.reject_promise(&probe, error);
                        return Ok(Value::Null);
                    }
                }
                {
                    let state = self.flow_state_mut(flow);
                    state.pending_timers += 1;
                    state.epoch += 1;
                    state.idle_pending = false;
                }
                self.event_loop.schedule_timer(
                    0,
                    Some(flow),
                    None,
                    Box::new(move |scheduler| scheduler.poll_again(wait_id)),
                );
            }
        }
        Ok(Value::Null)
    }

    fn poll_again(&mut self, wait_id: usize) {
        let valid = {
            match self.waits.get(wait_id) {
                Some(wait) if wait.probe.borrow().is_pending() => match wait.frame {
                    Some(frame) => self
                        .flow_state(wait.flow)
                        .frames
                        .get(frame.0)
                        .map(|f| Some(f.queue) == wait.queue)
                        .unwrap_or(false),
                    None => false,
                },
                _ => false,
            }
        };
        if valid {
            self.schedule_poll(wait_id);
        } else {
            self.finish_wait(wait_id);
        }
    }

    pub(crate) fn finish_wait(&mut self, wait_id: usize) {
        let Some(wait) = self.waits.remove(wait_id) else {
            return;
        };
        if wait.probe.borrow().is_pending() {
            wait.probe.borrow_mut().handled = true;
            self.reject_promise(&wait.probe, FlowError::cancelled("wait abandoned"));
        }
    }
}
