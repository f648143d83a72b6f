use std::cell::RefCell;
use std::rc::Rc;

use lockstep::{FlowError, PromiseRef, Scheduler, Value};

type Reason = Rc<RefCell<Option<FlowError>>>;

fn reason_slot() -> Reason {
    Rc::new(RefCell::new(None))
}

fn capture_rejection(scheduler: &mut Scheduler, promise: &PromiseRef, into: &Reason) {
    let into = into.clone();
    scheduler.catch(promise, move |_, error| {
        *into.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
}

#[test]
fn cancelled_task_body_never_runs() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let ran = Rc::new(RefCell::new(false));

    let flag = ran.clone();
    let doomed = scheduler.execute(flow, "a", move |_| {
        *flag.borrow_mut() = true;
        Ok(Value::Null)
    });
    scheduler.cancel(&doomed, "nope");
    scheduler.execute(flow, "b", |_| Ok(Value::Null));

    let reason = reason_slot();
    capture_rejection(&mut scheduler, &doomed, &reason);
    scheduler.run_until_idle().expect("cancellation is absorbed");

    assert!(!*ran.borrow());
    assert_eq!(scheduler.history(), ["b"]);
    let reason = reason.borrow().clone().expect("rejection observed");
    assert_eq!(
        reason,
        FlowError::Cancelled {
            message: "nope".into()
        }
    );
}

#[test]
fn cancellation_is_idempotent() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let doomed = scheduler.execute(flow, "a", |_| Ok(Value::Null));
    scheduler.cancel(&doomed, "first");
    scheduler.cancel(&doomed, "second");

    assert_eq!(
        doomed.borrow().rejection_reason(),
        Some(FlowError::Cancelled {
            message: "first".into()
        })
    );
    scheduler.run_until_idle().expect("cancellation is absorbed");
}

#[test]
fn cancelling_a_settled_promise_is_a_no_op() {
    let mut scheduler = Scheduler::new();
    let promise = scheduler.fulfilled(Value::Number(9.0));
    scheduler.cancel(&promise, "too late");

    assert_eq!(promise.borrow().fulfilled_value(), Some(Value::Number(9.0)));
}

#[test]
fn cancellation_reaches_promises_awaiting_the_task() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();

    let gate = scheduler.defer();
    let gate_promise = gate.promise.clone();
    let blocked = scheduler.execute(flow, "blocked", move |_| Ok(Value::Promise(gate_promise)));
    let dependent = scheduler.then(
        &blocked,
        Some(Box::new(|_, value: Value| Ok(value))),
        None,
    );
    let reason = reason_slot();
    capture_rejection(&mut scheduler, &dependent, &reason);

    scheduler.run_until_idle().expect("queue parks on the gate");
    scheduler.cancel(&blocked, "stop");
    scheduler.run_until_idle().expect("cancellation is absorbed");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert!(reason.is_cancellation());
}

#[test]
fn cancelling_a_running_task_cancels_its_pending_subtasks() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let inner_ran = Rc::new(RefCell::new(false));
    let inner_promise: Rc<RefCell<Option<PromiseRef>>> = Rc::new(RefCell::new(None));

    let gate = scheduler.defer();
    let gate_promise = gate.promise.clone();
    let flag = inner_ran.clone();
    let stash = inner_promise.clone();
    let outer = scheduler.execute(flow, "outer", move |scheduler| {
        let flow = scheduler.active_flow();
        let flag = flag.clone();
        // the gate keeps the outer task unsettled, so this subtask sits
        // in its frame behind the park
        let pending_gate = scheduler.execute(flow, "gate", {
            let gate_promise = gate_promise.clone();
            move |_| Ok(Value::Promise(gate_promise))
        });
        let _ = pending_gate;
        let inner = scheduler.execute(flow, "inner", move |_| {
            *flag.borrow_mut() = true;
            Ok(Value::Null)
        });
        *stash.borrow_mut() = Some(inner);
        Ok(Value::Null)
    });
    scheduler.run_until_idle().expect("queue parks on the gate");

    scheduler.cancel(&outer, "abort");
    scheduler.run_until_idle().expect("cancellation is absorbed");

    assert!(!*inner_ran.borrow());
    let inner = inner_promise.borrow().clone().expect("inner scheduled");
    let reason = inner.borrow().rejection_reason().expect("inner cancelled");
    assert!(reason.is_cancellation());
}
