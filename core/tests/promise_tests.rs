use std::cell::RefCell;
use std::rc::Rc;

use lockstep::{FlowError, Scheduler, Value};

type Slot = Rc<RefCell<Option<Value>>>;

fn slot() -> Slot {
    Rc::new(RefCell::new(None))
}

fn capture(scheduler: &mut Scheduler, promise: &lockstep::PromiseRef, into: &Slot) {
    let into = into.clone();
    scheduler.then(
        promise,
        Some(Box::new(move |_, value: Value| {
            *into.borrow_mut() = Some(value);
            Ok(Value::Null)
        })),
        None,
    );
}

#[test]
fn fulfilled_value_reaches_handlers() {
    let mut scheduler = Scheduler::new();
    let promise = scheduler.fulfilled(Value::Number(42.0));
    let got = slot();
    capture(&mut scheduler, &promise, &got);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(*got.borrow(), Some(Value::Number(42.0)));
}

#[test]
fn chained_handlers_transform_the_value() {
    let mut scheduler = Scheduler::new();
    let promise = scheduler.fulfilled(Value::Number(1.0));
    let doubled = scheduler.then(
        &promise,
        Some(Box::new(|_, value: Value| {
            let n = value.as_number().unwrap_or(0.0);
            Ok(Value::Number((n + 1.0) * 2.0))
        })),
        None,
    );
    let got = slot();
    capture(&mut scheduler, &doubled, &got);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(*got.borrow(), Some(Value::Number(4.0)));
}

#[test]
fn catch_recovers_a_rejection() {
    let mut scheduler = Scheduler::new();
    let promise = scheduler.rejected(FlowError::thrown("boom"));
    let recovered = scheduler.catch(&promise, |_, reason| {
        Ok(Value::str(format!("caught {reason}")))
    });
    let got = slot();
    capture(&mut scheduler, &recovered, &got);
    scheduler.run_until_idle().expect("handled rejection must not escalate");

    assert_eq!(*got.borrow(), Some(Value::str("caught boom")));
}

#[test]
fn finally_runs_and_passes_the_value_through() {
    let mut scheduler = Scheduler::new();
    let ran = Rc::new(RefCell::new(false));
    let promise = scheduler.fulfilled(Value::Number(3.0));
    let flag = ran.clone();
    let after = scheduler.finally(&promise, move |_| {
        *flag.borrow_mut() = true;
        Ok(())
    });
    let got = slot();
    capture(&mut scheduler, &after, &got);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert!(*ran.borrow());
    assert_eq!(*got.borrow(), Some(Value::Number(3.0)));
}

#[test]
fn settlement_is_idempotent() {
    let mut scheduler = Scheduler::new();
    let deferred = scheduler.defer();
    deferred.fulfill(&mut scheduler, Value::Number(1.0));
    deferred.fulfill(&mut scheduler, Value::Number(2.0));
    deferred.reject(&mut scheduler, FlowError::thrown("late"));

    assert_eq!(
        deferred.promise.borrow().fulfilled_value(),
        Some(Value::Number(1.0))
    );
    scheduler.run_until_idle().expect("no rejection should survive");
}

#[test]
fn task_result_promise_is_assimilated() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let task = scheduler.execute(flow, "delayed", |scheduler| {
        Ok(Value::Promise(scheduler.delayed(5)))
    });
    let got = slot();
    capture(&mut scheduler, &task, &got);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(*got.borrow(), Some(Value::Null));
}

#[test]
fn nested_fulfilled_promises_collapse() {
    let mut scheduler = Scheduler::new();
    let inner = scheduler.fulfilled(Value::Number(7.0));
    let outer = scheduler.fulfilled(Value::Promise(inner));
    let got = slot();
    capture(&mut scheduler, &outer, &got);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(*got.borrow(), Some(Value::Number(7.0)));
}

#[test]
fn self_dependent_task_result_rejects_with_cycle_error() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let holder: Rc<RefCell<Option<lockstep::PromiseRef>>> = Rc::new(RefCell::new(None));
    let inner = holder.clone();
    let promise = scheduler.execute(flow, "selfish", move |_| {
        let own = inner.borrow().clone().expect("promise stored before drain");
        Ok(Value::Promise(own))
    });
    *holder.borrow_mut() = Some(promise.clone());

    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));
    let seen = reason.clone();
    scheduler.catch(&promise, move |_, error| {
        *seen.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    scheduler.run_until_idle().expect("cycle is caught by the handler");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert!(matches!(reason.root_cause(), FlowError::Cycle { .. }));
}

#[test]
fn fully_resolved_awaits_nested_promises() {
    let mut scheduler = Scheduler::new();
    let deferred = scheduler.defer();
    let leaf = scheduler.fulfilled(Value::str("x"));
    let tree = Value::List(vec![
        Value::Number(1.0),
        Value::Promise(deferred.promise.clone()),
        Value::Map(std::collections::BTreeMap::from([(
            "k".to_string(),
            Value::Promise(leaf),
        )])),
    ]);
    let result = scheduler.fully_resolved(tree);
    deferred.fulfill(&mut scheduler, Value::str("two"));
    scheduler
        .run_until_settled(&result)
        .expect("no rejection expected");

    let expected = Value::List(vec![
        Value::Number(1.0),
        Value::str("two"),
        Value::Map(std::collections::BTreeMap::from([(
            "k".to_string(),
            Value::str("x"),
        )])),
    ]);
    assert_eq!(result.borrow().fulfilled_value(), Some(expected));
}

#[test]
fn fully_resolved_rejects_on_any_nested_rejection() {
    let mut scheduler = Scheduler::new();
    let deferred = scheduler.defer();
    let tree = Value::List(vec![Value::Promise(deferred.promise.clone())]);
    let result = scheduler.fully_resolved(tree);

    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));
    let seen = reason.clone();
    scheduler.catch(&result, move |_, error| {
        *seen.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    deferred.reject(&mut scheduler, FlowError::thrown("bad leaf"));
    scheduler.run_until_idle().expect("handled rejection must not escalate");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert!(matches!(reason.root_cause(), FlowError::Thrown { .. }));
}

#[test]
fn flowless_handlers_run_as_raw_microtasks() {
    let mut scheduler = Scheduler::new();
    let promise = scheduler.detached(|scheduler| scheduler.fulfilled(Value::Number(5.0)));
    let got = slot();
    let into = got.clone();
    scheduler.then(
        &promise,
        Some(Box::new(move |_, value: Value| {
            *into.borrow_mut() = Some(value);
            Ok(Value::Null)
        })),
        None,
    );
    scheduler
        .run_microtasks_only()
        .expect("no escalation expected");

    assert_eq!(*got.borrow(), Some(Value::Number(5.0)));
}

#[test]
fn flowless_rejections_are_not_decorated() {
    let mut scheduler = Scheduler::new();
    let promise =
        scheduler.detached(|scheduler| scheduler.rejected(FlowError::thrown("raw")));
    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));
    let seen = reason.clone();
    scheduler.catch(&promise, move |_, error| {
        *seen.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    scheduler
        .run_microtasks_only()
        .expect("handled rejection must not escalate");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert_eq!(reason, FlowError::thrown("raw"));
}

#[test]
fn flow_owned_failures_carry_the_task_chain() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let promise = scheduler.execute(flow, "doomed", |_| Err(FlowError::thrown("boom")));
    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));
    let seen = reason.clone();
    scheduler.catch(&promise, move |_, error| {
        *seen.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    scheduler.run_until_idle().expect("handled rejection must not escalate");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert!(matches!(reason, FlowError::InTask { .. }));
    assert!(reason.to_string().contains("in task \"doomed\""));
    assert_eq!(reason.root_cause(), &FlowError::thrown("boom"));
}
