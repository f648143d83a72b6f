use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lockstep::{FlowError, FlowEvent, FlowId, Scheduler, Value};

type Log = Rc<RefCell<Vec<String>>>;

fn log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

#[test]
fn reset_cancels_everything_then_goes_idle() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let order = log();
    let ran = Rc::new(Cell::new(false));

    let sink = order.clone();
    scheduler.on(flow, FlowEvent::Reset, move |_, _| {
        sink.borrow_mut().push("reset".into());
    });
    let sink = order.clone();
    scheduler.on(flow, FlowEvent::Idle, move |_, _| {
        sink.borrow_mut().push("idle".into());
    });

    let flag = ran.clone();
    let doomed = scheduler.execute(flow, "never", move |_| {
        flag.set(true);
        Ok(Value::Null)
    });
    scheduler.reset(flow);
    scheduler.run_until_idle().expect("reset leaves a clean flow");

    assert!(!ran.get());
    assert_eq!(*order.borrow(), ["reset", "idle"]);
    let reason = doomed.borrow().rejection_reason().expect("task cancelled");
    assert_eq!(
        reason,
        FlowError::Cancelled {
            message: "ControlFlow was reset".into()
        }
    );
}

#[test]
fn idle_fires_exactly_once_per_busy_period() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let idles = Rc::new(Cell::new(0u32));

    let count = idles.clone();
    scheduler.on(flow, FlowEvent::Idle, move |_, _| {
        count.set(count.get() + 1);
    });
    let first = scheduler.execute(flow, "first", |_| Ok(Value::Null));
    scheduler.then(
        &first,
        Some(Box::new(|scheduler: &mut Scheduler, _| {
            let flow = scheduler.active_flow();
            scheduler.execute(flow, "consequence", |_| Ok(Value::Null));
            Ok(Value::Null)
        })),
        None,
    );
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(idles.get(), 1);
    assert_eq!(scheduler.history(), ["first", "consequence"]);
}

#[test]
fn idle_waits_for_outstanding_timers() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let order = log();

    let sink = order.clone();
    scheduler.on(flow, FlowEvent::Idle, move |_, _| {
        sink.borrow_mut().push("idle".into());
    });
    let pending = scheduler.delayed(20);
    let sink = order.clone();
    scheduler.then(
        &pending,
        Some(Box::new(move |_, _| {
            sink.borrow_mut().push("timer".into());
            Ok(Value::Null)
        })),
        None,
    );
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(*order.borrow(), ["timer", "idle"]);
}

#[test]
fn listeners_can_be_removed_and_fire_once() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let calls = Rc::new(Cell::new(0u32));

    let count = calls.clone();
    let id = scheduler.on(flow, FlowEvent::Idle, move |_, _| {
        count.set(count.get() + 1);
    });
    assert!(scheduler.off(flow, id));
    assert!(!scheduler.off(flow, id));

    let count = calls.clone();
    scheduler.once(flow, FlowEvent::Reset, move |_, _| {
        count.set(count.get() + 10);
    });
    scheduler.reset(flow);
    scheduler.reset(flow);
    scheduler.run_until_idle().expect("nothing pending");

    assert_eq!(calls.get(), 10);
}

#[test]
fn create_flow_fulfills_when_the_subflow_goes_idle() {
    let mut scheduler = Scheduler::new();
    let result = scheduler.create_flow(|scheduler, inner| {
        scheduler.execute(inner, "sub-work", |_| Ok(Value::Null));
        Ok(())
    });
    scheduler.run_until_idle().expect("subflow drains cleanly");

    assert!(scheduler.history().contains(&"sub-work".to_string()));
    assert_eq!(result.borrow().fulfilled_value(), Some(Value::Null));
}

#[test]
fn create_flow_rejects_on_the_subflow_first_uncaught_error() {
    let mut scheduler = Scheduler::new();
    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));

    let result = scheduler.create_flow(|scheduler, inner| {
        scheduler.execute(inner, "boom", |_| Err(FlowError::thrown("sub failed")));
        Ok(())
    });
    let sink = reason.clone();
    scheduler.catch(&result, move |_, error| {
        *sink.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    scheduler
        .run_until_idle()
        .expect("the subflow error is consumed by the result promise");

    let reason = reason.borrow().clone().expect("rejection observed");
    assert_eq!(reason.root_cause(), &FlowError::thrown("sub failed"));
}

#[test]
fn handlers_run_on_the_promise_owning_flow() {
    let mut scheduler = Scheduler::new();
    let main = scheduler.active_flow();
    let captured: Rc<RefCell<Option<lockstep::Deferred>>> = Rc::new(RefCell::new(None));
    let inner_id: Rc<Cell<Option<FlowId>>> = Rc::new(Cell::new(None));

    let stash = captured.clone();
    let ids = inner_id.clone();
    scheduler.create_flow(move |scheduler, inner| {
        ids.set(Some(inner));
        *stash.borrow_mut() = Some(scheduler.defer());
        Ok(())
    });
    let deferred = captured.borrow().clone().expect("deferred created");
    let inner = inner_id.get().expect("inner flow recorded");
    assert_ne!(inner, main);

    let handler_flow: Rc<Cell<Option<FlowId>>> = Rc::new(Cell::new(None));
    let seen = handler_flow.clone();
    scheduler.then(
        &deferred.promise,
        Some(Box::new(move |scheduler: &mut Scheduler, _| {
            seen.set(Some(scheduler.active_flow()));
            Ok(Value::Null)
        })),
        None,
    );
    deferred.fulfill(&mut scheduler, Value::Null);
    scheduler.run_until_idle().expect("flow should drain cleanly");

    assert_eq!(handler_flow.get(), Some(inner));
}
