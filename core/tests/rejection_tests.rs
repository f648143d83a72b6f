use std::cell::{Cell, RefCell};
use std::rc::Rc;

use lockstep::{Engine, FlowError, FlowEvent, Scheduler, Value};

#[test]
fn unhandled_rejection_reaches_the_uncaught_listener() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let seen: Rc<RefCell<Vec<String>>> = Rc::new(RefCell::new(Vec::new()));

    let sink = seen.clone();
    scheduler.on(flow, FlowEvent::UncaughtException, move |_, error| {
        if let Some(error) = error {
            sink.borrow_mut().push(error.to_string());
        }
    });
    scheduler.execute(flow, "fail", |_| Err(FlowError::thrown("boom")));
    scheduler
        .run_until_idle()
        .expect("a listener consumes the error");

    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].contains("boom"));
    assert!(seen[0].contains("in task \"fail\""));
}

#[test]
fn unhandled_rejection_with_no_listener_surfaces_from_the_driver() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    scheduler.execute(flow, "fail", |_| Err(FlowError::thrown("boom")));

    let error = scheduler
        .run_until_idle()
        .expect_err("nothing consumes the failure");
    assert_eq!(error.root_cause(), &FlowError::thrown("boom"));
}

#[test]
fn attaching_a_handler_in_time_suppresses_the_report() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let uncaught = Rc::new(Cell::new(0u32));

    let count = uncaught.clone();
    scheduler.on(flow, FlowEvent::UncaughtException, move |_, _| {
        count.set(count.get() + 1);
    });
    let failing = scheduler.execute(flow, "fail", |_| Err(FlowError::thrown("boom")));
    scheduler.catch(&failing, |_, _| Ok(Value::Null));
    scheduler.run_until_idle().expect("handled by the catch");

    assert_eq!(uncaught.get(), 0);
}

#[test]
fn unhandled_failure_discards_the_rest_of_the_queue() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let ran = Rc::new(Cell::new(false));

    scheduler.execute(flow, "fail", |_| Err(FlowError::thrown("boom")));
    let flag = ran.clone();
    let sibling = scheduler.execute(flow, "b", move |_| {
        flag.set(true);
        Ok(Value::Null)
    });
    let error = scheduler
        .run_until_idle()
        .expect_err("nothing consumes the failure");

    assert!(!ran.get());
    assert_eq!(error.root_cause(), &FlowError::thrown("boom"));
    let reason = sibling
        .borrow()
        .rejection_reason()
        .expect("sibling is discarded");
    assert!(matches!(reason, FlowError::Discarded { .. }));
}

#[test]
fn simultaneous_unhandled_rejections_coalesce() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let seen: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));

    let sink = seen.clone();
    scheduler.on(flow, FlowEvent::UncaughtException, move |_, error| {
        *sink.borrow_mut() = error.cloned();
    });
    let first = scheduler.defer();
    let second = scheduler.defer();
    first.reject(&mut scheduler, FlowError::thrown("one"));
    second.reject(&mut scheduler, FlowError::thrown("two"));
    scheduler
        .run_microtasks_only()
        .expect("a listener consumes the error");

    let seen = seen.borrow().clone().expect("uncaught emitted");
    match seen {
        FlowError::MultipleUnhandled { errors } => {
            assert_eq!(
                errors,
                vec![FlowError::thrown("one"), FlowError::thrown("two")]
            );
        }
        other => panic!("expected a coalesced rejection, got {other}"),
    }
}

#[test]
fn handlers_inside_a_discarded_frame_never_observe_the_failure() {
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    let observed = Rc::new(Cell::new(false));

    let flag = observed.clone();
    let outer = scheduler.execute(flow, "outer", move |scheduler| {
        let flow = scheduler.active_flow();
        let inner = scheduler.execute(flow, "inner", |_| Ok(Value::Null));
        let flag = flag.clone();
        scheduler.catch(&inner, move |_, _| {
            flag.set(true);
            Ok(Value::Null)
        });
        Err(FlowError::thrown("outer failed"))
    });
    scheduler.catch(&outer, |_, _| Ok(Value::Null));
    scheduler.run_until_idle().expect("outer failure is handled");

    assert!(!observed.get());
}

#[test]
fn long_stack_traces_record_the_scheduling_chain() {
    let mut scheduler = Engine::new().with_long_stack_traces(true).new_scheduler();
    let flow = scheduler.active_flow();
    let reason: Rc<RefCell<Option<FlowError>>> = Rc::new(RefCell::new(None));

    let promise = scheduler.execute(flow, "parent", |scheduler| {
        let flow = scheduler.active_flow();
        let child = scheduler.execute(flow, "child", |_| Err(FlowError::thrown("deep")));
        Ok(Value::Promise(child))
    });
    let sink = reason.clone();
    scheduler.catch(&promise, move |_, error| {
        *sink.borrow_mut() = Some(error);
        Ok(Value::Null)
    });
    scheduler.run_until_idle().expect("failure is handled");

    let reason = reason.borrow().clone().expect("rejection observed");
    let rendered = reason.to_string();
    assert!(rendered.contains("in task \"child\""));
    assert!(rendered.contains("scheduled at:"));
    assert!(rendered.contains("at task \"parent\""));
}
