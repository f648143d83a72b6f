mod state;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::errors::FlowError;
use crate::runtime::flow::{FlowId, QueueId, TaskId};
use crate::runtime::scheduler::Scheduler;
use crate::runtime::value::Value;

pub use state::{PromiseState, Settlement};

pub type PromiseRef = Rc<RefCell<Promise>>;

/// Fulfillment handler: receives the settled value, produces the chained
/// promise's outcome.
pub type OnFulfilled = Box<dyn FnOnce(&mut Scheduler, Value) -> Result<Value, FlowError>>;

/// Rejection handler: receives the rejection reason, may recover.
pub type OnRejected = Box<dyn FnOnce(&mut Scheduler, FlowError) -> Result<Value, FlowError>>;

/// Finally handler: runs on either outcome; an error replaces the
/// settlement, otherwise it passes through.
pub type OnSettled = Box<dyn FnOnce(&mut Scheduler) -> Result<(), FlowError>>;

pub(crate) type Observer = Box<dyn FnOnce(&mut Scheduler, Settlement)>;

/// A reaction registered on a promise, fired once when it settles.
///
/// `Then` and `Finally` carry user handlers and are only stored here for
/// promises with no owning flow (flow-owned promises schedule their
/// handlers as tasks instead). The other variants are internal plumbing.
pub(crate) enum Reaction {
    Then {
        on_fulfilled: Option<OnFulfilled>,
        on_rejected: Option<OnRejected>,
        child: PromiseRef,
    },
    Finally {
        body: OnSettled,
        child: PromiseRef,
    },
    /// Resolve `target` with this promise's settlement, annotating a
    /// rejection with `context` when present.
    Assimilate {
        target: PromiseRef,
        context: Option<String>,
    },
    /// Wake a queue parked on this promise.
    KickQueue { flow: FlowId, queue: QueueId },
    /// Internal settlement observer (join bookkeeping, timer cleanup).
    Observe { observer: Observer },
}

impl fmt::Debug for Reaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reaction::Then { .. } => write!(f, "Reaction::Then {{ .. }}"),
            Reaction::Finally { .. } => write!(f, "Reaction::Finally {{ .. }}"),
            Reaction::Assimilate { .. } => write!(f, "Reaction::Assimilate {{ .. }}"),
            Reaction::KickQueue { flow, queue } => {
                write!(f, "Reaction::KickQueue {{ {flow:?}, {queue:?} }}")
            }
            Reaction::Observe { .. } => write!(f, "Reaction::Observe {{ .. }}"),
        }
    }
}

/// A promise cell. Shared as `Rc<RefCell<Promise>>`; all operations that
/// need scheduling context live on [`Scheduler`].
#[derive(Debug)]
pub struct Promise {
    pub(crate) state: PromiseState,
    pub(crate) reactions: Vec<Reaction>,
    /// The flow that was active when this promise was created. Handlers
    /// are scheduled on it; `None` means raw-microtask handlers and
    /// undecorated rejections.
    pub(crate) flow: Option<FlowId>,
    /// Set once any handler is attached or the settlement is otherwise
    /// consumed; suppresses the unhandled-rejection report.
    pub(crate) handled: bool,
    /// Present when this promise is a task's result.
    pub(crate) task: Option<(FlowId, TaskId)>,
    /// The queue the owning task was scheduled on, kept past task
    /// completion so an unhandled rejection can abort the right queue.
    pub(crate) origin_queue: Option<(FlowId, QueueId)>,
    /// While `Blocked`: the promise being assimilated, for cycle checks.
    pub(crate) blocked_on: Option<PromiseRef>,
}

impl Promise {
    pub(crate) fn pending(flow: Option<FlowId>) -> PromiseRef {
        Rc::new(RefCell::new(Promise {
            state: PromiseState::Pending,
            reactions: Vec::new(),
            flow,
            handled: false,
            task: None,
            origin_queue: None,
            blocked_on: None,
        }))
    }

    /// True until the promise is fulfilled or rejected (a `Blocked`
    /// promise is still pending from the outside).
    pub fn is_pending(&self) -> bool {
        !self.state.is_settled()
    }

    pub fn settlement(&self) -> Option<Settlement> {
        match &self.state {
            PromiseState::Fulfilled(value) => Some(Settlement::Fulfilled(value.clone())),
            PromiseState::Rejected(reason) => Some(Settlement::Rejected(reason.clone())),
            _ => None,
        }
    }

    pub fn fulfilled_value(&self) -> Option<Value> {
        match &self.state {
            PromiseState::Fulfilled(value) => Some(value.clone()),
            _ => None,
        }
    }

    pub fn rejection_reason(&self) -> Option<FlowError> {
        match &self.state {
            PromiseState::Rejected(reason) => Some(reason.clone()),
            _ => None,
        }
    }
}

/// A resolver handle: a promise plus one-shot fulfill/reject.
///
/// The second settlement call is a silent no-op, matching the one-shot
/// discipline of promise capabilities.
#[derive(Debug, Clone)]
pub struct Deferred {
    pub promise: PromiseRef,
}

impl Deferred {
    pub fn fulfill(&self, scheduler: &mut Scheduler, value: Value) {
        scheduler.resolve_promise(&self.promise, value);
    }

    pub fn reject(&self, scheduler: &mut Scheduler, reason: FlowError) {
        scheduler.reject_promise(&self.promise, reason);
    }
}
