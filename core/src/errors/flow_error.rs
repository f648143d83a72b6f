use miette::Diagnostic;
use thiserror::Error;

use crate::runtime::value::Value;

/// The rejection reason carried by promises and the error type surfaced by
/// the scheduler's drivers.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum FlowError {
    /// A task or promise was cancelled before it could settle normally.
    #[error("CancellationError: {message}")]
    Cancelled { message: String },

    /// A task was dropped because its containing frame was abandoned after
    /// a failure. Absorbed by the scheduler unless a handler observes it.
    #[error("DiscardedTaskError: {message}")]
    Discarded { message: String },

    /// Two or more rejections went unhandled within the same microtask
    /// turn. `errors` preserves insertion order.
    #[error("MultipleUnhandledRejectionError: {} unhandled rejection(s)", .errors.len())]
    #[diagnostic(help("attach a rejection handler to each promise, or listen for uncaughtException"))]
    MultipleUnhandled { errors: Vec<FlowError> },

    /// A wait condition did not become truthy before its deadline.
    #[error("TimeoutError: {message}")]
    Timeout { message: String },

    /// A promise was resolved with a value that ultimately depends on the
    /// promise itself.
    #[error("CycleError: {message}")]
    #[diagnostic(help("a promise cannot wait on its own settlement"))]
    Cycle { message: String },

    /// A user task body or handler failed with an arbitrary value.
    #[error("{value}")]
    Thrown { value: Value },

    /// A rejection annotated with the task chain it escaped from.
    #[error("{source}\n    in {context}")]
    InTask {
        context: String,
        #[source]
        source: Box<FlowError>,
    },
}

impl FlowError {
    pub fn cancelled(message: impl Into<String>) -> FlowError {
        FlowError::Cancelled {
            message: message.into(),
        }
    }

    pub fn thrown(value: impl Into<Value>) -> FlowError {
        FlowError::Thrown {
            value: value.into(),
        }
    }

    /// Strips task-chain annotations, yielding the underlying failure.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::InTask { source, .. } => source.root_cause(),
            other => other,
        }
    }

    pub fn is_cancellation(&self) -> bool {
        matches!(self.root_cause(), FlowError::Cancelled { .. })
    }
}
