use crate::errors::FlowError;
use crate::runtime::value::Value;

/// The lifecycle of a promise.
///
/// `Blocked` is the transient state while the promise is assimilating
/// another pending promise; it settles when that promise does. Once
/// `Fulfilled` or `Rejected`, the state never changes.
#[derive(Debug, Clone)]
pub enum PromiseState {
    Pending,
    Blocked,
    Fulfilled(Value),
    Rejected(FlowError),
}

impl PromiseState {
    pub fn is_settled(&self) -> bool {
        matches!(self, PromiseState::Fulfilled(_) | PromiseState::Rejected(_))
    }
}

/// A snapshot of a settled promise, handed to reactions.
#[derive(Debug, Clone)]
pub enum Settlement {
    Fulfilled(Value),
    Rejected(FlowError),
}

impl Settlement {
    pub fn into_result(self) -> Result<Value, FlowError> {
        match self {
            Settlement::Fulfilled(value) => Ok(value),
            Settlement::Rejected(reason) => Err(reason),
        }
    }
}
