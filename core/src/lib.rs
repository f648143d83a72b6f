pub mod diagnostics;
pub mod engine;
pub mod errors;
pub mod runtime;

pub use engine::Engine;
pub use errors::FlowError;
pub use runtime::flow::{FlowEvent, FlowId, ListenerId};
pub use runtime::promise::{
    Deferred, OnFulfilled, OnRejected, OnSettled, Promise, PromiseRef, PromiseState, Settlement,
};
pub use runtime::scheduler::{Condition, Scheduler};
pub use runtime::value::Value;

/// Convenience function to run a scripted flow end-to-end: constructs a
/// scheduler with virtual timers, hands the default flow to `script`,
/// and drives the event loop until idle.
pub fn run<F>(script: F) -> Result<Scheduler, FlowError>
where
    F: FnOnce(&mut Scheduler, FlowId) -> Result<(), FlowError>,
{
    let mut scheduler = Scheduler::new();
    let flow = scheduler.active_flow();
    script(&mut scheduler, flow)?;
    scheduler.run_until_idle()?;
    Ok(scheduler)
}
