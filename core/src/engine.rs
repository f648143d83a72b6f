use crate::runtime::scheduler::Scheduler;

/// Configuration for building schedulers.
#[derive(Debug, Clone, Default)]
pub struct Engine {
    realtime_timers: bool,
    long_stack_traces: bool,
}

impl Engine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Timers wait on the wall clock instead of jumping a virtual one.
    pub fn with_realtime_timers(mut self, realtime: bool) -> Self {
        self.realtime_timers = realtime;
        self
    }

    /// Capture the scheduling chain at each task-creation site; rejection
    /// reasons then carry the chain that scheduled the failing task.
    pub fn with_long_stack_traces(mut self, enabled: bool) -> Self {
        self.long_stack_traces = enabled;
        self
    }

    pub fn new_scheduler(&self) -> Scheduler {
        Scheduler::with_options(self.realtime_timers, self.long_stack_traces)
    }
}
