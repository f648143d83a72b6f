mod schedule_trace;

pub use schedule_trace::{ScheduleSite, ScheduleTrace};
