//! Weft Scheduler
//!
//! Every tick the scheduler walks the triggers of the latest revision of
//! each flow. A trigger is evaluated only by the instance holding its lease.
//! A positive evaluation is written to the trigger's state, together with the
//! message it is about to publish, before the message goes out; a crash in
//! between is repaired by republishing the pending message on the next tick.

mod config;
mod error;
mod scheduler;

pub use config::SchedulerConfig;
pub use error::SchedulerError;
pub use scheduler::Scheduler;
