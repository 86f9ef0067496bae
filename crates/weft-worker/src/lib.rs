//! Weft Worker
//!
//! Workers compete for `TaskRunStart` messages. For each one the worker:
//!
//! 1. claims the attempt with a lease so no other worker runs it,
//! 2. reports `TaskRunStarted`,
//! 3. runs the plugin inside a fresh [`weft_runtime::RunContext`], honoring the
//!    timeout and cancellation and publishing heartbeats meanwhile,
//! 4. closes the context and reports `TaskRunEnded`.
//!
//! Flowable tasks are not run inline: the worker publishes `SpawnSubflow` and
//! the executor completes the task when the child execution resolves.

mod cache;
mod config;
mod error;
mod trigger;
mod worker;

pub use cache::PluginCache;
pub use config::WorkerConfig;
pub use error::WorkerError;
pub use trigger::TriggerRunner;
pub use worker::{JOBS_GROUP, Worker};
