//! Weft Executor
//!
//! The executor is the single writer of [`weft_store::Execution`] state. It
//! consumes the executor topic (creation requests, task run reports, kill,
//! pause and resume requests, subflow requests) plus dead letters, and
//! for each message:
//!
//! 1. takes the execution's lease so no other instance interleaves,
//! 2. applies the message through the pure [`Machine`],
//! 3. saves the execution together with the messages it produced,
//! 4. publishes those messages and clears them from the saved copy.
//!
//! A periodic scan fails orphaned task runs, requeues attempts nobody
//! started and finishes kills whose grace period elapsed.

mod config;
mod error;
mod executor;
mod machine;

#[cfg(test)]
mod test_support;

pub use config::ExecutorConfig;
pub use error::ExecutorError;
pub use executor::{EXECUTOR_GROUP, Executor};
pub use machine::{Machine, ScanLimits, needs_scan};
