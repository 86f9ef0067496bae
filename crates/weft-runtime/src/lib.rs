//! Weft Runtime
//!
//! A [`RunContext`] is the environment one task-run attempt executes in. It
//! is built by the worker from the shared [`Runtime`] services and the
//! attempt's [`RunScope`], handed to the plugin as a
//! [`weft_plugin::TaskContext`], and consumed by [`RunContext::close`] on every
//! exit path.

mod context;
mod runtime;
mod secrets;

pub use context::{LogLine, RunContext, RunSummary};
pub use runtime::{RunScope, Runtime};
pub use secrets::{EnvSecretProvider, MapSecretProvider, SecretProvider};
