//! Weft Plugin
//!
//! This crate defines the contract between the engine and the code that does
//! the actual work. Every task and trigger declared in a flow document names a
//! plugin by a dotted type identifier (e.g. `io.weft.core.log.Log`); the
//! [`PluginRegistry`] maps those identifiers to implementations.
//!
//! Plugins are flattened into three capabilities:
//! - [`Task`] runs inline on a worker and produces an [`Output`]
//! - [`Flowable`] delegates to a child execution described by a [`SubflowSpec`]
//! - [`Trigger`] decides when a flow should start
//!
//! Shared identity lives in the embedded [`PluginInfo`] rather than in a type
//! hierarchy.

mod context;
mod error;
mod info;
mod registry;
mod task;
mod trigger;

pub use context::{LogLevel, TaskContext};
pub use error::{PluginError, TaskError, TriggerError};
pub use info::{Plugin, PluginInfo, is_valid_type_name};
pub use registry::{Capability, CapabilityKind, PluginFactory, PluginRegistry};
pub use task::{Flowable, Output, SubflowSpec, Task};
pub use trigger::{Trigger, TriggerPolicy, TriggerRequest, TriggerSeed};
