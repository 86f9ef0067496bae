//! Weft Flow
//!
//! Flows are declared in YAML or JSON documents ([`FlowDocument`]) and loaded
//! into immutable [`Flow`]s by the [`FlowLoader`], which validates structure,
//! resolves every plugin type and builds one dependency [`Graph`] per branch
//! (main tasks, error handlers, listeners).
//!
//! [`Flow::next_eligible`] is the scheduling rule the executor applies after
//! every task run change: it decides which tasks start, which are skipped and
//! which fail because their condition could not be evaluated.

mod context;
mod cron;
mod document;
mod error;
mod expression;
mod flow;
mod graph;
mod loader;
mod repository;

#[cfg(test)]
mod test_support;

pub use context::{execution_variables, task_run_variables};
pub use cron::{next_fire_after, parse_cron};
pub use document::{FlowDocument, RetryBackoff, RetryPolicy, TaskDef, TriggerDef};
pub use error::{ExpressionError, FlowError};
pub use expression::Expressions;
pub use flow::{Decision, Flow, TaskNode, TriggerNode};
pub use graph::Graph;
pub use loader::{FlowLoader, is_valid_id};
pub use repository::FlowRepository;
