//! Weft Core Plugins
//!
//! The plugins every engine ships with:
//!
//! | Type | Capability |
//! |---|---|
//! | `io.weft.core.log.Log` | task |
//! | `io.weft.core.debug.Return` | task |
//! | `io.weft.core.output.OutputValues` | task |
//! | `io.weft.core.execution.Fail` | task |
//! | `io.weft.core.flow.Sleep` | task |
//! | `io.weft.core.storage.Write` | task |
//! | `io.weft.core.http.Request` | task |
//! | `io.weft.core.flow.Subflow` | flowable |
//! | `io.weft.core.trigger.Schedule` | trigger |

mod fail;
mod http;
mod log;
mod output;
mod properties;
mod schedule;
mod sleep;
mod storage;
mod subflow;

#[cfg(test)]
mod test_support;

use std::sync::Arc;

use weft_plugin::{Capability, PluginError, PluginRegistry};

pub use fail::Fail;
pub use http::Request;
pub use log::Log;
pub use output::{OutputValues, Return};
pub use schedule::Schedule;
pub use sleep::Sleep;
pub use storage::Write;
pub use subflow::Subflow;

/// Register every core plugin.
pub fn register_all(registry: &mut PluginRegistry) -> Result<(), PluginError> {
  registry.register(Arc::new(|| Capability::Task(Arc::new(Log::new()))))?;
  registry.register(Arc::new(|| Capability::Task(Arc::new(Return::new()))))?;
  registry.register(Arc::new(|| Capability::Task(Arc::new(OutputValues::new()))))?;
  registry.register(Arc::new(|| Capability::Task(Arc::new(Fail::new()))))?;
  registry.register(Arc::new(|| Capability::Task(Arc::new(Sleep::new()))))?;
  registry.register(Arc::new(|| Capability::Task(Arc::new(Write::new()))))?;
  registry.register_instance(Capability::Task(Arc::new(Request::new())))?;
  registry.register(Arc::new(|| Capability::Flowable(Arc::new(Subflow::new()))))?;
  registry.register(Arc::new(|| Capability::Trigger(Arc::new(Schedule::new()))))?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_register_all() {
    let mut registry = PluginRegistry::new();
    register_all(&mut registry).unwrap();

    assert!(registry.task("io.weft.core.log.Log").is_ok());
    assert!(registry.flowable("io.weft.core.flow.Subflow").is_ok());
    assert!(registry.trigger("io.weft.core.trigger.Schedule").is_ok());
    assert_eq!(registry.types().count(), 9);
  }

  #[test]
  fn test_register_twice_fails() {
    let mut registry = PluginRegistry::new();
    register_all(&mut registry).unwrap();
    assert!(matches!(
      register_all(&mut registry),
      Err(PluginError::Duplicate(_))
    ));
  }
}
