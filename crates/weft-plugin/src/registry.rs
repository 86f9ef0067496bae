use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::PluginError;
use crate::info::{Plugin, PluginInfo, is_valid_type_name};
use crate::task::{Flowable, Task};
use crate::trigger::Trigger;

/// A plugin instance tagged with the capability it provides.
#[derive(Clone)]
pub enum Capability {
  Task(Arc<dyn Task>),
  Flowable(Arc<dyn Flowable>),
  Trigger(Arc<dyn Trigger>),
}

/// Discriminant of a [`Capability`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapabilityKind {
  Task,
  Flowable,
  Trigger,
}

impl fmt::Display for CapabilityKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      CapabilityKind::Task => write!(f, "task"),
      CapabilityKind::Flowable => write!(f, "flowable"),
      CapabilityKind::Trigger => write!(f, "trigger"),
    }
  }
}

impl Capability {
  pub fn info(&self) -> &PluginInfo {
    match self {
      Capability::Task(p) => p.info(),
      Capability::Flowable(p) => p.info(),
      Capability::Trigger(p) => p.info(),
    }
  }

  pub fn kind(&self) -> CapabilityKind {
    match self {
      Capability::Task(_) => CapabilityKind::Task,
      Capability::Flowable(_) => CapabilityKind::Flowable,
      Capability::Trigger(_) => CapabilityKind::Trigger,
    }
  }

  /// Validate type-specific configuration with the underlying plugin.
  pub fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    match self {
      Capability::Task(p) => p.validate(config),
      Capability::Flowable(p) => p.validate(config),
      Capability::Trigger(p) => p.validate(config),
    }
  }
}

impl fmt::Debug for Capability {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Capability")
      .field("kind", &self.kind())
      .field("type", &self.info().type_name)
      .finish()
  }
}

/// Constructs a fresh plugin instance.
pub type PluginFactory = Arc<dyn Fn() -> Capability + Send + Sync>;

/// Maps plugin type identifiers to factories.
///
/// The registry is populated at startup and read-only afterwards; callers
/// share it behind an `Arc`.
#[derive(Default, Clone)]
pub struct PluginRegistry {
  factories: BTreeMap<String, PluginFactory>,
}

impl PluginRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a plugin factory under the type its instances report.
  pub fn register(&mut self, factory: PluginFactory) -> Result<(), PluginError> {
    let type_name = factory().info().type_name.clone();
    if !is_valid_type_name(&type_name) {
      return Err(PluginError::InvalidTypeName(type_name));
    }
    if self.factories.contains_key(&type_name) {
      return Err(PluginError::Duplicate(type_name));
    }
    self.factories.insert(type_name, factory);
    Ok(())
  }

  /// Register a plugin that is shared by every resolution.
  pub fn register_instance(&mut self, capability: Capability) -> Result<(), PluginError> {
    self.register(Arc::new(move || capability.clone()))
  }

  /// Instantiate the plugin registered under `type_name`.
  pub fn resolve(&self, type_name: &str) -> Result<Capability, PluginError> {
    self
      .factories
      .get(type_name)
      .map(|factory| factory())
      .ok_or_else(|| PluginError::NotFound(type_name.to_string()))
  }

  pub fn task(&self, type_name: &str) -> Result<Arc<dyn Task>, PluginError> {
    match self.resolve(type_name)? {
      Capability::Task(task) => Ok(task),
      other => Err(mismatch(type_name, CapabilityKind::Task, other.kind())),
    }
  }

  pub fn flowable(&self, type_name: &str) -> Result<Arc<dyn Flowable>, PluginError> {
    match self.resolve(type_name)? {
      Capability::Flowable(flowable) => Ok(flowable),
      other => Err(mismatch(type_name, CapabilityKind::Flowable, other.kind())),
    }
  }

  pub fn trigger(&self, type_name: &str) -> Result<Arc<dyn Trigger>, PluginError> {
    match self.resolve(type_name)? {
      Capability::Trigger(trigger) => Ok(trigger),
      other => Err(mismatch(type_name, CapabilityKind::Trigger, other.kind())),
    }
  }

  /// Registered type identifiers, sorted.
  pub fn types(&self) -> impl Iterator<Item = &str> {
    self.factories.keys().map(String::as_str)
  }

  pub fn contains(&self, type_name: &str) -> bool {
    self.factories.contains_key(type_name)
  }
}

impl fmt::Debug for PluginRegistry {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PluginRegistry")
      .field("types", &self.factories.keys().collect::<Vec<_>>())
      .finish()
  }
}

fn mismatch(type_name: &str, expected: CapabilityKind, actual: CapabilityKind) -> PluginError {
  PluginError::CapabilityMismatch {
    type_name: type_name.to_string(),
    expected: expected.to_string(),
    actual: actual.to_string(),
  }
}
