//! Plugin instance caching.
//!
//! Factories build a fresh plugin on every registry lookup. Workers resolve
//! each type once and reuse the instance for every later run.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use weft_plugin::{Capability, PluginError, PluginRegistry};

pub struct PluginCache {
  registry: Arc<PluginRegistry>,
  cache: RwLock<HashMap<String, Capability>>,
}

impl PluginCache {
  pub fn new(registry: Arc<PluginRegistry>) -> Self {
    Self {
      registry,
      cache: RwLock::new(HashMap::new()),
    }
  }

  /// Get a plugin from cache, or resolve and cache it.
  pub fn resolve(&self, type_name: &str) -> Result<Capability, PluginError> {
    {
      let cache = self.cache.read().unwrap_or_else(|e| e.into_inner());
      if let Some(capability) = cache.get(type_name) {
        return Ok(capability.clone());
      }
    }

    let capability = self.registry.resolve(type_name)?;

    {
      let mut cache = self.cache.write().unwrap_or_else(|e| e.into_inner());
      cache.insert(type_name.to_string(), capability.clone());
    }

    Ok(capability)
  }

  pub fn len(&self) -> usize {
    self.cache.read().unwrap_or_else(|e| e.into_inner()).len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}
