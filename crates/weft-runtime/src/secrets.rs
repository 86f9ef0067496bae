use std::collections::HashMap;

/// Source of secret values for `secret('NAME')` in templates.
pub trait SecretProvider: Send + Sync {
  fn get(&self, name: &str) -> Option<String>;
}

/// Reads secrets from environment variables, `WEFT_SECRET_<NAME>` by default.
#[derive(Debug, Clone)]
pub struct EnvSecretProvider {
  prefix: String,
}

impl EnvSecretProvider {
  pub fn new(prefix: impl Into<String>) -> Self {
    Self {
      prefix: prefix.into(),
    }
  }
}

impl Default for EnvSecretProvider {
  fn default() -> Self {
    Self::new("WEFT_SECRET_")
  }
}

impl SecretProvider for EnvSecretProvider {
  fn get(&self, name: &str) -> Option<String> {
    std::env::var(format!("{}{}", self.prefix, name)).ok()
  }
}

/// Fixed set of secrets.
#[derive(Debug, Clone, Default)]
pub struct MapSecretProvider {
  secrets: HashMap<String, String>,
}

impl MapSecretProvider {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.secrets.insert(name.into(), value.into());
    self
  }
}

impl SecretProvider for MapSecretProvider {
  fn get(&self, name: &str) -> Option<String> {
    self.secrets.get(name).cloned()
  }
}
