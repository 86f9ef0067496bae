use std::collections::HashMap;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::Deserialize;
use weft_plugin::{
  LogLevel, Output, Plugin, PluginError, PluginInfo, Task, TaskContext, TaskError,
};

use crate::properties::{render_str, require_str, validate_present};

const TYPE: &str = "io.weft.core.http.Request";

/// Send an HTTP request and expose `code`, `headers` and `body`.
///
/// The body is parsed as JSON when possible and kept as text otherwise. A
/// response status of 400 or more fails the run unless `allowFailedStatus`
/// is set.
pub struct Request {
  info: PluginInfo,
  client: Client,
}

/// Keys used as given; everything else in the config is templated.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Options {
  #[serde(default)]
  allow_failed_status: bool,
}

impl Request {
  pub fn new() -> Self {
    Self {
      info: PluginInfo::new(TYPE, env!("CARGO_PKG_VERSION"), "HTTP request"),
      client: Client::new(),
    }
  }
}

impl Default for Request {
  fn default() -> Self {
    Self::new()
  }
}

impl Plugin for Request {
  fn info(&self) -> &PluginInfo {
    &self.info
  }

  fn validate(&self, config: &serde_json::Value) -> Result<(), PluginError> {
    validate_present(TYPE, config, "uri")?;
    Options::deserialize(config).map_err(|e| PluginError::InvalidConfig {
      type_name: TYPE.to_string(),
      message: e.to_string(),
    })?;
    if let Some(method) = config.get("method").and_then(|m| m.as_str()) {
      if !method.contains("{{") && parse_method(method).is_err() {
        return Err(PluginError::InvalidConfig {
          type_name: TYPE.to_string(),
          message: format!("unsupported HTTP method: {method}"),
        });
      }
    }
    Ok(())
  }
}

#[async_trait]
impl Task for Request {
  async fn run(
    &self,
    ctx: &dyn TaskContext,
    config: &serde_json::Value,
  ) -> Result<Output, TaskError> {
    let options = Options::deserialize(config)
      .map_err(|e| TaskError::property("allowFailedStatus", e.to_string()))?;
    let uri = require_str(ctx, config, "uri")?;
    let method = match render_str(ctx, config, "method")? {
      Some(method) => parse_method(&method)?,
      None => Method::GET,
    };

    let mut request = self.client.request(method.clone(), &uri);
    if let Some(headers) = config.get("headers") {
      let headers: HashMap<String, serde_json::Value> =
        serde_json::from_value(ctx.render_value(headers)?)
          .map_err(|e| TaskError::property("headers", e.to_string()))?;
      for (key, value) in headers {
        let value = match value {
          serde_json::Value::String(s) => s,
          other => other.to_string(),
        };
        request = request.header(key, value);
      }
    }
    if let Some(body) = config.get("body") {
      request = match ctx.render_value(body)? {
        serde_json::Value::String(text) => request.body(text),
        json => request.json(&json),
      };
    }

    ctx.log(LogLevel::Debug, &format!("{method} {uri}"));
    let response = request
      .send()
      .await
      .map_err(|e| TaskError::failed(format!("request to {uri} failed: {e}")))?;

    let status = response.status();
    let headers: serde_json::Map<String, serde_json::Value> = response
      .headers()
      .iter()
      .filter_map(|(k, v)| {
        v.to_str()
          .ok()
          .map(|val| (k.as_str().to_string(), serde_json::Value::String(val.to_string())))
      })
      .collect();
    let text = response
      .text()
      .await
      .map_err(|e| TaskError::failed(format!("reading response from {uri} failed: {e}")))?;
    let body = serde_json::from_str(&text).unwrap_or(serde_json::Value::String(text));

    if (status.is_client_error() || status.is_server_error()) && !options.allow_failed_status {
      return Err(TaskError::failed(format!("{method} {uri} returned {status}")));
    }

    let mut values = serde_json::Map::new();
    values.insert("code".to_string(), serde_json::Value::from(status.as_u16()));
    values.insert("headers".to_string(), serde_json::Value::Object(headers));
    values.insert("body".to_string(), body);
    Ok(Output::new(values))
  }
}

fn parse_method(method: &str) -> Result<Method, TaskError> {
  match method.to_uppercase().as_str() {
    "GET" => Ok(Method::GET),
    "POST" => Ok(Method::POST),
    "PUT" => Ok(Method::PUT),
    "DELETE" => Ok(Method::DELETE),
    "PATCH" => Ok(Method::PATCH),
    "HEAD" => Ok(Method::HEAD),
    "OPTIONS" => Ok(Method::OPTIONS),
    _ => Err(TaskError::property(
      "method",
      format!("unsupported HTTP method: {method}"),
    )),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_parse_method() {
    assert_eq!(parse_method("post").unwrap(), Method::POST);
    assert!(parse_method("BREW").is_err());
  }

  #[test]
  fn test_validate() {
    let plugin = Request::new();
    assert!(plugin.validate(&json!({})).is_err());
    assert!(plugin.validate(&json!({ "uri": "http://x", "method": "BREW" })).is_err());
    assert!(plugin.validate(&json!({ "uri": "http://x", "method": "{{ inputs.m }}" })).is_ok());
    assert!(plugin.validate(&json!({ "uri": "http://x", "allowFailedStatus": "yes" })).is_err());
  }

  #[test]
  fn test_options_default_to_strict_status() {
    let options = Options::deserialize(&json!({ "uri": "http://x" })).unwrap();
    assert!(!options.allow_failed_status);
    let options = Options::deserialize(&json!({ "allowFailedStatus": true })).unwrap();
    assert!(options.allow_failed_status);
  }
}
