//! Template rendering and expression evaluation with minijinja.
//!
//! Task configuration strings are templates rendered against the execution's
//! variable scope:
//!
//! ```yaml
//! message: "Hello {{ inputs.name | title }}, a returned {{ outputs.a.x }}"
//! ```
//!
//! A string that is exactly one `{{ ... }}` block keeps the type of the
//! expression, so `"{{ outputs.a.items }}"` renders to a list, not its text.
//! Conditions and `forEach` are bare expressions (`outputs.a.x > 0`).

use minijinja::Environment;

use crate::error::ExpressionError;

/// Shared minijinja environment.
#[derive(Clone)]
pub struct Expressions {
  env: Environment<'static>,
}

impl Expressions {
  pub fn new() -> Self {
    Self {
      env: Environment::new(),
    }
  }

  /// Access the environment to register functions or filters.
  pub fn environment_mut(&mut self) -> &mut Environment<'static> {
    &mut self.env
  }

  /// Render a template to a string.
  pub fn render_str(
    &self,
    template: &str,
    vars: &serde_json::Value,
  ) -> Result<String, ExpressionError> {
    if !is_template(template) {
      return Ok(template.to_string());
    }
    self
      .env
      .render_str(template, minijinja::Value::from_serialize(vars))
      .map_err(|e| ExpressionError::Render {
        template: template.to_string(),
        message: describe(&e),
      })
  }

  /// Render every string inside `value`.
  pub fn render_value(
    &self,
    value: &serde_json::Value,
    vars: &serde_json::Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    match value {
      serde_json::Value::String(s) => match sole_expression(s) {
        Some(expression) => self.evaluate(expression, vars),
        None => self.render_str(s, vars).map(serde_json::Value::String),
      },
      serde_json::Value::Array(items) => items
        .iter()
        .map(|item| self.render_value(item, vars))
        .collect::<Result<Vec<_>, _>>()
        .map(serde_json::Value::Array),
      serde_json::Value::Object(map) => map
        .iter()
        .map(|(k, v)| Ok((k.clone(), self.render_value(v, vars)?)))
        .collect::<Result<serde_json::Map<_, _>, _>>()
        .map(serde_json::Value::Object),
      other => Ok(other.clone()),
    }
  }

  /// Evaluate an expression to a JSON value.
  pub fn evaluate(
    &self,
    expression: &str,
    vars: &serde_json::Value,
  ) -> Result<serde_json::Value, ExpressionError> {
    let expression = sole_expression(expression).unwrap_or(expression);
    let rendered = self
      .env
      .render_str(
        &format!("{{{{ ({expression}) | tojson }}}}"),
        minijinja::Value::from_serialize(vars),
      )
      .map_err(|e| evaluate_error(expression, &e))?;
    serde_json::from_str(&rendered).map_err(|e| ExpressionError::Evaluate {
      expression: expression.to_string(),
      message: e.to_string(),
    })
  }

  /// Evaluate an expression for its truthiness.
  pub fn evaluate_bool(
    &self,
    expression: &str,
    vars: &serde_json::Value,
  ) -> Result<bool, ExpressionError> {
    let expression = sole_expression(expression).unwrap_or(expression);
    self
      .env
      .render_str(
        &format!("{{% if ({expression}) %}}1{{% endif %}}"),
        minijinja::Value::from_serialize(vars),
      )
      .map(|rendered| rendered == "1")
      .map_err(|e| evaluate_error(expression, &e))
  }

  /// Evaluate an expression that must produce a list.
  pub fn evaluate_list(
    &self,
    expression: &str,
    vars: &serde_json::Value,
  ) -> Result<Vec<serde_json::Value>, ExpressionError> {
    match self.evaluate(expression, vars)? {
      serde_json::Value::Array(items) => Ok(items),
      other => Err(ExpressionError::NotAList {
        expression: expression.to_string(),
        actual: kind_of(&other).to_string(),
      }),
    }
  }

  /// Syntax-check an expression without evaluating it.
  pub fn check(&self, expression: &str) -> Result<(), String> {
    let expression = sole_expression(expression).unwrap_or(expression);
    Environment::new()
      .compile_expression(expression)
      .map(|_| ())
      .map_err(|e| describe(&e))
  }

  /// Syntax-check every template string inside `value`.
  pub fn check_templates(&self, value: &serde_json::Value) -> Result<(), String> {
    match value {
      serde_json::Value::String(s) if is_template(s) => Environment::new()
        .template_from_str(s)
        .map(|_| ())
        .map_err(|e| describe(&e)),
      serde_json::Value::Array(items) => items.iter().try_for_each(|v| self.check_templates(v)),
      serde_json::Value::Object(map) => map.values().try_for_each(|v| self.check_templates(v)),
      _ => Ok(()),
    }
  }
}

impl Default for Expressions {
  fn default() -> Self {
    Self::new()
  }
}

fn is_template(s: &str) -> bool {
  s.contains("{{") || s.contains("{%") || s.contains("{#")
}

/// The inner expression of a string that is exactly one `{{ ... }}` block.
fn sole_expression(s: &str) -> Option<&str> {
  let inner = s.trim().strip_prefix("{{")?.strip_suffix("}}")?;
  if inner.contains("{{") || inner.contains("}}") {
    return None;
  }
  Some(inner.trim())
}

fn describe(err: &minijinja::Error) -> String {
  match err.detail() {
    Some(detail) => format!("{}: {detail}", err.kind()),
    None => err.kind().to_string(),
  }
}

fn evaluate_error(expression: &str, err: &minijinja::Error) -> ExpressionError {
  ExpressionError::Evaluate {
    expression: expression.to_string(),
    message: describe(err),
  }
}

fn kind_of(value: &serde_json::Value) -> &'static str {
  match value {
    serde_json::Value::Null => "null",
    serde_json::Value::Bool(_) => "boolean",
    serde_json::Value::Number(_) => "number",
    serde_json::Value::String(_) => "string",
    serde_json::Value::Array(_) => "list",
    serde_json::Value::Object(_) => "object",
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  fn vars() -> serde_json::Value {
    json!({
      "inputs": { "name": "john doe" },
      "outputs": { "a": { "x": 1, "items": ["p", "q"] } },
    })
  }

  #[test]
  fn test_render_str_with_filters() {
    let exprs = Expressions::new();
    let rendered = exprs
      .render_str("Hello {{ inputs.name | title }}!", &vars())
      .unwrap();
    assert_eq!(rendered, "Hello John Doe!");
  }

  #[test]
  fn test_render_literal_untouched() {
    let exprs = Expressions::new();
    assert_eq!(exprs.render_str("plain text", &vars()).unwrap(), "plain text");
  }

  #[test]
  fn test_render_value_keeps_types() {
    let exprs = Expressions::new();
    let rendered = exprs
      .render_value(
        &json!({
          "count": "{{ outputs.a.x + 1 }}",
          "items": "{{ outputs.a.items }}",
          "text": "x={{ outputs.a.x }}",
          "nested": [{ "flag": true, "name": "{{ inputs.name }}" }],
        }),
        &vars(),
      )
      .unwrap();

    assert_eq!(rendered["count"], 2);
    assert_eq!(rendered["items"], json!(["p", "q"]));
    assert_eq!(rendered["text"], "x=1");
    assert_eq!(rendered["nested"][0], json!({ "flag": true, "name": "john doe" }));
  }

  #[test]
  fn test_evaluate_bool() {
    let exprs = Expressions::new();
    assert!(exprs.evaluate_bool("outputs.a.x > 0", &vars()).unwrap());
    assert!(!exprs.evaluate_bool("outputs.a.x == 2", &vars()).unwrap());
    assert!(exprs.evaluate_bool("{{ outputs.a.items }}", &vars()).unwrap());
  }

  #[test]
  fn test_evaluate_list() {
    let exprs = Expressions::new();
    assert_eq!(
      exprs.evaluate_list("outputs.a.items", &vars()).unwrap(),
      vec![json!("p"), json!("q")]
    );
    assert_eq!(
      exprs.evaluate_list("[1, 2, 3]", &vars()).unwrap(),
      vec![json!(1), json!(2), json!(3)]
    );
    assert!(matches!(
      exprs.evaluate_list("outputs.a.x", &vars()),
      Err(ExpressionError::NotAList { .. })
    ));
  }

  #[test]
  fn test_render_error() {
    let exprs = Expressions::new();
    assert!(matches!(
      exprs.render_str("{{ inputs.name | nosuchfilter }}", &vars()),
      Err(ExpressionError::Render { .. })
    ));
  }

  #[test]
  fn test_check_syntax() {
    let exprs = Expressions::new();
    assert!(exprs.check("outputs.a.x > 0").is_ok());
    assert!(exprs.check("outputs.a.x >").is_err());
    assert!(exprs.check_templates(&json!({ "m": "{{ a }}" })).is_ok());
    assert!(exprs.check_templates(&json!({ "m": ["{{ a "] })).is_err());
  }

  #[test]
  fn test_custom_function() {
    let mut exprs = Expressions::new();
    exprs
      .environment_mut()
      .add_function("double", |x: i64| x * 2);
    assert_eq!(exprs.evaluate("double(outputs.a.x)", &vars()).unwrap(), 2);
  }
}
