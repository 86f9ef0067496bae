use chrono::{DateTime, Utc};
use croner::Cron;

/// Parse a cron expression. Five-field expressions get a leading seconds
/// field of `0`.
pub fn parse_cron(expression: &str) -> Result<Cron, String> {
  let trimmed = expression.trim();
  let normalized = match trimmed.split_whitespace().count() {
    5 => format!("0 {trimmed}"),
    6 => trimmed.to_string(),
    n => return Err(format!("expected 5 or 6 fields, got {n}")),
  };
  normalized.parse::<Cron>().map_err(|e| e.to_string())
}

/// First occurrence strictly after `after`.
pub fn next_fire_after(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
  cron.iter_after(after).next()
}
