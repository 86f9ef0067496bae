use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Exclusive, expiring ownership of a key.
///
/// `token` increases every time ownership changes hands, so a holder can
/// fence its writes against a successor that took over after expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
  pub key: String,
  pub owner: String,
  pub token: u64,
  pub expires_at: DateTime<Utc>,
}

impl Lease {
  pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
    self.expires_at <= now
  }
}
