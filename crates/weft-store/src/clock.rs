use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

/// Wall-clock time derived from the tokio clock.
///
/// Timestamps are the UTC time at construction plus the monotonic time
/// elapsed since, so they follow `tokio::time::pause`/`advance` in tests and
/// never go backwards.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
  origin_utc: DateTime<Utc>,
  origin: Instant,
}

impl Clock {
  pub fn new() -> Self {
    Self::starting_at(Utc::now())
  }

  /// A clock whose current time is `origin_utc`.
  pub fn starting_at(origin_utc: DateTime<Utc>) -> Self {
    Self {
      origin_utc,
      origin: Instant::now(),
    }
  }

  pub fn now(&self) -> DateTime<Utc> {
    let elapsed = TimeDelta::from_std(self.origin.elapsed()).unwrap_or(TimeDelta::zero());
    self.origin_utc + elapsed
  }
}

impl Default for Clock {
  fn default() -> Self {
    Self::new()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;

  #[tokio::test(start_paused = true)]
  async fn test_follows_paused_time() {
    let origin = Utc::now();
    let clock = Clock::starting_at(origin);
    tokio::time::advance(Duration::from_secs(90)).await;
    assert_eq!(clock.now() - origin, TimeDelta::seconds(90));
  }
}
