//! Injectable time source.
//!
//! Every freshness decision in both tiers reads time through a [`Clock`] so
//! that expiration can be tested without sleeping.

use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub trait Clock: Send + Sync {
  fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
  fn now(&self) -> DateTime<Utc> {
    Utc::now()
  }
}

/// A clock that only moves when told to.
#[derive(Debug, Clone)]
pub struct ManualClock {
  now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
  pub fn new(start: DateTime<Utc>) -> Self {
    Self {
      now: Arc::new(Mutex::new(start)),
    }
  }

  /// Start at the Unix epoch, handy for "t = 0" style tests.
  pub fn at_epoch() -> Self {
    Self::new(DateTime::<Utc>::default())
  }

  pub fn advance(&self, by: Duration) {
    let mut now = self.now.lock().unwrap_or_else(|e| e.into_inner());
    *now += by;
  }

  pub fn advance_ms(&self, ms: i64) {
    self.advance(Duration::milliseconds(ms));
  }
}

impl Clock for ManualClock {
  fn now(&self) -> DateTime<Utc> {
    *self.now.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// True while `now - stored_at < max_age`.
///
/// A timestamp in the future (clock skew) counts as fresh.
pub fn is_within(stored_at: DateTime<Utc>, now: DateTime<Utc>, max_age: std::time::Duration) -> bool {
  match (now - stored_at).to_std() {
    Ok(age) => age < max_age,
    Err(_) => true,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration as StdDuration;

  #[test]
  fn test_manual_clock_advances() {
    let clock = ManualClock::at_epoch();
    clock.advance_ms(1500);
    assert_eq!(clock.now().timestamp_millis(), 1500);
  }

  #[test]
  fn test_is_within_boundaries() {
    let t0 = DateTime::<Utc>::default();
    let max_age = StdDuration::from_millis(1000);

    assert!(is_within(t0, t0 + Duration::milliseconds(999), max_age));
    assert!(!is_within(t0, t0 + Duration::milliseconds(1000), max_age));
    assert!(!is_within(t0, t0 + Duration::milliseconds(1001), max_age));
    assert!(is_within(t0 + Duration::seconds(5), t0, max_age));
  }
}
