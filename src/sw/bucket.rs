//! A single versioned bucket with its expiration policy and response filter.

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::storage::{BucketStorage, StoredResponse};
use crate::clock::{is_within, Clock};
use crate::net::{Fingerprint, Response};

/// Count and age bounds applied whenever the bucket is written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExpirationPolicy {
  pub max_entries: Option<usize>,
  pub max_age: Option<Duration>,
}

impl ExpirationPolicy {
  pub fn new(max_entries: usize, max_age: Duration) -> Self {
    Self {
      max_entries: Some(max_entries),
      max_age: Some(max_age),
    }
  }

  /// No bounds at all (precache buckets).
  pub fn unbounded() -> Self {
    Self::default()
  }
}

/// Allow-list of statuses eligible for storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheableResponseFilter {
  statuses: Vec<u16>,
}

impl CacheableResponseFilter {
  pub fn new(statuses: impl Into<Vec<u16>>) -> Self {
    Self {
      statuses: statuses.into(),
    }
  }

  pub fn allows(&self, status: u16) -> bool {
    self.statuses.contains(&status)
  }
}

impl Default for CacheableResponseFilter {
  fn default() -> Self {
    Self::new([200])
  }
}

/// Handle on one named bucket in a [`BucketStorage`].
///
/// Reads are validated lazily: expired entries stay on disk until the next
/// write to this bucket purges them.
pub struct CacheBucket<S: BucketStorage> {
  name: String,
  policy: ExpirationPolicy,
  filter: CacheableResponseFilter,
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
}

impl<S: BucketStorage> CacheBucket<S> {
  pub fn new(
    name: impl Into<String>,
    policy: ExpirationPolicy,
    filter: CacheableResponseFilter,
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
  ) -> Self {
    Self {
      name: name.into(),
      policy,
      filter,
      storage,
      clock,
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn policy(&self) -> ExpirationPolicy {
    self.policy
  }

  pub fn filter(&self) -> &CacheableResponseFilter {
    &self.filter
  }

  /// Return the entry only if its status is allowed and it has not expired.
  ///
  /// Storage failures are logged and treated as a miss.
  pub fn match_valid(&self, key: &Fingerprint) -> Option<StoredResponse> {
    let entry = match self.storage.get(&self.name, key.as_str()) {
      Ok(entry) => entry?,
      Err(e) => {
        warn!(bucket = %self.name, %key, error = %e, "bucket read failed, treating as miss");
        return None;
      }
    };

    if !self.filter.allows(entry.response.status) {
      return None;
    }
    if let Some(max_age) = self.policy.max_age {
      if !is_within(entry.stored_at, self.clock.now(), max_age) {
        debug!(bucket = %self.name, %key, "entry expired");
        return None;
      }
    }
    Some(entry)
  }

  /// Store a response if the filter allows it, then enforce the policy.
  ///
  /// Returns whether the response was stored. Storage failures are logged
  /// and reported as not stored.
  pub fn store(&self, key: &Fingerprint, response: &Response) -> bool {
    if !self.filter.allows(response.status) {
      debug!(bucket = %self.name, %key, status = response.status, "status not cacheable");
      return false;
    }

    let now = self.clock.now();
    let entry = StoredResponse {
      response: response.clone(),
      stored_at: now,
    };
    if let Err(e) = self.storage.put(&self.name, key.as_str(), &entry) {
      warn!(bucket = %self.name, %key, error = %e, "bucket write failed");
      return false;
    }

    if let Err(e) = self.enforce_policy(now) {
      warn!(bucket = %self.name, error = %e, "expiration pass failed");
    }
    true
  }

  fn enforce_policy(&self, now: chrono::DateTime<Utc>) -> color_eyre::Result<()> {
    let mut purged = 0;
    if let Some(max_age) = self.policy.max_age {
      if let Ok(max_age) = chrono::Duration::from_std(max_age) {
        purged += self.storage.purge_older_than(&self.name, now - max_age)?;
      }
    }
    if let Some(max_entries) = self.policy.max_entries {
      purged += self.storage.evict_oldest(&self.name, max_entries)?;
    }
    if purged > 0 {
      debug!(bucket = %self.name, purged, "expired or evicted entries");
    }
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.storage.len(&self.name).unwrap_or(0)
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<S: BucketStorage> Clone for CacheBucket<S> {
  fn clone(&self) -> Self {
    Self {
      name: self.name.clone(),
      policy: self.policy,
      filter: self.filter.clone(),
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
    }
  }
}
