//! Core types shared by both cache tiers.

use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::clock::is_within;

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from cached data.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>, is_stale: bool) -> Self {
    Self {
      data,
      source: if is_stale {
        CacheSource::CacheStale
      } else {
        CacheSource::CacheFresh
      },
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  ///
  /// `cached_at` is `None` when the data was synthesized rather than read
  /// from a bucket.
  pub fn offline(data: T, cached_at: Option<DateTime<Utc>>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at,
    }
  }

  pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CacheResult<U> {
    CacheResult {
      data: f(self.data),
      source: self.source,
      cached_at: self.cached_at,
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Data from cache, still considered fresh
  CacheFresh,
  /// Data from cache served while a background refresh runs
  CacheStale,
  /// Offline mode - network unavailable, serving a fallback
  Offline,
}

/// An immutable cached payload. Refreshing replaces the whole entry.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
  pub data: T,
  pub stored_at: DateTime<Utc>,
}

impl<T> CacheEntry<T> {
  pub fn new(data: T, stored_at: DateTime<Utc>) -> Self {
    Self { data, stored_at }
  }

  /// Valid while `now - stored_at < max_age`.
  pub fn is_valid(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
    is_within(self.stored_at, now, max_age)
  }
}
