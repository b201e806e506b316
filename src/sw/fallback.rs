//! Deterministic answers for when neither network nor bucket can respond.

use tracing::warn;

use super::bucket::CacheBucket;
use super::storage::BucketStorage;
use crate::cache::CacheResult;
use crate::error::FetchError;
use crate::net::{Fingerprint, Request, Response};

pub struct OfflineFallback<S: BucketStorage> {
  root_key: Fingerprint,
  precache: CacheBucket<S>,
}

impl<S: BucketStorage> OfflineFallback<S> {
  /// `root` is the request the root document was precached under.
  pub fn new(root: Request, precache: CacheBucket<S>) -> Self {
    Self {
      root_key: root.fingerprint(),
      precache,
    }
  }

  /// Navigations get the precached root document when there is one;
  /// everything else gets a synthetic 503.
  pub fn respond(&self, request: &Request, error: &FetchError) -> CacheResult<Response> {
    warn!(url = %request.url, %error, "offline fallback");

    if request.is_navigation() {
      if let Some(entry) = self.precache.match_valid(&self.root_key) {
        return CacheResult::offline(entry.response, Some(entry.stored_at));
      }
    }
    CacheResult::offline(Response::service_unavailable(request.url.as_str()), None)
  }
}
