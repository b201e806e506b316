//! Caching strategies executed by the router.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use super::bucket::CacheBucket;
use super::storage::BucketStorage;
use crate::cache::CacheResult;
use crate::error::FetchError;
use crate::net::{Fingerprint, Request, Response, Transport};

/// How a resource class trades freshness for availability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
  /// Serve a valid cached entry, otherwise fetch and store
  CacheFirst,
  /// Fetch, falling back to a valid cached entry when the network fails
  NetworkFirst,
  /// Serve a valid cached entry immediately and refresh it in the background
  StaleWhileRevalidate,
  /// Never touch the bucket
  NetworkOnly,
}

impl Strategy {
  /// Run this strategy for `request`.
  ///
  /// `Err` means neither the network nor the bucket could answer; the router
  /// turns that into an offline fallback.
  pub async fn execute<S>(
    self,
    request: &Request,
    bucket: &CacheBucket<S>,
    network: &Arc<dyn Transport>,
  ) -> Result<CacheResult<Response>, FetchError>
  where
    S: BucketStorage + 'static,
  {
    let key = request.fingerprint();
    match self {
      Strategy::CacheFirst => cache_first(request, &key, bucket, network).await,
      Strategy::NetworkFirst => network_first(request, &key, bucket, network).await,
      Strategy::StaleWhileRevalidate => {
        stale_while_revalidate(request, key, bucket, network).await
      }
      Strategy::NetworkOnly => network
        .send(request)
        .await
        .map(CacheResult::from_network),
    }
  }
}

async fn cache_first<S: BucketStorage>(
  request: &Request,
  key: &Fingerprint,
  bucket: &CacheBucket<S>,
  network: &Arc<dyn Transport>,
) -> Result<CacheResult<Response>, FetchError> {
  if let Some(entry) = bucket.match_valid(key) {
    debug!(bucket = bucket.name(), %key, "cache hit");
    return Ok(CacheResult::from_cache(entry.response, entry.stored_at, false));
  }

  let response = network.send(request).await?;
  bucket.store(key, &response);
  Ok(CacheResult::from_network(response))
}

async fn network_first<S: BucketStorage>(
  request: &Request,
  key: &Fingerprint,
  bucket: &CacheBucket<S>,
  network: &Arc<dyn Transport>,
) -> Result<CacheResult<Response>, FetchError> {
  match network.send(request).await {
    Ok(response) => {
      bucket.store(key, &response);
      Ok(CacheResult::from_network(response))
    }
    Err(e) => match bucket.match_valid(key) {
      Some(entry) => {
        debug!(bucket = bucket.name(), %key, error = %e, "network failed, serving cached copy");
        Ok(CacheResult::offline(entry.response, Some(entry.stored_at)))
      }
      None => Err(e),
    },
  }
}

async fn stale_while_revalidate<S>(
  request: &Request,
  key: Fingerprint,
  bucket: &CacheBucket<S>,
  network: &Arc<dyn Transport>,
) -> Result<CacheResult<Response>, FetchError>
where
  S: BucketStorage + 'static,
{
  let Some(entry) = bucket.match_valid(&key) else {
    return network_first(request, &key, bucket, network).await;
  };

  let bucket = bucket.clone();
  let network = Arc::clone(network);
  let request = request.clone();
  let refresh_key = key.clone();
  tokio::spawn(async move {
    match network.send(&request).await {
      Ok(response) => {
        if bucket.store(&refresh_key, &response) {
          debug!(bucket = bucket.name(), key = %refresh_key, "revalidated");
        }
      }
      Err(e) => warn!(bucket = bucket.name(), key = %refresh_key, error = %e, "revalidation failed"),
    }
  });

  Ok(CacheResult::from_cache(entry.response, entry.stored_at, true))
}
