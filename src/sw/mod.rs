//! Persistent, network-intercepting cache tier.
//!
//! This module provides an offline worker that:
//! - Precaches a declared set of static resources per cache version
//! - Classifies every intercepted request and applies a per-class strategy
//! - Keeps buckets bounded by count and age
//! - Drops buckets of older versions on activation
//! - Serves a deterministic fallback when offline

mod bucket;
mod fallback;
mod lifecycle;
mod router;
mod storage;
mod strategy;

pub use bucket::{CacheBucket, CacheableResponseFilter, ExpirationPolicy};
pub use fallback::OfflineFallback;
pub use lifecycle::{
  transition, ActivationReport, CacheVersionRegistry, ControlMessage, LifecycleEvent, WorkerState,
  PRECACHE_BUCKET,
};
pub use router::{ResourceClass, ResourceRouter, RoutePolicy, RouteTable};
pub use storage::{BucketStorage, MemoryStorage, SqliteStorage, StoredResponse};
pub use strategy::Strategy;

use color_eyre::{eyre::eyre, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use url::Url;

use crate::cache::{CacheResult, CacheSource};
use crate::clock::Clock;
use crate::config::Config;
use crate::error::FetchError;
use crate::net::{Request, Response, Transport, TransportFuture};

/// `{logical}-{version}`
pub fn bucket_name(logical: &str, version: &str) -> String {
  format!("{}-{}", logical, version)
}

/// Registry and router for one cache version, sharing one storage.
pub struct OfflineWorker<S: BucketStorage> {
  registry: Mutex<CacheVersionRegistry<S>>,
  router: ResourceRouter<S>,
  table: RouteTable,
  api_prefix: String,
  root: Request,
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  network: Arc<dyn Transport>,
  precache: Vec<Request>,
}

impl<S: BucketStorage + 'static> OfflineWorker<S> {
  pub fn new(
    config: &Config,
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    network: Arc<dyn Transport>,
  ) -> Result<Self> {
    let origin = config
      .origin
      .as_deref()
      .ok_or_else(|| eyre!("`origin` must be configured to run the offline worker"))?;
    let origin = Url::parse(origin).map_err(|e| eyre!("Invalid origin {}: {}", origin, e))?;
    let resolve = |path: &str| {
      origin
        .join(path)
        .map(Request::get)
        .map_err(|e| eyre!("Invalid resource path {}: {}", path, e))
    };

    let precache = config
      .precache
      .iter()
      .map(|p| resolve(p))
      .collect::<Result<Vec<_>>>()?;
    let root = resolve(&config.navigation_fallback)?;

    let registry =
      CacheVersionRegistry::resume(config.cache_version.clone(), Arc::clone(&storage), Arc::clone(&clock))?;
    let table = RouteTable::default().with_overrides(&config.routes);
    let router = build_router(
      &table,
      &config.cache_version,
      &config.api_prefix,
      &root,
      &storage,
      &clock,
      &network,
    );

    Ok(Self {
      registry: Mutex::new(registry),
      router,
      table,
      api_prefix: config.api_prefix.clone(),
      root,
      storage,
      clock,
      network,
      precache,
    })
  }

  /// A router over another version's buckets, used while that version
  /// still controls sessions.
  fn router_for(&self, version: &str) -> ResourceRouter<S> {
    build_router(
      &self.table,
      version,
      &self.api_prefix,
      &self.root,
      &self.storage,
      &self.clock,
      &self.network,
    )
  }

  /// Install the current version unless it already is active.
  pub async fn install(&self) -> Result<WorkerState> {
    let mut registry = self.registry.lock().await;
    if registry.state() == WorkerState::Installing {
      registry.install(self.network.as_ref(), &self.precache).await?;
    }
    Ok(registry.state())
  }

  /// Apply a JSON control message such as `{"type": "SKIP_WAITING"}`.
  pub async fn post_message(&self, raw: &str) -> Result<Option<ActivationReport>> {
    let message = ControlMessage::parse(raw)?;
    self.registry.lock().await.handle_message(message)
  }

  pub async fn state(&self) -> WorkerState {
    self.registry.lock().await.state()
  }

  pub async fn attach_session(&self, id: &str) {
    self.registry.lock().await.attach_session(id);
  }

  pub fn router(&self) -> &ResourceRouter<S> {
    &self.router
  }

  /// Every bucket with its entry count.
  pub fn bucket_sizes(&self) -> Result<Vec<(String, usize)>> {
    self
      .storage
      .bucket_names()?
      .into_iter()
      .map(|name| {
        let len = self.storage.len(&name)?;
        Ok((name, len))
      })
      .collect()
  }

  /// Delete every runtime bucket, keeping this version's precache.
  pub async fn clear_runtime(&self) -> Result<Vec<String>> {
    let keep = self.registry.lock().await.precache_bucket().name().to_string();
    let mut deleted = Vec::new();
    for name in self.storage.bucket_names()? {
      if name != keep && self.storage.delete_bucket(&name)? {
        debug!(bucket = %name, "cleared");
        deleted.push(name);
      }
    }
    Ok(deleted)
  }

  /// Intercept a request.
  ///
  /// Until this version is activated, the previously active version keeps
  /// serving from its own buckets. With no previous version the request
  /// goes to the network, and failures get the offline fallback.
  pub async fn handle_fetch(&self, request: &Request) -> Result<CacheResult<Response>, FetchError> {
    let previous = {
      let registry = self.registry.lock().await;
      if registry.is_active() {
        None
      } else {
        Some(
          registry
            .active_version()
            .map_err(|e| FetchError::Storage(e.to_string()))?,
        )
      }
    };

    match previous {
      None => Ok(self.router.handle(request).await),
      Some(Some(version)) => {
        debug!(url = %request.url, %version, "not controlling yet, previous version serves");
        Ok(self.router_for(&version).handle(request).await)
      }
      Some(None) => {
        debug!(url = %request.url, "not controlling yet, passing through");
        match self.network.send(request).await {
          Ok(response) => Ok(CacheResult::from_network(response)),
          Err(e) => Ok(self.router.fallback().respond(request, &e)),
        }
      }
    }
  }
}

fn build_router<S: BucketStorage + 'static>(
  table: &RouteTable,
  version: &str,
  api_prefix: &str,
  root: &Request,
  storage: &Arc<S>,
  clock: &Arc<dyn Clock>,
  network: &Arc<dyn Transport>,
) -> ResourceRouter<S> {
  let precache = CacheBucket::new(
    bucket_name(PRECACHE_BUCKET, version),
    ExpirationPolicy::unbounded(),
    CacheableResponseFilter::default(),
    Arc::clone(storage),
    Arc::clone(clock),
  );
  ResourceRouter::new(
    table.clone(),
    version,
    api_prefix,
    Arc::clone(storage),
    Arc::clone(clock),
    Arc::clone(network),
    OfflineFallback::new(root.clone(), precache),
  )
}

impl<S: BucketStorage + 'static> Transport for OfflineWorker<S> {
  fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
    Box::pin(async move {
      let result = self.handle_fetch(request).await?;
      // A synthesized fallback carries no data worth decoding upstream
      if result.source == CacheSource::Offline && result.cached_at.is_none() {
        return Err(FetchError::Network(format!(
          "offline and no cached copy of {}",
          request.url
        )));
      }
      Ok(result.data)
    })
  }
}
