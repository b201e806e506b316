//! Resource classification and per-class dispatch.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info_span, Instrument};

use super::bucket::{CacheBucket, CacheableResponseFilter, ExpirationPolicy};
use super::fallback::OfflineFallback;
use super::storage::BucketStorage;
use super::{bucket_name, Strategy};
use crate::cache::CacheResult;
use crate::clock::Clock;
use crate::config::{RouteOverride, RoutesConfig};
use crate::net::{Destination, Request, Response, Transport};

const DAY: u64 = 24 * 60 * 60;

/// The classes every intercepted request falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
  /// Top-level document navigations
  Navigation,
  /// Scripts, stylesheets and workers
  Asset,
  Image,
  Font,
  Api,
  Other,
}

impl ResourceClass {
  /// Classify by declared destination first, then by URL. First match wins.
  pub fn classify(request: &Request, api_prefix: &str) -> Self {
    if request.is_navigation() {
      return ResourceClass::Navigation;
    }

    let path = request.url.path();
    let ext = path
      .rsplit_once('/')
      .map(|(_, file)| file)
      .and_then(|file| file.rsplit_once('.'))
      .map(|(_, ext)| ext.to_ascii_lowercase());
    let ext = ext.as_deref();

    match request.destination {
      Destination::Script | Destination::Style | Destination::Worker => {
        return ResourceClass::Asset
      }
      Destination::Image => return ResourceClass::Image,
      Destination::Font => return ResourceClass::Font,
      Destination::Document | Destination::Empty => {}
    }

    match ext {
      Some("js" | "mjs" | "css") => ResourceClass::Asset,
      Some("png" | "jpg" | "jpeg" | "gif" | "webp" | "svg" | "ico" | "avif") => {
        ResourceClass::Image
      }
      Some("woff" | "woff2" | "ttf" | "otf" | "eot") => ResourceClass::Font,
      _ if path.starts_with(api_prefix) => ResourceClass::Api,
      _ => ResourceClass::Other,
    }
  }
}

/// Strategy and expiration data for one class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutePolicy {
  pub strategy: Strategy,
  /// Logical bucket name; the version tag is appended at runtime
  pub bucket: &'static str,
  pub expiration: ExpirationPolicy,
  pub filter: CacheableResponseFilter,
}

impl RoutePolicy {
  fn new(strategy: Strategy, bucket: &'static str, max_entries: usize, max_age_secs: u64) -> Self {
    Self {
      strategy,
      bucket,
      expiration: ExpirationPolicy::new(max_entries, Duration::from_secs(max_age_secs)),
      filter: CacheableResponseFilter::default(),
    }
  }

  fn apply(&mut self, o: &RouteOverride) {
    if let Some(strategy) = o.strategy {
      self.strategy = strategy;
    }
    if let Some(max_entries) = o.max_entries {
      self.expiration.max_entries = Some(max_entries);
    }
    if let Some(secs) = o.max_age_secs {
      self.expiration.max_age = Some(Duration::from_secs(secs));
    }
    if let Some(statuses) = &o.statuses {
      self.filter = CacheableResponseFilter::new(statuses.clone());
    }
  }
}

/// Closed mapping from [`ResourceClass`] to its [`RoutePolicy`].
#[derive(Debug, Clone)]
pub struct RouteTable {
  navigation: RoutePolicy,
  asset: RoutePolicy,
  image: RoutePolicy,
  font: RoutePolicy,
  api: RoutePolicy,
  other: RoutePolicy,
}

impl Default for RouteTable {
  fn default() -> Self {
    Self {
      navigation: RoutePolicy::new(Strategy::NetworkFirst, "pages", 32, DAY),
      asset: RoutePolicy::new(Strategy::StaleWhileRevalidate, "assets", 60, 30 * DAY),
      image: RoutePolicy::new(Strategy::CacheFirst, "images", 100, 7 * DAY),
      font: RoutePolicy::new(Strategy::CacheFirst, "fonts", 10, 60 * DAY),
      api: RoutePolicy::new(Strategy::NetworkFirst, "api", 50, 5 * 60),
      other: RoutePolicy {
        strategy: Strategy::NetworkOnly,
        bucket: "other",
        expiration: ExpirationPolicy::unbounded(),
        filter: CacheableResponseFilter::default(),
      },
    }
  }
}

impl RouteTable {
  pub fn with_overrides(mut self, routes: &RoutesConfig) -> Self {
    self.navigation.apply(&routes.navigation);
    self.asset.apply(&routes.asset);
    self.image.apply(&routes.image);
    self.font.apply(&routes.font);
    self.api.apply(&routes.api);
    self
  }

  pub fn policy(&self, class: ResourceClass) -> &RoutePolicy {
    match class {
      ResourceClass::Navigation => &self.navigation,
      ResourceClass::Asset => &self.asset,
      ResourceClass::Image => &self.image,
      ResourceClass::Font => &self.font,
      ResourceClass::Api => &self.api,
      ResourceClass::Other => &self.other,
    }
  }
}

/// Classifies intercepted requests and runs the matching strategy against
/// the current version's bucket.
pub struct ResourceRouter<S: BucketStorage> {
  table: RouteTable,
  version: String,
  api_prefix: String,
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  network: Arc<dyn Transport>,
  fallback: OfflineFallback<S>,
}

impl<S: BucketStorage + 'static> ResourceRouter<S> {
  pub fn new(
    table: RouteTable,
    version: impl Into<String>,
    api_prefix: impl Into<String>,
    storage: Arc<S>,
    clock: Arc<dyn Clock>,
    network: Arc<dyn Transport>,
    fallback: OfflineFallback<S>,
  ) -> Self {
    Self {
      table,
      version: version.into(),
      api_prefix: api_prefix.into(),
      storage,
      clock,
      network,
      fallback,
    }
  }

  pub fn classify(&self, request: &Request) -> ResourceClass {
    ResourceClass::classify(request, &self.api_prefix)
  }

  pub fn fallback(&self) -> &OfflineFallback<S> {
    &self.fallback
  }

  /// The versioned bucket serving `class`.
  pub fn bucket(&self, class: ResourceClass) -> CacheBucket<S> {
    let policy = self.table.policy(class);
    CacheBucket::new(
      bucket_name(policy.bucket, &self.version),
      policy.expiration,
      policy.filter.clone(),
      Arc::clone(&self.storage),
      Arc::clone(&self.clock),
    )
  }

  /// Route a request. Never fails: when neither network nor cache can
  /// answer, the offline fallback does.
  pub async fn handle(&self, request: &Request) -> CacheResult<Response> {
    let class = self.classify(request);
    let policy = self.table.policy(class);
    let bucket = self.bucket(class);
    let span = info_span!("route", url = %request.url, ?class, strategy = ?policy.strategy);

    async {
      match policy.strategy.execute(request, &bucket, &self.network).await {
        Ok(result) => {
          debug!(source = ?result.source, status = result.data.status, "handled");
          result
        }
        Err(e) => self.fallback.respond(request, &e),
      }
    }
    .instrument(span)
    .await
  }
}
