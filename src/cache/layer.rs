//! In-process request cache with in-flight deduplication.

use futures::future::{BoxFuture, FutureExt, Shared};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, warn};

use super::traits::CacheEntry;
use crate::clock::Clock;
use crate::error::FetchError;
use crate::net::{Fingerprint, Request, Transport};

/// Per-call freshness settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchOptions {
  /// How long a stored entry is served without asking the network
  pub max_age: Duration,
  /// Serve a stale entry immediately while refreshing it in the background
  pub stale_while_revalidate: bool,
}

impl Default for FetchOptions {
  fn default() -> Self {
    Self {
      max_age: Duration::from_secs(5 * 60),
      stale_while_revalidate: true,
    }
  }
}

type SharedFetch<T> = Shared<BoxFuture<'static, Result<T, FetchError>>>;

enum Plan<T> {
  Join(SharedFetch<T>),
  Start { stale: Option<T> },
}

struct State<T> {
  entries: HashMap<Fingerprint, CacheEntry<T>>,
  /// At most one pending operation per fingerprint
  in_flight: HashMap<Fingerprint, SharedFetch<T>>,
}

struct Inner<T> {
  state: Mutex<State<T>>,
  transport: Arc<dyn Transport>,
  clock: Arc<dyn Clock>,
  defaults: FetchOptions,
}

impl<T> Inner<T> {
  fn state(&self) -> MutexGuard<'_, State<T>> {
    // Every critical section leaves the maps consistent, so a poisoned lock is still usable
    self.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

/// Fingerprint-keyed cache that sits between the application and the network.
///
/// Concurrent callers for the same fingerprint share one network operation.
/// Cloning is cheap and yields a handle on the same cache.
pub struct RequestCache<T> {
  inner: Arc<Inner<T>>,
}

impl<T> Clone for RequestCache<T> {
  fn clone(&self) -> Self {
    Self {
      inner: Arc::clone(&self.inner),
    }
  }
}

impl<T> RequestCache<T>
where
  T: Clone + Send + Sync + 'static,
{
  pub fn new(transport: Arc<dyn Transport>, clock: Arc<dyn Clock>, defaults: FetchOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(State {
          entries: HashMap::new(),
          in_flight: HashMap::new(),
        }),
        transport,
        clock,
        defaults,
      }),
    }
  }

  pub fn defaults(&self) -> FetchOptions {
    self.inner.defaults
  }

  /// Fetch through the cache using a caller-supplied fetcher.
  ///
  /// 1. A valid entry is returned without touching the network.
  /// 2. An in-flight operation for `key` is joined.
  /// 3. A stale entry is returned immediately (if enabled) while a refresh
  ///    runs in the background.
  /// 4. Otherwise a new operation is started and awaited.
  ///
  /// Failures are never cached; every waiter of a failed operation gets
  /// the same error. `fetcher` runs without the cache lock held, so it may
  /// read from this cache.
  pub async fn fetch_with<F, Fut>(
    &self,
    key: Fingerprint,
    options: &FetchOptions,
    fetcher: F,
  ) -> Result<T, FetchError>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let plan = {
      let state = self.inner.state();
      let now = self.inner.clock.now();

      if let Some(entry) = state.entries.get(&key) {
        if entry.is_valid(now, options.max_age) {
          debug!(%key, "cache hit");
          return Ok(entry.data.clone());
        }
      }

      match state.in_flight.get(&key) {
        Some(pending) => Plan::Join(pending.clone()),
        None => Plan::Start {
          stale: if options.stale_while_revalidate {
            state.entries.get(&key).map(|e| e.data.clone())
          } else {
            None
          },
        },
      }
    };

    let pending = match plan {
      Plan::Join(pending) => {
        debug!(%key, "joining in-flight fetch");
        pending
      }
      Plan::Start { stale } => {
        let fut = fetcher();
        let pending = {
          let mut state = self.inner.state();
          // Someone may have registered while the lock was released
          match state.in_flight.get(&key) {
            Some(pending) => pending.clone(),
            None => self.start(&mut state, key.clone(), fut),
          }
        };
        if let Some(data) = stale {
          debug!(%key, "serving stale entry, refreshing in background");
          return Ok(data);
        }
        debug!(%key, "fetching");
        pending
      }
    };

    pending.await
  }

  /// Register and spawn a new operation. The spawned task keeps it running
  /// even if every caller goes away.
  fn start<Fut>(&self, state: &mut State<T>, key: Fingerprint, fut: Fut) -> SharedFetch<T>
  where
    Fut: Future<Output = Result<T, FetchError>> + Send + 'static,
  {
    let inner = Arc::clone(&self.inner);
    let settle_key = key.clone();
    let task = async move {
      let result = fut.await;
      let mut state = inner.state();
      match &result {
        Ok(data) => {
          state.entries.insert(
            settle_key.clone(),
            CacheEntry::new(data.clone(), inner.clock.now()),
          );
        }
        Err(e) => warn!(key = %settle_key, error = %e, "fetch failed, entry left as is"),
      }
      state.in_flight.remove(&settle_key);
      result
    }
    .boxed()
    .shared();

    state.in_flight.insert(key, task.clone());
    tokio::spawn(task.clone());
    task
  }

  /// Drop the entry for `key`; the next fetch goes to the network.
  pub fn invalidate(&self, key: &Fingerprint) -> bool {
    self.inner.state().entries.remove(key).is_some()
  }

  /// Drop every entry.
  pub fn clear(&self) {
    self.inner.state().entries.clear();
  }

  /// Whether `key` has an entry younger than `max_age`. This is the single
  /// staleness authority for everything built on this cache.
  pub fn is_fresh(&self, key: &Fingerprint, max_age: Duration) -> bool {
    let now = self.inner.clock.now();
    self
      .inner
      .state()
      .entries
      .get(key)
      .is_some_and(|e| e.is_valid(now, max_age))
  }

  pub fn peek(&self, key: &Fingerprint) -> Option<CacheEntry<T>> {
    self.inner.state().entries.get(key).cloned()
  }

  pub fn is_in_flight(&self, key: &Fingerprint) -> bool {
    self.inner.state().in_flight.contains_key(key)
  }

  pub fn len(&self) -> usize {
    self.inner.state().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

impl<T> RequestCache<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Fetch `request` through the transport and decode its JSON body.
  pub async fn fetch(&self, request: &Request, options: &FetchOptions) -> Result<T, FetchError> {
    let transport = Arc::clone(&self.inner.transport);
    let req = request.clone();
    self
      .fetch_with(request.fingerprint(), options, move || async move {
        transport.send(&req).await?.json::<T>()
      })
      .await
  }

  /// GET `url` with the cache's default options.
  pub async fn fetch_url(&self, url: &str) -> Result<T, FetchError> {
    let request =
      Request::get_str(url).map_err(|e| FetchError::Parse(format!("invalid URL {}: {}", url, e)))?;
    self.fetch(&request, &self.inner.defaults).await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::net::Response;
  use crate::testing::{settle, ScriptedTransport};
  use serde_json::Value;

  fn cache(transport: Arc<ScriptedTransport>) -> (RequestCache<Value>, ManualClock) {
    let clock = ManualClock::at_epoch();
    let cache = RequestCache::new(transport, Arc::new(clock.clone()), FetchOptions::default());
    (cache, clock)
  }

  fn products() -> Request {
    Request::get_str("https://shop.example.com/api/products").unwrap()
  }

  fn opts(max_age_ms: u64) -> FetchOptions {
    FetchOptions {
      max_age: Duration::from_millis(max_age_ms),
      stale_while_revalidate: true,
    }
  }

  #[tokio::test(start_paused = true)]
  async fn test_concurrent_fetches_share_one_network_call() {
    let transport = ScriptedTransport::echo();
    transport.set_delay(Duration::from_millis(50));
    let (cache, _) = cache(transport.clone());
    let req = products();
    let options = opts(5000);

    let calls = (0..5).map(|_| cache.fetch(&req, &options));
    let results = futures::future::join_all(calls).await;

    assert_eq!(transport.calls(), 1);
    let first = results[0].clone().unwrap();
    assert!(results.iter().all(|r| r.as_ref() == Ok(&first)));
    assert!(!cache.is_in_flight(&req.fingerprint()));
  }

  #[tokio::test(start_paused = true)]
  async fn test_failure_reaches_every_waiter_and_is_not_cached() {
    let transport = ScriptedTransport::echo();
    transport.set_delay(Duration::from_millis(20));
    transport.set_offline(true);
    let (cache, _) = cache(transport.clone());
    let req = products();
    let options = opts(5000);

    let results = futures::future::join_all((0..3).map(|_| cache.fetch(&req, &options))).await;
    assert_eq!(transport.calls(), 1);
    for result in &results {
      assert_eq!(result, &Err(FetchError::Network("offline".to_string())));
    }
    assert!(!cache.is_in_flight(&req.fingerprint()));
    assert!(cache.is_empty());

    transport.set_offline(false);
    assert!(cache.fetch(&req, &options).await.is_ok());
    assert_eq!(transport.calls(), 2);
  }

  #[tokio::test]
  async fn test_products_scenario() {
    let transport = ScriptedTransport::echo();
    let (cache, clock) = cache(transport.clone());
    let req = products();
    let key = req.fingerprint();
    let options = opts(5000);

    // t=0: network hit
    let first = cache.fetch(&req, &options).await.unwrap();
    assert_eq!(first["call"], 1);
    assert_eq!(transport.calls(), 1);

    // t=2000: cache hit
    clock.advance_ms(2000);
    let second = cache.fetch(&req, &options).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(transport.calls(), 1);

    // t=6000: stale, served immediately, refreshed in the background
    clock.advance_ms(4000);
    let third = cache.fetch(&req, &options).await.unwrap();
    assert_eq!(third, first);

    settle().await;
    assert_eq!(transport.calls(), 2);
    let entry = cache.peek(&key).unwrap();
    assert_eq!(entry.data["call"], 2);
    assert_eq!(entry.stored_at.timestamp_millis(), 6000);
  }

  #[tokio::test]
  async fn test_stale_read_does_not_wait_on_network() {
    let transport = ScriptedTransport::echo();
    let (cache, clock) = cache(transport.clone());
    let req = products();
    let key = req.fingerprint();
    let options = opts(1000);

    cache.fetch(&req, &options).await.unwrap();
    clock.advance_ms(1001);
    transport.hold();

    let stale = cache
      .fetch(&req, &options)
      .now_or_never()
      .expect("stale read must not suspend")
      .unwrap();
    assert_eq!(stale["call"], 1);
    assert!(cache.is_in_flight(&key));
    assert_eq!(cache.peek(&key).unwrap().data["call"], 1);

    settle().await;
    transport.release();
    settle().await;

    assert!(!cache.is_in_flight(&key));
    assert_eq!(cache.peek(&key).unwrap().data["call"], 2);
  }

  #[tokio::test]
  async fn test_failed_refresh_keeps_stale_entry() {
    let transport = ScriptedTransport::new(|req, n| {
      if n == 1 {
        Ok(Response::new(req.url.as_str(), 200, r#"{"call":1}"#))
      } else {
        Err(FetchError::Network("connection refused".into()))
      }
    });
    let (cache, clock) = cache(transport.clone());
    let req = products();
    let key = req.fingerprint();
    let options = opts(1000);

    cache.fetch(&req, &options).await.unwrap();
    clock.advance_ms(1500);

    let stale = cache.fetch(&req, &options).await.unwrap();
    assert_eq!(stale["call"], 1);
    settle().await;

    assert_eq!(transport.calls(), 2);
    assert!(!cache.is_in_flight(&key));
    let entry = cache.peek(&key).unwrap();
    assert_eq!(entry.data["call"], 1);
    assert_eq!(entry.stored_at.timestamp_millis(), 0);
  }

  #[tokio::test]
  async fn test_fetcher_may_read_the_cache() {
    let (cache, _): (RequestCache<Value>, _) = cache(ScriptedTransport::echo());
    let key = Fingerprint::from_hex("self-referencing");
    let reader = cache.clone();
    let lookup_key = key.clone();

    let value = cache
      .fetch_with(key.clone(), &opts(1000), move || {
        let had_entry = reader.peek(&lookup_key).is_some();
        let in_flight = reader.is_in_flight(&lookup_key);
        async move { Ok(serde_json::json!({"had_entry": had_entry, "in_flight": in_flight})) }
      })
      .await
      .unwrap();

    assert_eq!(value["had_entry"], false);
    assert_eq!(value["in_flight"], false);
    assert!(cache.peek(&key).is_some());
  }

  #[tokio::test]
  async fn test_without_swr_stale_entry_waits_for_network() {
    let transport = ScriptedTransport::echo();
    let (cache, clock) = cache(transport.clone());
    let req = products();
    let options = FetchOptions {
      max_age: Duration::from_millis(1000),
      stale_while_revalidate: false,
    };

    cache.fetch(&req, &options).await.unwrap();
    clock.advance_ms(1000);
    let fresh = cache.fetch(&req, &options).await.unwrap();
    assert_eq!(fresh["call"], 2);
  }

  #[tokio::test]
  async fn test_invalidate_and_clear_force_network() {
    let transport = ScriptedTransport::echo();
    let (cache, _) = cache(transport.clone());
    let req = products();
    let options = opts(60_000);

    cache.fetch(&req, &options).await.unwrap();
    assert!(cache.is_fresh(&req.fingerprint(), options.max_age));
    assert!(cache.invalidate(&req.fingerprint()));
    assert!(!cache.is_fresh(&req.fingerprint(), options.max_age));

    cache.fetch(&req, &options).await.unwrap();
    cache.clear();
    cache.fetch(&req, &options).await.unwrap();
    assert_eq!(transport.calls(), 3);
  }

  #[tokio::test]
  async fn test_status_and_payload_failures_are_typed() {
    let transport = ScriptedTransport::new(|req, _| match req.url.path() {
      "/api/missing" => Ok(Response::new(req.url.as_str(), 404, "")),
      _ => Ok(Response::new(req.url.as_str(), 200, "<html>")),
    });
    let (cache, _) = cache(transport);

    let missing = cache
      .fetch_url("https://shop.example.com/api/missing")
      .await;
    assert!(matches!(missing, Err(FetchError::Http { status: 404, .. })));

    let garbage = cache.fetch_url("https://shop.example.com/api/html").await;
    assert!(matches!(garbage, Err(FetchError::Parse(_))));

    assert!(matches!(
      cache.fetch_url("not a url").await,
      Err(FetchError::Parse(_))
    ));
  }

  #[tokio::test]
  async fn test_fetch_with_custom_fetcher() {
    let (cache, _): (RequestCache<Value>, _) = cache(ScriptedTransport::echo());
    let key = Fingerprint::from_hex("custom");

    let value = cache
      .fetch_with(key.clone(), &opts(1000), || async {
        Ok(serde_json::json!({"source": "custom"}))
      })
      .await
      .unwrap();
    assert_eq!(value["source"], "custom");
    assert!(cache.peek(&key).is_some());
  }
}
