//! Async query abstraction on top of [`RequestCache`].
//!
//! Inspired by TanStack Query, a `QueryController<T>` owns the loading state
//! of one resource and adds bounded retry, periodic refetch, enable/disable
//! gating and success/error callbacks.
//!
//! # Example
//!
//! ```ignore
//! let mut products = use_query(&cache, "https://shop.example.com/api/products", config)?;
//!
//! // In event loop tick
//! if products.poll() {
//!     // State changed, trigger re-render
//! }
//!
//! // In render
//! match products.state().status {
//!     QueryStatus::Loading => render_spinner(),
//!     QueryStatus::Success => render_data(products.data()),
//!     QueryStatus::Error => render_error(products.error()),
//!     QueryStatus::Idle => {}
//! }
//! ```

use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::cache::{FetchOptions, RequestCache};
use crate::error::FetchError;
use crate::event::Ticker;
use crate::net::Request;

/// Lifecycle of a query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Query has not been started (or is disabled)
  Idle,
  /// Query is currently fetching data
  Loading,
  /// Query completed successfully
  Success,
  /// Query failed after exhausting its retries
  Error,
}

/// What a consumer renders from. Data from the last success is kept while a
/// refetch is loading or after it fails.
#[derive(Debug, Clone)]
pub struct QueryState<T> {
  pub data: Option<T>,
  pub status: QueryStatus,
  pub error: Option<FetchError>,
}

impl<T> Default for QueryState<T> {
  fn default() -> Self {
    Self {
      data: None,
      status: QueryStatus::Idle,
      error: None,
    }
  }
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    self.status == QueryStatus::Loading
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryConfig {
  /// Disabled queries never leave `Idle`
  pub enabled: bool,
  /// Retries after the first failed attempt
  pub retry: u32,
  /// Fixed delay between attempts
  pub retry_delay: Duration,
  pub refetch_interval: Option<Duration>,
  pub fetch: FetchOptions,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      enabled: true,
      retry: 3,
      retry_delay: Duration::from_secs(1),
      refetch_interval: None,
      fetch: FetchOptions::default(),
    }
  }
}

/// Messages from the fetch task
enum Update<T> {
  Retrying { attempt: u32, error: FetchError },
  Settled(Result<T, FetchError>),
}

type SuccessFn<T> = Box<dyn FnMut(&T) + Send>;
type ErrorFn = Box<dyn FnMut(&FetchError) + Send>;

/// Per-resource query state machine.
///
/// Work happens on spawned tasks; results are applied by [`poll`](Self::poll),
/// which is meant to be called from the owner's event loop.
pub struct QueryController<T> {
  cache: RequestCache<T>,
  request: Request,
  config: QueryConfig,
  state: QueryState<T>,
  receiver: Option<mpsc::UnboundedReceiver<Update<T>>>,
  failure_count: u32,
  fetched_at: Option<Instant>,
  ticker: Option<Ticker>,
  on_success: Option<SuccessFn<T>>,
  on_error: Option<ErrorFn>,
}

impl<T> QueryController<T>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  /// Create an idle controller. Nothing is fetched until [`fetch`](Self::fetch).
  pub fn new(cache: RequestCache<T>, request: Request, config: QueryConfig) -> Self {
    let mut controller = Self {
      cache,
      request,
      config,
      state: QueryState::default(),
      receiver: None,
      failure_count: 0,
      fetched_at: None,
      ticker: None,
      on_success: None,
      on_error: None,
    };
    controller.reset_ticker();
    controller
  }

  pub fn on_success(mut self, f: impl FnMut(&T) + Send + 'static) -> Self {
    self.on_success = Some(Box::new(f));
    self
  }

  pub fn on_error(mut self, f: impl FnMut(&FetchError) + Send + 'static) -> Self {
    self.on_error = Some(Box::new(f));
    self
  }

  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data.as_ref()
  }

  pub fn error(&self) -> Option<&FetchError> {
    self.state.error.as_ref()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn is_enabled(&self) -> bool {
    self.config.enabled
  }

  /// Failed attempts of the current run; reset on success.
  pub fn failure_count(&self) -> u32 {
    self.failure_count
  }

  pub fn fetched_at(&self) -> Option<Instant> {
    self.fetched_at
  }

  pub fn request(&self) -> &Request {
    &self.request
  }

  /// Start loading unless disabled or already loading.
  ///
  /// If the cache holds a fresh entry the query succeeds immediately
  /// without spawning anything.
  pub fn fetch(&mut self) {
    if !self.config.enabled || self.state.is_loading() {
      return;
    }

    let key = self.request.fingerprint();
    if self.cache.is_fresh(&key, self.config.fetch.max_age) {
      if let Some(entry) = self.cache.peek(&key) {
        debug!(url = %self.request.url, "fresh in cache, skipping fetch");
        self.apply_success(entry.data);
        return;
      }
    }
    self.start_fetch();
  }

  /// Invalidate the cached entry and load again, dropping any pending result.
  pub fn refetch(&mut self) {
    if !self.config.enabled {
      return;
    }
    self.cache.invalidate(&self.request.fingerprint());
    self.receiver = None;
    self.start_fetch();
  }

  /// Enabling an idle controller starts it; disabling stops its interval.
  pub fn set_enabled(&mut self, enabled: bool) {
    if self.config.enabled == enabled {
      return;
    }
    self.config.enabled = enabled;
    self.reset_ticker();
    if enabled && self.state.status == QueryStatus::Idle {
      self.fetch();
    }
  }

  /// Apply interval ticks and results from a pending fetch.
  ///
  /// Returns `true` if the state changed. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut changed = false;

    let ticked = self.ticker.as_mut().is_some_and(|t| t.try_tick());
    if ticked && !self.state.is_loading() {
      debug!(url = %self.request.url, "refetch interval");
      self.start_fetch();
      changed = true;
    }

    while let Some(update) = self.receiver.as_mut().and_then(|rx| rx.try_recv().ok()) {
      match update {
        Update::Retrying { attempt, error } => {
          self.failure_count = attempt;
          self.state.error = Some(error);
        }
        Update::Settled(Ok(data)) => {
          self.receiver = None;
          self.apply_success(data);
        }
        Update::Settled(Err(error)) => {
          self.receiver = None;
          self.apply_error(error);
        }
      }
      changed = true;
    }

    changed
  }

  fn apply_success(&mut self, data: T) {
    self.failure_count = 0;
    self.fetched_at = Some(Instant::now());
    if let Some(f) = self.on_success.as_mut() {
      f(&data);
    }
    self.state = QueryState {
      data: Some(data),
      status: QueryStatus::Success,
      error: None,
    };
  }

  fn apply_error(&mut self, error: FetchError) {
    if let FetchError::ExhaustedRetries { attempts, .. } = &error {
      self.failure_count = *attempts;
    }
    if let Some(f) = self.on_error.as_mut() {
      f(&error);
    }
    self.state.status = QueryStatus::Error;
    self.state.error = Some(error);
  }

  fn reset_ticker(&mut self) {
    self.ticker = match self.config.refetch_interval {
      Some(period) if self.config.enabled => Some(Ticker::new(period)),
      _ => None,
    };
  }

  /// Spawn the attempt loop: one initial attempt plus `retry` retries with
  /// a fixed delay in between. The loop stops early once the controller is
  /// gone, but an attempt already on the wire runs to completion.
  fn start_fetch(&mut self) {
    let (tx, rx) = mpsc::unbounded_channel();
    self.receiver = Some(rx);
    self.state.status = QueryStatus::Loading;

    let cache = self.cache.clone();
    let request = self.request.clone();
    let options = self.config.fetch;
    let retry = self.config.retry;
    let delay = self.config.retry_delay;

    tokio::spawn(async move {
      let mut attempt = 0;
      loop {
        attempt += 1;
        match cache.fetch(&request, &options).await {
          Ok(data) => {
            let _ = tx.send(Update::Settled(Ok(data)));
            return;
          }
          Err(error) if attempt <= retry => {
            warn!(url = %request.url, attempt, %error, "fetch failed, retrying");
            if tx.send(Update::Retrying { attempt, error }).is_err() {
              return;
            }
            tokio::time::sleep(delay).await;
          }
          Err(error) => {
            warn!(url = %request.url, attempts = attempt, %error, "giving up");
            let _ = tx.send(Update::Settled(Err(FetchError::ExhaustedRetries {
              attempts: attempt,
              last: Box::new(error),
            })));
            return;
          }
        }
      }
    });
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryController<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryController")
      .field("url", &self.request.url.as_str())
      .field("state", &self.state)
      .field("failure_count", &self.failure_count)
      .field("fetched_at", &self.fetched_at)
      .finish_non_exhaustive()
  }
}

/// Build a controller for `GET url` and start it.
pub fn use_query<T>(
  cache: &RequestCache<T>,
  url: &str,
  config: QueryConfig,
) -> Result<QueryController<T>, FetchError>
where
  T: DeserializeOwned + Clone + Send + Sync + 'static,
{
  let request =
    Request::get_str(url).map_err(|e| FetchError::Parse(format!("invalid URL {}: {}", url, e)))?;
  let mut controller = QueryController::new(cache.clone(), request, config);
  controller.fetch();
  Ok(controller)
}
