//! Scripted transport for tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;

use crate::error::FetchError;
use crate::net::{Request, Response, Transport, TransportFuture};

type Responder = Box<dyn Fn(&Request, usize) -> Result<Response, FetchError> + Send + Sync>;

/// A transport that answers from a closure, counts calls, and can be taken
/// offline, slowed down, or held until released.
pub struct ScriptedTransport {
  responder: Responder,
  calls: AtomicUsize,
  per_url: Mutex<HashMap<String, usize>>,
  offline: AtomicBool,
  delay: Mutex<Option<Duration>>,
  gate: Mutex<Option<Arc<Notify>>>,
}

impl ScriptedTransport {
  /// Respond with `f(request, call_number)`; call numbers start at 1.
  pub fn new<F>(f: F) -> Arc<Self>
  where
    F: Fn(&Request, usize) -> Result<Response, FetchError> + Send + Sync + 'static,
  {
    Arc::new(Self {
      responder: Box::new(f),
      calls: AtomicUsize::new(0),
      per_url: Mutex::new(HashMap::new()),
      offline: AtomicBool::new(false),
      delay: Mutex::new(None),
      gate: Mutex::new(None),
    })
  }

  /// 200 with a body naming the URL and call number.
  pub fn echo() -> Arc<Self> {
    Self::new(|req, n| {
      Ok(Response::new(
        req.url.as_str(),
        200,
        format!("{{\"url\":\"{}\",\"call\":{}}}", req.url, n),
      ))
    })
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }

  pub fn calls_for(&self, url: &str) -> usize {
    self
      .per_url
      .lock()
      .unwrap()
      .get(url)
      .copied()
      .unwrap_or(0)
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn set_delay(&self, delay: Duration) {
    *self.delay.lock().unwrap() = Some(delay);
  }

  /// Hold every subsequent request until [`release`](Self::release).
  pub fn hold(&self) {
    *self.gate.lock().unwrap() = Some(Arc::new(Notify::new()));
  }

  pub fn release(&self) {
    if let Some(gate) = self.gate.lock().unwrap().take() {
      gate.notify_waiters();
    }
  }
}

impl Transport for ScriptedTransport {
  fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
    Box::pin(async move {
      let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
      *self
        .per_url
        .lock()
        .unwrap()
        .entry(request.url.to_string())
        .or_insert(0) += 1;

      let gate = self.gate.lock().unwrap().clone();
      if let Some(gate) = gate {
        gate.notified().await;
      }
      let delay = *self.delay.lock().unwrap();
      if let Some(delay) = delay {
        tokio::time::sleep(delay).await;
      }
      if self.offline.load(Ordering::SeqCst) {
        return Err(FetchError::Network("offline".to_string()));
      }
      (self.responder)(request, n)
    })
  }
}

/// Let spawned background tasks on the current-thread runtime run to their
/// next suspension point.
pub async fn settle() {
  for _ in 0..32 {
    tokio::task::yield_now().await;
  }
}
