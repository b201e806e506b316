//! Versioned bucket lifecycle: install, wait, activate.
//!
//! The state machine is an explicit transition table so it can be driven
//! by tests, the CLI, or control messages alike.

use color_eyre::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use super::bucket::{CacheBucket, CacheableResponseFilter, ExpirationPolicy};
use super::bucket_name;
use super::storage::BucketStorage;
use crate::clock::Clock;
use crate::error::LifecycleError;
use crate::net::{Request, Response, Transport};

/// Meta key recording the last version that finished activating.
const ACTIVE_VERSION_KEY: &str = "active_version";

/// Meta key recording the last version that finished installing.
const INSTALLED_VERSION_KEY: &str = "installed_version";

/// Logical name of the bucket holding install-time resources.
pub const PRECACHE_BUCKET: &str = "precache";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
  Installing,
  /// Installed, waiting for the previous version to let go
  Waiting,
  Activating,
  /// Controlling sessions
  Activated,
  /// Install failed; this version will never activate
  Redundant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
  InstallComplete,
  SkipWaiting,
  /// The previous version no longer controls any session
  PreviousReleased,
  ActivationComplete,
}

impl fmt::Display for WorkerState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

impl fmt::Display for LifecycleEvent {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Debug::fmt(self, f)
  }
}

/// The transition table.
pub fn transition(from: WorkerState, event: LifecycleEvent) -> Result<WorkerState, LifecycleError> {
  use LifecycleEvent::*;
  use WorkerState::*;

  match (from, event) {
    (Installing, InstallComplete) => Ok(Waiting),
    // Remembered by the registry and applied once installed
    (Installing, SkipWaiting) => Ok(Installing),
    (Waiting, SkipWaiting | PreviousReleased) => Ok(Activating),
    (Activating, SkipWaiting | PreviousReleased) => Ok(Activating),
    (Activating, ActivationComplete) => Ok(Activated),
    (Activated, SkipWaiting | PreviousReleased) => Ok(Activated),
    (from, event) => Err(LifecycleError::InvalidTransition {
      from: from.to_string(),
      event: event.to_string(),
    }),
  }
}

/// Messages a session may post to the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
  #[serde(rename = "SKIP_WAITING")]
  SkipWaiting,
}

impl ControlMessage {
  pub fn parse(raw: &str) -> Result<Self, LifecycleError> {
    serde_json::from_str(raw).map_err(|e| LifecycleError::BadMessage(e.to_string()))
  }
}

/// What an activation did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
  pub deleted_buckets: Vec<String>,
  pub claimed_sessions: usize,
}

/// Owns the current cache version and the lifecycle of its buckets.
pub struct CacheVersionRegistry<S: BucketStorage> {
  version: String,
  state: WorkerState,
  storage: Arc<S>,
  clock: Arc<dyn Clock>,
  skip_waiting_requested: bool,
  /// session id -> version controlling it
  sessions: BTreeMap<String, Option<String>>,
}

impl<S: BucketStorage> CacheVersionRegistry<S> {
  /// A fresh registry for `version`, about to install.
  pub fn new(version: impl Into<String>, storage: Arc<S>, clock: Arc<dyn Clock>) -> Self {
    Self {
      version: version.into(),
      state: WorkerState::Installing,
      storage,
      clock,
      skip_waiting_requested: false,
      sessions: BTreeMap::new(),
    }
  }

  /// Like [`new`](Self::new), but picks up where an earlier run left off:
  /// `Activated` if this version finished activating, `Waiting` if it
  /// finished installing and its precache is still there.
  pub fn resume(version: impl Into<String>, storage: Arc<S>, clock: Arc<dyn Clock>) -> Result<Self> {
    let mut registry = Self::new(version, storage, clock);
    let version = registry.version.as_str();

    if registry.active_version()?.as_deref() == Some(version) {
      registry.state = WorkerState::Activated;
    } else if registry.storage.get_meta(INSTALLED_VERSION_KEY)?.as_deref() == Some(version)
      && registry
        .storage
        .bucket_names()?
        .contains(&bucket_name(PRECACHE_BUCKET, version))
    {
      registry.state = WorkerState::Waiting;
    }
    Ok(registry)
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn state(&self) -> WorkerState {
    self.state
  }

  pub fn is_active(&self) -> bool {
    self.state == WorkerState::Activated
  }

  /// Version recorded by the last completed activation, if any.
  pub fn active_version(&self) -> Result<Option<String>> {
    self.storage.get_meta(ACTIVE_VERSION_KEY)
  }

  pub fn precache_bucket(&self) -> CacheBucket<S> {
    CacheBucket::new(
      bucket_name(PRECACHE_BUCKET, &self.version),
      ExpirationPolicy::unbounded(),
      CacheableResponseFilter::default(),
      Arc::clone(&self.storage),
      Arc::clone(&self.clock),
    )
  }

  fn apply(&mut self, event: LifecycleEvent) -> Result<WorkerState, LifecycleError> {
    let next = transition(self.state, event)?;
    if next != self.state {
      info!(version = %self.version, from = %self.state, to = %next, %event, "lifecycle transition");
    }
    self.state = next;
    Ok(next)
  }

  /// Fetch every static resource into the precache bucket.
  ///
  /// All resources are fetched and checked before anything is written, so
  /// a single failure leaves no partial install behind and marks this
  /// version redundant.
  pub async fn install(&mut self, network: &dyn Transport, resources: &[Request]) -> Result<()> {
    if self.state != WorkerState::Installing {
      return Err(
        LifecycleError::InvalidTransition {
          from: self.state.to_string(),
          event: "install".to_string(),
        }
        .into(),
      );
    }

    let bucket = self.precache_bucket();
    let filter = bucket.filter();
    let fetches = resources.iter().map(|req| async move {
      let outcome = match network.send(req).await {
        Ok(resp) if filter.allows(resp.status) => Ok(resp),
        Ok(resp) => Err(format!("status {}", resp.status)),
        Err(e) => Err(e.to_string()),
      };
      (req, outcome)
    });

    let mut fetched: Vec<(&Request, Response)> = Vec::with_capacity(resources.len());
    for (req, outcome) in futures::future::join_all(fetches).await {
      match outcome {
        Ok(resp) => fetched.push((req, resp)),
        Err(reason) => return Err(self.fail_install(req, reason).into()),
      }
    }

    for (req, resp) in &fetched {
      if !bucket.store(&req.fingerprint(), resp) {
        if let Err(e) = self.storage.delete_bucket(bucket.name()) {
          warn!(bucket = bucket.name(), error = %e, "could not roll back partial precache");
        }
        return Err(self.fail_install(req, "could not write to storage".to_string()).into());
      }
    }
    info!(version = %self.version, resources = fetched.len(), "precached");

    self.apply(LifecycleEvent::InstallComplete)?;
    self.storage.set_meta(INSTALLED_VERSION_KEY, &self.version)?;

    if self.skip_waiting_requested {
      self.skip_waiting()?;
    } else if self.active_version()?.is_none() {
      // Nothing to hand over from
      self.release_previous()?;
    }
    Ok(())
  }

  fn fail_install(&mut self, req: &Request, reason: String) -> LifecycleError {
    warn!(version = %self.version, url = %req.url, %reason, "install failed");
    self.state = WorkerState::Redundant;
    LifecycleError::InstallFailed {
      url: req.url.to_string(),
      reason,
    }
  }

  /// Handle a control message posted by a session.
  pub fn handle_message(&mut self, message: ControlMessage) -> Result<Option<ActivationReport>> {
    match message {
      ControlMessage::SkipWaiting => self.skip_waiting(),
    }
  }

  /// Force `Waiting -> Activating` and activate. While still installing the
  /// request is remembered for when installation completes.
  pub fn skip_waiting(&mut self) -> Result<Option<ActivationReport>> {
    match self.state {
      WorkerState::Installing => {
        self.skip_waiting_requested = true;
        self.apply(LifecycleEvent::SkipWaiting)?;
        Ok(None)
      }
      WorkerState::Waiting => {
        self.apply(LifecycleEvent::SkipWaiting)?;
        self.activate().map(Some)
      }
      _ => {
        self.apply(LifecycleEvent::SkipWaiting)?;
        Ok(None)
      }
    }
  }

  /// Normal handoff: the previous version controls nothing anymore.
  pub fn release_previous(&mut self) -> Result<Option<ActivationReport>> {
    if self.state == WorkerState::Waiting {
      self.apply(LifecycleEvent::PreviousReleased)?;
      return self.activate().map(Some);
    }
    self.apply(LifecycleEvent::PreviousReleased)?;
    Ok(None)
  }

  /// Delete every bucket not tagged with the current version, then take
  /// control of all attached sessions.
  fn activate(&mut self) -> Result<ActivationReport> {
    let suffix = format!("-{}", self.version);
    let mut report = ActivationReport::default();

    for name in self.storage.bucket_names()? {
      if !name.ends_with(&suffix) {
        self.storage.delete_bucket(&name)?;
        info!(bucket = %name, "deleted outdated bucket");
        report.deleted_buckets.push(name);
      }
    }

    self.storage.set_meta(ACTIVE_VERSION_KEY, &self.version)?;
    self.apply(LifecycleEvent::ActivationComplete)?;

    for controller in self.sessions.values_mut() {
      *controller = Some(self.version.clone());
    }
    report.claimed_sessions = self.sessions.len();
    info!(version = %self.version, claimed = report.claimed_sessions, "activated");
    Ok(report)
  }

  /// Register an open session. Sessions opened after activation are
  /// controlled right away; earlier ones once activation claims them.
  pub fn attach_session(&mut self, id: impl Into<String>) {
    let controller = self.is_active().then(|| self.version.clone());
    self.sessions.insert(id.into(), controller);
  }

  pub fn controller_of(&self, session: &str) -> Option<&str> {
    self.sessions.get(session)?.as_deref()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::clock::ManualClock;
  use crate::net::Response;
  use crate::sw::storage::{MemoryStorage, StoredResponse};
  use crate::testing::ScriptedTransport;
  use chrono::Utc;

  fn registry(version: &str, storage: Arc<MemoryStorage>) -> CacheVersionRegistry<MemoryStorage> {
    CacheVersionRegistry::new(version, storage, Arc::new(ManualClock::at_epoch()))
  }

  fn resources(paths: &[&str]) -> Vec<Request> {
    paths
      .iter()
      .map(|p| Request::get_str(&format!("https://shop.example.com{}", p)).unwrap())
      .collect()
  }

  fn seed(storage: &MemoryStorage, bucket: &str) {
    storage
      .put(
        bucket,
        "k",
        &StoredResponse {
          response: Response::new("/", 200, ""),
          stored_at: Utc::now(),
        },
      )
      .unwrap();
  }

  #[test]
  fn test_transition_table() {
    use LifecycleEvent::*;
    use WorkerState::*;

    assert_eq!(transition(Installing, InstallComplete), Ok(Waiting));
    assert_eq!(transition(Waiting, SkipWaiting), Ok(Activating));
    assert_eq!(transition(Waiting, PreviousReleased), Ok(Activating));
    assert_eq!(transition(Activating, ActivationComplete), Ok(Activated));
    assert!(transition(Installing, ActivationComplete).is_err());
    assert!(transition(Waiting, InstallComplete).is_err());
    assert!(transition(Redundant, SkipWaiting).is_err());
  }

  #[test]
  fn test_control_message_parsing() {
    assert_eq!(
      ControlMessage::parse(r#"{"type":"SKIP_WAITING"}"#).unwrap(),
      ControlMessage::SkipWaiting
    );
    assert!(matches!(
      ControlMessage::parse(r#"{"type":"CLAIM"}"#),
      Err(LifecycleError::BadMessage(_))
    ));
  }

  #[tokio::test]
  async fn test_first_install_activates_immediately() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = ScriptedTransport::echo();
    let mut reg = registry("v1", storage.clone());

    reg.install(transport.as_ref(), &resources(&["/", "/app.js"])).await.unwrap();

    assert_eq!(reg.state(), WorkerState::Activated);
    assert_eq!(reg.precache_bucket().len(), 2);
    assert_eq!(reg.active_version().unwrap().as_deref(), Some("v1"));
  }

  #[tokio::test]
  async fn test_upgrade_waits_then_skip_waiting_cleans_old_buckets() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_meta(ACTIVE_VERSION_KEY, "v1").unwrap();
    seed(&storage, "app-v1");
    seed(&storage, "assets-v1");

    let transport = ScriptedTransport::echo();
    let mut reg = registry("v2", storage.clone());
    reg.attach_session("tab-1");
    reg.install(transport.as_ref(), &resources(&["/"])).await.unwrap();
    assert_eq!(reg.state(), WorkerState::Waiting);
    assert_eq!(reg.controller_of("tab-1"), None);

    let msg = ControlMessage::parse(r#"{"type": "SKIP_WAITING"}"#).unwrap();
    let report = reg.handle_message(msg).unwrap().unwrap();

    assert_eq!(reg.state(), WorkerState::Activated);
    assert_eq!(report.deleted_buckets, vec!["app-v1", "assets-v1"]);
    assert_eq!(report.claimed_sessions, 1);
    assert_eq!(reg.controller_of("tab-1"), Some("v2"));
    assert_eq!(storage.bucket_names().unwrap(), vec!["precache-v2"]);
    assert_eq!(storage.len("app-v2").unwrap(), 0);
    assert_eq!(storage.len("assets-v2").unwrap(), 0);
  }

  #[tokio::test]
  async fn test_skip_waiting_during_install_is_remembered() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_meta(ACTIVE_VERSION_KEY, "v1").unwrap();
    let mut reg = registry("v2", storage);

    assert_eq!(reg.skip_waiting().unwrap(), None);
    assert_eq!(reg.state(), WorkerState::Installing);

    reg
      .install(ScriptedTransport::echo().as_ref(), &resources(&["/"]))
      .await
      .unwrap();
    assert_eq!(reg.state(), WorkerState::Activated);
  }

  #[tokio::test]
  async fn test_failed_resource_fails_whole_install() {
    let storage = Arc::new(MemoryStorage::new());
    let transport = ScriptedTransport::new(|req, _| {
      let status = if req.url.path() == "/missing.css" { 404 } else { 200 };
      Ok(Response::new(req.url.as_str(), status, ""))
    });
    let mut reg = registry("v1", storage.clone());

    let err = reg
      .install(transport.as_ref(), &resources(&["/", "/missing.css", "/app.js"]))
      .await
      .unwrap_err();

    assert!(matches!(
      err.downcast_ref::<LifecycleError>(),
      Some(LifecycleError::InstallFailed { .. })
    ));
    assert_eq!(reg.state(), WorkerState::Redundant);
    assert!(storage.bucket_names().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_resume_restores_activated_version() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_meta(ACTIVE_VERSION_KEY, "v4").unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());

    let same = CacheVersionRegistry::resume("v4", storage.clone(), clock.clone()).unwrap();
    assert!(same.is_active());

    let newer = CacheVersionRegistry::resume("v5", storage, clock).unwrap();
    assert_eq!(newer.state(), WorkerState::Installing);
  }

  #[tokio::test]
  async fn test_resume_restores_waiting_version() {
    let storage = Arc::new(MemoryStorage::new());
    storage.set_meta(ACTIVE_VERSION_KEY, "v1").unwrap();
    let clock: Arc<dyn Clock> = Arc::new(ManualClock::at_epoch());

    let mut installed = registry("v2", storage.clone());
    installed
      .install(ScriptedTransport::echo().as_ref(), &resources(&["/"]))
      .await
      .unwrap();
    assert_eq!(installed.state(), WorkerState::Waiting);
    drop(installed);

    let mut resumed = CacheVersionRegistry::resume("v2", storage.clone(), clock.clone()).unwrap();
    assert_eq!(resumed.state(), WorkerState::Waiting);
    assert!(resumed.skip_waiting().unwrap().is_some());
    assert!(resumed.is_active());

    // A marker without its precache bucket means installing again
    storage.set_meta(INSTALLED_VERSION_KEY, "v3").unwrap();
    let orphan = CacheVersionRegistry::resume("v3", storage, clock).unwrap();
    assert_eq!(orphan.state(), WorkerState::Installing);
  }
}
