//! Typed failures shared by both cache tiers.

use thiserror::Error;

/// Failure of a fetch through either tier.
///
/// Cloneable so that every caller awaiting the same in-flight operation
/// receives the same failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
  /// Transport-level failure (offline, DNS, connection reset, ...)
  #[error("network failure: {0}")]
  Network(String),

  /// A response arrived but its status is not acceptable
  #[error("HTTP {status} for {url}")]
  Http { status: u16, url: String },

  /// The payload could not be decoded
  #[error("failed to parse payload: {0}")]
  Parse(String),

  /// Cache storage could not be read or written
  #[error("cache storage failure: {0}")]
  Storage(String),

  /// A query controller gave up; wraps the last underlying failure
  #[error("gave up after {attempts} attempts: {last}")]
  ExhaustedRetries {
    attempts: u32,
    last: Box<FetchError>,
  },
}

impl FetchError {
  pub fn is_network(&self) -> bool {
    matches!(self, FetchError::Network(_))
  }

  /// The innermost failure, looking through `ExhaustedRetries`.
  pub fn root_cause(&self) -> &FetchError {
    match self {
      FetchError::ExhaustedRetries { last, .. } => last.root_cause(),
      other => other,
    }
  }
}

/// Failures of the worker lifecycle and its control channel.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LifecycleError {
  #[error("invalid transition: {event} while {from}")]
  InvalidTransition { from: String, event: String },

  #[error("install failed for {url}: {reason}")]
  InstallFailed { url: String, reason: String },

  #[error("malformed control message: {0}")]
  BadMessage(String),
}
