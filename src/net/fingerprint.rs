//! Request fingerprints used as cache and dedup keys.

use sha2::{Digest, Sha256};
use std::fmt;

use super::Request;

/// Headers that vary between otherwise identical requests and never change
/// what the server returns for our purposes.
const IGNORED_HEADERS: &[&str] = &[
  "accept-encoding",
  "authorization",
  "cache-control",
  "connection",
  "cookie",
  "if-modified-since",
  "if-none-match",
  "pragma",
  "referer",
  "user-agent",
];

/// Deterministic identity of a request: SHA256 over method, URL, the
/// normalized header set and the body.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint(String);

impl Fingerprint {
  pub fn of(request: &Request) -> Self {
    let mut url = request.url.clone();
    url.set_fragment(None);

    let mut hasher = Sha256::new();
    hasher.update(request.method.to_ascii_uppercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(url.as_str().as_bytes());
    hasher.update(b"\n");

    for (name, value) in normalized_headers(request) {
      hasher.update(name.as_bytes());
      hasher.update(b":");
      hasher.update(value.as_bytes());
      hasher.update(b"\n");
    }

    hasher.update(b"\n");
    if let Some(body) = &request.body {
      hasher.update(body);
    }

    Self(hex::encode(hasher.finalize()))
  }

  /// Wrap an already computed key (e.g. loaded from storage).
  pub fn from_hex(hex: impl Into<String>) -> Self {
    Self(hex.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for Fingerprint {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    // Short form is plenty for logs
    let short: String = self.0.chars().take(12).collect();
    f.write_str(&short)
  }
}

/// Lowercased names, trimmed values, sorted by name, volatile headers dropped.
fn normalized_headers(request: &Request) -> Vec<(String, String)> {
  let mut headers: Vec<(String, String)> = request
    .headers
    .iter()
    .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
    .filter(|(name, _)| !IGNORED_HEADERS.contains(&name.as_str()))
    .collect();
  headers.sort();
  headers
}
