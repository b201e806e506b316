//! Wire model shared by both tiers: requests, responses, fingerprints and
//! the transport seam.

mod fingerprint;
mod transport;

pub use fingerprint::Fingerprint;
pub use transport::{ReqwestTransport, Transport, TransportFuture};

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::error::FetchError;

/// What the requester intends to do with the response.
#[derive(
  Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Worker,
  Image,
  Font,
  /// fetch()/XHR style requests
  #[default]
  Empty,
}

/// Request mode; only navigations are treated specially.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RequestMode {
  Navigate,
  #[default]
  Cors,
}

/// An outbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  /// Uppercase HTTP method
  pub method: String,
  pub url: Url,
  /// Header names are stored lowercased
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
  pub destination: Destination,
  pub mode: RequestMode,
}

impl Request {
  pub fn new(method: &str, url: Url) -> Self {
    Self {
      method: method.to_ascii_uppercase(),
      url,
      headers: BTreeMap::new(),
      body: None,
      destination: Destination::default(),
      mode: RequestMode::default(),
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url)
  }

  /// Parse `url` and build a GET request for it.
  pub fn get_str(url: &str) -> Result<Self, url::ParseError> {
    Ok(Self::get(Url::parse(url)?))
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Mark as a top-level document navigation.
  pub fn navigate(mut self) -> Self {
    self.mode = RequestMode::Navigate;
    self.destination = Destination::Document;
    self
  }

  pub fn is_navigation(&self) -> bool {
    self.mode == RequestMode::Navigate || self.destination == Destination::Document
  }

  pub fn fingerprint(&self) -> Fingerprint {
    Fingerprint::of(self)
  }
}

/// A response as seen by either tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub url: String,
  pub status: u16,
  pub headers: BTreeMap<String, String>,
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(url: impl Into<String>, status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      url: url.into(),
      status,
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self
      .headers
      .insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Synthetic response produced when nothing better is available offline.
  pub fn service_unavailable(url: impl Into<String>) -> Self {
    Self::new(url, 503, "Service Unavailable: offline and not cached")
      .with_header("content-type", "text/plain; charset=utf-8")
  }

  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  /// Decode a JSON body, mapping non-2xx statuses to [`FetchError::Http`].
  pub fn json<T: DeserializeOwned>(&self) -> Result<T, FetchError> {
    if !self.is_success() {
      return Err(FetchError::Http {
        status: self.status,
        url: self.url.clone(),
      });
    }
    serde_json::from_slice(&self.body).map_err(|e| FetchError::Parse(e.to_string()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_navigation_detection() {
    let req = Request::get_str("https://shop.example.com/").unwrap().navigate();
    assert!(req.is_navigation());

    let req = Request::get_str("https://shop.example.com/app.js")
      .unwrap()
      .with_destination(Destination::Script);
    assert!(!req.is_navigation());
  }

  #[test]
  fn test_json_maps_status_and_parse_failures() {
    let ok = Response::new("https://x/api", 200, r#"{"n": 1}"#);
    let value: serde_json::Value = ok.json().unwrap();
    assert_eq!(value["n"], 1);

    let not_found = Response::new("https://x/api", 404, "nope");
    assert_eq!(
      not_found.json::<serde_json::Value>(),
      Err(FetchError::Http {
        status: 404,
        url: "https://x/api".to_string()
      })
    );

    let garbage = Response::new("https://x/api", 200, "{not json");
    assert!(matches!(
      garbage.json::<serde_json::Value>(),
      Err(FetchError::Parse(_))
    ));
  }
}
