use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use tracing::debug;

use super::{Request, Response};
use crate::error::FetchError;

/// A boxed future resolving to a response or a transport failure
pub type TransportFuture<'a> = Pin<Box<dyn Future<Output = Result<Response, FetchError>> + Send + 'a>>;

/// Anything that can put a request on the wire.
///
/// Any HTTP status is a successful send; only transport-level problems are
/// errors. Deciding what a status means is left to the caller.
pub trait Transport: Send + Sync {
  fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a>;
}

/// Real network transport backed by reqwest.
#[derive(Clone)]
pub struct ReqwestTransport {
  client: reqwest::Client,
}

impl ReqwestTransport {
  pub fn new(timeout: Duration) -> Result<Self, FetchError> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| FetchError::Network(format!("failed to build HTTP client: {}", e)))?;
    Ok(Self { client })
  }

  async fn execute(&self, request: &Request) -> Result<Response, FetchError> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| FetchError::Network(format!("invalid method {}: {}", request.method, e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    for (name, value) in &request.headers {
      if let (Ok(name), Ok(value)) = (
        HeaderName::from_bytes(name.as_bytes()),
        HeaderValue::from_str(value),
      ) {
        builder = builder.header(name, value);
      }
    }
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let resp = builder
      .send()
      .await
      .map_err(|e| FetchError::Network(e.to_string()))?;

    let status = resp.status().as_u16();
    let url = resp.url().to_string();
    let headers = resp
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();
    let body = resp
      .bytes()
      .await
      .map_err(|e| FetchError::Network(format!("failed to read body: {}", e)))?
      .to_vec();

    debug!(%url, status, bytes = body.len(), "network response");

    Ok(Response {
      url,
      status,
      headers,
      body,
    })
  }
}

impl Transport for ReqwestTransport {
  fn send<'a>(&'a self, request: &'a Request) -> TransportFuture<'a> {
    Box::pin(self.execute(request))
  }
}
