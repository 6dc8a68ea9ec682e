//! Thin HTTP wrapper around the operations API.
//!
//! Attaches the bearer token per request and maps HTTP outcomes onto the
//! error taxonomy: 401 becomes [`Error::Unauthenticated`], other non-2xx
//! statuses become [`Error::Status`], transport failures stay
//! [`Error::Network`]. Retry and caching live a layer above.

use std::time::Duration;

use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::error::{Error, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Client for the operations API.
#[derive(Debug, Clone)]
pub struct ApiClient {
  http: reqwest::Client,
  base: Url,
  token: String,
}

impl ApiClient {
  pub fn new(base_url: &str, token: &str) -> Result<Self> {
    // A trailing slash makes Url::join treat the last path segment as a
    // directory instead of replacing it.
    let normalized = format!("{}/", base_url.trim_end_matches('/'));
    let base = Url::parse(&normalized)
      .map_err(|e| Error::Config(format!("invalid API base URL '{base_url}': {e}")))?;

    let http = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()?;

    Ok(Self {
      http,
      base,
      token: token.to_string(),
    })
  }

  fn request(&self, method: Method, path: &str) -> Result<RequestBuilder> {
    let url = self
      .base
      .join(path)
      .map_err(|e| Error::Config(format!("invalid API path '{path}': {e}")))?;
    Ok(self.http.request(method, url).bearer_auth(&self.token))
  }

  pub async fn get_json<T: DeserializeOwned>(
    &self,
    path: &str,
    query: &[(&str, String)],
  ) -> Result<T> {
    let response = self.request(Method::GET, path)?.query(query).send().await?;
    let response = check_status(response).await?;
    Ok(response.json().await?)
  }

  pub async fn post_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
    let response = self.request(Method::POST, path)?.json(body).send().await?;
    let response = check_status(response).await?;
    Ok(response.json().await?)
  }

  pub async fn patch_json<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
    let response = self.request(Method::PATCH, path)?.json(body).send().await?;
    let response = check_status(response).await?;
    Ok(response.json().await?)
  }

  pub async fn delete(&self, path: &str) -> Result<()> {
    let response = self.request(Method::DELETE, path)?.send().await?;
    check_status(response).await?;
    Ok(())
  }
}

async fn check_status(response: Response) -> Result<Response> {
  let status = response.status();
  if status.is_success() {
    return Ok(response);
  }
  if status == StatusCode::UNAUTHORIZED {
    return Err(Error::Unauthenticated);
  }

  let message = response.text().await.unwrap_or_default();
  Err(Error::Status {
    code: status.as_u16(),
    message: truncate(&message, 200),
  })
}

fn truncate(s: &str, max: usize) -> String {
  if s.len() <= max {
    s.to_string()
  } else {
    let mut end = max;
    while !s.is_char_boundary(end) {
      end -= 1;
    }
    format!("{}…", &s[..end])
  }
}
