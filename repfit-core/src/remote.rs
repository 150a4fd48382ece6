//! The remote API seam.
//!
//! The engine talks to the server only through [`RemoteClient`], so tests can
//! substitute a scripted client. [`HttpRemoteClient`] is the reqwest-backed
//! implementation used by the binaries.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use serde_json::Value;

use crate::error::RemoteError;

/// Longest server error body kept in an error message.
const MAX_ERROR_BODY: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Post,
    Put,
    Delete,
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
        })
    }
}

/// Sends one request to the server and returns its decoded JSON body
/// (`Value::Null` for an empty body).
pub trait RemoteClient: Send + Sync + 'static {
    fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
    ) -> impl Future<Output = Result<Value, RemoteError>> + Send;
}

#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRemoteClient {
    pub fn new(
        base_url: impl Into<String>,
        api_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::Transient(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'))
    }
}

fn transport_error(err: reqwest::Error) -> RemoteError {
    if err.is_timeout() {
        RemoteError::Transient(format!("request timed out: {}", err))
    } else if err.is_connect() {
        RemoteError::Transient(format!("connection failed: {}", err))
    } else {
        RemoteError::Transient(err.to_string())
    }
}

impl RemoteClient for HttpRemoteClient {
    async fn send(
        &self,
        endpoint: &str,
        method: Method,
        body: Option<&Value>,
    ) -> Result<Value, RemoteError> {
        let url = self.url(endpoint);
        let mut request = match method {
            Method::Post => self.client.post(&url),
            Method::Put => self.client.put(&url),
            Method::Delete => self.client.delete(&url),
        };
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {}", key));
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        tracing::debug!("{} {}", method, url);
        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let text = response.text().await.map_err(transport_error)?;

        if !status.is_success() {
            let message = if text.trim().is_empty() {
                status.canonical_reason().unwrap_or("no reason").to_string()
            } else {
                text.chars().take(MAX_ERROR_BODY).collect()
            };
            return Err(RemoteError::from_status(status.as_u16(), message));
        }

        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(|e| RemoteError::Rejected {
            status: status.as_u16(),
            message: format!("unreadable response body: {}", e),
        })
    }
}
