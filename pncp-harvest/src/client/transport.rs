//! Transport seam between the rate-governed client and the network
//!
//! The client owns quotas, retries, and the breaker; the transport only
//! performs a single HTTP GET. Keeping the seam this narrow lets tests
//! drive the whole pipeline with scripted transports.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// A single request against the consultation API
#[derive(Debug, Clone)]
pub struct ApiRequest {
    /// Path below the API base URL, e.g. `/v1/tenders/published`
    pub path: String,
    pub query: Vec<(String, String)>,
}

impl ApiRequest {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            query: Vec::new(),
        }
    }

    pub fn with(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }
}

/// Raw response: status plus body, uninterpreted
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
}

/// Failures below the HTTP layer
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("network error: {0}")]
    Network(String),
}

/// Issues one HTTP GET. Implementations must be shareable across the
/// concurrent stage tasks.
pub trait Transport: Send + Sync {
    fn send(
        &self,
        req: ApiRequest,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send;
}

/// reqwest-backed transport used by the binary
pub struct HttpTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// # Panics
    /// Panics if the HTTP client cannot be built (should not happen with
    /// valid config)
    pub fn new(base_url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(5))
            .user_agent(concat!("pncp-harvest/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("Failed to build HTTP client");

        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl Transport for HttpTransport {
    fn send(
        &self,
        req: ApiRequest,
    ) -> impl Future<Output = Result<RawResponse, TransportError>> + Send {
        async move {
            let url = format!("{}{}", self.base_url, req.path);
            let response = self
                .client
                .get(&url)
                .query(&req.query)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        TransportError::Timeout
                    } else {
                        TransportError::Network(e.to_string())
                    }
                })?;

            let status = response.status().as_u16();
            let body = response
                .text()
                .await
                .map_err(|e| TransportError::Network(e.to_string()))?;

            Ok(RawResponse { status, body })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_builder_collects_query_pairs() {
        let req = ApiRequest::new("/v1/tenders/published")
            .with("page", 3)
            .with("modality", 6);
        assert_eq!(req.path, "/v1/tenders/published");
        assert_eq!(req.query.len(), 2);
        assert_eq!(req.query[0], ("page".to_string(), "3".to_string()));
    }
}
