//! HTTP client seam for token endpoint calls.

use async_trait::async_trait;
use std::time::Duration;

use crate::errors::{codes, MailError, MailResult};

/// Largest token endpoint response accepted.
const MAX_RESPONSE_SIZE: usize = 1024 * 1024;

/// A form POST to a token endpoint.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    /// Endpoint URL.
    pub url: String,
    /// Request headers.
    pub headers: Vec<(String, String)>,
    /// `application/x-www-form-urlencoded` body.
    pub body: String,
    /// Per-request timeout.
    pub timeout: Duration,
}

/// Status and body of a response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body.
    pub body: String,
}

impl HttpResponse {
    /// Returns true for 2xx statuses.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Sends token endpoint requests.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends `request`. Transport failures are connection errors; any
    /// received status is returned as a response.
    async fn send(&self, request: HttpRequest) -> MailResult<HttpResponse>;
}

/// [`HttpTransport`] backed by reqwest.
#[derive(Debug, Clone)]
pub struct ReqwestHttpTransport {
    client: reqwest::Client,
}

impl ReqwestHttpTransport {
    /// Builds a client that never follows redirects.
    pub fn new() -> MailResult<Self> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                MailError::connection(codes::HTTP_REQUEST_FAILED, "failed to build HTTP client").with_cause(e)
            })?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpTransport for ReqwestHttpTransport {
    async fn send(&self, request: HttpRequest) -> MailResult<HttpResponse> {
        let mut builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .header(reqwest::header::ACCEPT, "application/json");
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        let response = builder.body(request.body).send().await.map_err(|e| {
            let err = if e.is_timeout() {
                MailError::timeout(codes::HTTP_REQUEST_FAILED, format!("token endpoint timed out: {}", request.url))
            } else {
                MailError::connection(codes::HTTP_REQUEST_FAILED, format!("token endpoint unreachable: {}", request.url))
            };
            err.with_cause(e)
        })?;

        let status = response.status().as_u16();
        if response.content_length().is_some_and(|len| len as usize > MAX_RESPONSE_SIZE) {
            return Err(MailError::connection(
                codes::HTTP_REQUEST_FAILED,
                "token endpoint response too large",
            ));
        }
        let body = response.text().await.map_err(|e| {
            MailError::connection(codes::HTTP_REQUEST_FAILED, "failed to read token endpoint response").with_cause(e)
        })?;

        Ok(HttpResponse { status, body })
    }
}
