//! # HTTP Retrieval Utilities
//!
//! An asynchronous API client wrapper around `reqwest`, with middleware
//! support for exponential backoff retries and standardized JSON response
//! handling.

use std::time::Duration;

use anyhow::Context;
use reqwest::{header::{AUTHORIZATION, CONTENT_TYPE}, Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{policies::ExponentialBackoff, RetryTransientMiddleware};
use serde::{de::DeserializeOwned, Serialize};

/// Outcome of one request that reached the server.
#[derive(Debug)]
pub enum ApiResponse<T> {
    /// 2xx with a decoded body.
    Success { status: StatusCode, data: T },
    /// Any other status, with whatever body the server sent.
    Failure { status: StatusCode, body: Option<String> },
}

/// A flexible asynchronous HTTP client.
///
/// Built on top of `reqwest_middleware`, it handles base URLs,
/// bearer authentication, request timeouts and automatic retries.
#[derive(Clone)]
pub struct ApiClient {
    /// The underlying middleware-enabled client.
    inner: ClientWithMiddleware,
    /// The base URL to which all relative paths are joined.
    base_url: Url,
    /// An optional Bearer token used for authorization.
    auth_token: Option<String>,
}

impl ApiClient {
    /// Creates a new `ApiClient`.
    ///
    /// # Arguments
    /// * `base_url` - The absolute base URL for the API (e.g., "http://localhost:4000").
    ///   A trailing slash is added when missing so relative paths join under it.
    /// * `auth_token` - An optional string for the Authorization header.
    /// * `max_retries` - Transient-failure retries; `0` sends each request exactly once.
    /// * `timeout` - Per-request network timeout.
    ///
    /// # Errors
    /// Fails if `base_url` is not an absolute URL or the TLS backend cannot be initialized.
    pub fn new(
        base_url: &str,
        auth_token: Option<String>,
        max_retries: u32,
        timeout: Duration,
    ) -> anyhow::Result<Self> {
        let normalized = if base_url.ends_with('/') {
            base_url.to_string()
        } else {
            format!("{}/", base_url)
        };
        let url = Url::parse(&normalized)
            .with_context(|| format!("Invalid base URL (must be absolute): {}", base_url))?;

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        let mut builder = ClientBuilder::new(http);
        if max_retries > 0 {
            let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
            builder = builder.with(RetryTransientMiddleware::new_with_policy(retry_policy));
        }

        Ok(Self {
            inner: builder.build(),
            base_url: url,
            auth_token,
        })
    }

    /// The normalized base URL.
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Sends `body` (if any) as JSON to `path` under the base URL.
    ///
    /// # Errors
    /// URL joining, transport failures and undecodable 2xx bodies are errors.
    /// Non-2xx statuses come back as [`ApiResponse::Failure`].
    pub async fn request<T, B>(&self, method: Method, path: &str, body: Option<&B>) -> anyhow::Result<ApiResponse<T>>
    where
        T: DeserializeOwned,
        B: Serialize + ?Sized,
    {
        let url = self.base_url.join(path.trim_start_matches('/'))?;
        let mut req = self.inner.request(method.clone(), url.clone());

        if let Some(token) = &self.auth_token {
            req = req.header(AUTHORIZATION, format!("Bearer {}", token));
        }
        if let Some(body) = body {
            req = req
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_string(body)?);
        }

        let response = req
            .send()
            .await
            .with_context(|| format!("{} {} failed", method, url))?;
        let status = response.status();

        if status.is_success() {
            let data = response
                .json::<T>()
                .await
                .with_context(|| format!("Undecodable response body from {}", url))?;
            Ok(ApiResponse::Success { status, data })
        } else {
            Ok(ApiResponse::Failure {
                status,
                body: response.text().await.ok(),
            })
        }
    }
}
