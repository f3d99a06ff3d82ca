use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use futures_util::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncWriteExt;

const MAX_ATTEMPTS: usize = 5;
const RETRY_BASE_DELAY_MS: u64 = 300;
const MAX_BACKOFF_SECS: u64 = 8;
const REQUEST_TIMEOUT_SECS: u64 = 300;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request to {url} failed ({status}): {body}")]
    Status {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("request to {url} failed: {source}")]
    Network {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Which failures a request may be resent after.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Reads and writes that overwrite: resending cannot change the outcome.
    Idempotent,
    /// Appends: resend only when the server cannot have applied the request.
    Unapplied,
}

impl ApiError {
    fn is_retryable(&self, retry: Retry) -> bool {
        match (self, retry) {
            (ApiError::Status { status, .. }, _) if *status == StatusCode::TOO_MANY_REQUESTS => true,
            (ApiError::Status { status, .. }, Retry::Idempotent) => status.is_server_error(),
            (ApiError::Status { .. }, Retry::Unapplied) => false,
            (ApiError::Network { .. }, Retry::Idempotent) => true,
            (ApiError::Network { source, .. }, Retry::Unapplied) => source.is_connect(),
        }
    }
}

#[derive(Debug, Clone)]
enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
}

/// JSON-over-HTTP client shared by the MLflow and Neptune backends.
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: Client,
    base_url: String,
    auth: Auth,
}

impl ApiClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .user_agent(concat!("neptune-mlflow/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            auth: Auth::None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth = Auth::Bearer(token.into());
        self
    }

    pub fn with_basic_auth(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.auth = Auth::Basic {
            username: username.into(),
            password: password.into(),
        };
        self
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.url(path);
        let response = self.send(&url, Retry::Idempotent, || self.http.get(&url)).await?;
        parse_json(response, &url).await
    }

    pub async fn get_with_headers<T: DeserializeOwned>(
        &self,
        path: &str,
        headers: &[(&str, &str)],
    ) -> Result<T> {
        let url = self.url(path);
        let response = self
            .send(&url, Retry::Idempotent, || {
                headers
                    .iter()
                    .fold(self.http.get(&url), |req, (name, value)| req.header(*name, *value))
            })
            .await?;
        parse_json(response, &url).await
    }

    /// POST a JSON body that is safe to resend (searches, lookups).
    pub async fn post<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T> {
        self.post_with(path, body, Retry::Idempotent).await
    }

    pub async fn post_with<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
        retry: Retry,
    ) -> Result<T> {
        let url = self.url(path);
        let response = self.send(&url, retry, || self.http.post(&url).json(body)).await?;
        parse_json(response, &url).await
    }

    /// POST a write and discard the response payload. Only resent when unapplied.
    pub async fn post_unit<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> Result<()> {
        let url = self.url(path);
        self.send(&url, Retry::Unapplied, || self.http.post(&url).json(body))
            .await?;
        Ok(())
    }

    /// Upload `bytes` to a path that stores them whole; resending overwrites.
    pub async fn post_bytes(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.url(path);
        self.send(&url, Retry::Idempotent, || {
            self.http
                .post(&url)
                .header("content-type", "application/octet-stream")
                .body(bytes.clone())
        })
        .await?;
        Ok(())
    }

    /// PUT raw bytes to a path that stores them whole.
    pub async fn put_bytes(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        let url = self.url(path);
        self.send(&url, Retry::Idempotent, || {
            self.http
                .put(&url)
                .header("content-type", "application/octet-stream")
                .body(bytes.clone())
        })
        .await?;
        Ok(())
    }

    /// Stream the response body of `path` into `dest`, returning the number of bytes written.
    pub async fn download(&self, path: &str, dest: &Path) -> Result<u64> {
        let url = self.url(path);
        let response = self.send(&url, Retry::Idempotent, || self.http.get(&url)).await?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("failed to create {}", dest.display()))?;

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.with_context(|| format!("failed to read body of {url}"))?;
            file.write_all(&chunk)
                .await
                .with_context(|| format!("failed to write {}", dest.display()))?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        Ok(written)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
        }
    }

    async fn send<F>(&self, url: &str, retry: Retry, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let attempt_counter = AtomicUsize::new(0);
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(RETRY_BASE_DELAY_MS))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_secs(MAX_BACKOFF_SECS))
            .with_max_elapsed_time(None)
            .build();

        let attempts = &attempt_counter;
        let build = &build;
        let result = retry_notify(
            backoff,
            move || async move {
                let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                let outcome = match self.authorize(build()).send().await {
                    Ok(response) if response.status().is_success() => return Ok(response),
                    Ok(response) => {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        ApiError::Status {
                            url: url.to_string(),
                            status,
                            body,
                        }
                    }
                    Err(source) => ApiError::Network {
                        url: url.to_string(),
                        source,
                    },
                };

                if outcome.is_retryable(retry) && attempt < MAX_ATTEMPTS {
                    Err(BackoffError::transient(anyhow::Error::new(outcome)))
                } else {
                    Err(BackoffError::permanent(anyhow::Error::new(outcome)))
                }
            },
            |err: anyhow::Error, delay: Duration| {
                tracing::debug!(%url, ?delay, "retrying request: {err}");
            },
        )
        .await;

        result.map_err(|err| {
            let attempts = attempt_counter.load(Ordering::Relaxed).max(1);
            err.context(format!("{url} failed after {attempts} attempt(s)"))
        })
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response, url: &str) -> Result<T> {
    let text = response
        .text()
        .await
        .with_context(|| format!("failed to read response from {url}"))?;
    serde_json::from_str(&text).with_context(|| format!("failed to parse response from {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_joins_without_double_slash() {
        let client = ApiClient::new("http://localhost:5000/").unwrap();
        assert_eq!(
            client.url("/api/2.0/mlflow/experiments/search"),
            "http://localhost:5000/api/2.0/mlflow/experiments/search"
        );
    }

    fn status_error(status: StatusCode) -> ApiError {
        ApiError::Status {
            url: "u".into(),
            status,
            body: String::new(),
        }
    }

    #[test]
    fn server_errors_are_retried_only_for_idempotent_requests() {
        let err = status_error(StatusCode::BAD_GATEWAY);
        assert!(err.is_retryable(Retry::Idempotent));
        assert!(!err.is_retryable(Retry::Unapplied));
    }

    #[test]
    fn throttling_is_always_retryable() {
        let err = status_error(StatusCode::TOO_MANY_REQUESTS);
        assert!(err.is_retryable(Retry::Idempotent));
        assert!(err.is_retryable(Retry::Unapplied));
    }

    #[test]
    fn client_errors_are_not_retryable() {
        let err = status_error(StatusCode::NOT_FOUND);
        assert!(!err.is_retryable(Retry::Idempotent));
        assert!(!err.is_retryable(Retry::Unapplied));
    }

    #[tokio::test]
    async fn appends_are_resent_only_after_connect_failures() {
        let http = Client::new();

        let refused = http.get("http://127.0.0.1:1/").send().await.unwrap_err();
        assert!(refused.is_connect());
        let err = ApiError::Network {
            url: "u".into(),
            source: refused,
        };
        assert!(err.is_retryable(Retry::Unapplied));

        let malformed = http.get("http://exa mple/").send().await.unwrap_err();
        assert!(!malformed.is_connect());
        let err = ApiError::Network {
            url: "u".into(),
            source: malformed,
        };
        assert!(err.is_retryable(Retry::Idempotent));
        assert!(!err.is_retryable(Retry::Unapplied));
    }
}
