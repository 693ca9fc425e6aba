//! Remote service client
//!
//! Thin authenticated HTTP client for the Glimpse API: fetches tunnel tokens,
//! submits builds, and polls build status. Retry loops here are unbounded;
//! the orchestrator imposes the wall-clock ceiling.

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use url::Url;

/// Default API base, overridable for self-hosted deployments.
pub const DEFAULT_API_URL: &str = "https://api.glimpse.dev/v2";

/// Environment variable overriding the API base URL.
pub const ENDPOINT_ENV: &str = "GLIMPSE_API_ENDPOINT";

/// Wait between submit attempts while an earlier build on the same branch is
/// still running.
const CONFLICT_RETRY: Duration = Duration::from_secs(30);

/// Wait between status polls.
const POLL_INTERVAL: Duration = Duration::from_millis(2500);

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Error message reported by the service in a `{"error":{"message"}}`
    /// body.
    #[error("Error: {0}")]
    Remote(String),

    /// Non-2xx response without a structured error body.
    #[error("Error: Response Code {0}")]
    ResponseCode(u16),

    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid API endpoint: {0}")]
    Endpoint(#[from] url::ParseError),

    #[error("API endpoint cannot be used as a base URL")]
    NotABase,
}

impl ApiError {
    /// A build for the same project and branch is still in progress.
    pub fn is_conflict(&self) -> bool {
        matches!(self, ApiError::Remote(message) if message.contains("Conflict"))
    }

    /// The build record is not visible yet; polling should continue.
    pub fn is_build_not_found(&self) -> bool {
        matches!(self, ApiError::Remote(message) if message.contains("Build Not Found"))
    }
}

/// Authentication mode for API requests.
#[derive(Debug, Clone)]
pub enum ApiAuth {
    ApiKey(String),
    Basic { username: String, access_key: String },
}

impl ApiAuth {
    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            ApiAuth::ApiKey(key) => request.header("x-api-key", key),
            ApiAuth::Basic {
                username,
                access_key,
            } => request.basic_auth(username, Some(access_key)),
        }
    }
}

/// Identifiers assigned by the service when a build is created.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct BuildHandle {
    pub project: String,
    pub build: String,
    pub branch: String,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
}

/// Resolve the API base URL from the environment, falling back to the public
/// endpoint.
pub fn default_base_url() -> String {
    std::env::var(ENDPOINT_ENV)
        .ok()
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_API_URL.to_string())
}

pub struct ApiClient {
    http: reqwest::Client,
    base_url: Url,
    auth: ApiAuth,
    conflict_retry: Duration,
    poll_interval: Duration,
}

impl ApiClient {
    pub fn new(auth: ApiAuth) -> Result<ApiClient, ApiError> {
        ApiClient::with_base_url(auth, &default_base_url())
    }

    pub fn with_base_url(auth: ApiAuth, base_url: &str) -> Result<ApiClient, ApiError> {
        Ok(ApiClient {
            http: reqwest::Client::new(),
            base_url: Url::parse(base_url)?,
            auth,
            conflict_retry: CONFLICT_RETRY,
            poll_interval: POLL_INTERVAL,
        })
    }

    /// Shrink the retry intervals. Intended for tests.
    pub fn with_intervals(mut self, conflict_retry: Duration, poll_interval: Duration) -> Self {
        self.conflict_retry = conflict_retry;
        self.poll_interval = poll_interval;
        self
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, ApiError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ApiError::NotABase)?
            .extend(segments);
        Ok(url)
    }

    /// Shared response handling: a `{"error":{"message"}}` body wins over the
    /// status line; otherwise any non-2xx status is an error. Returns the raw
    /// body on success.
    async fn handle(response: reqwest::Response) -> Result<String, ApiError> {
        let status = response.status();
        let body = response.text().await?;
        if body.starts_with("{\"error\":") {
            if let Ok(value) = serde_json::from_str::<Value>(&body) {
                if let Some(message) = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .and_then(Value::as_str)
                {
                    return Err(ApiError::Remote(message.to_string()));
                }
            }
        }
        if !status.is_success() {
            return Err(ApiError::ResponseCode(status.as_u16()));
        }
        Ok(body)
    }

    /// Fetch a tunnel authorization token. The service occasionally responds
    /// without one while a token is being provisioned, so the result is
    /// optional and the caller decides whether to ask again.
    pub async fn get_tunnel_token(&self) -> Result<Option<String>, ApiError> {
        let url = self.endpoint(&["tunnel", "token"])?;
        let response = self.auth.apply(self.http.get(url)).send().await?;
        let body = Self::handle(response).await?;
        let parsed: TokenResponse =
            serde_json::from_str(&body).map_err(|e| ApiError::Remote(e.to_string()))?;
        Ok(parsed.token.filter(|t| !t.is_empty()))
    }

    /// Submit a build. A single attempt; see [`ApiClient::create_build_with_retry`].
    pub async fn create_build(&self, payload: &Value) -> Result<BuildHandle, ApiError> {
        let url = self.endpoint(&["projects"])?;
        let response = self
            .auth
            .apply(self.http.post(url))
            .json(payload)
            .send()
            .await?;
        let body = Self::handle(response).await?;
        serde_json::from_str(&body).map_err(|e| ApiError::Remote(e.to_string()))
    }

    /// Fetch the status text for a build. All identifiers are path-encoded.
    pub async fn get_build_status(&self, handle: &BuildHandle) -> Result<String, ApiError> {
        let url = self.endpoint(&[
            "projects",
            &handle.project,
            "branches",
            &handle.branch,
            "builds",
            &handle.build,
            "status",
        ])?;
        let response = self.auth.apply(self.http.get(url)).send().await?;
        Self::handle(response).await
    }

    /// Submit a build, waiting out conflicts with an in-progress build on the
    /// same branch. Retries indefinitely on conflict; other errors propagate.
    pub async fn create_build_with_retry(&self, payload: &Value) -> Result<BuildHandle, ApiError> {
        retry_on_conflict(self.conflict_retry, || self.create_build(payload)).await
    }

    /// Poll until the build reports a terminal status. Empty status and
    /// not-yet-visible build records mean "still running".
    pub async fn wait_for_build(&self, handle: &BuildHandle) -> Result<String, ApiError> {
        poll_until_status(self.poll_interval, || self.get_build_status(handle)).await
    }
}

/// Run `attempt` until it succeeds or fails with a non-conflict error,
/// sleeping `delay` between attempts.
pub async fn retry_on_conflict<T, F, Fut>(delay: Duration, mut attempt: F) -> Result<T, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ApiError>>,
{
    loop {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_conflict() => {
                tokio::time::sleep(delay).await;
                println!("Existing build still running. Retrying...");
            }
            Err(err) => return Err(err),
        }
    }
}

/// Run `poll` until it yields a non-blank status, sleeping `interval` between
/// polls. A "Build Not Found" error is transient and keeps the loop going.
pub async fn poll_until_status<F, Fut>(interval: Duration, mut poll: F) -> Result<String, ApiError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<String, ApiError>>,
{
    loop {
        match poll().await {
            Ok(status) if !status.trim().is_empty() => return Ok(status),
            Ok(_) => {}
            Err(err) if err.is_build_not_found() => {}
            Err(err) => return Err(err),
        }
        tokio::time::sleep(interval).await;
    }
}
