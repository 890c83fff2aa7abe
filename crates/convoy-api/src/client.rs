//! Authenticated HTTP client with retry and backoff
//!
//! Every call to the coordination service goes through here. The client
//! classifies failures into the agent error taxonomy: connection resets,
//! timeouts, 429 and 5xx are transient and retried with exponential backoff
//! plus jitter up to a bounded attempt count; 401/403 are fatal auth errors
//! surfaced immediately; response bodies that fail to decode are protocol
//! errors for that call only.

use convoy_core::{AgentError, Result};
use rand::Rng;
use reqwest::{header, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_BASE_DELAY_MS: u64 = 500;
const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_ATTEMPT_TIMEOUT_SECS: u64 = 30;

/// A request body that can be rebuilt for every retry attempt
enum Payload {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// Bounded retry policy for transient failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts before surfacing the transient error
    pub max_attempts: u32,
    /// First backoff delay; doubles per retry
    pub base_delay: Duration,
    /// Backoff ceiling
    pub max_delay: Duration,
    /// Per-attempt request timeout
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
            max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
            attempt_timeout: Duration::from_secs(DEFAULT_ATTEMPT_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before the given retry (1-based), with ±50% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let exp = self.base_delay.as_millis() as u64 * (1u64 << retry.saturating_sub(1).min(16));
        let capped = exp.min(self.max_delay.as_millis() as u64);
        let jittered = rand::thread_rng().gen_range(capped / 2..=capped + capped / 2);
        Duration::from_millis(jittered)
    }
}

/// HTTP client for the coordination service
#[derive(Debug, Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
    policy: RetryPolicy,
}

impl ApiClient {
    /// Create a client against the given endpoint, authenticating with the
    /// given agent token.
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Result<Self> {
        Self::with_policy(endpoint, token, RetryPolicy::default())
    }

    /// Create a client with an explicit retry policy.
    pub fn with_policy(
        endpoint: impl Into<String>,
        token: impl Into<String>,
        policy: RetryPolicy,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .map_err(|e| AgentError::Transient(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: endpoint.into().trim_end_matches('/').to_string(),
            token: token.into(),
            policy,
        })
    }

    /// Base URL this client talks to
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// GET a JSON resource
    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.request(Method::GET, path, None).await?;
        decode(&body)
    }

    /// GET a JSON resource that may legitimately be absent.
    ///
    /// 204 and 404 map to `None` — used by `jobs/next`, where an empty
    /// response means "no work for you".
    pub async fn get_optional<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        match self.request(Method::GET, path, None).await {
            Ok(body) if body.is_empty() => Ok(None),
            Ok(body) => decode(&body).map(Some),
            Err(AgentError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// POST a JSON body, expecting a JSON response
    pub async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let body = serde_json::to_vec(body)?;
        let response = self.request(Method::POST, path, Some(body)).await?;
        decode(&response)
    }

    /// POST a JSON body, ignoring the response body
    pub async fn post_unit<B: Serialize>(&self, path: &str, body: &B) -> Result<()> {
        let body = serde_json::to_vec(body)?;
        self.request(Method::POST, path, Some(body)).await?;
        Ok(())
    }

    /// POST a JSON body where a 409 means we lost a conditional update.
    ///
    /// Returns `None` on conflict — used for job claims, where another agent
    /// winning the claim is an expected outcome, not an error.
    pub async fn post_conditional<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<Option<T>> {
        let body = serde_json::to_vec(body)?;
        match self.request(Method::POST, path, Some(body)).await {
            Ok(response) => decode(&response).map(Some),
            Err(AgentError::Protocol(msg)) if msg.starts_with("conflict") => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// GET raw bytes, e.g. artifact content. Accepts a path or absolute URL.
    pub async fn get_bytes(&self, path_or_url: &str) -> Result<Vec<u8>> {
        self.request_url(Method::GET, &self.absolute(path_or_url), None, None)
            .await
    }

    /// Upload a file's contents, streamed from disk rather than buffered
    /// in memory. Accepts a path or absolute URL. The file is reopened for
    /// each retry attempt.
    pub async fn post_file(&self, path_or_url: &str, file: &Path, content_type: &str) -> Result<()> {
        self.request_url(
            Method::POST,
            &self.absolute(path_or_url),
            Some(Payload::File(file.to_path_buf())),
            Some(content_type.to_string()),
        )
        .await?;
        Ok(())
    }

    fn absolute(&self, path_or_url: &str) -> String {
        if path_or_url.starts_with("http://") || path_or_url.starts_with("https://") {
            path_or_url.to_string()
        } else {
            format!("{}{}", self.base_url, path_or_url)
        }
    }

    async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<Vec<u8>> {
        let url = format!("{}{}", self.base_url, path);
        let content_type = body.as_ref().map(|_| "application/json".to_string());
        self.request_url(method, &url, body.map(Payload::Bytes), content_type)
            .await
    }

    /// Retry loop shared by every request. Builds a fresh request per
    /// attempt so bodies can be resent; file payloads are reopened and
    /// streamed, never buffered whole.
    async fn request_url(
        &self,
        method: Method,
        url: &str,
        body: Option<Payload>,
        content_type: Option<String>,
    ) -> Result<Vec<u8>> {
        let mut retries = 0u32;

        loop {
            tracing::debug!("{} {} (attempt {})", method, url, retries + 1);

            let mut request = self
                .http
                .request(method.clone(), url)
                .header(header::AUTHORIZATION, format!("Bearer {}", self.token));
            if let Some(ref ct) = content_type {
                request = request.header(header::CONTENT_TYPE, ct.clone());
            }
            match &body {
                Some(Payload::Bytes(bytes)) => request = request.body(bytes.clone()),
                Some(Payload::File(path)) => {
                    let file = tokio::fs::File::open(path).await?;
                    request = request.body(reqwest::Body::from(file));
                }
                None => {}
            }

            let outcome = match request.send().await {
                Ok(response) => self.classify(response).await,
                Err(e) if e.is_timeout() => Err(AgentError::Transient(format!(
                    "request to {} timed out",
                    url
                ))),
                Err(e) => Err(AgentError::Transient(format!("request failed: {}", e))),
            };

            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(e) if e.is_transient() => {
                    retries += 1;
                    if retries >= self.policy.max_attempts {
                        tracing::error!(
                            "{} {} failed after {} attempts: {}",
                            method,
                            url,
                            retries,
                            e
                        );
                        return Err(e);
                    }
                    let delay = self.policy.delay_for(retries);
                    tracing::warn!(
                        "{} {} failed ({}), retry {}/{} in {:?}",
                        method,
                        url,
                        e,
                        retries,
                        self.policy.max_attempts - 1,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Map a response status onto the error taxonomy.
    async fn classify(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();

        if status.is_success() {
            let bytes = response
                .bytes()
                .await
                .map_err(|e| AgentError::Transient(format!("failed to read body: {}", e)))?;
            return Ok(bytes.to_vec());
        }

        let body = response.text().await.unwrap_or_default();

        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AgentError::Auth(format!(
                "service rejected agent token ({}): {}",
                status, body
            ))),
            StatusCode::NOT_FOUND => Err(AgentError::NotFound(body)),
            StatusCode::CONFLICT => Err(AgentError::Protocol(format!("conflict: {}", body))),
            StatusCode::TOO_MANY_REQUESTS => {
                Err(AgentError::Transient(format!("rate limited: {}", body)))
            }
            s if s.is_server_error() => Err(AgentError::Transient(format!(
                "server error {}: {}",
                status, body
            ))),
            _ => Err(AgentError::Protocol(format!(
                "unexpected response {}: {}",
                status, body
            ))),
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8]) -> Result<T> {
    serde_json::from_slice(body).map_err(|e| {
        AgentError::Protocol(format!(
            "failed to decode response: {} (body: {})",
            e,
            String::from_utf8_lossy(&body[..body.len().min(200)])
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde::Deserialize;

    #[derive(Debug, Deserialize)]
    struct Ping {
        message: String,
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            attempt_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_get_sends_bearer_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/ping")
            .match_header("authorization", "Bearer tok-123")
            .with_status(200)
            .with_body(r#"{"message":"pong"}"#)
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok-123").unwrap();
        let ping: Ping = client.get("/ping").await.unwrap();
        assert_eq!(ping.message, "pong");
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let mut server = Server::new_async().await;
        let failing = server
            .mock("GET", "/flaky")
            .with_status(503)
            .with_body("unavailable")
            .expect(1)
            .create_async()
            .await;
        let ok = server
            .mock("GET", "/flaky")
            .with_status(200)
            .with_body(r#"{"message":"recovered"}"#)
            .create_async()
            .await;

        let client = ApiClient::with_policy(server.url(), "tok", fast_policy()).unwrap();
        let ping: Ping = client.get("/flaky").await.unwrap();
        assert_eq!(ping.message, "recovered");
        failing.assert_async().await;
        ok.assert_async().await;
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/down")
            .with_status(500)
            .expect(3)
            .create_async()
            .await;

        let client = ApiClient::with_policy(server.url(), "tok", fast_policy()).unwrap();
        let result: Result<Ping> = client.get("/down").await;
        assert!(matches!(result, Err(AgentError::Transient(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_auth_error_is_not_retried() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/secret")
            .with_status(401)
            .with_body("bad token")
            .expect(1)
            .create_async()
            .await;

        let client = ApiClient::with_policy(server.url(), "bad", fast_policy()).unwrap();
        let result: Result<Ping> = client.get("/secret").await;
        assert!(matches!(result, Err(AgentError::Auth(_))));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_optional_maps_404_to_none() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/jobs/next")
            .with_status(404)
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let job: Option<Ping> = client.get_optional("/jobs/next").await.unwrap();
        assert!(job.is_none());
    }

    #[tokio::test]
    async fn test_post_conditional_maps_conflict_to_none() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/jobs/next")
            .with_status(409)
            .with_body("already claimed")
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let claimed: Option<Ping> = client
            .post_conditional("/jobs/next", &serde_json::json!({}))
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_malformed_body_is_protocol_error() {
        let mut server = Server::new_async().await;
        server
            .mock("GET", "/garbled")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let result: Result<Ping> = client.get("/garbled").await;
        assert!(matches!(result, Err(AgentError::Protocol(_))));
    }

    #[test]
    fn test_backoff_is_capped_and_jittered() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            attempt_timeout: Duration::from_secs(1),
        };
        for retry in 1..20 {
            let delay = policy.delay_for(retry);
            // at the cap, jitter keeps us within ±50%
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(1500));
        }
    }
}
