//! Direct object-storage upload
//!
//! When an upload destination starts with `s3://`, artifact bytes go
//! straight to the bucket and only the resulting location + checksum are
//! registered with the coordination service. The service issues the agent
//! short-lived credentials usable as header auth against the bucket
//! endpoint; request signing is the service's concern, not replicated here.

use convoy_api::RetryPolicy;
use convoy_core::{AgentError, BucketConfig, Result};
use reqwest::header;
use std::path::Path;

/// A parsed `s3://bucket/prefix` destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketDestination {
    pub bucket: String,
    pub prefix: String,
}

impl BucketDestination {
    /// Whether a destination string addresses object storage.
    pub fn is_bucket_url(destination: &str) -> bool {
        destination.starts_with("s3://")
    }

    /// Parse an `s3://bucket/prefix` destination.
    pub fn parse(destination: &str) -> Result<Self> {
        let rest = destination.strip_prefix("s3://").ok_or_else(|| {
            AgentError::Scope(format!("not an object-storage URL: {}", destination))
        })?;
        let (bucket, prefix) = match rest.split_once('/') {
            Some((bucket, prefix)) => (bucket, prefix.trim_end_matches('/')),
            None => (rest, ""),
        };
        if bucket.is_empty() {
            return Err(AgentError::Scope(format!(
                "object-storage URL has no bucket name: {}",
                destination
            )));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            prefix: prefix.to_string(),
        })
    }

    /// Object key for an artifact path under this destination's prefix.
    pub fn key_for(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }
}

/// Uploads artifact bytes to an S3-compatible bucket
#[derive(Debug, Clone)]
pub struct BucketClient {
    http: reqwest::Client,
    config: BucketConfig,
    policy: RetryPolicy,
    /// Endpoint override for tests; None means the real bucket host
    endpoint: Option<String>,
}

impl BucketClient {
    pub fn new(config: BucketConfig) -> Result<Self> {
        let policy = RetryPolicy::default();
        let http = reqwest::Client::builder()
            .timeout(policy.attempt_timeout)
            .build()
            .map_err(|e| AgentError::Transient(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            http,
            config,
            policy,
            endpoint: None,
        })
    }

    /// Point the client at an alternate endpoint (used by tests).
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into().trim_end_matches('/').to_string());
        self
    }

    fn object_url(&self, destination: &BucketDestination, key: &str) -> String {
        match &self.endpoint {
            Some(endpoint) => format!("{}/{}/{}", endpoint, destination.bucket, key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                destination.bucket, self.config.region, key
            ),
        }
    }

    /// PUT one object streamed from disk, returning its URL. Transient
    /// failures retry with the same backoff policy as the API client; the
    /// file is reopened for each attempt.
    pub async fn put_object(
        &self,
        destination: &BucketDestination,
        key: &str,
        file: &Path,
    ) -> Result<String> {
        let url = self.object_url(destination, key);
        let mut retries = 0u32;

        loop {
            tracing::debug!("PUT {} (attempt {})", url, retries + 1);

            let body = reqwest::Body::from(tokio::fs::File::open(file).await?);
            let outcome = self
                .http
                .put(&url)
                .header("x-amz-acl", &self.config.acl)
                .header("x-amz-access-key-id", &self.config.access_key_id)
                .header("x-amz-secret-access-key", &self.config.secret_access_key)
                .header(header::CONTENT_TYPE, "application/octet-stream")
                .body(body)
                .send()
                .await;

            let err = match outcome {
                Ok(response) if response.status().is_success() => return Ok(url),
                Ok(response) if response.status().as_u16() == 403 => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::Auth(format!(
                        "bucket rejected credentials: {}",
                        body
                    )));
                }
                Ok(response) if response.status().is_server_error() => {
                    AgentError::Transient(format!("bucket error {}", response.status()))
                }
                Ok(response) => {
                    let status = response.status();
                    let body = response.text().await.unwrap_or_default();
                    return Err(AgentError::Protocol(format!(
                        "unexpected bucket response {}: {}",
                        status, body
                    )));
                }
                Err(e) => AgentError::Transient(format!("bucket request failed: {}", e)),
            };

            retries += 1;
            if retries >= self.policy.max_attempts {
                return Err(err);
            }
            tokio::time::sleep(self.policy.delay_for(retries)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;

    #[test]
    fn test_parse_bucket_and_prefix() {
        let dest = BucketDestination::parse("s3://my-artifacts/builds/b-1").unwrap();
        assert_eq!(dest.bucket, "my-artifacts");
        assert_eq!(dest.prefix, "builds/b-1");
        assert_eq!(dest.key_for("log/a.log"), "builds/b-1/log/a.log");
    }

    #[test]
    fn test_parse_bare_bucket() {
        let dest = BucketDestination::parse("s3://my-artifacts").unwrap();
        assert_eq!(dest.prefix, "");
        assert_eq!(dest.key_for("a.log"), "a.log");
    }

    #[test]
    fn test_parse_rejects_non_bucket_urls() {
        assert!(BucketDestination::parse("https://example.com").is_err());
        assert!(BucketDestination::parse("s3://").is_err());
        assert!(BucketDestination::is_bucket_url("s3://x"));
        assert!(!BucketDestination::is_bucket_url("tmp/artifacts"));
    }

    #[tokio::test]
    async fn test_put_object_sends_acl_header() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/my-artifacts/builds/log/a.log")
            .match_header("x-amz-acl", "private")
            .with_status(200)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("a.log");
        std::fs::write(&file, b"data").unwrap();

        let config = BucketConfig::new("AKIA", "secret").with_acl("private");
        let client = BucketClient::new(config).unwrap().with_endpoint(server.url());
        let dest = BucketDestination::parse("s3://my-artifacts/builds").unwrap();

        let url = client
            .put_object(&dest, &dest.key_for("log/a.log"), &file)
            .await
            .unwrap();
        assert!(url.ends_with("/my-artifacts/builds/log/a.log"));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_put_object_auth_failure_is_fatal() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("PUT", "/b/k")
            .with_status(403)
            .expect(1)
            .create_async()
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let file = dir.path().join("k");
        std::fs::write(&file, b"").unwrap();

        let client = BucketClient::new(BucketConfig::new("AKIA", "bad"))
            .unwrap()
            .with_endpoint(server.url());
        let dest = BucketDestination::parse("s3://b").unwrap();

        let err = client.put_object(&dest, "k", &file).await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)));
        mock.assert_async().await;
    }
}
