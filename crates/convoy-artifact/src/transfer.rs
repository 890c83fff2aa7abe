//! Artifact upload and download
//!
//! Each file in a batch is an independent transfer unit: one file failing
//! (after its own retries) never aborts the rest, and the batch outcome is
//! reported per file through the `TransferSession`. Upload bodies stream
//! from disk rather than buffering whole files in memory. Downloads verify
//! byte count and SHA-1 against the artifact record before a file counts
//! as delivered.

use crate::bucket::{BucketClient, BucketDestination};
use crate::checksum::{sha1_bytes, sha1_file};
use crate::index::{ArtifactIndex, ResolveMode};
use convoy_api::wire::ArtifactUploadRequest;
use convoy_api::ApiClient;
use convoy_core::{AgentError, ArtifactRecord, Result, SearchQuery, TransferSession};
use std::path::{Path, PathBuf};

/// Build/job identity an upload registers its artifacts under
#[derive(Debug, Clone)]
pub struct UploadScope {
    pub build_id: String,
    pub job_id: String,
}

/// Upload every file matching `pattern` under `working_dir`.
///
/// Destination is either the coordination service (default) or an
/// `s3://bucket/prefix` URL, in which case bytes go straight to the bucket
/// and only location + checksum are registered with the service.
pub async fn upload(
    client: &ApiClient,
    bucket: Option<&BucketClient>,
    working_dir: &Path,
    pattern: &str,
    destination: Option<&str>,
    scope: &UploadScope,
) -> Result<(Vec<ArtifactRecord>, TransferSession)> {
    let files = expand_glob(working_dir, pattern)?;
    if files.is_empty() {
        return Err(AgentError::NotFound(format!(
            "no local files match \"{}\"",
            pattern
        )));
    }

    let bucket_dest = match destination {
        Some(dest) if BucketDestination::is_bucket_url(dest) => Some(BucketDestination::parse(dest)?),
        _ => None,
    };
    if bucket_dest.is_some() && bucket.is_none() {
        return Err(AgentError::Auth(
            "destination is an object-storage URL but no bucket credentials are configured".into(),
        ));
    }

    tracing::info!(
        "Uploading {} artifact(s) for job {} in build {}",
        files.len(),
        scope.job_id,
        scope.build_id
    );

    let mut session = TransferSession::start(files.clone());
    let mut records = Vec::new();

    for (local, remote) in &files {
        match upload_one(client, bucket, bucket_dest.as_ref(), local, remote, scope).await {
            Ok(record) => {
                session.record_success(record.file_size);
                records.push(record);
            }
            Err(e) => {
                tracing::error!("Failed to upload {}: {}", remote, e);
                session.record_failure(remote.clone(), e.to_string());
            }
        }
    }

    Ok((records, session))
}

async fn upload_one(
    client: &ApiClient,
    bucket: Option<&BucketClient>,
    bucket_dest: Option<&BucketDestination>,
    local: &Path,
    remote: &str,
    scope: &UploadScope,
) -> Result<ArtifactRecord> {
    let sha1sum = sha1_file(local).await?;
    let file_size = tokio::fs::metadata(local).await?.len();

    let url = match (bucket, bucket_dest) {
        (Some(bucket), Some(dest)) => {
            // Bytes bypass the service entirely on this path.
            Some(bucket.put_object(dest, &dest.key_for(remote), local).await?)
        }
        _ => None,
    };
    let direct = url.is_some();

    let request = ArtifactUploadRequest {
        job_id: scope.job_id.clone(),
        path: remote.to_string(),
        file_size,
        sha1sum,
        url,
    };
    let record: ArtifactRecord = client
        .post(&format!("/builds/{}/artifacts", scope.build_id), &request)
        .await?;

    if !direct {
        client
            .post_file(
                &format!("/artifacts/{}/content", record.id),
                local,
                "application/octet-stream",
            )
            .await?;
    }

    tracing::debug!("Uploaded {} ({} bytes)", remote, file_size);
    Ok(record)
}

/// Download every artifact matching `query` under `dest_dir`, preserving
/// each artifact's relative path. Multi-job matches are accepted (union).
pub async fn download(
    client: &ApiClient,
    query: &SearchQuery,
    dest_dir: &Path,
) -> Result<(Vec<PathBuf>, TransferSession)> {
    let records = ArtifactIndex::new(client).resolve(query, ResolveMode::Many).await?;

    tracing::info!("Downloading {} artifact(s) to {}", records.len(), dest_dir.display());

    let mut session = TransferSession::start(
        records
            .iter()
            .map(|r| (dest_dir.join(&r.path), r.path.clone()))
            .collect(),
    );
    let mut paths = Vec::new();

    for record in &records {
        match download_one(client, record, dest_dir, &mut session).await {
            Ok(path) => {
                session.record_success(record.file_size);
                paths.push(path);
            }
            Err(e) => {
                tracing::error!("Failed to download {}: {}", record.path, e);
                session.record_failure(record.path.clone(), e.to_string());
            }
        }
    }

    Ok((paths, session))
}

async fn download_one(
    client: &ApiClient,
    record: &ArtifactRecord,
    dest_dir: &Path,
    session: &mut TransferSession,
) -> Result<PathBuf> {
    // One verification retry per file; a corrupted fetch is refetched once
    // before the file is failed.
    let mut last_err = None;
    for attempt in 0..2 {
        match fetch_verified(client, record).await {
            Ok(bytes) => {
                let path = dest_dir.join(&record.path);
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, &bytes).await?;
                tracing::debug!("Downloaded {} ({} bytes)", record.path, bytes.len());
                return Ok(path);
            }
            Err(e @ AgentError::Integrity(_)) => {
                if attempt == 0 {
                    tracing::warn!("{}; refetching once", e);
                    session.record_retry();
                }
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| AgentError::Integrity(format!("{}: verification failed", record.path))))
}

async fn fetch_verified(client: &ApiClient, record: &ArtifactRecord) -> Result<Vec<u8>> {
    let bytes = match &record.url {
        Some(url) => client.get_bytes(url).await?,
        None => {
            client
                .get_bytes(&format!("/artifacts/{}/content", record.id))
                .await?
        }
    };

    if bytes.len() as u64 != record.file_size {
        return Err(AgentError::Integrity(format!(
            "{}: expected {} bytes, got {}",
            record.path,
            record.file_size,
            bytes.len()
        )));
    }
    if !record.sha1sum.is_empty() {
        let actual = sha1_bytes(&bytes);
        if actual != record.sha1sum {
            return Err(AgentError::Integrity(format!(
                "{}: checksum mismatch (expected {}, got {})",
                record.path, record.sha1sum, actual
            )));
        }
    }
    Ok(bytes)
}

/// Print-ready SHA-1 for a query that must resolve to exactly one artifact.
pub async fn shasum(client: &ApiClient, query: &SearchQuery) -> Result<String> {
    let records = ArtifactIndex::new(client).resolve(query, ResolveMode::Single).await?;
    // Single mode guarantees exactly one record here.
    Ok(records[0].sha1sum.clone())
}

/// Expand a glob pattern under `working_dir` into (absolute local path,
/// relative remote path) pairs. Only regular files are kept.
fn expand_glob(working_dir: &Path, pattern: &str) -> Result<Vec<(PathBuf, String)>> {
    let full_pattern = working_dir.join(pattern);
    let matches = glob::glob(&full_pattern.to_string_lossy())
        .map_err(|e| AgentError::NotFound(format!("bad glob pattern \"{}\": {}", pattern, e)))?;

    let mut files = Vec::new();
    for entry in matches {
        let path = entry.map_err(|e| AgentError::Io(e.into_error()))?;
        if !path.is_file() {
            continue;
        }
        let remote = path
            .strip_prefix(working_dir)
            .unwrap_or(&path)
            .to_string_lossy()
            .replace('\\', "/");
        files.push((path, remote));
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Server};
    use tempfile::TempDir;

    fn scope() -> UploadScope {
        UploadScope {
            build_id: "b-1".to_string(),
            job_id: "job-1".to_string(),
        }
    }

    async fn fixture_tree() -> TempDir {
        let dir = TempDir::new().unwrap();
        tokio::fs::create_dir_all(dir.path().join("log/sub")).await.unwrap();
        tokio::fs::write(dir.path().join("log/a.log"), b"ten bytes!").await.unwrap();
        tokio::fs::write(dir.path().join("log/sub/b.log"), b"").await.unwrap();
        dir
    }

    fn record_body(id: &str, path: &str, size: u64, sha1: &str) -> String {
        format!(
            r#"{{"id":"{}","build_id":"b-1","job_id":"job-1","path":"{}","file_size":{},"sha1sum":"{}"}}"#,
            id, path, size, sha1
        )
    }

    #[tokio::test]
    async fn test_upload_registers_each_matched_file() {
        let dir = fixture_tree().await;
        let mut server = Server::new_async().await;

        let sha_a = sha1_bytes(b"ten bytes!");
        let sha_b = sha1_bytes(b"");

        let register_a = server
            .mock("POST", "/builds/b-1/artifacts")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "path": "log/a.log", "file_size": 10, "sha1sum": sha_a,
            })))
            .with_status(200)
            .with_body(record_body("art-a", "log/a.log", 10, &sha_a))
            .create_async()
            .await;
        let register_b = server
            .mock("POST", "/builds/b-1/artifacts")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "path": "log/sub/b.log", "file_size": 0, "sha1sum": sha_b,
            })))
            .with_status(200)
            .with_body(record_body("art-b", "log/sub/b.log", 0, &sha_b))
            .create_async()
            .await;
        let content_a = server
            .mock("POST", "/artifacts/art-a/content")
            .with_status(200)
            .create_async()
            .await;
        let content_b = server
            .mock("POST", "/artifacts/art-b/content")
            .with_status(200)
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let (records, session) = upload(&client, None, dir.path(), "log/**/*.log", None, &scope())
            .await
            .unwrap();

        assert_eq!(records.len(), 2);
        assert!(session.is_success());
        assert_eq!(session.bytes_transferred, 10);
        register_a.assert_async().await;
        register_b.assert_async().await;
        content_a.assert_async().await;
        content_b.assert_async().await;
    }

    #[tokio::test]
    async fn test_upload_no_matches_is_not_found() {
        let dir = TempDir::new().unwrap();
        let server = Server::new_async().await;
        let client = ApiClient::new(server.url(), "tok").unwrap();

        let err = upload(&client, None, dir.path(), "nothing/*.bin", None, &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_upload_bucket_destination_requires_credentials() {
        let dir = fixture_tree().await;
        let server = Server::new_async().await;
        let client = ApiClient::new(server.url(), "tok").unwrap();

        let err = upload(&client, None, dir.path(), "log/a.log", Some("s3://bkt/x"), &scope())
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)));
    }

    #[tokio::test]
    async fn test_upload_partial_failure_is_per_file() {
        let dir = fixture_tree().await;
        let mut server = Server::new_async().await;
        let sha_a = sha1_bytes(b"ten bytes!");
        let sha_b = sha1_bytes(b"");

        server
            .mock("POST", "/builds/b-1/artifacts")
            .match_body(Matcher::PartialJson(serde_json::json!({"path": "log/a.log"})))
            .with_status(200)
            .with_body(record_body("art-a", "log/a.log", 10, &sha_a))
            .create_async()
            .await;
        server
            .mock("POST", "/artifacts/art-a/content")
            .with_status(200)
            .create_async()
            .await;
        // registration of the second file is rejected outright
        server
            .mock("POST", "/builds/b-1/artifacts")
            .match_body(Matcher::PartialJson(serde_json::json!({"path": "log/sub/b.log"})))
            .with_status(422)
            .with_body("path rejected")
            .create_async()
            .await;
        let _ = sha_b;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let (records, session) = upload(&client, None, dir.path(), "log/**/*.log", None, &scope())
            .await
            .unwrap();

        assert_eq!(records.len(), 1);
        assert!(!session.is_success());
        assert_eq!(session.failed.len(), 1);
        assert_eq!(session.failed[0].0, "log/sub/b.log");
    }

    #[tokio::test]
    async fn test_download_recreates_relative_paths() {
        let mut server = Server::new_async().await;
        let sha_a = sha1_bytes(b"ten bytes!");
        let sha_b = sha1_bytes(b"");
        let body = format!(
            "[{},{}]",
            record_body("art-a", "log/a.log", 10, &sha_a),
            record_body("art-b", "log/sub/b.log", 0, &sha_b)
        );
        server
            .mock("GET", "/builds/b-1/artifacts/search?query=log/**/*.log")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;
        server
            .mock("GET", "/artifacts/art-a/content")
            .with_status(200)
            .with_body("ten bytes!")
            .create_async()
            .await;
        server
            .mock("GET", "/artifacts/art-b/content")
            .with_status(200)
            .with_body("")
            .create_async()
            .await;

        let dest = TempDir::new().unwrap();
        let client = ApiClient::new(server.url(), "tok").unwrap();
        let query = SearchQuery::new("log/**/*.log").with_build("b-1");

        let (paths, session) = download(&client, &query, dest.path()).await.unwrap();

        assert_eq!(paths.len(), 2);
        assert!(session.is_success());
        let a = tokio::fs::read(dest.path().join("log/a.log")).await.unwrap();
        assert_eq!(a, b"ten bytes!");
        let b = tokio::fs::read(dest.path().join("log/sub/b.log")).await.unwrap();
        assert!(b.is_empty());
    }

    #[tokio::test]
    async fn test_corrupted_download_surfaces_integrity_error() {
        let mut server = Server::new_async().await;
        let sha = sha1_bytes(b"ten bytes!");
        server
            .mock("GET", "/builds/b-1/artifacts/search?query=log/a.log")
            .with_status(200)
            .with_body(format!("[{}]", record_body("art-a", "log/a.log", 10, &sha)))
            .create_async()
            .await;
        // right length, wrong content, on both the fetch and the one retry
        let content = server
            .mock("GET", "/artifacts/art-a/content")
            .with_status(200)
            .with_body("ten bytes?")
            .expect(2)
            .create_async()
            .await;

        let dest = TempDir::new().unwrap();
        let client = ApiClient::new(server.url(), "tok").unwrap();
        let query = SearchQuery::new("log/a.log").with_build("b-1");

        let (paths, session) = download(&client, &query, dest.path()).await.unwrap();
        assert!(paths.is_empty());
        assert!(!session.is_success());
        assert!(session.failed[0].1.contains("checksum mismatch"));
        assert_eq!(session.retries, 1);
        content.assert_async().await;
    }

    #[tokio::test]
    async fn test_shasum_returns_bare_digest() {
        let mut server = Server::new_async().await;
        let sha = sha1_bytes(b"release");
        server
            .mock("GET", "/builds/b-1/artifacts/search?query=pkg/release.tar.gz")
            .with_status(200)
            .with_body(format!(
                "[{}]",
                record_body("art-r", "pkg/release.tar.gz", 7, &sha)
            ))
            .create_async()
            .await;

        let client = ApiClient::new(server.url(), "tok").unwrap();
        let query = SearchQuery::new("pkg/release.tar.gz").with_build("b-1");
        assert_eq!(shasum(&client, &query).await.unwrap(), sha);
    }

    #[tokio::test]
    async fn test_upload_to_bucket_registers_location_only() {
        let dir = fixture_tree().await;
        let mut api = Server::new_async().await;
        let mut store = Server::new_async().await;
        let sha_a = sha1_bytes(b"ten bytes!");

        let object = store
            .mock("PUT", "/bkt/job-1/log/a.log")
            .with_status(200)
            .create_async()
            .await;
        let register = api
            .mock("POST", "/builds/b-1/artifacts")
            .match_body(Matcher::PartialJson(serde_json::json!({
                "path": "log/a.log",
                "url": format!("{}/bkt/job-1/log/a.log", store.url()),
            })))
            .with_status(200)
            .with_body(record_body("art-a", "log/a.log", 10, &sha_a))
            .create_async()
            .await;
        // no /artifacts/{id}/content call on the bucket path
        let content = api
            .mock("POST", "/artifacts/art-a/content")
            .expect(0)
            .create_async()
            .await;

        let client = ApiClient::new(api.url(), "tok").unwrap();
        let bucket = BucketClient::new(convoy_core::BucketConfig::new("AKIA", "secret"))
            .unwrap()
            .with_endpoint(store.url());

        let (records, session) = upload(
            &client,
            Some(&bucket),
            dir.path(),
            "log/a.log",
            Some("s3://bkt/job-1"),
            &scope(),
        )
        .await
        .unwrap();

        assert_eq!(records.len(), 1);
        assert!(session.is_success());
        object.assert_async().await;
        register.assert_async().await;
        content.assert_async().await;
    }
}
