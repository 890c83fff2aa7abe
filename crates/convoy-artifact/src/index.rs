//! Remote artifact search
//!
//! Resolves a glob pattern plus scoping filters to a set of artifact
//! records via the service's search endpoint. The raw pattern is sent as-is
//! — matching semantics (`**` crossing separators, `*` not) belong to the
//! service contract and are not reimplemented client-side.

use convoy_api::ApiClient;
use convoy_core::{AgentError, ArtifactRecord, Result, SearchQuery};
use std::collections::HashSet;

/// How much ambiguity the caller accepts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveMode {
    /// Matches must come from exactly one job and name exactly one artifact
    /// (shasum: a single checksum cannot represent several files)
    Single,
    /// Matches may span job instances; the union is returned
    /// (download: favor availability)
    Many,
}

/// Resolves search queries against the service's artifact index
#[derive(Debug, Clone)]
pub struct ArtifactIndex<'a> {
    client: &'a ApiClient,
}

impl<'a> ArtifactIndex<'a> {
    pub fn new(client: &'a ApiClient) -> Self {
        Self { client }
    }

    /// Resolve a query to artifact records.
    ///
    /// Fails with `Scope` before any network call when the query carries no
    /// build, `NotFound` on zero matches, and (in `Single` mode)
    /// `AmbiguousMatch` when matches span more than one job or name more
    /// than one artifact.
    pub async fn resolve(&self, query: &SearchQuery, mode: ResolveMode) -> Result<Vec<ArtifactRecord>> {
        let build_id = query.validate_scope()?;

        let mut path = format!(
            "/builds/{}/artifacts/search?query={}",
            build_id,
            encode_component(&query.pattern)
        );
        if let Some(step) = &query.step {
            path.push_str(&format!("&step={}", encode_component(step)));
        }
        if let Some(job_id) = &query.job_id {
            path.push_str(&format!("&job={}", encode_component(job_id)));
        }

        let records: Vec<ArtifactRecord> = self.client.get(&path).await?;

        if records.is_empty() {
            return Err(AgentError::NotFound(format!(
                "no artifacts found for \"{}\" in build {}",
                query.pattern, build_id
            )));
        }

        if mode == ResolveMode::Single {
            let jobs: HashSet<&str> = records.iter().map(|r| r.job_id.as_str()).collect();
            if jobs.len() > 1 {
                return Err(AgentError::AmbiguousMatch(format!(
                    "\"{}\" matches artifacts from {} jobs; scope the search with --step or --job",
                    query.pattern,
                    jobs.len()
                )));
            }
            if records.len() > 1 {
                return Err(AgentError::AmbiguousMatch(format!(
                    "\"{}\" matches {} artifacts; a single match is required",
                    query.pattern,
                    records.len()
                )));
            }
        }

        tracing::debug!(
            "Resolved \"{}\" to {} artifact(s) in build {}",
            query.pattern,
            records.len(),
            build_id
        );
        Ok(records)
    }
}

/// Percent-encode a query-string component. Glob metacharacters pass
/// through; only characters that would break the query string are escaped.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'%' | b'&' | b'+' | b'#' | b'=' | b' ' => {
                out.push_str(&format!("%{:02X}", b));
            }
            // non-ASCII patterns go over the wire as percent-encoded
            // UTF-8 bytes, so the service decodes the exact pattern
            b if !b.is_ascii() => out.push_str(&format!("%{:02X}", b)),
            b => out.push(b as char),
        }
    }
    out
}
