//! Build-scoped key/value metadata
//!
//! Keys are plain strings unique per build; `set` is an idempotent
//! overwrite and there is no delete. Reads go to the service every time —
//! read-your-writes comes from the service acknowledging the `set`, never
//! from a local cache.

use crate::wire::{MetadataResponse, SetMetadataRequest};
use crate::ApiClient;
use convoy_core::{AgentError, MetadataEntry, Result};

/// Get/set key-value pairs scoped to a build
#[derive(Debug, Clone)]
pub struct MetadataStore<'a> {
    client: &'a ApiClient,
}

impl<'a> MetadataStore<'a> {
    pub fn new(client: &'a ApiClient) -> Self {
        Self { client }
    }

    /// Set a key on the build, overwriting any previous value.
    pub async fn set(&self, build_id: &str, key: &str, value: &str) -> Result<()> {
        tracing::debug!("Setting meta-data \"{}\" on build {}", key, build_id);
        let request = SetMetadataRequest {
            value: value.to_string(),
        };
        self.client
            .post_unit(&format!("/builds/{}/metadata/{}", build_id, key), &request)
            .await
    }

    /// Get a key from the build. A key that was never set is `NotFound`.
    pub async fn get(&self, build_id: &str, key: &str) -> Result<MetadataEntry> {
        let response: MetadataResponse = self
            .client
            .get(&format!("/builds/{}/metadata/{}", build_id, key))
            .await
            .map_err(|e| match e {
                AgentError::NotFound(_) => AgentError::NotFound(format!(
                    "no meta-data key \"{}\" on build {}",
                    key, build_id
                )),
                other => other,
            })?;
        Ok(MetadataEntry {
            key: key.to_string(),
            value: response.value,
        })
    }
}
