//! Resolved agent configuration
//!
//! `AgentConfig` is produced once at startup by the CLI layer (flags and
//! environment variables, already merged) and threaded into every component
//! by value. Nothing in the core reads ambient global state.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Default coordination service endpoint
pub const DEFAULT_ENDPOINT: &str = "https://agent.convoy.dev/v3";

fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}

fn default_meta_data() -> Vec<String> {
    vec!["queue=default".to_string()]
}

/// Immutable agent configuration, resolved before the core starts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Account agent token used to register
    pub token: String,

    /// Coordination service base URL
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Agent name (defaults to the hostname at the CLI edge)
    pub name: String,

    /// Scheduling priority; higher priorities are assigned work first
    #[serde(default)]
    pub priority: Option<String>,

    /// Agent meta-data tags as `key=value` pairs
    #[serde(default = "default_meta_data")]
    pub meta_data: Vec<String>,

    /// Path to the bootstrap script each job runs
    pub bootstrap_script: PathBuf,

    /// Directory builds run from
    pub build_path: PathBuf,

    /// Directory hook scripts are found in
    #[serde(default)]
    pub hooks_path: Option<PathBuf>,

    /// Run jobs inside a pseudo terminal when available
    #[serde(default = "default_true")]
    pub run_in_pty: bool,

    /// Allow jobs to supply arbitrary commands. When false, only the fixed
    /// bootstrap script runs — a security boundary, not a convenience flag.
    #[serde(default = "default_true")]
    pub command_eval: bool,

    /// Direct object-storage upload target, when configured
    #[serde(default)]
    pub bucket: Option<BucketConfig>,
}

fn default_true() -> bool {
    true
}

impl AgentConfig {
    /// Create a config with required fields and defaults for the rest
    pub fn new(
        token: impl Into<String>,
        name: impl Into<String>,
        bootstrap_script: impl Into<PathBuf>,
        build_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            token: token.into(),
            endpoint: default_endpoint(),
            name: name.into(),
            priority: None,
            meta_data: default_meta_data(),
            bootstrap_script: bootstrap_script.into(),
            build_path: build_path.into(),
            hooks_path: None,
            run_in_pty: true,
            command_eval: true,
            bucket: None,
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }

    pub fn with_priority(mut self, priority: impl Into<String>) -> Self {
        self.priority = Some(priority.into());
        self
    }

    pub fn with_meta_data(mut self, meta_data: Vec<String>) -> Self {
        self.meta_data = meta_data;
        self
    }

    pub fn with_pty(mut self, run_in_pty: bool) -> Self {
        self.run_in_pty = run_in_pty;
        self
    }

    pub fn with_command_eval(mut self, command_eval: bool) -> Self {
        self.command_eval = command_eval;
        self
    }

    pub fn with_bucket(mut self, bucket: BucketConfig) -> Self {
        self.bucket = Some(bucket);
        self
    }
}

/// Credentials and policy for direct artifact upload to object storage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BucketConfig {
    /// Access key ID
    pub access_key_id: String,
    /// Secret access key
    pub secret_access_key: String,
    /// Bucket region
    #[serde(default = "default_region")]
    pub region: String,
    /// Canned ACL applied to uploaded objects
    #[serde(default = "default_acl")]
    pub acl: String,
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_acl() -> String {
    "public-read".to_string()
}

impl BucketConfig {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            region: default_region(),
            acl: default_acl(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn with_acl(mut self, acl: impl Into<String>) -> Self {
        self.acl = acl.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::new("tok", "agent-1", "/usr/local/bin/bootstrap", "/builds");
        assert_eq!(config.endpoint, DEFAULT_ENDPOINT);
        assert_eq!(config.meta_data, vec!["queue=default".to_string()]);
        assert!(config.run_in_pty);
        assert!(config.command_eval);
        assert!(config.bucket.is_none());
    }

    #[test]
    fn test_builder_chain() {
        let config = AgentConfig::new("tok", "agent-1", "/bootstrap", "/builds")
            .with_endpoint("http://localhost:8080")
            .with_priority("9")
            .with_pty(false)
            .with_command_eval(false)
            .with_bucket(BucketConfig::new("AKIA", "secret").with_region("eu-central-1"));

        assert_eq!(config.endpoint, "http://localhost:8080");
        assert_eq!(config.priority.as_deref(), Some("9"));
        assert!(!config.run_in_pty);
        assert!(!config.command_eval);
        let bucket = config.bucket.unwrap();
        assert_eq!(bucket.region, "eu-central-1");
        assert_eq!(bucket.acl, "public-read");
    }
}
