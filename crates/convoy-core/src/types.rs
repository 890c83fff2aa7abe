//! Data model for the Convoy build agent

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Agent identity, immutable after registration
///
/// Created once by the registrar; owned by the poller for the process
/// lifetime. The access token returned by the service is what all
/// subsequent calls authenticate with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentIdentity {
    /// Service-assigned agent ID
    pub id: String,
    /// Agent name as registered
    pub name: String,
    /// Access token for all subsequent calls
    pub access_token: String,
    /// Scheduling priority
    #[serde(default)]
    pub priority: Option<String>,
    /// Meta-data tags (`key=value`)
    #[serde(default)]
    pub meta_data: Vec<String>,
}

/// Job lifecycle state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Waiting,
    Assigned,
    Running,
    /// The service requested cancellation mid-run
    Canceled,
    Finished,
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Waiting => write!(f, "waiting"),
            Self::Assigned => write!(f, "assigned"),
            Self::Running => write!(f, "running"),
            Self::Canceled => write!(f, "canceled"),
            Self::Finished => write!(f, "finished"),
        }
    }
}

/// A remote-assigned unit of work
///
/// Created server-side, claimed by exactly one agent, mutated locally only
/// by the executor (state, exit status), terminal once the completion report
/// is accepted by the service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Job ID
    pub id: String,
    /// Owning build ID
    pub build_id: String,
    /// Step name within the build pipeline
    #[serde(default)]
    pub step: Option<String>,
    /// Environment variables supplied by the service for this job
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Current lifecycle state
    #[serde(default)]
    pub state: JobState,
    /// Exit status once finished
    #[serde(default)]
    pub exit_status: Option<i32>,
}

/// Terminal outcome of one job execution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Bootstrap exited 0
    Success,
    /// Bootstrap exited nonzero
    Failure(i32),
    /// Cancellation was requested and honored
    Canceled,
    /// The child died to an uncaught signal
    SignalTerminated,
}

impl ExitStatus {
    /// Exit code to report to the service
    pub fn code(&self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Failure(code) => *code,
            Self::Canceled => -1,
            Self::SignalTerminated => -2,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Failure(code) => write!(f, "failure ({})", code),
            Self::Canceled => write!(f, "canceled"),
            Self::SignalTerminated => write!(f, "terminated by signal"),
        }
    }
}

/// A registered artifact, immutable after upload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Service-assigned artifact ID
    pub id: String,
    /// Build the artifact belongs to
    pub build_id: String,
    /// Job that uploaded it
    pub job_id: String,
    /// Step name of that job
    #[serde(default)]
    pub step: Option<String>,
    /// Path relative to the upload root
    pub path: String,
    /// Content length in bytes
    pub file_size: u64,
    /// SHA-1 of the content, hex encoded
    pub sha1sum: String,
    /// Where the bytes live: the service, or an external bucket URL
    #[serde(default)]
    pub url: Option<String>,
}

/// A search query against the build's artifact namespace
///
/// Build scope is mandatory. A step name or job ID optionally narrows the
/// search; the raw glob pattern is sent to the service unmodified — remote
/// matching semantics belong to the service contract.
#[derive(Debug, Clone, Default)]
pub struct SearchQuery {
    /// Glob-style path pattern
    pub pattern: String,
    /// Build to search within (required)
    pub build_id: Option<String>,
    /// Scope to a step by name or job ID
    pub step: Option<String>,
    /// Scope to an exact job
    pub job_id: Option<String>,
}

impl SearchQuery {
    pub fn new(pattern: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            ..Default::default()
        }
    }

    pub fn with_build(mut self, build_id: impl Into<String>) -> Self {
        self.build_id = Some(build_id.into());
        self
    }

    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }

    /// Validate that the query carries a build scope.
    ///
    /// Runs before any network call so an unscoped query never leaves the
    /// process.
    pub fn validate_scope(&self) -> crate::Result<&str> {
        match self.build_id.as_deref() {
            Some(build) if !build.is_empty() => Ok(build),
            _ => Err(crate::AgentError::Scope(format!(
                "artifact query \"{}\" has no build to search within; pass --build or run inside a job",
                self.pattern
            ))),
        }
    }
}

/// Build-scoped key/value pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataEntry {
    pub key: String,
    pub value: String,
}

/// Ephemeral accounting for one upload or download batch
///
/// Owned exclusively by the invoking transfer operation and discarded when
/// the batch completes or fails.
#[derive(Debug, Default)]
pub struct TransferSession {
    /// (local path, remote path) pairs in the batch
    pub files: Vec<(PathBuf, String)>,
    /// Total bytes moved so far
    pub bytes_transferred: u64,
    /// Files that completed
    pub completed: usize,
    /// Files that failed after exhausting retries, with reasons
    pub failed: Vec<(String, String)>,
    /// Cumulative retry count across the batch
    pub retries: u32,
    /// When the batch started
    pub started_at: Option<DateTime<Utc>>,
}

impl TransferSession {
    pub fn start(files: Vec<(PathBuf, String)>) -> Self {
        Self {
            files,
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn record_success(&mut self, bytes: u64) {
        self.completed += 1;
        self.bytes_transferred += bytes;
    }

    pub fn record_failure(&mut self, path: impl Into<String>, reason: impl Into<String>) {
        self.failed.push((path.into(), reason.into()));
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    /// The batch as a whole fails iff at least one file failed.
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}
