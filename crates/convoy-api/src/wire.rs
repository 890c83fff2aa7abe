//! Request/response payloads for the coordination service API

use convoy_core::{AgentIdentity, ExitStatus};
use serde::{Deserialize, Serialize};

/// `POST /register`
#[derive(Debug, Clone, Serialize)]
pub struct RegisterRequest {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    pub meta_data: Vec<String>,
}

/// Response to `POST /register`
#[derive(Debug, Clone, Deserialize)]
pub struct RegisterResponse {
    pub id: String,
    pub name: String,
    pub access_token: String,
    #[serde(default)]
    pub priority: Option<String>,
    #[serde(default)]
    pub meta_data: Vec<String>,
}

impl From<RegisterResponse> for AgentIdentity {
    fn from(r: RegisterResponse) -> Self {
        AgentIdentity {
            id: r.id,
            name: r.name,
            access_token: r.access_token,
            priority: r.priority,
            meta_data: r.meta_data,
        }
    }
}

/// `POST /jobs/next` — conditional claim of an offered job
#[derive(Debug, Clone, Serialize)]
pub struct ClaimRequest {
    pub job_id: String,
    pub agent_id: String,
}

/// `POST /jobs/{id}/finish`
#[derive(Debug, Clone, Serialize)]
pub struct FinishRequest {
    pub exit_status: i32,
    pub canceled: bool,
    pub signal_terminated: bool,
}

impl From<ExitStatus> for FinishRequest {
    fn from(status: ExitStatus) -> Self {
        Self {
            exit_status: status.code(),
            canceled: matches!(status, ExitStatus::Canceled),
            signal_terminated: matches!(status, ExitStatus::SignalTerminated),
        }
    }
}

/// `POST /builds/{id}/artifacts` — register one artifact before its bytes move
#[derive(Debug, Clone, Serialize)]
pub struct ArtifactUploadRequest {
    pub job_id: String,
    pub path: String,
    pub file_size: u64,
    pub sha1sum: String,
    /// External bucket location when bytes bypass the service
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// `POST /builds/{id}/metadata/{key}`
#[derive(Debug, Clone, Serialize)]
pub struct SetMetadataRequest {
    pub value: String,
}

/// Response to `GET /builds/{id}/metadata/{key}`
#[derive(Debug, Clone, Deserialize)]
pub struct MetadataResponse {
    pub value: String,
}
