//! Database models for the caravel daemon.

use serde::{Deserialize, Serialize};

/// Backend instance record: one remote confidential VM.
///
/// `external_id` is the provider-assigned instance id; a row without one
/// must never receive lifecycle calls. Rows are soft-deleted, never removed.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackendRow {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub external_id: Option<String>,
    pub url: Option<String>,
    /// Opaque provider metadata blob (status, sizing, image, creation time).
    pub provider_metadata: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One execution of the clone/build/upload pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildRow {
    pub id: String,
    pub site_id: String,
    pub config_id: Option<String>,
    pub build_status: String,
    pub logs: String,
    pub last_output: Option<String>,
    pub reason: Option<String>,
    pub finished_at: Option<i64>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Per-repository continuous-deployment settings.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeployConfigRow {
    pub id: String,
    pub site_id: String,
    pub repo_id: String,
    pub repo_url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub webhook_id: Option<String>,
    pub branch: String,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_dir: String,
    pub hosting_key: String,
    /// Hosting secret, encrypted by the key-management service.
    pub hosting_secret_enc: String,
    pub kms_key_id: String,
    /// Environment-variable bundle, encrypted by the key-management service.
    pub env_vars_enc: Option<String>,
    pub credential_id: Option<String>,
    pub status: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Fields needed to create a deploy config (the rest is generated).
#[derive(Debug, Clone)]
pub struct NewDeployConfig {
    pub site_id: String,
    pub repo_id: String,
    pub repo_url: String,
    pub repo_owner: String,
    pub repo_name: String,
    pub webhook_id: Option<String>,
    pub branch: String,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_dir: String,
    pub hosting_key: String,
    pub hosting_secret_enc: String,
    pub kms_key_id: String,
    pub env_vars_enc: Option<String>,
    pub credential_id: Option<String>,
}

/// Source-host OAuth credentials for one project.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProjectCredentialRow {
    pub id: String,
    pub project_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub username: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Queued build job record.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BuildJobRow {
    pub id: i64,
    pub build_id: String,
    pub payload: String,
    pub status: String,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<i64>,
    pub created_at: i64,
}

/// Build status enum.
///
/// Transitions are monotonic: pending → in-progress → {success, failed}.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    InProgress,
    Success,
    Failed,
}

impl BuildStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Failed => "failed",
        }
    }

    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Failed)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
