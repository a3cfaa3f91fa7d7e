//! Build-and-deploy pipeline.
//!
//! The service creates Build records and dispatches jobs; the worker runs
//! the clone/install/build/upload script and drives the build state machine.
//! Jobs carry secrets only in their KMS-encrypted form; the worker decrypts
//! them just before the subprocess needs them.

mod script;
mod service;
mod worker;

pub use script::{ScriptSpec, build_script};
pub use service::{BuildService, DispatchMode, WebDeployParams};
pub use worker::{BuildWorker, WorkerConfig, run_worker_loop};

use caravel_core::db::DatabaseError;
use serde::{Deserialize, Serialize};

use crate::githost::GitHostError;
use crate::kms::KmsError;
use crate::sites::SiteError;

/// What started the build.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// Push webhook from the git host.
    Webhook,
    /// Direct API request (web deploy of a prebuilt directory).
    Api,
}

/// Repository to clone, for webhook-triggered builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoSpec {
    pub url: String,
    pub branch: String,
    /// Project whose stored credentials authenticate the clone.
    pub project_id: String,
    pub config_id: String,
}

/// One unit of work on the build queue. Serialized as JSON into the durable
/// queue, so nothing here may be plaintext secret material.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildJob {
    pub build_id: String,
    pub site_id: String,
    pub trigger: TriggerKind,
    /// Present for webhook builds; `None` deploys `prebuilt_dir` as-is.
    pub repo: Option<RepoSpec>,
    pub install_command: Option<String>,
    pub build_command: Option<String>,
    pub output_dir: String,
    pub prebuilt_dir: Option<String>,
    pub hosting_key: String,
    pub hosting_secret_enc: String,
    pub kms_key_id: String,
    pub env_vars_enc: Option<String>,
}

/// Pipeline failures. These never escape the worker: each one becomes a
/// terminal `failed` transition plus a log line.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Key service error: {0}")]
    Kms(#[from] KmsError),

    #[error("Git host error: {0}")]
    GitHost(#[from] GitHostError),

    #[error("Site directory error: {0}")]
    Site(#[from] SiteError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Job payload error: {0}")]
    Payload(#[from] serde_json::Error),

    #[error("Credential error: {0}")]
    Credentials(String),

    #[error("Build exceeded the {0}s time limit")]
    TimedOut(u64),
}
