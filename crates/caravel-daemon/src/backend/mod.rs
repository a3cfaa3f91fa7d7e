//! Backend orchestration: confidential-VM lifecycle over the TEE provider.
//!
//! The controller resolves persisted instances and dispatches to a
//! [`BackendStrategy`]; the strategy owns image selection, the secrets
//! handshake, and the mapping of provider responses into instance records.

mod controller;
mod strategy;
mod version;

pub use controller::BackendController;
pub use strategy::{
    BackendStrategy, DeployEnvironment, DeployRequest, ResizeSpec, TeeComposeStrategy,
};
pub use version::{select_pod_image, version_weight};

use caravel_core::db::DatabaseError;
use caravel_crypto::HandshakeError;

use crate::provider::ProviderError;

/// Errors from backend orchestration.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Unknown, deleted, or never-provisioned instance. Surfaces as 404.
    #[error("Backend not found: {0}")]
    NotFound(String),

    /// No pod is currently accepting new VMs.
    #[error("No capacity available for a new backend")]
    NoCapacity,

    /// The provider rejected or failed the creation request. Carries the
    /// upstream status and payload for operators; never plaintext secrets.
    #[error("Deployment failed ({status}): {payload}")]
    DeployFailed { status: u16, payload: String },

    /// Upstream provider failure outside deployment. Surfaces as 500.
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    /// Secrets handshake failure. Always fatal for the request.
    #[error("Handshake error: {0}")]
    Crypto(#[from] HandshakeError),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}
