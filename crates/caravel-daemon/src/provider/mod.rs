//! Thin, unretried HTTP binding to the remote TEE control plane.
//!
//! Retry and interpretation of failures belong to the deploy strategy, not
//! to this client.

mod client;
mod types;

pub use client::{ProviderClient, ProviderConfig, ProviderError};
pub use types::{
    ComposeManifest, CreateVmRequest, HandshakeKey, ImageInfo, PodInfo, ResizeRequest, VmConfig,
    VmInfo, addressed,
};
