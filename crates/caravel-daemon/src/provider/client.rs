//! TEE control plane REST client.
//!
//! Uses reqwest with a bearer API key. One method per remote operation; each
//! is a single direct call with no retry.

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue};
use thiserror::Error;

use super::types::{
    CreateVmRequest, HandshakeKey, PodInfo, ResizeRequest, VmConfig, VmInfo, addressed,
};

/// Control plane client errors.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Provider API error ({status}): {payload}")]
    Api { status: u16, payload: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl ProviderError {
    /// Status code for API-level failures, if this is one.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration for connecting to the control plane.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Control plane URL (e.g., "<https://cloud.tee-provider.io>").
    pub base_url: String,
    /// API key for the bearer header.
    pub api_key: String,
}

/// TEE control plane REST client.
#[derive(Debug)]
pub struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
}

impl ProviderClient {
    /// Create a new control plane client.
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.base_url.is_empty() {
            return Err(ProviderError::Config("base_url is empty".into()));
        }
        if config.api_key.is_empty() {
            return Err(ProviderError::Config("api_key is empty".into()));
        }

        let mut headers = HeaderMap::new();
        let key_val = HeaderValue::from_str(&format!("Bearer {}", config.api_key))
            .map_err(|_| ProviderError::Config("Invalid API key format".into()))?;
        headers.insert(AUTHORIZATION, key_val);

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed — safe to ignore.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;

        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self { http, base_url })
    }

    /// Build the API v1 URL for a given path.
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    /// Check HTTP response status, capturing the payload for non-2xx codes.
    /// The payload is operator-facing context; sealed secrets were encrypted
    /// before they entered any request body, so nothing sensitive can leak
    /// through here.
    async fn checked(resp: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = resp.status();
        if !status.is_success() {
            let payload = resp.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                payload,
            });
        }
        Ok(resp)
    }

    /// List pods currently accepting new VMs.
    pub async fn list_pods(&self) -> Result<Vec<PodInfo>, ProviderError> {
        let resp = self.http.get(self.api_url("/pods/available")).send().await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Fetch the handshake public key bound to this exact VM configuration.
    pub async fn handshake_pubkey(&self, config: &VmConfig) -> Result<HandshakeKey, ProviderError> {
        let resp = self
            .http
            .post(self.api_url("/vms/pubkey"))
            .json(config)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Submit the final creation request (configuration + sealed secrets).
    pub async fn create_vm(&self, request: &CreateVmRequest) -> Result<VmInfo, ProviderError> {
        let resp = self
            .http
            .post(self.api_url("/vms"))
            .json(request)
            .send()
            .await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Fetch current details for a VM.
    pub async fn vm_details(&self, external_id: &str) -> Result<VmInfo, ProviderError> {
        let url = self.api_url(&format!("/vms/{}", addressed(external_id)));
        let resp = self.http.get(url).send().await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Fetch resource usage stats for a VM.
    pub async fn vm_stats(&self, external_id: &str) -> Result<serde_json::Value, ProviderError> {
        let url = self.api_url(&format!("/vms/{}/stats", addressed(external_id)));
        let resp = self.http.get(url).send().await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Fetch the remote attestation report for a VM.
    pub async fn vm_attestation(
        &self,
        external_id: &str,
    ) -> Result<serde_json::Value, ProviderError> {
        let url = self.api_url(&format!("/vms/{}/attestation", addressed(external_id)));
        let resp = self.http.get(url).send().await?;
        Ok(Self::checked(resp).await?.json().await?)
    }

    /// Start a stopped VM.
    pub async fn start_vm(&self, external_id: &str) -> Result<(), ProviderError> {
        self.lifecycle(external_id, "start").await
    }

    /// Stop a running VM (hard stop).
    pub async fn stop_vm(&self, external_id: &str) -> Result<(), ProviderError> {
        self.lifecycle(external_id, "stop").await
    }

    /// Shut a VM down gracefully.
    pub async fn shutdown_vm(&self, external_id: &str) -> Result<(), ProviderError> {
        self.lifecycle(external_id, "shutdown").await
    }

    /// Restart a VM.
    pub async fn restart_vm(&self, external_id: &str) -> Result<(), ProviderError> {
        self.lifecycle(external_id, "restart").await
    }

    async fn lifecycle(&self, external_id: &str, action: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!("/vms/{}/{action}", addressed(external_id)));
        let resp = self.http.post(url).send().await?;
        Self::checked(resp).await?;
        Ok(())
    }

    /// Destroy a VM permanently on the provider side.
    pub async fn destroy_vm(&self, external_id: &str) -> Result<(), ProviderError> {
        let url = self.api_url(&format!("/vms/{}", addressed(external_id)));
        let resp = self.http.delete(url).send().await?;
        Self::checked(resp).await?;
        Ok(())
    }

    /// Resize a VM's vcpu/memory/disk, optionally allowing a restart.
    pub async fn resize_vm(
        &self,
        external_id: &str,
        request: &ResizeRequest,
    ) -> Result<(), ProviderError> {
        let url = self.api_url(&format!("/vms/{}/resize", addressed(external_id)));
        let resp = self.http.post(url).json(request).send().await?;
        Self::checked(resp).await?;
        Ok(())
    }
}
