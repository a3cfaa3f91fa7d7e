//! Wire types for the TEE control plane API.

use serde::{Deserialize, Serialize};

/// Prefix every VM identifier with the provider's addressing scheme.
pub fn addressed(external_id: &str) -> String {
    if external_id.starts_with("app_") {
        external_id.to_string()
    } else {
        format!("app_{external_id}")
    }
}

/// One pod (physical host) available for scheduling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInfo {
    pub id: u64,
    pub name: String,
    #[serde(default)]
    pub images: Vec<ImageInfo>,
}

/// A bootable enclave OS image offered by a pod.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageInfo {
    pub name: String,
    /// Three-component version string, e.g. "0.3.5".
    pub version: String,
    #[serde(default)]
    pub is_dev: bool,
}

/// Docker-compose manifest wrapper submitted with a VM configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeManifest {
    pub name: String,
    pub docker_compose_file: String,
}

/// Full VM configuration. The handshake public key is bound to the exact
/// serialized form of this structure, so it must not change between the
/// pubkey request and the creation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmConfig {
    pub name: String,
    pub pod_id: u64,
    pub image: String,
    pub compose_manifest: ComposeManifest,
    pub vcpu: u32,
    pub memory: u64,
    pub disk_size: u64,
    // Fixed security posture for every caravel backend.
    pub isolated_execution: bool,
    pub network_proxy: bool,
    pub public_sysinfo: bool,
    pub public_logs: bool,
    pub listed: bool,
}

/// Creation request: configuration plus the sealed secrets envelope.
#[derive(Debug, Clone, Serialize)]
pub struct CreateVmRequest {
    #[serde(flatten)]
    pub config: VmConfig,
    pub encrypted_env: String,
}

/// Configuration-bound public key for the secrets handshake.
#[derive(Debug, Clone, Deserialize)]
pub struct HandshakeKey {
    pub pubkey: String,
}

/// Provider response for a created or inspected VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmInfo {
    pub id: String,
    pub name: String,
    pub status: String,
    /// Everything else the provider reports; stored as the opaque metadata
    /// blob on the local instance record.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Resize parameters. `allow_restart` goes over the wire as `0`/`1`.
#[derive(Debug, Clone, Serialize)]
pub struct ResizeRequest {
    pub vcpu: u32,
    pub memory: u64,
    pub disk_size: u64,
    pub allow_restart: u8,
}

impl ResizeRequest {
    pub const fn new(vcpu: u32, memory: u64, disk_size: u64, allow_restart: bool) -> Self {
        Self {
            vcpu,
            memory,
            disk_size,
            allow_restart: if allow_restart { 1 } else { 0 },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn addressed_adds_prefix_once() {
        assert_eq!(addressed("42"), "app_42");
        assert_eq!(addressed("app_42"), "app_42");
    }

    #[test]
    fn resize_request_serializes_exactly_four_fields() {
        let value = serde_json::to_value(ResizeRequest::new(2, 4096, 40, true)).unwrap();
        assert_eq!(
            value,
            serde_json::json!({"vcpu": 2, "memory": 4096, "disk_size": 40, "allow_restart": 1})
        );

        let value = serde_json::to_value(ResizeRequest::new(1, 2048, 20, false)).unwrap();
        assert_eq!(value["allow_restart"], 0);
    }

    #[test]
    fn vm_info_keeps_unknown_fields_as_metadata() {
        let raw = serde_json::json!({
            "id": "app_7",
            "name": "api",
            "status": "running",
            "image_version": "0.3.5",
            "created_at": "2026-01-01T00:00:00Z"
        });
        let info: VmInfo = serde_json::from_value(raw).unwrap();
        assert_eq!(info.id, "app_7");
        assert_eq!(info.extra["image_version"], "0.3.5");
    }
}
