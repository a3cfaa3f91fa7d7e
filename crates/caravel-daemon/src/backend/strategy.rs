//! Deploy strategy for compose-manifest workloads on the TEE provider.

use async_trait::async_trait;
use caravel_core::db::unix_timestamp;
use caravel_crypto::{EnvVar, seal_env_vars};
use tracing::{info, instrument};

use crate::provider::{
    ComposeManifest, CreateVmRequest, ProviderClient, ProviderError, ResizeRequest, VmConfig,
    VmInfo, addressed,
};
use crate::storage::{BackendRow, Database};

use super::BackendError;
use super::version::select_pod_image;

/// Which image channel deploys are allowed to boot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployEnvironment {
    Development,
    Production,
}

impl DeployEnvironment {
    pub const fn wants_dev_images(self) -> bool {
        matches!(self, Self::Development)
    }
}

impl std::str::FromStr for DeployEnvironment {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dev" | "development" => Ok(Self::Development),
            "prod" | "production" => Ok(Self::Production),
            other => Err(format!("Unknown environment: {other}")),
        }
    }
}

/// Everything needed to provision one backend instance.
#[derive(Debug, Clone)]
pub struct DeployRequest {
    pub name: String,
    pub description: Option<String>,
    /// Raw docker-compose file content to run inside the enclave.
    pub compose_file: String,
    pub vcpu: u32,
    pub memory: u64,
    pub disk_size: u64,
    /// Plaintext environment variables. These exist only in memory here and
    /// leave this process exclusively inside the sealed envelope.
    pub env_vars: Vec<EnvVar>,
}

/// Resize parameters for an existing instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizeSpec {
    pub vcpu: u32,
    pub memory: u64,
    pub disk_size: u64,
    pub allow_restart: bool,
}

/// Provisioning and lifecycle operations, abstracted from the concrete
/// provider so the controller can be exercised against a fake.
#[async_trait]
pub trait BackendStrategy: Send + Sync {
    async fn deploy(&self, request: DeployRequest) -> Result<BackendRow, BackendError>;
    async fn start(&self, external_id: &str) -> Result<(), BackendError>;
    async fn stop(&self, external_id: &str) -> Result<(), BackendError>;
    async fn shutdown(&self, external_id: &str) -> Result<(), BackendError>;
    async fn restart(&self, external_id: &str) -> Result<(), BackendError>;
    async fn destroy(&self, external_id: &str) -> Result<(), BackendError>;
    async fn resize(&self, external_id: &str, spec: ResizeSpec) -> Result<(), BackendError>;
    async fn details(&self, external_id: &str) -> Result<VmInfo, BackendError>;
    async fn stats(&self, external_id: &str) -> Result<serde_json::Value, BackendError>;
    async fn attestation(&self, external_id: &str) -> Result<serde_json::Value, BackendError>;
}

/// Map lifecycle-call failures: a provider 404 means the instance is gone.
fn lifecycle_err(external_id: &str, err: ProviderError) -> BackendError {
    match err.status() {
        Some(404) => BackendError::NotFound(external_id.to_string()),
        _ => BackendError::Provider(err),
    }
}

/// Map provisioning failures: any API-level rejection (validation or
/// otherwise) becomes a deployment error carrying the upstream payload.
fn deploy_err(err: ProviderError) -> BackendError {
    match err {
        ProviderError::Api { status, payload } => BackendError::DeployFailed { status, payload },
        other => BackendError::Provider(other),
    }
}

/// Production strategy: compose-manifest VMs on the remote TEE control plane.
pub struct TeeComposeStrategy {
    provider: ProviderClient,
    db: Database,
    environment: DeployEnvironment,
    /// Dashboard base URL, e.g. "<https://console.caravel.sh>".
    console_base: String,
}

impl TeeComposeStrategy {
    pub fn new(
        provider: ProviderClient,
        db: Database,
        environment: DeployEnvironment,
        console_base: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            db,
            environment,
            console_base: console_base.into().trim_end_matches('/').to_string(),
        }
    }

    fn dashboard_url(&self, external_id: &str) -> String {
        format!("{}/backends/{}", self.console_base, addressed(external_id))
    }

    /// Assemble the VM configuration for a deploy. The security posture is
    /// fixed: isolated execution behind the network proxy, system info
    /// published for dashboards, logs private, instance unlisted.
    fn vm_config(request: &DeployRequest, pod_id: u64, image: &str) -> VmConfig {
        VmConfig {
            name: request.name.clone(),
            pod_id,
            image: image.to_string(),
            compose_manifest: ComposeManifest {
                name: request.name.clone(),
                docker_compose_file: request.compose_file.clone(),
            },
            vcpu: request.vcpu,
            memory: request.memory,
            disk_size: request.disk_size,
            isolated_execution: true,
            network_proxy: true,
            public_sysinfo: true,
            public_logs: false,
            listed: false,
        }
    }

    fn validate(request: &DeployRequest) -> Result<(), BackendError> {
        if request.name.trim().is_empty() {
            return Err(BackendError::Validation("name must not be empty".into()));
        }
        if request.compose_file.trim().is_empty() {
            return Err(BackendError::Validation(
                "compose file must not be empty".into(),
            ));
        }
        if request.vcpu == 0 || request.memory == 0 || request.disk_size == 0 {
            return Err(BackendError::Validation(
                "vcpu, memory and disk_size must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl BackendStrategy for TeeComposeStrategy {
    /// Provision a new confidential VM.
    ///
    /// The handshake public key is bound to the exact VM configuration sent
    /// here, so the same `VmConfig` value is reused verbatim for both the
    /// pubkey request and the creation request.
    #[instrument(skip_all, fields(name = %request.name))]
    async fn deploy(&self, request: DeployRequest) -> Result<BackendRow, BackendError> {
        Self::validate(&request)?;

        let pods = self.provider.list_pods().await.map_err(deploy_err)?;
        let (pod_id, image) = select_pod_image(&pods, self.environment.wants_dev_images())
            .ok_or(BackendError::NoCapacity)?;

        let config = Self::vm_config(&request, pod_id, &image.name);

        let key = self
            .provider
            .handshake_pubkey(&config)
            .await
            .map_err(deploy_err)?;
        let encrypted_env = seal_env_vars(&request.env_vars, &key.pubkey)?;

        let info = self
            .provider
            .create_vm(&CreateVmRequest {
                config,
                encrypted_env,
            })
            .await
            .map_err(deploy_err)?;

        info!(
            external_id = %info.id,
            image = %image.name,
            version = %image.version,
            "Provisioned backend VM"
        );

        let now = unix_timestamp();
        let row = BackendRow {
            id: uuid::Uuid::new_v4().to_string(),
            name: request.name,
            description: request.description,
            external_id: Some(info.id.clone()),
            url: Some(self.dashboard_url(&info.id)),
            provider_metadata: serde_json::to_string(&info).ok(),
            status: "active".to_string(),
            created_at: now,
            updated_at: now,
        };
        Ok(self.db.insert_backend(&row).await?)
    }

    async fn start(&self, external_id: &str) -> Result<(), BackendError> {
        self.provider
            .start_vm(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn stop(&self, external_id: &str) -> Result<(), BackendError> {
        self.provider
            .stop_vm(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn shutdown(&self, external_id: &str) -> Result<(), BackendError> {
        self.provider
            .shutdown_vm(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn restart(&self, external_id: &str) -> Result<(), BackendError> {
        self.provider
            .restart_vm(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn destroy(&self, external_id: &str) -> Result<(), BackendError> {
        self.provider
            .destroy_vm(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn resize(&self, external_id: &str, spec: ResizeSpec) -> Result<(), BackendError> {
        if spec.vcpu == 0 || spec.memory == 0 || spec.disk_size == 0 {
            return Err(BackendError::Validation(
                "vcpu, memory and disk_size must be positive".into(),
            ));
        }
        let request = ResizeRequest::new(spec.vcpu, spec.memory, spec.disk_size, spec.allow_restart);
        self.provider
            .resize_vm(external_id, &request)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn details(&self, external_id: &str) -> Result<VmInfo, BackendError> {
        self.provider
            .vm_details(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn stats(&self, external_id: &str) -> Result<serde_json::Value, BackendError> {
        self.provider
            .vm_stats(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }

    async fn attestation(&self, external_id: &str) -> Result<serde_json::Value, BackendError> {
        self.provider
            .vm_attestation(external_id)
            .await
            .map_err(|e| lifecycle_err(external_id, e))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use crate::provider::ProviderConfig;

    use super::*;

    fn strategy(db: Database) -> TeeComposeStrategy {
        let provider = ProviderClient::new(&ProviderConfig {
            base_url: "https://cloud.tee-provider.io".into(),
            api_key: "key".into(),
        })
        .unwrap();
        TeeComposeStrategy::new(
            provider,
            db,
            DeployEnvironment::Production,
            "https://console.caravel.sh/",
        )
    }

    fn request() -> DeployRequest {
        DeployRequest {
            name: "api".into(),
            description: None,
            compose_file: "services: {}".into(),
            vcpu: 2,
            memory: 4096,
            disk_size: 40,
            env_vars: vec![],
        }
    }

    #[tokio::test]
    async fn deploy_rejects_zero_sizing_before_any_network_call() {
        let db = Database::open_in_memory().await.unwrap();
        let strategy = strategy(db);

        let mut bad = request();
        bad.vcpu = 0;
        let err = strategy.deploy(bad).await.unwrap_err();
        assert!(matches!(err, BackendError::Validation(_)));

        let mut bad = request();
        bad.compose_file = "  ".into();
        let err = strategy.deploy(bad).await.unwrap_err();
        assert!(matches!(err, BackendError::Validation(_)));
    }

    #[tokio::test]
    async fn dashboard_url_uses_provider_addressing() {
        let db = Database::open_in_memory().await.unwrap();
        let strategy = strategy(db);
        assert_eq!(
            strategy.dashboard_url("42"),
            "https://console.caravel.sh/backends/app_42"
        );
    }

    #[test]
    fn vm_config_applies_the_fixed_security_posture() {
        let config = TeeComposeStrategy::vm_config(&request(), 7, "dstack-0.5.3");
        assert!(config.isolated_execution);
        assert!(config.network_proxy);
        assert!(config.public_sysinfo);
        assert!(!config.public_logs);
        assert!(!config.listed);
        assert_eq!(config.pod_id, 7);
        assert_eq!(config.compose_manifest.docker_compose_file, "services: {}");
    }

    #[test]
    fn deploy_errors_keep_upstream_status_and_payload() {
        let err = deploy_err(ProviderError::Api {
            status: 422,
            payload: "compose manifest invalid".into(),
        });
        match err {
            BackendError::DeployFailed { status, payload } => {
                assert_eq!(status, 422);
                assert_eq!(payload, "compose manifest invalid");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn lifecycle_404_maps_to_not_found() {
        let err = lifecycle_err(
            "app_7",
            ProviderError::Api {
                status: 404,
                payload: String::new(),
            },
        );
        assert!(matches!(err, BackendError::NotFound(_)));

        let err = lifecycle_err(
            "app_7",
            ProviderError::Api {
                status: 500,
                payload: "boom".into(),
            },
        );
        assert!(matches!(err, BackendError::Provider(_)));
    }

    #[test]
    fn environment_parsing() {
        use std::str::FromStr as _;
        assert_eq!(
            DeployEnvironment::from_str("dev").unwrap(),
            DeployEnvironment::Development
        );
        assert_eq!(
            DeployEnvironment::from_str("production").unwrap(),
            DeployEnvironment::Production
        );
        assert!(DeployEnvironment::from_str("staging").is_err());
        assert!(!DeployEnvironment::Production.wants_dev_images());
    }
}
