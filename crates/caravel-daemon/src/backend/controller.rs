//! Backend controller: resolves persisted instances and drives lifecycle
//! operations through the configured strategy.

use std::sync::Arc;

use caravel_core::db::DatabaseError;
use tracing::{info, instrument};

use crate::provider::VmInfo;
use crate::storage::{BackendRow, Database};

use super::BackendError;
use super::strategy::{BackendStrategy, DeployRequest, ResizeSpec};

/// Orchestrates backend instances by local id.
///
/// Lookup fails closed: a missing row, a soft-deleted row, or a row that was
/// never assigned a provider id all yield `NotFound` before any remote call
/// is attempted.
pub struct BackendController {
    db: Database,
    strategy: Arc<dyn BackendStrategy>,
}

impl BackendController {
    pub fn new(db: Database, strategy: Arc<dyn BackendStrategy>) -> Self {
        Self { db, strategy }
    }

    /// Provision a new instance and persist its record.
    pub async fn create_instance(
        &self,
        request: DeployRequest,
    ) -> Result<BackendRow, BackendError> {
        self.strategy.deploy(request).await
    }

    /// Fetch the local record for an active instance.
    pub async fn get_instance(&self, id: &str) -> Result<BackendRow, BackendError> {
        self.lookup(id).await
    }

    pub async fn start_instance(&self, id: &str) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.start(&external_id).await
    }

    pub async fn stop_instance(&self, id: &str) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.stop(&external_id).await
    }

    pub async fn shutdown_instance(&self, id: &str) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.shutdown(&external_id).await
    }

    pub async fn restart_instance(&self, id: &str) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.restart(&external_id).await
    }

    /// Destroy the remote VM, then soft-delete the local record. The local
    /// row stays active if the remote destroy fails, so the instance remains
    /// addressable for a retry.
    #[instrument(skip(self))]
    pub async fn destroy_instance(&self, id: &str) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.destroy(&external_id).await?;
        self.db.mark_backend_deleted(id).await?;
        info!(backend_id = %id, "Destroyed backend instance");
        Ok(())
    }

    pub async fn resize_instance(&self, id: &str, spec: ResizeSpec) -> Result<(), BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.resize(&external_id, spec).await
    }

    /// Fetch live details from the provider and refresh the local metadata
    /// blob with them.
    pub async fn instance_details(&self, id: &str) -> Result<VmInfo, BackendError> {
        let external_id = self.resolve(id).await?;
        let info = self.strategy.details(&external_id).await?;
        if let Ok(metadata) = serde_json::to_string(&info) {
            self.db.update_backend_metadata(id, &metadata).await?;
        }
        Ok(info)
    }

    pub async fn instance_stats(&self, id: &str) -> Result<serde_json::Value, BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.stats(&external_id).await
    }

    pub async fn instance_attestation(&self, id: &str) -> Result<serde_json::Value, BackendError> {
        let external_id = self.resolve(id).await?;
        self.strategy.attestation(&external_id).await
    }

    async fn lookup(&self, id: &str) -> Result<BackendRow, BackendError> {
        match self.db.get_backend(id).await {
            Ok(row) => Ok(row),
            Err(DatabaseError::NotFound(_)) => Err(BackendError::NotFound(id.to_string())),
            Err(other) => Err(other.into()),
        }
    }

    async fn resolve(&self, id: &str) -> Result<String, BackendError> {
        self.lookup(id)
            .await?
            .external_id
            .ok_or_else(|| BackendError::NotFound(id.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use caravel_core::db::unix_timestamp;

    use super::*;

    /// Records every strategy call; optionally fails them all.
    #[derive(Default)]
    struct RecordingStrategy {
        calls: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingStrategy {
        fn record(&self, call: impl Into<String>) -> Result<(), BackendError> {
            self.calls.lock().unwrap().push(call.into());
            if self.fail {
                Err(BackendError::Provider(crate::provider::ProviderError::Api {
                    status: 500,
                    payload: "provider down".into(),
                }))
            } else {
                Ok(())
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BackendStrategy for RecordingStrategy {
        async fn deploy(&self, request: DeployRequest) -> Result<BackendRow, BackendError> {
            self.record(format!("deploy {}", request.name))?;
            let now = unix_timestamp();
            Ok(BackendRow {
                id: "deployed".into(),
                name: request.name,
                description: None,
                external_id: Some("ext-new".into()),
                url: None,
                provider_metadata: None,
                status: "active".into(),
                created_at: now,
                updated_at: now,
            })
        }

        async fn start(&self, external_id: &str) -> Result<(), BackendError> {
            self.record(format!("start {external_id}"))
        }

        async fn stop(&self, external_id: &str) -> Result<(), BackendError> {
            self.record(format!("stop {external_id}"))
        }

        async fn shutdown(&self, external_id: &str) -> Result<(), BackendError> {
            self.record(format!("shutdown {external_id}"))
        }

        async fn restart(&self, external_id: &str) -> Result<(), BackendError> {
            self.record(format!("restart {external_id}"))
        }

        async fn destroy(&self, external_id: &str) -> Result<(), BackendError> {
            self.record(format!("destroy {external_id}"))
        }

        async fn resize(&self, external_id: &str, spec: ResizeSpec) -> Result<(), BackendError> {
            self.record(format!(
                "resize {external_id} {}x{} allow_restart={}",
                spec.vcpu, spec.memory, spec.allow_restart
            ))
        }

        async fn details(&self, external_id: &str) -> Result<VmInfo, BackendError> {
            self.record(format!("details {external_id}"))?;
            Ok(VmInfo {
                id: external_id.to_string(),
                name: "api".into(),
                status: "running".into(),
                extra: serde_json::Map::new(),
            })
        }

        async fn stats(&self, external_id: &str) -> Result<serde_json::Value, BackendError> {
            self.record(format!("stats {external_id}"))?;
            Ok(serde_json::json!({"cpu": 0.5}))
        }

        async fn attestation(&self, external_id: &str) -> Result<serde_json::Value, BackendError> {
            self.record(format!("attestation {external_id}"))?;
            Ok(serde_json::json!({"quote": "aa"}))
        }
    }

    async fn seeded(external_id: Option<&str>) -> (BackendController, Arc<RecordingStrategy>) {
        let db = Database::open_in_memory().await.unwrap();
        let now = unix_timestamp();
        db.insert_backend(&BackendRow {
            id: "b1".into(),
            name: "api".into(),
            description: None,
            external_id: external_id.map(String::from),
            url: None,
            provider_metadata: None,
            status: "active".into(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

        let strategy = Arc::new(RecordingStrategy::default());
        (
            BackendController::new(db, Arc::clone(&strategy) as Arc<dyn BackendStrategy>),
            strategy,
        )
    }

    #[tokio::test]
    async fn lifecycle_targets_the_external_id() {
        let (controller, strategy) = seeded(Some("ext-1")).await;
        controller.start_instance("b1").await.unwrap();
        controller.stop_instance("b1").await.unwrap();
        controller.restart_instance("b1").await.unwrap();
        assert_eq!(
            strategy.calls(),
            vec!["start ext-1", "stop ext-1", "restart ext-1"]
        );
    }

    #[tokio::test]
    async fn unknown_instance_fails_closed_without_remote_calls() {
        let (controller, strategy) = seeded(Some("ext-1")).await;
        let err = controller.start_instance("missing").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(strategy.calls().is_empty());
    }

    #[tokio::test]
    async fn instance_without_external_id_fails_closed() {
        let (controller, strategy) = seeded(None).await;
        let err = controller.shutdown_instance("b1").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
        assert!(strategy.calls().is_empty());
    }

    #[tokio::test]
    async fn destroy_soft_deletes_only_after_remote_success() {
        let (controller, _) = seeded(Some("ext-1")).await;
        controller.destroy_instance("b1").await.unwrap();

        let err = controller.get_instance("b1").await.unwrap_err();
        assert!(matches!(err, BackendError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_remote_destroy_keeps_the_local_row() {
        let db = Database::open_in_memory().await.unwrap();
        let now = unix_timestamp();
        db.insert_backend(&BackendRow {
            id: "b1".into(),
            name: "api".into(),
            description: None,
            external_id: Some("ext-1".into()),
            url: None,
            provider_metadata: None,
            status: "active".into(),
            created_at: now,
            updated_at: now,
        })
        .await
        .unwrap();

        let strategy = Arc::new(RecordingStrategy {
            calls: Mutex::new(vec![]),
            fail: true,
        });
        let controller = BackendController::new(db, strategy as Arc<dyn BackendStrategy>);

        let err = controller.destroy_instance("b1").await.unwrap_err();
        assert!(matches!(err, BackendError::Provider(_)));

        // Still addressable for a retry.
        assert!(controller.get_instance("b1").await.is_ok());
    }

    #[tokio::test]
    async fn details_refreshes_local_metadata() {
        let (controller, _) = seeded(Some("ext-1")).await;
        let info = controller.instance_details("b1").await.unwrap();
        assert_eq!(info.status, "running");

        let row = controller.get_instance("b1").await.unwrap();
        let metadata = row.provider_metadata.unwrap();
        assert!(metadata.contains("running"));
    }

    #[tokio::test]
    async fn resize_forwards_the_spec() {
        let (controller, strategy) = seeded(Some("ext-1")).await;
        controller
            .resize_instance(
                "b1",
                ResizeSpec {
                    vcpu: 4,
                    memory: 8192,
                    disk_size: 80,
                    allow_restart: true,
                },
            )
            .await
            .unwrap();
        assert_eq!(strategy.calls(), vec!["resize ext-1 4x8192 allow_restart=true"]);
    }
}
