//! Build orchestration service.
//!
//! Creates the Build record before anything else happens, then hands a job
//! to the worker, either inline (development and tests) or through the
//! durable queue.

use std::sync::Arc;

use tracing::{info, instrument};
use uuid::Uuid;

use crate::sites::SiteDirectory;
use crate::storage::{Database, DeployConfigRow};

use super::worker::BuildWorker;
use super::{BuildError, BuildJob, RepoSpec, TriggerKind};

/// How jobs reach a worker.
#[derive(Clone)]
pub enum DispatchMode {
    /// Run the job on the calling task. The trigger call returns only after
    /// the build reaches a terminal state.
    Inline(Arc<BuildWorker>),
    /// Enqueue for the worker pool.
    Queued,
}

/// Parameters for deploying an already-built directory.
#[derive(Debug, Clone)]
pub struct WebDeployParams {
    pub site_id: String,
    pub prebuilt_dir: String,
    pub output_dir: String,
    pub hosting_key: String,
    pub hosting_secret_enc: String,
    pub kms_key_id: String,
    pub env_vars_enc: Option<String>,
}

/// Entry point for both deploy triggers.
pub struct BuildService {
    db: Database,
    dispatch: DispatchMode,
    /// When present, the target site's write access is checked before any
    /// build record is created.
    sites: Option<Arc<dyn SiteDirectory>>,
}

impl BuildService {
    pub fn new(db: Database, dispatch: DispatchMode) -> Self {
        Self {
            db,
            dispatch,
            sites: None,
        }
    }

    #[must_use]
    pub fn with_site_directory(mut self, sites: Arc<dyn SiteDirectory>) -> Self {
        self.sites = Some(sites);
        self
    }

    /// Refuse the trigger when the caller may not modify the site.
    async fn authorize(&self, site_id: &str) -> Result<(), BuildError> {
        if let Some(sites) = &self.sites {
            sites.get_website_with_access(site_id, true).await?;
        }
        Ok(())
    }

    /// Start a webhook-triggered build for a deploy config. Returns the new
    /// build id; the Build row exists in `pending` before any external work.
    #[instrument(skip_all, fields(config_id = %config.id))]
    pub async fn trigger_git_deploy(
        &self,
        config: &DeployConfigRow,
    ) -> Result<String, BuildError> {
        self.authorize(&config.site_id).await?;

        let build_id = Uuid::new_v4().to_string();
        self.db
            .create_build(&build_id, &config.site_id, Some(&config.id))
            .await?;

        let job = BuildJob {
            build_id: build_id.clone(),
            site_id: config.site_id.clone(),
            trigger: TriggerKind::Webhook,
            repo: Some(RepoSpec {
                url: config.repo_url.clone(),
                branch: config.branch.clone(),
                project_id: config.repo_id.clone(),
                config_id: config.id.clone(),
            }),
            install_command: config.install_command.clone(),
            build_command: config.build_command.clone(),
            output_dir: config.output_dir.clone(),
            prebuilt_dir: None,
            hosting_key: config.hosting_key.clone(),
            hosting_secret_enc: config.hosting_secret_enc.clone(),
            kms_key_id: config.kms_key_id.clone(),
            env_vars_enc: config.env_vars_enc.clone(),
        };

        info!(build_id, "Triggered git deploy");
        self.dispatch(job).await?;
        Ok(build_id)
    }

    /// Start a build for a prebuilt directory uploaded through the API.
    #[instrument(skip_all, fields(site_id = %params.site_id))]
    pub async fn trigger_web_deploy(&self, params: WebDeployParams) -> Result<String, BuildError> {
        self.authorize(&params.site_id).await?;

        let build_id = Uuid::new_v4().to_string();
        self.db
            .create_build(&build_id, &params.site_id, None)
            .await?;

        let job = BuildJob {
            build_id: build_id.clone(),
            site_id: params.site_id,
            trigger: TriggerKind::Api,
            repo: None,
            install_command: None,
            build_command: None,
            output_dir: params.output_dir,
            prebuilt_dir: Some(params.prebuilt_dir),
            hosting_key: params.hosting_key,
            hosting_secret_enc: params.hosting_secret_enc,
            kms_key_id: params.kms_key_id,
            env_vars_enc: params.env_vars_enc,
        };

        info!(build_id, "Triggered web deploy");
        self.dispatch(job).await?;
        Ok(build_id)
    }

    async fn dispatch(&self, job: BuildJob) -> Result<(), BuildError> {
        match &self.dispatch {
            DispatchMode::Inline(worker) => {
                worker.run_job(&job).await?;
                Ok(())
            }
            DispatchMode::Queued => {
                let payload = serde_json::to_string(&job)?;
                self.db.enqueue_job(&job.build_id, &payload).await?;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use caravel_core::db::unix_timestamp;

    use crate::kms::{KeyService, KmsError};
    use crate::storage::NewDeployConfig;

    use super::super::worker::WorkerConfig;
    use super::*;

    struct FakeKms;

    #[async_trait::async_trait]
    impl KeyService for FakeKms {
        async fn encrypt(&self, plaintext: &str, _key_id: &str) -> Result<String, KmsError> {
            Ok(format!("enc:{plaintext}"))
        }

        async fn decrypt(&self, ciphertext: &str, _key_id: &str) -> Result<String, KmsError> {
            ciphertext
                .strip_prefix("enc:")
                .map(String::from)
                .ok_or(KmsError::Api { status: 400 })
        }
    }

    fn web_params(dir: &str) -> WebDeployParams {
        WebDeployParams {
            site_id: "site-1".to_string(),
            prebuilt_dir: dir.to_string(),
            output_dir: "dist".to_string(),
            hosting_key: "hk".to_string(),
            hosting_secret_enc: "enc:hs".to_string(),
            kms_key_id: "key-1".to_string(),
            env_vars_enc: None,
        }
    }

    #[tokio::test]
    async fn queued_dispatch_creates_pending_build_and_job() {
        let db = Database::open_in_memory().await.unwrap();
        let service = BuildService::new(db.clone(), DispatchMode::Queued);

        let build_id = service
            .trigger_web_deploy(web_params("/srv/uploads/site-1"))
            .await
            .unwrap();

        let build = db.get_build(&build_id).await.unwrap();
        assert_eq!(build.build_status, "pending");

        let job = db.claim_next_job("w1").await.unwrap().unwrap();
        assert_eq!(job.build_id, build_id);
        let parsed: BuildJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(parsed.trigger, TriggerKind::Api);
        assert_eq!(parsed.prebuilt_dir.as_deref(), Some("/srv/uploads/site-1"));
        // Only the encrypted form of the secret rides on the queue.
        assert_eq!(parsed.hosting_secret_enc, "enc:hs");
    }

    #[tokio::test]
    async fn inline_dispatch_runs_the_build_to_completion() {
        let db = Database::open_in_memory().await.unwrap();
        let worker = Arc::new(BuildWorker::new(
            db.clone(),
            Arc::new(FakeKms),
            None,
            WorkerConfig {
                workdir: std::env::temp_dir().join("caravel-service-tests"),
                upload_bin: "echo".to_string(),
                build_timeout: Duration::from_secs(30),
            },
        ));
        let service = BuildService::new(db.clone(), DispatchMode::Inline(worker));

        let dir = tempfile::tempdir().unwrap();
        let build_id = service
            .trigger_web_deploy(web_params(dir.path().to_str().unwrap()))
            .await
            .unwrap();

        let build = db.get_build(&build_id).await.unwrap();
        assert_eq!(build.build_status, "success");
        // `sh` strips the quoting before echo prints the line.
        assert!(build.logs.contains("upload --site site-1 --dir dist"));
    }

    #[tokio::test]
    async fn denied_site_access_refuses_the_trigger_before_any_record() {
        use crate::sites::{SiteDirectory, SiteError, SiteInfo};

        struct DenyingSites;

        #[async_trait::async_trait]
        impl SiteDirectory for DenyingSites {
            async fn get_website_with_access(
                &self,
                _site_id: &str,
                _require_write: bool,
            ) -> Result<SiteInfo, SiteError> {
                Err(SiteError::Api {
                    status: 403,
                    message: "Forbidden".into(),
                })
            }

            async fn update_website(
                &self,
                _site_id: &str,
                _patch: &serde_json::Value,
            ) -> Result<(), SiteError> {
                Ok(())
            }
        }

        let db = Database::open_in_memory().await.unwrap();
        let service = BuildService::new(db.clone(), DispatchMode::Queued)
            .with_site_directory(Arc::new(DenyingSites));

        let err = service
            .trigger_web_deploy(web_params("/srv/uploads/site-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, BuildError::Site(_)));

        // No build row and no queued job were created.
        let builds: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(builds, 0);
        assert!(db.claim_next_job("w1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn git_deploy_job_carries_the_config_repo() {
        let db = Database::open_in_memory().await.unwrap();
        let config = db
            .create_deploy_config(&NewDeployConfig {
                site_id: "site-1".to_string(),
                repo_id: "proj-9".to_string(),
                repo_url: "https://git.example.com/alice/site.git".to_string(),
                repo_owner: "alice".to_string(),
                repo_name: "site".to_string(),
                webhook_id: Some("77".to_string()),
                branch: "main".to_string(),
                install_command: Some("npm ci".to_string()),
                build_command: Some("npm run build".to_string()),
                output_dir: "dist".to_string(),
                hosting_key: "hk".to_string(),
                hosting_secret_enc: "enc:hs".to_string(),
                kms_key_id: "key-1".to_string(),
                env_vars_enc: None,
                credential_id: None,
            })
            .await
            .unwrap();

        let service = BuildService::new(db.clone(), DispatchMode::Queued);
        let build_id = service.trigger_git_deploy(&config).await.unwrap();

        let build = db.get_build(&build_id).await.unwrap();
        assert_eq!(build.config_id.as_deref(), Some(config.id.as_str()));

        let job = db.claim_next_job("w1").await.unwrap().unwrap();
        let parsed: BuildJob = serde_json::from_str(&job.payload).unwrap();
        assert_eq!(parsed.trigger, TriggerKind::Webhook);
        let repo = parsed.repo.unwrap();
        assert_eq!(repo.project_id, "proj-9");
        assert_eq!(repo.branch, "main");

        // Timestamps exist and are sane.
        assert!(build.created_at <= unix_timestamp());
    }
}
