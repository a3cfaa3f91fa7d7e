//! Deploy configuration service.
//!
//! Links a repository to a site: one active config per repository, with a
//! push webhook registered on the git host. Unlinking removes the remote
//! webhook before the local record, so a config row never outlives its hook
//! silently. Webhook calls run under the project's stored credentials and
//! pick up a refreshed token transparently when the host rejects the stored
//! one.

use caravel_core::db::DatabaseError;
use tracing::{info, instrument};

use crate::githost::{GitHostError, ProjectHost};
use crate::storage::{Database, DeployConfigRow, NewDeployConfig};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The repository already has an active deploy configuration.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Deploy config not found: {0}")]
    NotFound(String),

    #[error("Git host error: {0}")]
    GitHost(#[from] GitHostError),

    #[error("Database error: {0}")]
    Database(DatabaseError),
}

impl From<DatabaseError> for ConfigError {
    fn from(err: DatabaseError) -> Self {
        match err {
            DatabaseError::Conflict(msg) => Self::Conflict(msg),
            DatabaseError::NotFound(msg) => Self::NotFound(msg),
            other => Self::Database(other),
        }
    }
}

/// Everything needed to link a repository to a site. The repository id keys
/// the stored credentials used for webhook management.
#[derive(Debug, Clone)]
pub struct LinkRepositoryParams {
    pub site_id: String,
    pub repo_id: String,
    pub repo_url: String,
    pub repo_owner: String,
    pub repo_name: String,
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

pub struct ConfigService {
    db: Database,
    hosts: ProjectHost,
}

impl ConfigService {
    pub fn new(db: Database, hosts: ProjectHost) -> Self {
        Self { db, hosts }
    }

    /// Create a deploy config and register its push webhook.
    ///
    /// The conflict check runs before the webhook call: a repository that
    /// already has an active config never gets a second hook registered. A
    /// concurrent create losing the unique-index race cleans its hook up.
    #[instrument(skip_all, fields(repo_id = %params.repo_id))]
    pub async fn link_repository(
        &self,
        params: LinkRepositoryParams,
    ) -> Result<DeployConfigRow, ConfigError> {
        if self
            .db
            .get_active_config_by_repo(&params.repo_id)
            .await
            .is_ok()
        {
            return Err(ConfigError::Conflict(format!(
                "Repository {} already has an active deploy configuration",
                params.repo_id
            )));
        }

        let hook = self
            .hosts
            .create_webhook(&params.repo_id, &params.repo_owner, &params.repo_name)
            .await?;

        let created = self
            .db
            .create_deploy_config(&NewDeployConfig {
                site_id: params.site_id,
                repo_id: params.repo_id.clone(),
                repo_url: params.repo_url,
                repo_owner: params.repo_owner.clone(),
                repo_name: params.repo_name.clone(),
                webhook_id: Some(hook.id.to_string()),
                branch: params.branch,
                install_command: params.install_command,
                build_command: params.build_command,
                output_dir: params.output_dir,
                hosting_key: params.hosting_key,
                hosting_secret_enc: params.hosting_secret_enc,
                kms_key_id: params.kms_key_id,
                env_vars_enc: params.env_vars_enc,
                credential_id: params.credential_id,
            })
            .await;

        match created {
            Ok(config) => {
                info!(config_id = %config.id, hook_id = hook.id, "Linked repository");
                Ok(config)
            }
            Err(err) => {
                // Lost a concurrent race after registering the hook: remove
                // it so the loser leaves no webhook behind.
                if matches!(err, DatabaseError::Conflict(_)) {
                    self.hosts
                        .delete_webhook(
                            &params.repo_id,
                            &params.repo_owner,
                            &params.repo_name,
                            hook.id,
                        )
                        .await
                        .ok();
                }
                Err(err.into())
            }
        }
    }

    /// Remove a deploy config. The remote webhook is deleted first; if that
    /// fails the local record stays active so the operation can be retried.
    #[instrument(skip(self))]
    pub async fn unlink_repository(&self, config_id: &str) -> Result<(), ConfigError> {
        let config = self.db.get_deploy_config(config_id).await?;

        if let Some(hook_id) = config.webhook_id.as_deref().and_then(|s| s.parse::<u64>().ok()) {
            self.hosts
                .delete_webhook(&config.repo_id, &config.repo_owner, &config.repo_name, hook_id)
                .await?;
        }

        self.db
            .soft_delete_configs(std::slice::from_ref(&config.id))
            .await?;
        info!(config_id, "Unlinked repository");
        Ok(())
    }
}
