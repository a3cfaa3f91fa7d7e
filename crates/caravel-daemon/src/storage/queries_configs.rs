//! Deploy configuration and source-host credential queries.

use caravel_core::db::unix_timestamp;
use uuid::Uuid;

use super::db::{Database, DatabaseError};
use super::models::{DeployConfigRow, NewDeployConfig, ProjectCredentialRow};

impl Database {
    /// Create a deploy configuration, enforcing at most one active config
    /// per source repository.
    ///
    /// The existence check precedes the insert; the partial unique index on
    /// `(repo_id) WHERE status = 'active'` closes the race two concurrent
    /// creates would otherwise win together.
    pub async fn create_deploy_config(
        &self,
        config: &NewDeployConfig,
    ) -> Result<DeployConfigRow, DatabaseError> {
        if self.get_active_config_by_repo(&config.repo_id).await.is_ok() {
            return Err(DatabaseError::Conflict(format!(
                "Repository {} already has an active deploy configuration",
                config.repo_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = unix_timestamp();

        let result = sqlx::query(
            r"
            INSERT INTO deploy_configs
                (id, site_id, repo_id, repo_url, repo_owner, repo_name, webhook_id,
                 branch, install_command, build_command, output_dir, hosting_key,
                 hosting_secret_enc, kms_key_id, env_vars_enc, credential_id,
                 status, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'active', ?, ?)
            ",
        )
        .bind(&id)
        .bind(&config.site_id)
        .bind(&config.repo_id)
        .bind(&config.repo_url)
        .bind(&config.repo_owner)
        .bind(&config.repo_name)
        .bind(&config.webhook_id)
        .bind(&config.branch)
        .bind(&config.install_command)
        .bind(&config.build_command)
        .bind(&config.output_dir)
        .bind(&config.hosting_key)
        .bind(&config.hosting_secret_enc)
        .bind(&config.kms_key_id)
        .bind(&config.env_vars_enc)
        .bind(&config.credential_id)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await;

        match result {
            Ok(_) => self.get_deploy_config(&id).await,
            Err(e) if e.to_string().contains("UNIQUE constraint failed") => {
                Err(DatabaseError::Conflict(format!(
                    "Repository {} already has an active deploy configuration",
                    config.repo_id
                )))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Get a deploy config by id (active or deleted).
    pub async fn get_deploy_config(&self, id: &str) -> Result<DeployConfigRow, DatabaseError> {
        sqlx::query_as::<_, DeployConfigRow>("SELECT * FROM deploy_configs WHERE id = ?")
            .bind(id)
            .fetch_optional(self.pool())
            .await?
            .ok_or_else(|| DatabaseError::NotFound(format!("Deploy config {id}")))
    }

    /// Get the active deploy config for a source repository.
    pub async fn get_active_config_by_repo(
        &self,
        repo_id: &str,
    ) -> Result<DeployConfigRow, DatabaseError> {
        sqlx::query_as::<_, DeployConfigRow>(
            "SELECT * FROM deploy_configs WHERE repo_id = ? AND status = 'active'",
        )
        .bind(repo_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Deploy config for repo {repo_id}")))
    }

    /// Update build settings and re-encrypted secrets on an active config.
    /// Secrets arrive already encrypted; plaintext never touches this layer.
    pub async fn update_deploy_config(
        &self,
        id: &str,
        branch: &str,
        install_command: Option<&str>,
        build_command: Option<&str>,
        output_dir: &str,
        hosting_secret_enc: &str,
        env_vars_enc: Option<&str>,
    ) -> Result<DeployConfigRow, DatabaseError> {
        sqlx::query(
            r"
            UPDATE deploy_configs
            SET branch = ?, install_command = ?, build_command = ?, output_dir = ?,
                hosting_secret_enc = ?, env_vars_enc = ?, updated_at = ?
            WHERE id = ? AND status = 'active'
            ",
        )
        .bind(branch)
        .bind(install_command)
        .bind(build_command)
        .bind(output_dir)
        .bind(hosting_secret_enc)
        .bind(env_vars_enc)
        .bind(unix_timestamp())
        .bind(id)
        .execute(self.pool())
        .await?;

        self.get_deploy_config(id).await
    }

    /// Soft-delete configs by id list. Called only after the remote webhook
    /// cleanup succeeded for each of them.
    pub async fn soft_delete_configs(&self, ids: &[String]) -> Result<u64, DatabaseError> {
        let now = unix_timestamp();
        let mut deleted = 0u64;

        for id in ids {
            let result = sqlx::query(
                "UPDATE deploy_configs SET status = 'deleted', updated_at = ? WHERE id = ? AND status = 'active'",
            )
            .bind(now)
            .bind(id)
            .execute(self.pool())
            .await?;
            deleted += result.rows_affected();
        }

        Ok(deleted)
    }

    // =========================================================================
    // Source-host project credentials
    // =========================================================================

    /// Insert or replace the single live credential set for a project.
    pub async fn upsert_credential(
        &self,
        project_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
        username: &str,
    ) -> Result<ProjectCredentialRow, DatabaseError> {
        let now = unix_timestamp();

        sqlx::query(
            r"
            INSERT INTO project_credentials
                (id, project_id, access_token, refresh_token, username, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(project_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = excluded.refresh_token,
                username = excluded.username,
                updated_at = excluded.updated_at
            ",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(project_id)
        .bind(access_token)
        .bind(refresh_token)
        .bind(username)
        .bind(now)
        .bind(now)
        .execute(self.pool())
        .await?;

        self.get_credential(project_id).await
    }

    /// Get the live credential set for a project.
    pub async fn get_credential(
        &self,
        project_id: &str,
    ) -> Result<ProjectCredentialRow, DatabaseError> {
        sqlx::query_as::<_, ProjectCredentialRow>(
            "SELECT * FROM project_credentials WHERE project_id = ?",
        )
        .bind(project_id)
        .fetch_optional(self.pool())
        .await?
        .ok_or_else(|| DatabaseError::NotFound(format!("Credentials for project {project_id}")))
    }

    /// Atomically replace the access token (and refresh token, when the host
    /// rotated it) in a single UPDATE, before any retry is attempted.
    pub async fn rotate_tokens(
        &self,
        project_id: &str,
        access_token: &str,
        refresh_token: Option<&str>,
    ) -> Result<(), DatabaseError> {
        let result = if let Some(refresh) = refresh_token {
            sqlx::query(
                "UPDATE project_credentials SET access_token = ?, refresh_token = ?, updated_at = ? WHERE project_id = ?",
            )
            .bind(access_token)
            .bind(refresh)
            .bind(unix_timestamp())
            .bind(project_id)
            .execute(self.pool())
            .await?
        } else {
            sqlx::query(
                "UPDATE project_credentials SET access_token = ?, updated_at = ? WHERE project_id = ?",
            )
            .bind(access_token)
            .bind(unix_timestamp())
            .bind(project_id)
            .execute(self.pool())
            .await?
        };

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound(format!(
                "Credentials for project {project_id}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample_config(repo_id: &str) -> NewDeployConfig {
        NewDeployConfig {
            site_id: "site-1".to_string(),
            repo_id: repo_id.to_string(),
            repo_url: "https://github.com/acme/site.git".to_string(),
            repo_owner: "acme".to_string(),
            repo_name: "site".to_string(),
            webhook_id: Some("hook-1".to_string()),
            branch: "main".to_string(),
            install_command: Some("npm install".to_string()),
            build_command: Some("npm run build".to_string()),
            output_dir: "dist".to_string(),
            hosting_key: "AKIA123".to_string(),
            hosting_secret_enc: "enc:secret".to_string(),
            kms_key_id: "key-1".to_string(),
            env_vars_enc: None,
            credential_id: None,
        }
    }

    #[tokio::test]
    async fn duplicate_active_config_is_conflict() {
        let db = Database::open_in_memory().await.unwrap();
        db.create_deploy_config(&sample_config("repo-1"))
            .await
            .unwrap();

        let result = db.create_deploy_config(&sample_config("repo-1")).await;
        assert!(matches!(result, Err(DatabaseError::Conflict(_))));
    }

    #[tokio::test]
    async fn soft_deleted_repo_can_be_relinked() {
        let db = Database::open_in_memory().await.unwrap();
        let config = db
            .create_deploy_config(&sample_config("repo-1"))
            .await
            .unwrap();
        db.soft_delete_configs(std::slice::from_ref(&config.id))
            .await
            .unwrap();

        // The partial index only covers active rows.
        assert!(db.create_deploy_config(&sample_config("repo-1")).await.is_ok());
    }

    #[tokio::test]
    async fn soft_delete_is_batched_and_idempotent() {
        let db = Database::open_in_memory().await.unwrap();
        let a = db.create_deploy_config(&sample_config("repo-a")).await.unwrap();
        let b = db.create_deploy_config(&sample_config("repo-b")).await.unwrap();

        let ids = vec![a.id.clone(), b.id.clone()];
        assert_eq!(db.soft_delete_configs(&ids).await.unwrap(), 2);
        assert_eq!(db.soft_delete_configs(&ids).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn credential_rotation_replaces_tokens() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_credential("proj-1", "tok-old", Some("refresh-old"), "octocat")
            .await
            .unwrap();

        db.rotate_tokens("proj-1", "tok-new", Some("refresh-new"))
            .await
            .unwrap();
        let creds = db.get_credential("proj-1").await.unwrap();
        assert_eq!(creds.access_token, "tok-new");
        assert_eq!(creds.refresh_token.as_deref(), Some("refresh-new"));

        // Host did not rotate the refresh token this time.
        db.rotate_tokens("proj-1", "tok-newer", None).await.unwrap();
        let creds = db.get_credential("proj-1").await.unwrap();
        assert_eq!(creds.access_token, "tok-newer");
        assert_eq!(creds.refresh_token.as_deref(), Some("refresh-new"));
    }

    #[tokio::test]
    async fn upsert_keeps_one_live_credential_per_project() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_credential("proj-1", "tok-a", None, "octocat")
            .await
            .unwrap();
        let second = db
            .upsert_credential("proj-1", "tok-b", Some("refresh-b"), "octocat")
            .await
            .unwrap();
        assert_eq!(second.access_token, "tok-b");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM project_credentials WHERE project_id = ?")
                .bind("proj-1")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn rotate_unknown_project_is_not_found() {
        let db = Database::open_in_memory().await.unwrap();
        let result = db.rotate_tokens("ghost", "tok", None).await;
        assert!(matches!(result, Err(DatabaseError::NotFound(_))));
    }
}
