//! Project-keyed git host operations.
//!
//! Callers address operations by project id; the stored access token is
//! looked up per call, and a 401 triggers exactly one refresh-and-retry.
//! Rotated tokens are persisted before the retry, so a crash between the
//! refresh and the retry never strands a working token.

use std::sync::Arc;

use async_trait::async_trait;
use caravel_core::db::DatabaseError;

use crate::storage::Database;

use super::client::{GitHostClient, GitHostError, run_with_refresh};
use super::types::{HookInfo, OAuthTokens, RepoInfo};

/// Token-taking git host calls the project wrapper delegates to.
#[async_trait]
pub trait HostOps: Send + Sync {
    async fn list_repos(&self, token: &str) -> Result<Vec<RepoInfo>, GitHostError>;

    async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<HookInfo, GitHostError>;

    async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), GitHostError>;

    async fn fork_repo(&self, token: &str, owner: &str, repo: &str)
    -> Result<RepoInfo, GitHostError>;

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens, GitHostError>;
}

#[async_trait]
impl HostOps for GitHostClient {
    async fn list_repos(&self, token: &str) -> Result<Vec<RepoInfo>, GitHostError> {
        Self::list_repos(self, token).await
    }

    async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<HookInfo, GitHostError> {
        Self::create_webhook(self, token, owner, repo).await
    }

    async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), GitHostError> {
        Self::delete_webhook(self, token, owner, repo, hook_id).await
    }

    async fn fork_repo(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<RepoInfo, GitHostError> {
        Self::fork_repo(self, token, owner, repo).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens, GitHostError> {
        Self::refresh_token(self, refresh_token).await
    }
}

/// Git host operations bound to a project's stored credentials.
pub struct ProjectHost {
    db: Database,
    host: Arc<dyn HostOps>,
}

impl ProjectHost {
    pub fn new(db: Database, host: Arc<dyn HostOps>) -> Self {
        Self { db, host }
    }

    /// List repositories the project's user owns.
    pub async fn list_repos(&self, project_id: &str) -> Result<Vec<RepoInfo>, GitHostError> {
        self.with_token(project_id, |token| {
            let host = Arc::clone(&self.host);
            async move { host.list_repos(&token).await }
        })
        .await
    }

    /// Register the daemon's push webhook on a repository.
    pub async fn create_webhook(
        &self,
        project_id: &str,
        owner: &str,
        repo: &str,
    ) -> Result<HookInfo, GitHostError> {
        self.with_token(project_id, |token| {
            let host = Arc::clone(&self.host);
            async move { host.create_webhook(&token, owner, repo).await }
        })
        .await
    }

    /// Remove a webhook from a repository.
    pub async fn delete_webhook(
        &self,
        project_id: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), GitHostError> {
        self.with_token(project_id, |token| {
            let host = Arc::clone(&self.host);
            async move { host.delete_webhook(&token, owner, repo, hook_id).await }
        })
        .await
    }

    /// Fork a repository into the project user's namespace.
    pub async fn fork_repo(
        &self,
        project_id: &str,
        owner: &str,
        repo: &str,
    ) -> Result<RepoInfo, GitHostError> {
        self.with_token(project_id, |token| {
            let host = Arc::clone(&self.host);
            async move { host.fork_repo(&token, owner, repo).await }
        })
        .await
    }

    /// Run `op` with the project's stored access token, refreshing once on a
    /// 401. The rotated token pair hits the database before the retry runs.
    async fn with_token<T, F, Fut>(&self, project_id: &str, op: F) -> Result<T, GitHostError>
    where
        F: FnMut(String) -> Fut,
        Fut: std::future::Future<Output = Result<T, GitHostError>>,
    {
        let cred = self.db.get_credential(project_id).await.map_err(|err| match err {
            DatabaseError::NotFound(msg) => GitHostError::Credentials(msg),
            other => GitHostError::Credentials(other.to_string()),
        })?;
        let access = cred.access_token.clone();

        run_with_refresh(access, op, move || async move {
            let Some(refresh) = cred.refresh_token.as_deref() else {
                return Err(GitHostError::Credentials(
                    "Access token rejected and no refresh token on file".into(),
                ));
            };
            let tokens = self.host.refresh(refresh).await?;
            self.db
                .rotate_tokens(
                    project_id,
                    &tokens.access_token,
                    tokens.refresh_token.as_deref(),
                )
                .await
                .map_err(|err| {
                    GitHostError::Credentials(format!("Failed to persist rotated tokens: {err}"))
                })?;
            Ok(tokens.access_token)
        })
        .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::super::types::GitUser;
    use super::*;

    /// Rejects a designated stale token with 401; counts calls.
    #[derive(Default)]
    struct FlakyHost {
        lists: AtomicU32,
        refreshes: AtomicU32,
    }

    fn repo(name: &str) -> RepoInfo {
        RepoInfo {
            id: 1,
            name: name.to_string(),
            full_name: format!("alice/{name}"),
            clone_url: format!("https://git.example.com/alice/{name}.git"),
            default_branch: Some("main".to_string()),
            private: false,
            owner: GitUser {
                id: 7,
                login: "alice".to_string(),
            },
        }
    }

    #[async_trait]
    impl HostOps for FlakyHost {
        async fn list_repos(&self, token: &str) -> Result<Vec<RepoInfo>, GitHostError> {
            self.lists.fetch_add(1, Ordering::SeqCst);
            if token == "stale" {
                return Err(GitHostError::Api {
                    status: 401,
                    message: "Unauthorized".into(),
                });
            }
            Ok(vec![repo("site")])
        }

        async fn create_webhook(
            &self,
            _token: &str,
            _owner: &str,
            _repo: &str,
        ) -> Result<HookInfo, GitHostError> {
            Ok(HookInfo { id: 1 })
        }

        async fn delete_webhook(
            &self,
            _token: &str,
            _owner: &str,
            _repo: &str,
            _hook_id: u64,
        ) -> Result<(), GitHostError> {
            Ok(())
        }

        async fn fork_repo(
            &self,
            _token: &str,
            _owner: &str,
            _repo: &str,
        ) -> Result<RepoInfo, GitHostError> {
            Ok(repo("site"))
        }

        async fn refresh(&self, refresh_token: &str) -> Result<OAuthTokens, GitHostError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(OAuthTokens {
                access_token: "fresh".to_string(),
                refresh_token: Some(format!("{refresh_token}-next")),
                expires_in: Some(3600),
            })
        }
    }

    #[tokio::test]
    async fn stale_token_refreshes_once_and_persists_rotation() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_credential("proj-1", "stale", Some("r1"), "alice")
            .await
            .unwrap();

        let host = Arc::new(FlakyHost::default());
        let hosts = ProjectHost::new(db.clone(), Arc::clone(&host) as Arc<dyn HostOps>);

        let repos = hosts.list_repos("proj-1").await.unwrap();
        assert_eq!(repos.len(), 1);
        assert_eq!(host.lists.load(Ordering::SeqCst), 2);
        assert_eq!(host.refreshes.load(Ordering::SeqCst), 1);

        // Rotated pair is on disk before the retry ran.
        let cred = db.get_credential("proj-1").await.unwrap();
        assert_eq!(cred.access_token, "fresh");
        assert_eq!(cred.refresh_token.as_deref(), Some("r1-next"));
    }

    #[tokio::test]
    async fn missing_refresh_token_propagates_without_retry() {
        let db = Database::open_in_memory().await.unwrap();
        db.upsert_credential("proj-1", "stale", None, "alice")
            .await
            .unwrap();

        let host = Arc::new(FlakyHost::default());
        let hosts = ProjectHost::new(db, Arc::clone(&host) as Arc<dyn HostOps>);

        let err = hosts.list_repos("proj-1").await.unwrap_err();
        assert!(matches!(err, GitHostError::Credentials(_)));
        assert_eq!(host.lists.load(Ordering::SeqCst), 1);
        assert_eq!(host.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unknown_project_is_a_credential_error_before_any_call() {
        let db = Database::open_in_memory().await.unwrap();
        let host = Arc::new(FlakyHost::default());
        let hosts = ProjectHost::new(db, Arc::clone(&host) as Arc<dyn HostOps>);

        let err = hosts.list_repos("ghost").await.unwrap_err();
        assert!(matches!(err, GitHostError::Credentials(_)));
        assert_eq!(host.lists.load(Ordering::SeqCst), 0);
    }
}
