//! Git host REST API client.
//!
//! Tokens are per-project, so unlike the provider client there is no default
//! authorization header; every call takes the token it should act as.

use std::future::Future;

use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use super::types::{GitUser, HookInfo, OAuthTokens, RepoInfo};

/// Git host API client errors. Variants never carry token material.
#[derive(Debug, Error)]
pub enum GitHostError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Git host API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential error: {0}")]
    Credentials(String),
}

impl GitHostError {
    /// Status code for API-level failures, if this is one.
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::Api { status, .. } => Some(*status),
            _ => None,
        }
    }
}

/// Configuration for the git host integration.
#[derive(Debug, Clone)]
pub struct GitHostConfig {
    /// Git host URL (e.g., "<https://git.example.com>").
    pub base_url: String,
    /// OAuth application client id.
    pub client_id: String,
    /// OAuth application client secret.
    pub client_secret: String,
    /// Public callback URL registered on every webhook.
    pub webhook_callback_url: String,
    /// Shared secret the host signs webhook deliveries with.
    pub webhook_secret: String,
}

#[derive(Serialize)]
struct TokenExchange<'a> {
    client_id: &'a str,
    client_secret: &'a str,
    grant_type: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    code: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    refresh_token: Option<&'a str>,
}

#[derive(Serialize)]
struct CreateHook<'a> {
    active: bool,
    events: &'a [&'a str],
    config: HookConfig<'a>,
}

#[derive(Serialize)]
struct HookConfig<'a> {
    url: &'a str,
    content_type: &'a str,
    secret: &'a str,
}

/// Git host REST API client.
#[derive(Debug)]
pub struct GitHostClient {
    http: reqwest::Client,
    config: GitHostConfig,
    base_url: String,
}

impl GitHostClient {
    /// Create a new git host API client.
    pub fn new(config: &GitHostConfig) -> Result<Self, GitHostError> {
        if config.base_url.is_empty() {
            return Err(GitHostError::Config("base_url is empty".into()));
        }
        if config.client_id.is_empty() || config.client_secret.is_empty() {
            return Err(GitHostError::Config("OAuth client credentials are empty".into()));
        }

        // Ensure a TLS crypto provider is installed (reqwest uses rustls-no-provider).
        // The `Err` case just means it was already installed — safe to ignore.
        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder().build()?;
        let base_url = config.base_url.trim_end_matches('/').to_string();
        Ok(Self {
            http,
            config: config.clone(),
            base_url,
        })
    }

    /// Build the API v1 URL for a given path.
    pub(crate) fn api_url(&self, path: &str) -> String {
        format!("{}/api/v1{}", self.base_url, path)
    }

    fn bearer(token: &str) -> Result<HeaderValue, GitHostError> {
        HeaderValue::from_str(&format!("Bearer {token}"))
            .map_err(|_| GitHostError::Credentials("Token contains invalid characters".into()))
    }

    /// Check HTTP response status, returning error for non-success codes.
    /// Only the status reason is kept; response bodies from authenticated
    /// endpoints are not echoed into errors.
    fn check_status(resp: &reqwest::Response) -> Result<(), GitHostError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(GitHostError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }

    /// Exchange an authorization code for a token pair.
    pub async fn exchange_code(&self, code: &str) -> Result<OAuthTokens, GitHostError> {
        self.token_request(&TokenExchange {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            grant_type: "authorization_code",
            code: Some(code),
            refresh_token: None,
        })
        .await
    }

    /// Trade a refresh token for a fresh token pair.
    pub async fn refresh_token(&self, refresh_token: &str) -> Result<OAuthTokens, GitHostError> {
        self.token_request(&TokenExchange {
            client_id: &self.config.client_id,
            client_secret: &self.config.client_secret,
            grant_type: "refresh_token",
            code: None,
            refresh_token: Some(refresh_token),
        })
        .await
    }

    async fn token_request(&self, body: &TokenExchange<'_>) -> Result<OAuthTokens, GitHostError> {
        let url = format!("{}/login/oauth/access_token", self.base_url);
        let resp = self
            .http
            .post(&url)
            .header(ACCEPT, "application/json")
            .json(body)
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    /// Fetch the user the token acts as.
    pub async fn current_user(&self, token: &str) -> Result<GitUser, GitHostError> {
        let resp = self
            .http
            .get(self.api_url("/user"))
            .header(AUTHORIZATION, Self::bearer(token)?)
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    /// List repositories the user owns, most recently pushed first.
    pub async fn list_repos(&self, token: &str) -> Result<Vec<RepoInfo>, GitHostError> {
        let url = format!(
            "{}?affiliation=owner&sort=pushed&per_page=100",
            self.api_url("/user/repos")
        );
        let resp = self
            .http
            .get(&url)
            .header(AUTHORIZATION, Self::bearer(token)?)
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    /// Register the daemon's push webhook on a repository. The callback URL
    /// and signing secret come from daemon configuration, not the caller.
    pub async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<HookInfo, GitHostError> {
        let url = self.api_url(&format!("/repos/{owner}/{repo}/hooks"));
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, Self::bearer(token)?)
            .json(&CreateHook {
                active: true,
                events: &["push"],
                config: HookConfig {
                    url: &self.config.webhook_callback_url,
                    content_type: "json",
                    secret: &self.config.webhook_secret,
                },
            })
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    /// Remove a webhook. A 404 counts as success: the hook is already gone,
    /// which is the state this call exists to reach.
    pub async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: u64,
    ) -> Result<(), GitHostError> {
        let url = self.api_url(&format!("/repos/{owner}/{repo}/hooks/{hook_id}"));
        let resp = self
            .http
            .delete(&url)
            .header(AUTHORIZATION, Self::bearer(token)?)
            .send()
            .await?;
        match Self::check_status(&resp) {
            Err(GitHostError::Api { status: 404, .. }) => {
                debug!(owner, repo, hook_id, "Webhook already absent on delete");
                Ok(())
            }
            other => other,
        }
    }

    /// Fork a repository into the user's namespace.
    pub async fn fork_repo(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
    ) -> Result<RepoInfo, GitHostError> {
        let url = self.api_url(&format!("/repos/{owner}/{repo}/forks"));
        let resp = self
            .http
            .post(&url)
            .header(AUTHORIZATION, Self::bearer(token)?)
            .send()
            .await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }
}

/// Run `op` with `token`; on a 401 (and only a 401) obtain a new token via
/// `refresh` and retry exactly once. Any other failure, including a failed
/// refresh or a second 401, propagates as-is.
pub async fn run_with_refresh<T, F, Fut, R, RFut>(
    token: String,
    mut op: F,
    refresh: R,
) -> Result<T, GitHostError>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<T, GitHostError>>,
    R: FnOnce() -> RFut,
    RFut: Future<Output = Result<String, GitHostError>>,
{
    match op(token).await {
        Err(err) if err.status() == Some(401) => {
            debug!("Access token rejected, refreshing once");
            let fresh = refresh().await?;
            op(fresh).await
        }
        other => other,
    }
}

/// Embed basic-auth credentials into an HTTPS clone URL.
///
/// The result is handed to the build script through the environment, never
/// through argv, so the token stays out of process listings.
pub fn authenticated_clone_url(
    repo_url: &str,
    username: &str,
    token: &str,
) -> Result<String, GitHostError> {
    let rest = repo_url
        .strip_prefix("https://")
        .ok_or_else(|| GitHostError::Config(format!("Unsupported clone URL: {repo_url}")))?;
    Ok(format!("https://{username}:{token}@{rest}"))
}
