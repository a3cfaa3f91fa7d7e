//! Git host API response types.

use serde::Deserialize;

/// OAuth token pair from a code exchange or refresh.
///
/// Debug is intentionally not derived: token material must never end up in
/// log output by accident.
#[derive(Clone, Deserialize)]
pub struct OAuthTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
}

/// Authenticated user reference (subset of fields).
#[derive(Debug, Clone, Deserialize)]
pub struct GitUser {
    pub id: u64,
    pub login: String,
}

/// Repository from the git host API.
#[derive(Debug, Clone, Deserialize)]
pub struct RepoInfo {
    pub id: u64,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    #[serde(default)]
    pub default_branch: Option<String>,
    #[serde(default)]
    pub private: bool,
    pub owner: GitUser,
}

/// Registered webhook (subset of fields).
#[derive(Debug, Clone, Deserialize)]
pub struct HookInfo {
    pub id: u64,
}
