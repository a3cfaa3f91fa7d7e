//! Git hosting provider integration.
//!
//! OAuth token exchange and refresh, repository listing, webhook management,
//! and forking. Build workers use these tokens for authenticated clones; the
//! tokens themselves never appear in logs or error messages.

mod client;
mod project;
mod types;

#[cfg(test)]
mod tests;

pub use client::{
    GitHostClient, GitHostConfig, GitHostError, authenticated_clone_url, run_with_refresh,
};
pub use project::{HostOps, ProjectHost};
pub use types::{GitUser, HookInfo, OAuthTokens, RepoInfo};
