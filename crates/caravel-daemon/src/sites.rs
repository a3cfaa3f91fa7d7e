//! Website directory client.
//!
//! The deploy pipeline needs two things from the wider platform: an access
//! check on the site being deployed and a way to patch site records after a
//! deploy. Everything else about websites lives behind this trait.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SiteError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Site directory error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Website record (subset of fields the deploy pipeline cares about).
#[derive(Debug, Clone, Deserialize)]
pub struct SiteInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub owner_id: Option<String>,
}

/// Access-checked site lookup and updates.
#[async_trait]
pub trait SiteDirectory: Send + Sync {
    /// Fetch a site, enforcing that the caller may read (or, with
    /// `require_write`, modify) it. Denied access surfaces as an API error.
    async fn get_website_with_access(
        &self,
        site_id: &str,
        require_write: bool,
    ) -> Result<SiteInfo, SiteError>;

    /// Patch fields on a site record.
    async fn update_website(
        &self,
        site_id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SiteError>;
}

/// Remote site directory over HTTPS.
#[derive(Debug)]
pub struct HttpSiteDirectory {
    http: reqwest::Client,
    base_url: String,
}

impl HttpSiteDirectory {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, SiteError> {
        if base_url.is_empty() {
            return Err(SiteError::Config("base_url is empty".into()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let key_val = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| SiteError::Config("Invalid API key format".into()))?;
        headers.insert(reqwest::header::AUTHORIZATION, key_val);

        let _ = rustls::crypto::ring::default_provider().install_default();

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn check_status(resp: &reqwest::Response) -> Result<(), SiteError> {
        let status = resp.status();
        if !status.is_success() {
            return Err(SiteError::Api {
                status: status.as_u16(),
                message: status.canonical_reason().unwrap_or("Unknown").into(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SiteDirectory for HttpSiteDirectory {
    async fn get_website_with_access(
        &self,
        site_id: &str,
        require_write: bool,
    ) -> Result<SiteInfo, SiteError> {
        let url = format!(
            "{}/v1/sites/{site_id}?access={}",
            self.base_url,
            if require_write { "write" } else { "read" }
        );
        let resp = self.http.get(&url).send().await?;
        Self::check_status(&resp)?;
        Ok(resp.json().await?)
    }

    async fn update_website(
        &self,
        site_id: &str,
        patch: &serde_json::Value,
    ) -> Result<(), SiteError> {
        let url = format!("{}/v1/sites/{site_id}", self.base_url);
        let resp = self.http.patch(&url).json(patch).send().await?;
        Self::check_status(&resp)?;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn empty_base_url_is_rejected() {
        let err = HttpSiteDirectory::new("", "key").unwrap_err();
        assert!(matches!(err, SiteError::Config(_)));
    }

    #[test]
    fn deserialize_site_minimal() {
        let site: SiteInfo =
            serde_json::from_str(r#"{"id":"site-1","name":"blog"}"#).unwrap();
        assert_eq!(site.id, "site-1");
        assert!(site.owner_id.is_none());
    }
}
