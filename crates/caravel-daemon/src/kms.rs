//! Key-management service client.
//!
//! Deploy configs store the hosting secret and environment bundle only in
//! encrypted form; this collaborator turns them back into plaintext inside
//! the worker process and nowhere else. It is unrelated to the TEE secrets
//! handshake, which has its own key agreement.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Key-management client errors. Neither variant ever carries plaintext.
#[derive(Debug, Error)]
pub enum KmsError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Key service error ({status})")]
    Api { status: u16 },

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Encrypt/decrypt against named keys.
#[async_trait]
pub trait KeyService: Send + Sync {
    async fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String, KmsError>;
    async fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String, KmsError>;
}

#[derive(Serialize)]
struct KeyRequest<'a> {
    key_id: &'a str,
    payload: &'a str,
}

#[derive(Deserialize)]
struct KeyResponse {
    payload: String,
}

/// Remote key-management service over HTTPS.
#[derive(Debug)]
pub struct HttpKeyService {
    http: reqwest::Client,
    base_url: String,
}

impl HttpKeyService {
    pub fn new(base_url: &str, api_key: &str) -> Result<Self, KmsError> {
        if base_url.is_empty() {
            return Err(KmsError::Config("base_url is empty".into()));
        }
        let mut headers = reqwest::header::HeaderMap::new();
        let key_val = reqwest::header::HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| KmsError::Config("Invalid API key format".into()))?;
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

    async fn call(&self, action: &str, payload: &str, key_id: &str) -> Result<String, KmsError> {
        let url = format!("{}/v1/{action}", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&KeyRequest { key_id, payload })
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            // Body intentionally dropped: decrypt responses must never be
            // echoed into an error message.
            return Err(KmsError::Api {
                status: status.as_u16(),
            });
        }
        let body: KeyResponse = resp.json().await?;
        Ok(body.payload)
    }
}

#[async_trait]
impl KeyService for HttpKeyService {
    async fn encrypt(&self, plaintext: &str, key_id: &str) -> Result<String, KmsError> {
        self.call("encrypt", plaintext, key_id).await
    }

    async fn decrypt(&self, ciphertext: &str, key_id: &str) -> Result<String, KmsError> {
        self.call("decrypt", ciphertext, key_id).await
    }
}
