//! Content-hash reputation lookup.

use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::debug;

use crate::config::ReputationConfig;
use crate::error::{Error, Result};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// VirusTotal v3 file report client.
pub struct VirusTotal {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl VirusTotal {
    pub fn new(config: &ReputationConfig) -> Result<Self> {
        if config.api_key.trim().is_empty() {
            return Err(Error::Config(
                "reputation.api_key must be set when reputation lookups are enabled".into(),
            ));
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// File report for `sha256`, or `None` when the hash has never been seen.
    pub async fn lookup(&self, sha256: &str) -> Result<Option<serde_json::Value>> {
        let url = format!("{}/files/{}", self.base_url, sha256);
        debug!("Reputation lookup: GET {}", url);

        let response = self
            .http
            .get(&url)
            .header("x-apikey", &self.api_key)
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response.json().await?)),
            status => Err(Error::Transport(format!(
                "reputation lookup returned {}",
                status
            ))),
        }
    }
}
