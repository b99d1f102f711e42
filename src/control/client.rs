//! reqwest implementations of both control channel halves.

use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use std::time::Duration;
use tracing::debug;

use super::{
    AgentApi, COLLECTION_PATH, FILE_FIELD, FINISHED_PATH, HEALTH_PATH, Reporter, START_PATH,
    STATUS_PATH, SessionId, TRANSFER_PATH,
};
use crate::error::{Error, Result};

/// Guest-side client for the host collection server.
#[derive(Debug, Clone)]
pub struct HostClient {
    http: reqwest::Client,
    base_url: String,
    upload_timeout: Duration,
}

impl HostClient {
    pub fn new(base_url: &str, request_timeout: Duration, upload_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(base_url),
            upload_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str, session: &SessionId) -> String {
        format!("{}{}/{}", self.base_url, path, session)
    }
}

#[async_trait]
impl Reporter for HostClient {
    async fn status(
        &self,
        session: &SessionId,
        message: &str,
        error: Option<String>,
    ) -> Result<()> {
        let mut form = vec![("message", message.to_string())];
        if let Some(error) = error {
            form.push(("error", error));
        }

        let resp = self
            .http
            .post(self.url(STATUS_PATH, session))
            .form(&form)
            .send()
            .await?;
        ensure_success(resp, "status update").await?;
        Ok(())
    }

    async fn submit_artifact(
        &self,
        session: &SessionId,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let size = content.len();
        let part = Part::bytes(content).file_name(filename.to_string());
        let form = Form::new().part(FILE_FIELD, part);

        let resp = self
            .http
            .post(self.url(COLLECTION_PATH, session))
            .multipart(form)
            .timeout(self.upload_timeout)
            .send()
            .await?;
        ensure_success(resp, "artifact upload").await?;
        debug!("Uploaded {} ({} bytes) for {}", filename, size, session);
        Ok(())
    }

    async fn finished(&self, session: &SessionId) -> Result<()> {
        let resp = self
            .http
            .get(self.url(FINISHED_PATH, session))
            .send()
            .await?;
        ensure_success(resp, "finished signal").await?;
        Ok(())
    }
}

/// Host-side client for the in-guest agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    http: reqwest::Client,
    base_url: String,
    transfer_timeout: Duration,
}

impl AgentClient {
    /// `address` is either `ip:port` or a full URL.
    pub fn new(address: &str, request_timeout: Duration, transfer_timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()?;
        Ok(Self {
            http,
            base_url: normalize_base_url(address),
            transfer_timeout,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl AgentApi for AgentClient {
    async fn health(&self) -> Result<bool> {
        let resp = self
            .http
            .get(format!("{}{}", self.base_url, HEALTH_PATH))
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn transfer(&self, filename: &str, content: Vec<u8>) -> Result<()> {
        let part = Part::bytes(content).file_name(filename.to_string());
        let form = Form::new().part(FILE_FIELD, part);

        let resp = self
            .http
            .post(format!("{}{}", self.base_url, TRANSFER_PATH))
            .multipart(form)
            .timeout(self.transfer_timeout)
            .send()
            .await?;
        ensure_success(resp, "sample transfer").await?;
        Ok(())
    }

    async fn begin(&self, session: &SessionId, executor: Option<String>) -> Result<SessionId> {
        let mut query = vec![("uuid", session.to_string())];
        if let Some(executor) = executor.filter(|e| !e.is_empty()) {
            query.push(("executor", executor));
        }

        let resp = self
            .http
            .get(format!("{}{}", self.base_url, START_PATH))
            .query(&query)
            .send()
            .await?;
        let resp = ensure_success(resp, "begin analysis").await?;
        let body = resp.text().await?;
        SessionId::parse(&body)
    }
}

async fn ensure_success(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(Error::Transport(format!(
        "{} returned {}: {}",
        what,
        status,
        body.trim()
    )))
}

fn normalize_base_url(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{}", trimmed)
    }
}
