//! Control channel between the host controller and the in-guest agent.
//!
//! Guest side endpoints: `/health`, `/start`, `/transfer`, `/status`.
//! Host side endpoints: `/health`, `/status/{uuid}`, `/collection/{uuid}`,
//! `/finished/{uuid}`. Every message after `/start` carries the session id.

mod client;

pub use client::{AgentClient, HostClient};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

pub const HEALTH_PATH: &str = "/health";
pub const START_PATH: &str = "/start";
pub const TRANSFER_PATH: &str = "/transfer";
pub const AGENT_STATUS_PATH: &str = "/status";

pub const STATUS_PATH: &str = "/status";
pub const COLLECTION_PATH: &str = "/collection";
pub const FINISHED_PATH: &str = "/finished";

/// Body returned by every `/health` endpoint.
pub const HEALTH_BODY: &str = "I'm OK";

/// Multipart field carrying uploaded files, both for samples and artifacts.
pub const FILE_FIELD: &str = "file";

/// Opaque identifier minted by the host for one analysis run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Mint a fresh identifier.
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Accept an identifier received over the wire.
    ///
    /// Identifiers become directory names under the result root and path
    /// segments of control URLs, so only ASCII letters, digits, `-` and `_`
    /// are allowed.
    pub fn parse(raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::Validation("session id is empty".into()));
        }
        if !raw
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(Error::Validation(format!("invalid session id '{}'", raw)));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

/// Query parameters of `/start`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub executor: Option<String>,
}

/// Form body of `/status/{uuid}`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct StatusForm {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

/// Guest-to-host half of the control channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Reporter: Send + Sync {
    /// Informational status line; `error` carries failure detail.
    async fn status(&self, session: &SessionId, message: &str, error: Option<String>)
    -> Result<()>;

    /// Upload one artifact; the host stores it as `<root>/<session>/<filename>`.
    async fn submit_artifact(
        &self,
        session: &SessionId,
        filename: &str,
        content: Vec<u8>,
    ) -> Result<()>;

    /// Last message of a session.
    async fn finished(&self, session: &SessionId) -> Result<()>;
}

/// Host-to-guest half of the control channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AgentApi: Send + Sync {
    /// `Ok(true)` when the agent answered its health probe with a success status.
    async fn health(&self) -> Result<bool>;

    async fn transfer(&self, filename: &str, content: Vec<u8>) -> Result<()>;

    /// Trigger analysis; returns the id echoed by the agent.
    async fn begin(&self, session: &SessionId, executor: Option<String>) -> Result<SessionId>;
}
