//! Per-session result directories on the host.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::control::SessionId;
use crate::error::{Error, Result};

/// File-system writer/reader used by the host for everything it persists.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FileStore: Send + Sync {
    /// Create or truncate `path` and write `data`.
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()>;

    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DiskStore;

#[async_trait]
impl FileStore for DiskStore {
    async fn write(&self, path: &Path, data: &[u8]) -> Result<()> {
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }
}

/// Lays out `<root>/<session>/<filename>`.
pub struct ArtifactStore {
    root: PathBuf,
    fs: Arc<dyn FileStore>,
    dir_lock: Mutex<()>,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn FileStore>) -> Self {
        Self {
            root: root.into(),
            fs,
            dir_lock: Mutex::new(()),
        }
    }

    pub fn on_disk(root: impl Into<PathBuf>) -> Self {
        Self::new(root, Arc::new(DiskStore))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn session_dir(&self, session: &SessionId) -> PathBuf {
        self.root.join(session.as_str())
    }

    /// Create the session directory. Concurrent first writes are serialized here.
    pub async fn ensure_session_dir(&self, session: &SessionId) -> Result<PathBuf> {
        let dir = self.session_dir(session);
        let _guard = self.dir_lock.lock().await;
        self.fs.create_dir_all(&dir).await?;
        Ok(dir)
    }

    /// Store `data` as `filename`, replacing any previous upload of the same name.
    pub async fn write_artifact(
        &self,
        session: &SessionId,
        filename: &str,
        data: &[u8],
    ) -> Result<PathBuf> {
        validate_filename(filename)?;
        let dir = self.ensure_session_dir(session).await?;
        let path = dir.join(filename);
        self.fs.write(&path, data).await?;
        debug!("Stored {} ({} bytes)", path.display(), data.len());
        Ok(path)
    }

    pub async fn read_artifact(&self, session: &SessionId, filename: &str) -> Result<Vec<u8>> {
        validate_filename(filename)?;
        self.fs.read(&self.session_dir(session).join(filename)).await
    }
}

fn validate_filename(filename: &str) -> Result<()> {
    if filename.is_empty()
        || filename == "."
        || filename == ".."
        || filename.contains(['/', '\\', '\0'])
    {
        return Err(Error::Validation(format!(
            "invalid artifact name '{}'",
            filename
        )));
    }
    Ok(())
}
