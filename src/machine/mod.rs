//! Sandbox Machine capability.
//!
//! The host session only ever talks to a [`Machine`]; which virtualization
//! backend sits behind it is chosen from `host.provider`.

mod virtualbox;

pub use virtualbox::VirtualBox;

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use crate::config::{HostConfig, SandboxDescriptor};
use crate::error::{Error, Result};
use crate::exec::CommandRunner;

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Machine: Send + Sync {
    /// Boot the sandbox without a display.
    async fn start(&self) -> Result<()>;

    /// Power the sandbox off.
    async fn stop(&self) -> Result<()>;

    async fn pause(&self) -> Result<()>;

    /// Restore the configured snapshot.
    async fn revert(&self) -> Result<()>;

    async fn is_running(&self) -> Result<bool>;

    /// Backend-specific description of the sandbox.
    async fn info(&self) -> Result<String>;

    /// Write a raw memory image of the running sandbox to `destination`.
    async fn memory_dump(&self, destination: &Path) -> Result<()>;
}

/// Build the backend named by `host.provider` for `sandbox`.
pub fn connect(
    host: &HostConfig,
    sandbox: &SandboxDescriptor,
    runner: Arc<dyn CommandRunner>,
) -> Result<Arc<dyn Machine>> {
    match host.provider.trim().to_ascii_lowercase().as_str() {
        "virtualbox" | "vbox" => Ok(Arc::new(VirtualBox::new(
            &host.vboxmanage,
            sandbox,
            runner,
        ))),
        other => Err(Error::Config(format!(
            "unknown sandbox provider '{}'",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::MockCommandRunner;

    fn descriptor() -> SandboxDescriptor {
        SandboxDescriptor {
            name: "ubuntu".into(),
            uuid: None,
            snapshot: None,
            address: "192.168.56.101:9001".into(),
            platform: "linux".into(),
            profile: None,
        }
    }

    #[test]
    fn unknown_provider_is_a_config_error() {
        let host = HostConfig {
            provider: "qemu".into(),
            ..HostConfig::default()
        };
        let result = connect(&host, &descriptor(), Arc::new(MockCommandRunner::new()));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn virtualbox_is_the_default_provider() {
        let host = HostConfig::default();
        assert!(connect(&host, &descriptor(), Arc::new(MockCommandRunner::new())).is_ok());
    }
}
