use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::paths::Paths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Resolved XDG-compliant paths (not serialized)
    #[serde(skip)]
    pub paths: Paths,

    /// File this config was loaded from (not serialized)
    #[serde(skip)]
    pub file: Option<PathBuf>,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub host: HostConfig,

    #[serde(default)]
    pub sandboxes: Vec<SandboxDescriptor>,

    #[serde(default)]
    pub forensics: ForensicsConfig,

    #[serde(default)]
    pub reputation: ReputationConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// In-guest agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Base URL of the host collection server, e.g. "http://192.168.56.1:9001"
    #[serde(default = "default_host_url")]
    pub host_url: String,

    /// Directory holding the staged sample and every analysis output
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// File name the staged sample is written under
    #[serde(default = "default_sample_name")]
    pub sample_name: String,

    /// Wall-clock budget for one analysis session
    #[serde(default = "default_deadline_secs")]
    pub deadline_secs: u64,

    /// Prepended to privileged commands (instrumentation harness, packet capture).
    /// Empty runs them directly.
    #[serde(default = "default_privilege_prefix")]
    pub privilege_prefix: Vec<String>,

    /// Kernel module loaded by the instrumentation harness
    #[serde(default = "default_harness_module")]
    pub harness_module: String,

    /// Interface passed to the packet capture tool (tool default when unset)
    #[serde(default)]
    pub capture_interface: Option<String>,

    #[serde(default = "default_yara_rules")]
    pub yara_rules: String,

    #[serde(default = "default_report_timeout_secs")]
    pub report_timeout_secs: u64,

    #[serde(default = "default_upload_timeout_secs")]
    pub upload_timeout_secs: u64,

    /// Largest accepted sample upload
    #[serde(default = "default_max_sample_mb")]
    pub max_sample_mb: usize,
}

/// Host controller settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// Artifact root; empty means `<data_dir>/results`
    #[serde(default)]
    pub result_dir: String,

    /// Sandbox backend: "virtualbox"
    #[serde(default = "default_provider")]
    pub provider: String,

    #[serde(default = "default_vboxmanage")]
    pub vboxmanage: String,

    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Give up on the agent after this long without a healthy answer
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,

    /// Give up waiting for the finished signal after this long
    #[serde(default = "default_finished_timeout_secs")]
    pub finished_timeout_secs: u64,

    /// Grace period for in-flight collection requests at shutdown
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_transfer_timeout_secs")]
    pub transfer_timeout_secs: u64,

    /// Largest accepted artifact upload
    #[serde(default = "default_max_upload_mb")]
    pub max_upload_mb: usize,
}

/// One sandbox virtual machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxDescriptor {
    pub name: String,

    /// Backend identifier; the name is used when absent
    #[serde(default)]
    pub uuid: Option<String>,

    /// Snapshot to revert to; the current snapshot when absent
    #[serde(default)]
    pub snapshot: Option<String>,

    /// `ip:port` of the in-guest agent
    pub address: String,

    /// Guest OS family: "linux" or "windows"
    #[serde(default = "default_platform")]
    pub platform: String,

    /// Memory forensics profile
    #[serde(default)]
    pub profile: Option<String>,
}

impl SandboxDescriptor {
    /// Identifier handed to the virtualization backend.
    pub fn machine_id(&self) -> &str {
        self.uuid.as_deref().unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interpreter")]
    pub interpreter: String,

    /// Path of the memory forensics tool
    #[serde(default = "default_tool_path")]
    pub tool_path: String,

    /// Budget covering the whole module batch
    #[serde(default = "default_forensics_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReputationConfig {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default)]
    pub api_key: String,

    #[serde(default = "default_reputation_base_url")]
    pub base_url: String,

    #[serde(default = "default_report_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_bind() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    9001
}
fn default_host_url() -> String {
    "http://192.168.56.1:9001".to_string()
}
fn default_staging_dir() -> String {
    "/tmp".to_string()
}
fn default_sample_name() -> String {
    "binary".to_string()
}
fn default_deadline_secs() -> u64 {
    300
}
fn default_privilege_prefix() -> Vec<String> {
    vec!["sudo".to_string()]
}
fn default_harness_module() -> String {
    "/opt/sandbay.ko".to_string()
}
fn default_yara_rules() -> String {
    "/opt/rules/index.yar".to_string()
}
fn default_report_timeout_secs() -> u64 {
    3
}
fn default_upload_timeout_secs() -> u64 {
    30
}
fn default_max_sample_mb() -> usize {
    256
}
fn default_provider() -> String {
    "virtualbox".to_string()
}
fn default_vboxmanage() -> String {
    "VBoxManage".to_string()
}
fn default_poll_interval_secs() -> u64 {
    3
}
fn default_agent_timeout_secs() -> u64 {
    300
}
fn default_finished_timeout_secs() -> u64 {
    900
}
fn default_drain_timeout_secs() -> u64 {
    6
}
fn default_request_timeout_secs() -> u64 {
    3
}
fn default_transfer_timeout_secs() -> u64 {
    30
}
fn default_max_upload_mb() -> usize {
    512
}
fn default_platform() -> String {
    "linux".to_string()
}
fn default_true() -> bool {
    true
}
fn default_interpreter() -> String {
    "python2.7".to_string()
}
fn default_tool_path() -> String {
    "/opt/volatility/vol.py".to_string()
}
fn default_forensics_timeout_secs() -> u64 {
    120
}
fn default_reputation_base_url() -> String {
    "https://www.virustotal.com/api/v3".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "text".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            host_url: default_host_url(),
            staging_dir: default_staging_dir(),
            sample_name: default_sample_name(),
            deadline_secs: default_deadline_secs(),
            privilege_prefix: default_privilege_prefix(),
            harness_module: default_harness_module(),
            capture_interface: None,
            yara_rules: default_yara_rules(),
            report_timeout_secs: default_report_timeout_secs(),
            upload_timeout_secs: default_upload_timeout_secs(),
            max_sample_mb: default_max_sample_mb(),
        }
    }
}

impl AgentConfig {
    pub fn staging_path(&self) -> PathBuf {
        PathBuf::from(shellexpand::tilde(&self.staging_dir).to_string())
    }

    pub fn sample_path(&self) -> PathBuf {
        self.staging_path().join(&self.sample_name)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            result_dir: String::new(),
            provider: default_provider(),
            vboxmanage: default_vboxmanage(),
            poll_interval_secs: default_poll_interval_secs(),
            agent_timeout_secs: default_agent_timeout_secs(),
            finished_timeout_secs: default_finished_timeout_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
            transfer_timeout_secs: default_transfer_timeout_secs(),
            max_upload_mb: default_max_upload_mb(),
        }
    }
}

impl Default for ForensicsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interpreter: default_interpreter(),
            tool_path: default_tool_path(),
            timeout_secs: default_forensics_timeout_secs(),
        }
    }
}

impl Default for ReputationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            api_key: String::new(),
            base_url: default_reputation_base_url(),
            timeout_secs: default_report_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load from `path`, or from `<config_dir>/config.toml` when `None`.
    /// A missing file is created from the commented template.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let paths = Paths::resolve()?;
        let file = match path {
            Some(p) => PathBuf::from(shellexpand::tilde(&p.to_string_lossy()).to_string()),
            None => {
                paths.ensure_dirs()?;
                paths.config_file()
            }
        };

        if !file.exists() {
            let config = Config {
                paths,
                file: Some(file),
                ..Config::default()
            };
            config.save_with_template()?;
            return Ok(config);
        }

        let content = fs::read_to_string(&file)
            .with_context(|| format!("Failed to read config {}", file.display()))?;
        let mut config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", file.display()))?;
        config.paths = paths;
        config.file = Some(file);

        // Expand environment variables in API keys
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    pub fn save(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(&path, content)?;

        Ok(())
    }

    /// Save config with a helpful template (for first-time setup)
    pub fn save_with_template(&self) -> Result<()> {
        let path = self.file_path();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(&path, DEFAULT_CONFIG_TEMPLATE)?;
        eprintln!("Created default config at {}", path.display());

        Ok(())
    }

    pub fn config_path() -> Result<PathBuf> {
        let paths = Paths::resolve()?;
        Ok(paths.config_file())
    }

    pub fn file_path(&self) -> PathBuf {
        self.file
            .clone()
            .unwrap_or_else(|| self.paths.config_file())
    }

    fn expand_env_vars(&mut self) {
        self.reputation.api_key = expand_env(&self.reputation.api_key);
        self.agent.host_url = expand_env(&self.agent.host_url);
    }

    fn validate(&self) -> Result<()> {
        for (i, sandbox) in self.sandboxes.iter().enumerate() {
            if sandbox.name.trim().is_empty() {
                anyhow::bail!("sandboxes[{}] has an empty name", i);
            }
            if sandbox.address.trim().is_empty() {
                anyhow::bail!("sandbox '{}' has no agent address", sandbox.name);
            }
            if self.sandboxes[..i].iter().any(|s| s.name == sandbox.name) {
                anyhow::bail!("sandbox '{}' is defined twice", sandbox.name);
            }
        }
        Ok(())
    }

    /// Pick a sandbox by name, or the only one configured when `name` is `None`.
    pub fn sandbox(&self, name: Option<&str>) -> Result<&SandboxDescriptor> {
        match name {
            Some(name) => self
                .sandboxes
                .iter()
                .find(|s| s.name == name)
                .with_context(|| format!("No sandbox named '{}' in config", name)),
            None => match self.sandboxes.as_slice() {
                [only] => Ok(only),
                [] => anyhow::bail!("No sandboxes configured; add a [[sandboxes]] entry"),
                _ => anyhow::bail!("Several sandboxes configured; pick one with --sandbox"),
            },
        }
    }

    /// Root directory for per-session results.
    pub fn result_root(&self) -> PathBuf {
        if self.host.result_dir.trim().is_empty() {
            self.paths.results_dir()
        } else {
            PathBuf::from(shellexpand::tilde(&self.host.result_dir).to_string())
        }
    }

    pub fn get_value(&self, key: &str) -> Result<String> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["agent", "bind"] => Ok(self.agent.bind.clone()),
            ["agent", "port"] => Ok(self.agent.port.to_string()),
            ["agent", "host_url"] => Ok(self.agent.host_url.clone()),
            ["agent", "staging_dir"] => Ok(self.agent.staging_dir.clone()),
            ["agent", "deadline_secs"] => Ok(self.agent.deadline_secs.to_string()),
            ["agent", "harness_module"] => Ok(self.agent.harness_module.clone()),
            ["agent", "yara_rules"] => Ok(self.agent.yara_rules.clone()),
            ["host", "bind"] => Ok(self.host.bind.clone()),
            ["host", "port"] => Ok(self.host.port.to_string()),
            ["host", "result_dir"] => Ok(self.result_root().display().to_string()),
            ["host", "provider"] => Ok(self.host.provider.clone()),
            ["host", "agent_timeout_secs"] => Ok(self.host.agent_timeout_secs.to_string()),
            ["host", "finished_timeout_secs"] => Ok(self.host.finished_timeout_secs.to_string()),
            ["forensics", "enabled"] => Ok(self.forensics.enabled.to_string()),
            ["forensics", "tool_path"] => Ok(self.forensics.tool_path.clone()),
            ["forensics", "timeout_secs"] => Ok(self.forensics.timeout_secs.to_string()),
            ["reputation", "enabled"] => Ok(self.reputation.enabled.to_string()),
            ["logging", "level"] => Ok(self.logging.level.clone()),
            ["logging", "format"] => Ok(self.logging.format.clone()),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }
    }

    pub fn set_value(&mut self, key: &str, value: &str) -> Result<()> {
        let parts: Vec<&str> = key.split('.').collect();

        match parts.as_slice() {
            ["agent", "bind"] => self.agent.bind = value.to_string(),
            ["agent", "port"] => self.agent.port = value.parse()?,
            ["agent", "host_url"] => self.agent.host_url = value.to_string(),
            ["agent", "staging_dir"] => self.agent.staging_dir = value.to_string(),
            ["agent", "deadline_secs"] => self.agent.deadline_secs = value.parse()?,
            ["agent", "harness_module"] => self.agent.harness_module = value.to_string(),
            ["agent", "yara_rules"] => self.agent.yara_rules = value.to_string(),
            ["host", "bind"] => self.host.bind = value.to_string(),
            ["host", "port"] => self.host.port = value.parse()?,
            ["host", "result_dir"] => self.host.result_dir = value.to_string(),
            ["host", "provider"] => self.host.provider = value.to_string(),
            ["host", "agent_timeout_secs"] => self.host.agent_timeout_secs = value.parse()?,
            ["host", "finished_timeout_secs"] => self.host.finished_timeout_secs = value.parse()?,
            ["forensics", "enabled"] => self.forensics.enabled = value.parse()?,
            ["forensics", "tool_path"] => self.forensics.tool_path = value.to_string(),
            ["forensics", "timeout_secs"] => self.forensics.timeout_secs = value.parse()?,
            ["reputation", "enabled"] => self.reputation.enabled = value.parse()?,
            ["logging", "level"] => self.logging.level = value.to_string(),
            ["logging", "format"] => self.logging.format = value.to_string(),
            _ => anyhow::bail!("Unknown config key: {}", key),
        }

        Ok(())
    }
}

fn expand_env(s: &str) -> String {
    if let Some(var_name) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else if let Some(var_name) = s.strip_prefix('$') {
        std::env::var(var_name).unwrap_or_else(|_| s.to_string())
    } else {
        s.to_string()
    }
}

/// Default config template with helpful comments (used for first-time setup)
pub const DEFAULT_CONFIG_TEMPLATE: &str = r#"# Sandbay Configuration
# Auto-created on first run. Edit as needed.

# In-guest agent (runs inside the sandbox VM)
[agent]
bind = "0.0.0.0"
port = 9001
host_url = "http://192.168.56.1:9001"
staging_dir = "/tmp"
sample_name = "binary"
deadline_secs = 300
privilege_prefix = ["sudo"]
harness_module = "/opt/sandbay.ko"
yara_rules = "/opt/rules/index.yar"
# capture_interface = "eth0"

# Host controller
[host]
bind = "0.0.0.0"
port = 9001
# Default: XDG data dir (~/.local/share/sandbay/results)
# result_dir = "~/sandbay-results"
provider = "virtualbox"
vboxmanage = "VBoxManage"
poll_interval_secs = 3
agent_timeout_secs = 300
finished_timeout_secs = 900
drain_timeout_secs = 6

# Sandboxes (one entry per VM)
# [[sandboxes]]
# name = "ubuntu-x64"
# snapshot = "clean"
# address = "192.168.56.101:9001"
# platform = "linux"                  # linux | windows
# profile = "LinuxUbuntu1604x64"

[forensics]
enabled = true
interpreter = "python2.7"
tool_path = "/opt/volatility/vol.py"
timeout_secs = 120

# Hash reputation lookups (optional)
# [reputation]
# enabled = true
# api_key = "${VIRUSTOTAL_API_KEY}"

[logging]
level = "info"
format = "text"                      # text | json
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_yields_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.agent.port, 9001);
        assert_eq!(config.agent.deadline_secs, 300);
        assert_eq!(config.host.poll_interval_secs, 3);
        assert_eq!(config.host.drain_timeout_secs, 6);
        assert_eq!(config.forensics.timeout_secs, 120);
        assert!(config.sandboxes.is_empty());
        assert!(!config.reputation.enabled);
    }

    #[test]
    fn template_parses() {
        let config: Config = toml::from_str(DEFAULT_CONFIG_TEMPLATE).unwrap();
        assert_eq!(config.agent.sample_name, "binary");
        assert_eq!(config.agent.privilege_prefix, vec!["sudo".to_string()]);
        assert_eq!(config.host.provider, "virtualbox");
        assert_eq!(config.logging.format, "text");
    }

    #[test]
    fn sandbox_entries_parse() {
        let config: Config = toml::from_str(
            r#"
            [[sandboxes]]
            name = "win7"
            address = "192.168.56.102:9001"
            platform = "windows"
            profile = "Win7SP1x64"

            [[sandboxes]]
            name = "ubuntu"
            uuid = "5f1c0d1e-aaaa-bbbb-cccc-0123456789ab"
            address = "192.168.56.101:9001"
            "#,
        )
        .unwrap();

        let win = config.sandbox(Some("win7")).unwrap();
        assert_eq!(win.platform, "windows");
        assert_eq!(win.machine_id(), "win7");

        let ubuntu = config.sandbox(Some("ubuntu")).unwrap();
        assert_eq!(ubuntu.platform, "linux");
        assert_eq!(ubuntu.machine_id(), "5f1c0d1e-aaaa-bbbb-cccc-0123456789ab");

        assert!(config.sandbox(None).is_err());
        assert!(config.sandbox(Some("missing")).is_err());
    }

    #[test]
    fn duplicate_sandbox_names_are_rejected() {
        let config: Config = toml::from_str(
            r#"
            [[sandboxes]]
            name = "vm"
            address = "10.0.0.1:9001"

            [[sandboxes]]
            name = "vm"
            address = "10.0.0.2:9001"
            "#,
        )
        .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn get_and_set_dotted_keys() {
        let mut config = Config::default();
        config.set_value("host.agent_timeout_secs", "42").unwrap();
        config.set_value("forensics.enabled", "false").unwrap();
        config.set_value("logging.format", "json").unwrap();

        assert_eq!(config.get_value("host.agent_timeout_secs").unwrap(), "42");
        assert_eq!(config.get_value("forensics.enabled").unwrap(), "false");
        assert_eq!(config.get_value("logging.format").unwrap(), "json");
        assert!(config.get_value("host.nope").is_err());
        assert!(config.set_value("host.port", "not-a-port").is_err());
    }

    #[test]
    fn result_root_prefers_explicit_dir() {
        let mut config = Config::default();
        assert!(config.result_root().ends_with("results"));

        config.host.result_dir = "/srv/sandbay".to_string();
        assert_eq!(config.result_root(), PathBuf::from("/srv/sandbay"));
    }

    #[test]
    fn expand_env_leaves_unknown_vars_untouched() {
        assert_eq!(
            expand_env("${SANDBAY_TEST_SURELY_UNSET_VAR}"),
            "${SANDBAY_TEST_SURELY_UNSET_VAR}"
        );
        assert_eq!(expand_env("plain-key"), "plain-key");
    }

    #[test]
    fn load_from_creates_template_then_reads_it_back() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("sandbay.toml");

        let created = Config::load_from(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(created.file_path(), path);

        let mut loaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(loaded.agent.host_url, "http://192.168.56.1:9001");

        loaded.set_value("agent.deadline_secs", "120").unwrap();
        loaded.save().unwrap();
        let reloaded = Config::load_from(Some(&path)).unwrap();
        assert_eq!(reloaded.agent.deadline_secs, 120);
    }
}
