//! Deployer configuration stored in `deployer.toml`.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

/// Deployer configuration (TOML). Missing fields take the defaults below;
/// a missing file is the same as an empty one.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DeployerConfig {
    pub ssh: SshConfig,
    pub container: ContainerConfig,
    pub timeouts: TimeoutConfig,
    /// Cap on captured stdout and stderr per command, in bytes.
    pub output_limit_bytes: usize,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Wrap every command in `ssh` to the control host.
    Ssh,
    /// Run directly on this machine; used when the deployer lives on the host.
    Local,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    pub mode: TransportMode,
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_file: Option<PathBuf>,
    pub connect_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ContainerConfig {
    /// Template for the in-container command. Sees `vm_id` and `interpreter`.
    pub attach: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TimeoutConfig {
    pub command_secs: u64,
    pub inspection_secs: u64,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            mode: TransportMode::Ssh,
            host: "localhost".to_string(),
            port: 22,
            user: "root".to_string(),
            identity_file: None,
            connect_timeout_secs: 5,
        }
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            attach: "lxc-attach -n {{ vm_id }} -- {{ interpreter }}".to_string(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_secs: 10,
            inspection_secs: 30,
        }
    }
}

impl Default for DeployerConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            container: ContainerConfig::default(),
            timeouts: TimeoutConfig::default(),
            output_limit_bytes: 1_000_000,
        }
    }
}

impl TimeoutConfig {
    pub fn command(&self) -> Duration {
        Duration::from_secs(self.command_secs)
    }

    pub fn inspection(&self) -> Duration {
        Duration::from_secs(self.inspection_secs)
    }
}

impl DeployerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.timeouts.command_secs == 0 {
            return Err(anyhow!("timeouts.command_secs must be > 0"));
        }
        if self.timeouts.inspection_secs == 0 {
            return Err(anyhow!("timeouts.inspection_secs must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.ssh.mode == TransportMode::Ssh && self.ssh.host.trim().is_empty() {
            return Err(anyhow!("ssh.host must be set when ssh.mode = \"ssh\""));
        }
        if self.container.attach.trim().is_empty() {
            return Err(anyhow!("container.attach must not be empty"));
        }
        Ok(())
    }
}

/// Load config from a TOML file, or defaults when the file is missing.
pub fn load_config(path: &Path) -> Result<DeployerConfig> {
    if !path.exists() {
        let cfg = DeployerConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: DeployerConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk.
pub fn write_config(path: &Path, cfg: &DeployerConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    super::write_atomic(path, &buf)
}
