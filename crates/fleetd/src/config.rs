//! fleetd.toml configuration parser.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleetgrid_rollout::NotificationSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetdConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub rollout: RolloutConfig,
    pub dispatcher: DispatcherConfig,
    pub repo_builder: RepoBuilderConfig,
    pub scripts: ScriptsConfig,
    /// Absent: notifications are disabled.
    pub notifications: Option<NotificationsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutConfig {
    /// Wait after a device reports success before committing it.
    #[serde(default = "default_reboot_grace_secs")]
    pub reboot_grace_secs: u64,
    /// How long shutdown waits for in-flight rollouts.
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default = "default_remote_name")]
    pub remote_name: String,
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            reboot_grace_secs: default_reboot_grace_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            remote_name: default_remote_name(),
        }
    }
}

impl RolloutConfig {
    pub fn reboot_grace(&self) -> Duration {
        Duration::from_secs(self.reboot_grace_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub url: String,
    #[serde(default = "default_dispatcher_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepoBuilderConfig {
    pub url: String,
    #[serde(default = "default_builder_timeout_secs")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptsConfig {
    /// Directory rendered playbooks are written to.
    pub dir: PathBuf,
    /// Externally reachable base URL of this API.
    pub public_url: String,
    #[serde(default = "default_fleet_env")]
    pub fleet_env: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationsConfig {
    pub url: String,
    #[serde(default = "default_notification_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(flatten)]
    pub settings: NotificationSettings,
}

fn default_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("/var/lib/fleetgrid")
}

fn default_reboot_grace_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_remote_name() -> String {
    "rhel-edge".to_string()
}

fn default_dispatcher_timeout_secs() -> u64 {
    30
}

fn default_builder_timeout_secs() -> u64 {
    600
}

fn default_notification_timeout_secs() -> u64 {
    10
}

fn default_fleet_env() -> String {
    "dev".to_string()
}

impl FleetdConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: FleetdConfig = toml::from_str(content)?;
        Ok(config)
    }
}
