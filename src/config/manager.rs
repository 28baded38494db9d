//! Manager configuration (`~/.arkfleet/config.yaml`)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::cluster::ports::PortConfig;

/// Default API port of the manager
pub const DEFAULT_API_PORT: u16 = 8280;

/// SteamCMD app id of the ASA dedicated server
pub const ASA_SERVER_APP_ID: u32 = 2430930;

/// Default config file location: ~/.arkfleet/config.yaml
pub fn default_config_path() -> PathBuf {
    default_home().join("config.yaml")
}

fn default_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".arkfleet")
}

/// The complete configuration file structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// HTTP API
    #[serde(default)]
    pub server: ApiConfig,

    /// Root for clusters, artifacts, backups and the job journal.
    /// Supports `~` and `$VAR` expansion.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Docker supervisor
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Lifecycle timeouts and saving
    #[serde(default)]
    pub lifecycle: LifecycleConfig,

    /// Port layout suggested for new clusters
    #[serde(default)]
    pub ports: PortConfig,

    /// SteamCMD installation
    #[serde(default)]
    pub install: InstallConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            server: ApiConfig::default(),
            data_dir: default_data_dir(),
            supervisor: SupervisorConfig::default(),
            lifecycle: LifecycleConfig::default(),
            ports: PortConfig::default(),
            install: InstallConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.arkfleet".to_string()
}

/// HTTP API binding
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Address to bind
    #[serde(default = "default_bind_address")]
    pub bind_addr: String,
    /// Port to listen on
    #[serde(default = "default_api_port")]
    pub port: u16,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_address(),
            port: DEFAULT_API_PORT,
        }
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    DEFAULT_API_PORT
}

/// Docker supervisor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Docker CLI binary
    #[serde(default = "default_docker_binary")]
    pub docker_binary: String,

    /// Image the server containers are created from
    #[serde(default = "default_image")]
    pub image: String,

    /// Command prefix run inside the container to send an RCON command
    #[serde(default = "default_rcon_exec")]
    pub rcon_exec: Vec<String>,

    /// Mount point of the server's data directory inside the container
    #[serde(default = "default_container_data_path")]
    pub container_data_path: String,

    /// Container restart policy
    #[serde(default = "default_restart_policy")]
    pub restart_policy: String,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            docker_binary: default_docker_binary(),
            image: default_image(),
            rcon_exec: default_rcon_exec(),
            container_data_path: default_container_data_path(),
            restart_policy: default_restart_policy(),
        }
    }
}

fn default_docker_binary() -> String {
    "docker".to_string()
}

fn default_image() -> String {
    "mschnitzer/asa-linux-server:latest".to_string()
}

fn default_rcon_exec() -> Vec<String> {
    vec!["asa-ctrl".into(), "rcon".into(), "--exec".into()]
}

fn default_container_data_path() -> String {
    "/home/gameserver/server-files".to_string()
}

fn default_restart_policy() -> String {
    "unless-stopped".to_string()
}

/// Lifecycle orchestration settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LifecycleConfig {
    /// Timeout for supervisor start/stop/restart calls (seconds)
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_secs: u64,

    /// Timeout for the save issued before stop and backup (seconds)
    #[serde(default = "default_save_timeout")]
    pub save_timeout_secs: u64,

    /// RCON command that flushes the world to disk
    #[serde(default = "default_save_command")]
    pub save_command: String,

    /// Issue the save command before every stop
    #[serde(default = "default_true")]
    pub save_before_stop: bool,

    /// How long finished jobs stay listed and journaled (hours)
    #[serde(default = "default_job_retention")]
    pub job_retention_hours: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            operation_timeout_secs: default_operation_timeout(),
            save_timeout_secs: default_save_timeout(),
            save_command: default_save_command(),
            save_before_stop: true,
            job_retention_hours: default_job_retention(),
        }
    }
}

impl LifecycleConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn save_timeout(&self) -> Duration {
        Duration::from_secs(self.save_timeout_secs)
    }

    pub fn job_retention(&self) -> Duration {
        Duration::from_secs(self.job_retention_hours * 3600)
    }
}

fn default_operation_timeout() -> u64 {
    120
}

fn default_save_timeout() -> u64 {
    30
}

fn default_job_retention() -> u64 {
    24 * 7
}

fn default_save_command() -> String {
    "SaveWorld".to_string()
}

fn default_true() -> bool {
    true
}

/// SteamCMD binary installation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// SteamCMD binary
    #[serde(default = "default_steamcmd")]
    pub steamcmd: String,
    /// Steam app id of the dedicated server
    #[serde(default = "default_app_id")]
    pub app_id: u32,
    /// Where server binaries are installed; supports `~` expansion
    #[serde(default = "default_install_dir")]
    pub install_dir: String,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            steamcmd: default_steamcmd(),
            app_id: ASA_SERVER_APP_ID,
            install_dir: default_install_dir(),
        }
    }
}

fn default_steamcmd() -> String {
    "steamcmd".to_string()
}

fn default_app_id() -> u32 {
    ASA_SERVER_APP_ID
}

fn default_install_dir() -> String {
    "~/.arkfleet/binaries".to_string()
}

impl ManagerConfig {
    /// Data directory with `~` and environment variables expanded
    pub fn data_path(&self) -> Result<PathBuf, ConfigError> {
        expand_path(&self.data_dir)
    }

    /// Install directory with `~` and environment variables expanded
    pub fn install_path(&self) -> Result<PathBuf, ConfigError> {
        expand_path(&self.install.install_dir)
    }
}

/// Expand `~` and `$VAR` in a configured path
pub fn expand_path(raw: &str) -> Result<PathBuf, ConfigError> {
    shellexpand::full(raw)
        .map(|p| PathBuf::from(p.as_ref()))
        .map_err(|e| ConfigError::InvalidPath(raw.to_string(), e.to_string()))
}

// ============================================================================
// SBIO: Pure business logic (no I/O)
// ============================================================================

/// Parse config from YAML string
pub fn parse_config(content: &str) -> Result<ManagerConfig, ConfigError> {
    serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))
}

/// Serialize config to YAML string
pub fn serialize_config(config: &ManagerConfig) -> Result<String, ConfigError> {
    serde_yaml::to_string(config).map_err(|e| ConfigError::WriteError(e.to_string()))
}

// ============================================================================
// I/O boundary functions
// ============================================================================

/// Load config from a specific path; a missing file yields defaults
pub fn load_config_from(path: &Path) -> Result<ManagerConfig, ConfigError> {
    if !path.exists() {
        return Ok(ManagerConfig::default());
    }
    let content = std::fs::read_to_string(path)?;
    parse_config(&content)
}

/// Save config to a specific path
pub fn save_config_to(config: &ManagerConfig, path: &Path) -> Result<(), ConfigError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serialize_config(config)?;
    std::fs::write(path, content)?;
    Ok(())
}
