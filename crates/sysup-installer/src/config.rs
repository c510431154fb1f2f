// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Configuration file handling

use crate::error::{InstallerError, Result};
use crate::installer::CommandBackend;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/sysup/installer.conf";

/// Written to the config path on first start
pub const CONFIG_SAMPLE: &str = include_str!("../installer.conf.sample");

fn default_runtime_path() -> PathBuf {
    PathBuf::from("/var/run/sysup")
}

fn default_log_path() -> PathBuf {
    PathBuf::from("/var/log/sysup")
}

fn default_log_save_name() -> String {
    "installer".to_owned()
}

fn default_log_file_ext() -> String {
    "log".to_owned()
}

fn default_listen_address() -> String {
    "127.0.0.1:0".to_owned()
}

fn default_channel() -> String {
    "main".to_owned()
}

fn default_metadata_url() -> String {
    "https://releases.sysup.dev".to_owned()
}

fn default_600() -> u64 {
    600
}

fn default_10() -> u64 {
    10
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("/var/lib/sysup/cache")
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("/var/lib/sysup/work")
}

fn default_sys_root() -> PathBuf {
    PathBuf::from("/")
}

fn default_pending_migrations_file() -> PathBuf {
    PathBuf::from("var/lib/sysup/migration.pending.json")
}

fn default_migrate_command() -> Vec<String> {
    vec!["/bin/sh".to_owned(), "{script}".to_owned()]
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallerConfig {
    #[serde(default)]
    pub common: CommonConfig,
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub registration: RegistrationConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonConfig {
    /// Where collaborators advertise their addresses
    #[serde(default = "default_runtime_path")]
    pub runtime_path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default = "default_log_path")]
    pub log_path: PathBuf,
    #[serde(default = "default_log_save_name")]
    pub log_save_name: String,
    #[serde(default = "default_log_file_ext")]
    pub log_file_ext: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_listen_address")]
    pub listen_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Channel resolved for "latest"
    #[serde(default = "default_channel")]
    pub channel: String,

    /// Release server base URL
    #[serde(default = "default_metadata_url")]
    pub metadata_url: String,

    /// Bearer token for private channels (optional)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,

    /// How often the reconciler checks for updates (seconds)
    #[serde(default = "default_600")]
    pub check_interval_secs: u64,

    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Extraction workspace, also holds migration scripts until the next launch
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    #[serde(default = "default_sys_root")]
    pub sys_root: PathBuf,

    /// Relative to `sys_root`
    #[serde(default = "default_pending_migrations_file")]
    pub pending_migrations_file: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub install_command: Vec<String>,
    #[serde(default)]
    pub enable_command: Vec<String>,
    #[serde(default = "default_migrate_command")]
    pub migrate_command: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationConfig {
    /// Overrides `{runtime_path}/management.url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gateway_url: Option<String>,

    /// Overrides `{runtime_path}/message-bus.url`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_bus_url: Option<String>,

    #[serde(default = "default_10")]
    pub retry_interval_secs: u64,
}

impl Default for CommonConfig {
    fn default() -> Self {
        Self {
            runtime_path: default_runtime_path(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_path: default_log_path(),
            log_save_name: default_log_save_name(),
            log_file_ext: default_log_file_ext(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            channel: default_channel(),
            metadata_url: default_metadata_url(),
            token: None,
            check_interval_secs: default_600(),
            cache_dir: default_cache_dir(),
            work_dir: default_work_dir(),
            sys_root: default_sys_root(),
            pending_migrations_file: default_pending_migrations_file(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            install_command: Vec::new(),
            enable_command: Vec::new(),
            migrate_command: default_migrate_command(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            gateway_url: None,
            message_bus_url: None,
            retry_interval_secs: default_10(),
        }
    }
}

impl AppConfig {
    /// `{log_path}/{log_save_name}.{log_file_ext}`
    pub fn log_file(&self) -> PathBuf {
        self.log_path
            .join(format!("{}.{}", self.log_save_name, self.log_file_ext))
    }
}

impl UpdateConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

impl RegistrationConfig {
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

impl BackendConfig {
    pub fn command_backend(&self) -> CommandBackend {
        CommandBackend {
            install_command: self.install_command.clone(),
            enable_command: self.enable_command.clone(),
            migrate_command: self.migrate_command.clone(),
        }
    }
}

impl InstallerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.update.metadata_url.trim().is_empty() {
            return Err(InstallerError::Config(
                "update.metadata_url must not be empty".to_owned(),
            ));
        }
        if self.update.channel.trim().is_empty() {
            return Err(InstallerError::Config(
                "update.channel must not be empty".to_owned(),
            ));
        }
        if self.update.check_interval_secs == 0 {
            return Err(InstallerError::Config(
                "update.check_interval_secs must be positive".to_owned(),
            ));
        }
        if self.registration.retry_interval_secs == 0 {
            return Err(InstallerError::Config(
                "registration.retry_interval_secs must be positive".to_owned(),
            ));
        }
        if self.backend.install_command.is_empty() {
            return Err(InstallerError::Config(
                "backend.install_command must not be empty".to_owned(),
            ));
        }
        Ok(())
    }
}

/// Load the config, creating it from the bundled sample when absent
pub fn load_or_create(path: &Path) -> Result<InstallerConfig> {
    if !path.exists() {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, CONFIG_SAMPLE).map_err(|e| {
            InstallerError::Config(format!("Failed to create {}: {e}", path.display()))
        })?;
        tracing::info!("Created default config at {}", path.display());
    }

    let content = std::fs::read_to_string(path)?;
    let config: InstallerConfig = toml::from_str(&content)
        .map_err(|e| InstallerError::Config(format!("Failed to parse config: {e}")))?;
    config.validate()?;
    Ok(config)
}
