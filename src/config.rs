use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{error, info, warn};

/// Name of the configuration file inside the config directory.
pub const CONFIG_NAME: &str = "config.toml";

// Define error types for config loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("TOML serialization error: {0}")]
    TomlSer(#[from] toml::ser::Error),
}

// Result type alias for config operations
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Paths {
    pub download_directory: String,
    pub database_file: String,
    pub log_directory: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Logging {
    pub log_level: String,
    pub log_format: String,
    pub log_to_terminal: bool,
    pub log_to_file: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Writer {
    /// Seconds to wait for the write queue to drain on exit, 0 waits forever.
    pub shutdown_timeout_secs: u64,
    pub progress_interval_ms: u64,
    /// Remember written files across runs in the database index.
    pub use_index: bool,
}

impl Writer {
    pub fn shutdown_timeout(&self) -> Option<Duration> {
        (self.shutdown_timeout_secs > 0).then(|| Duration::from_secs(self.shutdown_timeout_secs))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AppConfig {
    pub paths: Paths,
    pub logging: Logging,
    pub writer: Writer,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            paths: Paths {
                download_directory: "./downloads".to_string(),
                database_file: "./data/aid.sqlite".to_string(),
                log_directory: "./logs".to_string(),
            },
            logging: Logging {
                log_level: "info".to_string(),
                log_format: "text".to_string(),
                log_to_terminal: true,
                log_to_file: true,
            },
            writer: Writer {
                shutdown_timeout_secs: 0,
                progress_interval_ms: 100,
                use_index: true,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warn,
    Error,
}

/// Message raised while loading the config.
///
/// The config is read before the logger exists, so messages are held here
/// until [`ConfigManager::drain_notices`] hands them to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigNotice {
    pub level: NoticeLevel,
    pub message: String,
}

impl ConfigNotice {
    fn new(level: NoticeLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    /// Send the notice to the installed tracing subscriber.
    pub fn emit(&self) {
        match self.level {
            NoticeLevel::Info => info!("{}", self.message),
            NoticeLevel::Warn => warn!("{}", self.message),
            NoticeLevel::Error => error!("{}", self.message),
        }
    }
}

/// Loads, caches and saves `config.toml`.
pub struct ConfigManager {
    app_config: RwLock<AppConfig>,
    config_dir: PathBuf,
    notices: Mutex<Vec<ConfigNotice>>,
}

impl ConfigManager {
    /// Load the config from `config_dir`, writing defaults if the file is missing.
    pub fn new(config_dir: impl AsRef<Path>) -> ConfigResult<Self> {
        let config_dir = config_dir.as_ref().to_path_buf();
        let mut notices = Vec::new();

        if !config_dir.exists() {
            notices.push(ConfigNotice::new(
                NoticeLevel::Info,
                format!("Creating config directory: {}", config_dir.display()),
            ));
            fs::create_dir_all(&config_dir)?;
        }

        let app_config = Self::load_app_config(&config_dir, &mut notices)?;
        let manager = Self {
            app_config: RwLock::new(app_config),
            config_dir,
            notices: Mutex::new(notices),
        };
        manager.create_default_config()?;

        Ok(manager)
    }

    fn load_app_config(config_dir: &Path, notices: &mut Vec<ConfigNotice>) -> ConfigResult<AppConfig> {
        let config_path = config_dir.join(CONFIG_NAME);

        if !config_path.exists() {
            notices.push(ConfigNotice::new(
                NoticeLevel::Warn,
                format!("Config file not found: {}", config_path.display()),
            ));
            return Ok(AppConfig::default());
        }

        let content = fs::read_to_string(&config_path)?;
        match toml::from_str(&content) {
            Ok(config) => Ok(config),
            Err(e) => {
                notices.push(ConfigNotice::new(
                    NoticeLevel::Error,
                    format!("Failed to parse {}: {}", CONFIG_NAME, e),
                ));
                notices.push(ConfigNotice::new(
                    NoticeLevel::Info,
                    "Backing up old config and creating new one with default values",
                ));

                if let Err(backup_err) = fs::rename(&config_path, config_path.with_extension("toml.backup")) {
                    notices.push(ConfigNotice::new(
                        NoticeLevel::Warn,
                        format!("Failed to backup old config: {}", backup_err),
                    ));
                }

                let default_config = AppConfig::default();
                fs::write(&config_path, toml::to_string_pretty(&default_config)?)?;
                Ok(default_config)
            }
        }
    }

    /// Take the messages collected so far, oldest first.
    pub fn drain_notices(&self) -> Vec<ConfigNotice> {
        std::mem::take(&mut *self.notices.lock())
    }

    pub fn get_app_config(&self) -> AppConfig {
        self.app_config.read().clone()
    }

    pub fn save_app_config(&self, config: &AppConfig) -> ConfigResult<()> {
        let config_path = self.config_path();
        fs::write(&config_path, toml::to_string_pretty(config)?)?;

        *self.app_config.write() = config.clone();
        Ok(())
    }

    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join(CONFIG_NAME)
    }

    /// Write the default config file if none exists yet.
    pub fn create_default_config(&self) -> ConfigResult<()> {
        if !self.config_path().exists() {
            let default_config = AppConfig::default();
            self.save_app_config(&default_config)?;
            self.notices.lock().push(ConfigNotice::new(
                NoticeLevel::Info,
                format!("Created {} with default values", self.config_path().display()),
            ));
        }

        Ok(())
    }
}
