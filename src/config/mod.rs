//! Configuration module
//!
//! Handles application settings: transport parameters, discovery timeouts,
//! execution timing and logging.

mod settings;

pub use settings::{
    AppConfig, BleSettings, ConfigError, ExecutionSettings, LineEnding, LoggingConfig,
    SerialSettings,
};

use directories::ProjectDirs;
use std::path::PathBuf;

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "botlink", "Botlink").map(|dirs| dirs.config_dir().to_path_buf())
}

fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from("com", "botlink", "Botlink").map(|dirs| dirs.data_dir().to_path_buf())
}

/// Default directory for log files, used when `logging.directory` is unset
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Path of the default configuration file
pub fn config_file() -> Option<PathBuf> {
    config_dir().map(|d| d.join("config.toml"))
}
