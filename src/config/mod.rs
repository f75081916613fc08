//! Configuration module
//!
//! Handles application settings and the platform directories they live in

mod settings;

pub use settings::{AppConfig, CameraSettings, LoggingConfig, RelayConfig, SerialLinkConfig};

use directories::ProjectDirs;
use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// No platform config directory
    #[error("Could not determine config directory")]
    NoConfigDir,

    /// Settings that cannot be used
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    TomlWrite(#[from] toml::ser::Error),

    /// YAML error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("com", "benchlink", "Benchlink")
}

/// Get the application configuration directory
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Get the application data directory
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

/// Get the log directory
pub fn log_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("logs"))
}

/// Get the snapshot directory
pub fn captures_dir() -> Option<PathBuf> {
    data_dir().map(|d| d.join("captures"))
}
