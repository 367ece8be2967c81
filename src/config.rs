use crate::core::{ClientError, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

pub const DEFAULT_ROW_LIMIT: usize = 100;
pub const DEFAULT_LOG_LEVEL: &str = "info";

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub profiles: ProfilesConfig,
    #[serde(default)]
    pub drivers: DriversConfig,
    #[serde(default)]
    pub results: ResultsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Where connection profiles are stored.
#[derive(Debug, Default, Deserialize)]
pub struct ProfilesConfig {
    pub path: Option<PathBuf>,
}

/// Driver library configuration.
#[derive(Debug, Default, Deserialize)]
pub struct DriversConfig {
    /// Driver library locations, resolved in order on every connect.
    #[serde(default)]
    pub classpath: Vec<PathBuf>,
}

/// Result display configuration.
#[derive(Debug, Default, Deserialize)]
pub struct ResultsConfig {
    pub row_limit: Option<usize>,
}

/// Logging configuration.
#[derive(Debug, Default, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<String>,
}

impl Config {
    /// Path of the profile file, defaulting to the user config directory.
    pub fn profiles_path(&self) -> PathBuf {
        self.profiles
            .path
            .clone()
            .unwrap_or_else(|| config_dir().join("profiles.toml"))
    }

    pub fn row_limit(&self) -> usize {
        self.results.row_limit.unwrap_or(DEFAULT_ROW_LIMIT)
    }

    pub fn log_level(&self) -> &str {
        self.logging.level.as_deref().unwrap_or(DEFAULT_LOG_LEVEL)
    }
}

/// `<user config dir>/termsql`, or the current directory when the platform
/// has no config directory.
pub fn config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|dir| dir.join("termsql"))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Default location of the configuration file.
pub fn default_config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Loads configuration from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```
/// let config = termsql::config::load_config("config.toml").unwrap_or_default();
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path)
        .map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))?;
    toml::from_str(&content).map_err(|e| ClientError::Config(format!("{}: {}", path.display(), e)))
}
