//! Configuration discovery and loading
//!
//! This module handles the configuration discovery hierarchy:
//! 1. Current directory: ./wrangle.toml or ./.wrangle/config.toml
//! 2. User config: ~/.wrangle/config.toml
//! 3. System config: /etc/wrangle/config.toml
//! 4. Built-in defaults

use crate::codec::CodecConfig;
use crate::engine::EngineConfig;
use crate::env;
use crate::session::SessionManagerConfig;
use serde::{Deserialize, Serialize};
use std::env as std_env;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to access config file '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid config file '{path}': {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("could not determine home directory")]
    NoHomeDir,
}

/// Everything a `wrangle` process can be configured with
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WrangleConfig {
    pub session: SessionManagerConfig,
    pub codec: CodecConfig,
    pub engine: EngineConfig,
}

impl WrangleConfig {
    /// Load from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Save to TOML file
    pub fn to_toml_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Configuration discovery system
pub struct ConfigDiscovery;

impl ConfigDiscovery {
    /// Discover and load configuration using the hierarchy
    pub fn discover_config() -> Result<WrangleConfig, ConfigError> {
        if let Some(config_path) = Self::find_config_file() {
            info!("Loading configuration from: {:?}", config_path);
            return WrangleConfig::from_toml_file(config_path);
        }

        info!("No configuration file found, using defaults");
        Ok(WrangleConfig::default())
    }

    /// Load an explicit file, or fall back to discovery
    pub fn load(explicit: Option<&Path>) -> Result<WrangleConfig, ConfigError> {
        match explicit {
            Some(path) => {
                info!("Loading configuration from: {:?}", path);
                WrangleConfig::from_toml_file(path)
            }
            None => Self::discover_config(),
        }
    }

    /// Find configuration file using discovery hierarchy
    pub fn find_config_file() -> Option<PathBuf> {
        Self::get_config_candidates().into_iter().find(|candidate| {
            debug!("Checking for config file: {:?}", candidate);
            candidate.is_file()
        })
    }

    /// Get list of configuration file candidates in priority order
    fn get_config_candidates() -> Vec<PathBuf> {
        let mut candidates = Vec::new();

        if let Ok(current_dir) = std_env::current_dir() {
            candidates.push(current_dir.join(env::LOCAL_CONFIG_FILE_NAME));
            candidates.push(env::local_config_file_path(&current_dir));
        }

        if let Some(home_dir) = Self::get_home_dir() {
            candidates.push(env::user_config_file_path(&home_dir));
        }

        #[cfg(unix)]
        candidates.push(PathBuf::from("/etc/wrangle").join(env::CONFIG_FILE_NAME));

        #[cfg(windows)]
        if let Ok(program_data) = std_env::var("PROGRAMDATA") {
            candidates.push(
                PathBuf::from(program_data)
                    .join("wrangle")
                    .join(env::CONFIG_FILE_NAME),
            );
        }

        candidates
    }

    fn get_home_dir() -> Option<PathBuf> {
        std_env::var("HOME")
            .ok()
            .or_else(|| std_env::var("USERPROFILE").ok())
            .map(PathBuf::from)
    }

    /// Create a default config file in the user's home directory
    pub fn create_default_user_config() -> Result<PathBuf, ConfigError> {
        let home_dir = Self::get_home_dir().ok_or(ConfigError::NoHomeDir)?;
        Self::create_default_config_in(&home_dir)
    }

    fn create_default_config_in(home_dir: &Path) -> Result<PathBuf, ConfigError> {
        let config_dir = env::user_config_dir_path(home_dir);
        let config_path = env::user_config_file_path(home_dir);

        if !config_dir.exists() {
            fs::create_dir_all(&config_dir).map_err(|source| ConfigError::Io {
                path: config_dir.clone(),
                source,
            })?;
            info!("Created configuration directory: {:?}", config_dir);
        }

        if config_path.exists() {
            warn!("Configuration file already exists: {:?}", config_path);
        } else {
            WrangleConfig::default().to_toml_file(&config_path)?;
            info!("Created default configuration file: {:?}", config_path);
        }

        Ok(config_path)
    }

    /// Show configuration discovery information for debugging
    pub fn show_discovery_info() {
        println!("Configuration Discovery Hierarchy:");
        println!();

        for (i, candidate) in Self::get_config_candidates().iter().enumerate() {
            let status = if candidate.is_file() {
                "✓ EXISTS"
            } else if candidate.exists() {
                "✗ NOT A FILE"
            } else {
                "✗ NOT FOUND"
            };
            println!("  {}. {:?} - {}", i + 1, candidate, status);
        }

        println!();
        match Self::find_config_file() {
            Some(found) => println!("Active configuration: {:?}", found),
            None => println!("Active configuration: Built-in defaults"),
        }
    }
}
