//! Configuration System
//!
//! Handles loading configuration from files and environment variables.
//! Supports TOML config files and environment variable overrides.

use crate::index::{
    LocalityConfig, DEFAULT_AGGREGATION_STEP, DEFAULT_MAX_BUCKETS, DEFAULT_STEPS_IN_BIGGEST_FILE,
};
use crate::storage::StorageResult;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Locality index configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexConfig {
    /// Directory for the locality artifact files
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Directory holding the store's `*.kseg` key segments
    #[serde(default = "default_segments_dir")]
    pub segments_dir: String,

    #[serde(default = "default_filename_base")]
    pub filename_base: String,

    #[serde(default = "default_aggregation_step")]
    pub aggregation_step: u64,

    #[serde(default = "default_steps_in_biggest_file")]
    pub steps_in_biggest_file: u64,

    #[serde(default = "default_max_buckets")]
    pub max_buckets: u64,
}

fn default_root() -> PathBuf {
    dirs::data_local_dir()
        .map(|p| p.join("locality-index"))
        .unwrap_or_else(|| PathBuf::from("./locality_data"))
}

fn default_data_dir() -> String {
    default_root().join("locality").to_string_lossy().to_string()
}

fn default_segments_dir() -> String {
    default_root().join("segments").to_string_lossy().to_string()
}

fn default_filename_base() -> String {
    "accounts".to_string()
}

fn default_aggregation_step() -> u64 {
    DEFAULT_AGGREGATION_STEP
}

fn default_steps_in_biggest_file() -> u64 {
    DEFAULT_STEPS_IN_BIGGEST_FILE
}

fn default_max_buckets() -> u64 {
    DEFAULT_MAX_BUCKETS
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            segments_dir: default_segments_dir(),
            filename_base: default_filename_base(),
            aggregation_step: default_aggregation_step(),
            steps_in_biggest_file: default_steps_in_biggest_file(),
            max_buckets: default_max_buckets(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default = "default_log_format")]
    pub format: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
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
    /// Load configuration from a file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.to_path_buf(),
            error: e.to_string(),
        })?;

        Self::parse(&content).map_err(|e| match e {
            ConfigError::Parse { error, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                error,
            },
            other => other,
        })
    }

    /// Parse configuration from TOML text
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            error: e.to_string(),
        })
    }

    /// Load configuration from environment variables only
    pub fn from_env() -> Self {
        let mut config = Config::default();
        config.apply_env_overrides();
        config
    }

    /// Load configuration with environment variable overrides
    pub fn load_with_env(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load(path)?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from default locations or environment
    pub fn load_default() -> Self {
        let config_paths = [
            dirs::config_dir().map(|p| p.join("locality-index").join("config.toml")),
            Some(PathBuf::from("/etc/locality-index/config.toml")),
            Some(PathBuf::from("./config.toml")),
        ];

        for path_opt in config_paths.iter().flatten() {
            if path_opt.exists() {
                match Self::load_with_env(path_opt) {
                    Ok(config) => {
                        tracing::info!("Loaded config from {:?}", path_opt);
                        return config;
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load config from {:?}: {}", path_opt, e);
                    }
                }
            }
        }

        tracing::info!("Using default config with environment overrides");
        Self::from_env()
    }

    /// Apply environment variable overrides to an existing config
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Index overrides
        if let Some(data_dir) = var("LOCALITY_DATA_DIR") {
            self.index.data_dir = data_dir;
        }
        if let Some(segments_dir) = var("LOCALITY_SEGMENTS_DIR") {
            self.index.segments_dir = segments_dir;
        }
        if let Some(base) = var("LOCALITY_FILENAME_BASE") {
            self.index.filename_base = base;
        }
        if let Some(step) = var("LOCALITY_AGGREGATION_STEP") {
            match step.parse() {
                Ok(s) => self.index.aggregation_step = s,
                Err(_) => tracing::warn!("Ignoring invalid LOCALITY_AGGREGATION_STEP {:?}", step),
            }
        }
        if let Some(steps) = var("LOCALITY_STEPS_IN_BIGGEST_FILE") {
            match steps.parse() {
                Ok(s) => self.index.steps_in_biggest_file = s,
                Err(_) => {
                    tracing::warn!("Ignoring invalid LOCALITY_STEPS_IN_BIGGEST_FILE {:?}", steps)
                }
            }
        }

        // Logging overrides
        if let Some(level) = var("LOCALITY_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(format) = var("LOCALITY_LOG_FORMAT") {
            self.logging.format = format;
        }
    }

    /// Runtime settings for the locality index, validated
    pub fn locality_config(&self) -> StorageResult<LocalityConfig> {
        let config = LocalityConfig {
            data_dir: expand_home(&self.index.data_dir),
            filename_base: self.index.filename_base.clone(),
            aggregation_step: self.index.aggregation_step,
            steps_in_biggest_file: self.index.steps_in_biggest_file,
            max_buckets: self.index.max_buckets,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn segments_dir(&self) -> PathBuf {
        expand_home(&self.index.segments_dir)
    }
}

/// Expand a leading `~/` to the home directory
fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path:?}: {error}")]
    Io { path: PathBuf, error: String },

    #[error("Failed to parse config file {path:?}: {error}")]
    Parse { path: PathBuf, error: String },
}

/// Generate a default config file content
pub fn generate_default_config() -> String {
    format!(
        r#"# Locality Index Configuration
#
# Environment variables override these settings:
# - LOCALITY_DATA_DIR
# - LOCALITY_SEGMENTS_DIR
# - LOCALITY_FILENAME_BASE
# - LOCALITY_AGGREGATION_STEP
# - LOCALITY_STEPS_IN_BIGGEST_FILE
# - LOCALITY_LOG_LEVEL
# - LOCALITY_LOG_FORMAT

[index]
# Directory for the locality artifact files (.li / .lb)
data_dir = "~/.local/share/locality-index/locality"

# Directory holding the store's key segments (.kseg)
segments_dir = "~/.local/share/locality-index/segments"

# Base name of the artifact files, usually the owning store's name
filename_base = "accounts"

# Operations per step
aggregation_step = {agg}

# Steps per bucket (size of the coarsest merged segment)
steps_in_biggest_file = {steps}

# Highest number of buckets a build may index
max_buckets = {buckets}

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log format: pretty (for development) or json (for production)
format = "pretty"
"#,
        agg = DEFAULT_AGGREGATION_STEP,
        steps = DEFAULT_STEPS_IN_BIGGEST_FILE,
        buckets = DEFAULT_MAX_BUCKETS,
    )
}
