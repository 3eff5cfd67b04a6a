use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for ModelGraph
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ModelGraphConfig {
    /// Checkpoint scheduling, storage and retention
    #[serde(default)]
    pub history: HistoryConfig,

    /// Graph model settings
    #[serde(default)]
    pub graph: GraphConfig,

    /// Notification channel settings
    #[serde(default)]
    pub events: EventsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How two captures of the same entity are compared when diffing checkpoints
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EqualityMode {
    /// Classification, anchor within tolerance and attribute count
    #[default]
    Shallow,
    /// Shallow plus name and attribute contents
    Deep,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryConfig {
    /// Root directory; each document gets a subdirectory
    #[serde(default = "default_checkpoint_root")]
    pub checkpoint_root: PathBuf,

    /// Scheduled checkpoint interval
    #[serde(default = "default_checkpoint_interval_minutes")]
    pub checkpoint_interval_minutes: u64,

    /// Checkpoints older than this are swept
    #[serde(default = "default_retain_days")]
    pub retain_days: u32,

    /// Advisory only. Exceeding it is logged, never enforced.
    #[serde(default = "default_max_checkpoints_per_day")]
    pub max_checkpoints_per_day: u32,

    #[serde(default)]
    pub equality: EqualityMode,

    /// Per-axis anchor tolerance used by the diff
    #[serde(default = "default_coordinate_tolerance")]
    pub coordinate_tolerance: f64,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            checkpoint_root: default_checkpoint_root(),
            checkpoint_interval_minutes: default_checkpoint_interval_minutes(),
            retain_days: default_retain_days(),
            max_checkpoints_per_day: default_max_checkpoints_per_day(),
            equality: EqualityMode::default(),
            coordinate_tolerance: default_coordinate_tolerance(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GraphConfig {
    /// Categories that never become graph nodes (case-insensitive)
    #[serde(default = "default_excluded_categories")]
    pub excluded_categories: Vec<String>,

    /// Log a warning when the sync queue grows past this many operations
    #[serde(default = "default_sync_queue_warn_threshold")]
    pub sync_queue_warn_threshold: usize,

    /// Push graph mutations to the configured sink
    #[serde(default = "default_true")]
    pub sync_enabled: bool,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            excluded_categories: default_excluded_categories(),
            sync_queue_warn_threshold: default_sync_queue_warn_threshold(),
            sync_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: "pretty", "json", "compact"
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

impl HistoryConfig {
    pub fn interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.checkpoint_interval_minutes * 60)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.retain_days))
    }
}

fn default_checkpoint_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("modelgraph")
        .join("checkpoints")
}
fn default_checkpoint_interval_minutes() -> u64 {
    60
}
fn default_retain_days() -> u32 {
    7
}
fn default_max_checkpoints_per_day() -> u32 {
    24
}
fn default_coordinate_tolerance() -> f64 {
    0.001
}
fn default_excluded_categories() -> Vec<String> {
    vec![
        "Links".to_string(),
        "Views".to_string(),
        "Sheets".to_string(),
        "Cameras".to_string(),
    ]
}
fn default_sync_queue_warn_threshold() -> usize {
    1000
}
fn default_true() -> bool {
    true
}
fn default_channel_capacity() -> usize {
    256
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_log_format() -> String {
    "pretty".to_string()
}

/// Configuration manager with layered sources
#[derive(Debug)]
pub struct ConfigManager {
    config: ModelGraphConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (.env file)
    /// 2. Config file (.modelgraph.toml, then ~/.modelgraph/config.toml)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_dotenv();

        let (config, config_path) = Self::load_config_file()?;
        let config = Self::apply_env_overrides(config);
        Self::validate_config(&config)?;

        match config_path {
            Some(ref path) => info!(path = %path.display(), "Configuration loaded"),
            None => info!("Configuration loaded from defaults"),
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    /// Load a specific file, still applying env overrides and validation.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::apply_env_overrides(Self::read_toml_file(path)?);
        Self::validate_config(&config)?;
        Ok(Self {
            config,
            config_path: Some(path.to_path_buf()),
        })
    }

    fn load_dotenv() {
        if Path::new(".env").exists() {
            if let Err(e) = dotenv::from_filename(".env") {
                warn!("Failed to load .env file: {}", e);
            }
        }
    }

    fn load_config_file() -> Result<(ModelGraphConfig, Option<PathBuf>), ConfigError> {
        let local_config = Path::new(".modelgraph.toml");
        if local_config.exists() {
            let config = Self::read_toml_file(local_config)?;
            return Ok((config, Some(local_config.to_path_buf())));
        }

        if let Some(home) = dirs::home_dir() {
            let user_config = home.join(".modelgraph").join("config.toml");
            if user_config.exists() {
                let config = Self::read_toml_file(&user_config)?;
                return Ok((config, Some(user_config)));
            }
        }

        Ok((ModelGraphConfig::default(), None))
    }

    fn read_toml_file(path: &Path) -> Result<ModelGraphConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    fn apply_env_overrides(mut config: ModelGraphConfig) -> ModelGraphConfig {
        if let Ok(root) = std::env::var("MODELGRAPH_CHECKPOINT_ROOT") {
            config.history.checkpoint_root = PathBuf::from(root);
        }
        if let Ok(minutes) = std::env::var("MODELGRAPH_CHECKPOINT_INTERVAL_MINUTES") {
            if let Ok(minutes) = minutes.parse() {
                config.history.checkpoint_interval_minutes = minutes;
            }
        }
        if let Ok(days) = std::env::var("MODELGRAPH_RETAIN_DAYS") {
            if let Ok(days) = days.parse() {
                config.history.retain_days = days;
            }
        }
        if let Ok(mode) = std::env::var("MODELGRAPH_EQUALITY") {
            match mode.to_lowercase().as_str() {
                "shallow" => config.history.equality = EqualityMode::Shallow,
                "deep" => config.history.equality = EqualityMode::Deep,
                other => warn!("Ignoring unknown MODELGRAPH_EQUALITY value: {}", other),
            }
        }
        if let Ok(enabled) = std::env::var("MODELGRAPH_SYNC_ENABLED") {
            if let Ok(enabled) = enabled.parse() {
                config.graph.sync_enabled = enabled;
            }
        }
        if let Ok(level) = std::env::var("MODELGRAPH_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Ok(format) = std::env::var("MODELGRAPH_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    fn validate_config(config: &ModelGraphConfig) -> Result<(), ConfigError> {
        if config.history.checkpoint_interval_minutes == 0 {
            return Err(ConfigError::ValidationError(
                "checkpoint_interval_minutes must be greater than 0".to_string(),
            ));
        }

        if config.history.retain_days == 0 {
            return Err(ConfigError::ValidationError(
                "retain_days must be greater than 0".to_string(),
            ));
        }

        let tolerance = config.history.coordinate_tolerance;
        if tolerance.is_nan() || tolerance < 0.0 {
            return Err(ConfigError::ValidationError(format!(
                "coordinate_tolerance must be non-negative, got {}",
                tolerance
            )));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        match config.logging.format.as_str() {
            "pretty" | "json" | "compact" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log format: {}. Must be one of: pretty, json, compact",
                    other
                )))
            }
        }

        Ok(())
    }

    pub fn config(&self) -> &ModelGraphConfig {
        &self.config
    }

    pub fn into_config(self) -> ModelGraphConfig {
        self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = ModelGraphConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ModelGraphConfig::default();
        assert_eq!(config.history.checkpoint_interval_minutes, 60);
        assert_eq!(config.history.retain_days, 7);
        assert_eq!(config.history.max_checkpoints_per_day, 24);
        assert_eq!(config.history.equality, EqualityMode::Shallow);
        assert_eq!(config.history.coordinate_tolerance, 0.001);
        assert_eq!(config.graph.excluded_categories.len(), 4);
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_config_validation() {
        let config = ModelGraphConfig::default();
        assert!(ConfigManager::validate_config(&config).is_ok());

        let mut bad_config = config.clone();
        bad_config.history.retain_days = 0;
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut bad_config = config.clone();
        bad_config.logging.level = "loud".to_string();
        assert!(ConfigManager::validate_config(&bad_config).is_err());

        let mut bad_config = config;
        bad_config.history.coordinate_tolerance = f64::NAN;
        assert!(ConfigManager::validate_config(&bad_config).is_err());
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ModelGraphConfig = toml::from_str(
            r#"
            [history]
            retain_days = 14
            equality = "deep"
            "#,
        )
        .unwrap();
        assert_eq!(config.history.retain_days, 14);
        assert_eq!(config.history.equality, EqualityMode::Deep);
        assert_eq!(config.history.checkpoint_interval_minutes, 60);
        assert_eq!(config.logging, LoggingConfig::default());
    }

    #[test]
    fn default_config_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");
        ConfigManager::create_default_config(&path).unwrap();

        let manager = ConfigManager::from_file(&path).unwrap();
        assert_eq!(manager.config_path(), Some(path.as_path()));
        assert_eq!(manager.config().history.retain_days, 7);
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = ConfigManager::from_file(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound(_)));
    }
}
