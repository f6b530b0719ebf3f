//! Configuration for the canondir library and command-line tool.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (canondir.toml)
//! ```toml
//! [storage]
//! root = "/var/lib/canondir"
//!
//! [backfill]
//! chunk_size = 200
//! concurrency = 3
//!
//! [matching]
//! suggestion_limit = 10
//! ```
//!
//! Environment variables use the `CANONDIR_` prefix with `__` between the
//! section and the field, e.g. `CANONDIR_BACKFILL__CHUNK_SIZE=100`.

mod defaults;

pub use defaults::*;

use crate::consistency::ViewLayout;
use crate::similarity::SimilarityPolicy;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanonConfig {
    /// Remote view layout and local store root
    pub storage: StorageConfig,
    /// Chunked build/resume settings
    pub backfill: BackfillConfig,
    /// Similarity thresholds
    pub matching: MatchingConfig,
}

impl CanonConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(CanonConfig::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        figment = figment.merge(Env::prefixed("CANONDIR_").split("__"));

        figment = figment.merge(Serialized::defaults(overrides));

        let config: CanonConfig = figment.extract().map_err(ConfigError::from)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    /// Reject settings the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let matching = &self.matching;
        if !(0.0..=1.0).contains(&matching.near_threshold)
            || !(0.0..=1.0).contains(&matching.clear_threshold)
            || matching.near_threshold > matching.clear_threshold
        {
            return Err(ConfigError::new(format!(
                "thresholds must satisfy 0 <= near ({}) <= clear ({}) <= 1",
                matching.near_threshold, matching.clear_threshold
            )));
        }
        if self.backfill.chunk_size == 0 || self.backfill.concurrency == 0 {
            return Err(ConfigError::new(
                "backfill chunk_size and concurrency must be positive",
            ));
        }
        Ok(())
    }
}

/// Storage layout configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Root directory of the directory-backed store
    pub root: PathBuf,
    /// Folder of per-identity objects
    pub folder: String,
    /// Folder of the snapshot and index objects
    pub views_folder: String,
    pub snapshot_name: String,
    pub index_name: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORAGE_ROOT),
            folder: DEFAULT_IDENTITY_FOLDER.to_string(),
            views_folder: DEFAULT_VIEWS_FOLDER.to_string(),
            snapshot_name: DEFAULT_SNAPSHOT_NAME.to_string(),
            index_name: DEFAULT_INDEX_NAME.to_string(),
        }
    }
}

impl StorageConfig {
    pub fn layout(&self) -> ViewLayout {
        ViewLayout {
            folder: self.folder.clone(),
            views_folder: self.views_folder.clone(),
            snapshot_name: self.snapshot_name.clone(),
            index_name: self.index_name.clone(),
        }
    }
}

/// Backfill configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillConfig {
    /// Identities per invocation
    pub chunk_size: usize,
    /// Write-throughs in flight
    pub concurrency: usize,
    /// Local progress file
    pub progress_path: PathBuf,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            progress_path: PathBuf::from(DEFAULT_PROGRESS_PATH),
        }
    }
}

/// Matching configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatchingConfig {
    pub clear_threshold: f64,
    pub near_threshold: f64,
    pub min_token_len: usize,
    pub suggestion_limit: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            clear_threshold: DEFAULT_CLEAR_THRESHOLD,
            near_threshold: DEFAULT_NEAR_THRESHOLD,
            min_token_len: DEFAULT_MIN_TOKEN_LEN,
            suggestion_limit: DEFAULT_SUGGESTION_LIMIT,
        }
    }
}

impl MatchingConfig {
    pub fn policy(&self) -> SimilarityPolicy {
        SimilarityPolicy {
            clear_threshold: self.clear_threshold,
            near_threshold: self.near_threshold,
            min_token_len: self.min_token_len,
        }
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<StorageOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backfill: Option<BackfillOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackfillOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress_path: Option<PathBuf>,
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl ConfigError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}
