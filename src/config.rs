use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::device::DevicePreference;
use crate::semantic::DEFAULT_MODEL;

const CONFIG_FILE: &str = "config.yaml";

/// Default cache lifetime in days
const DEFAULT_MAX_CACHE_AGE_DAYS: u64 = 7;
/// Default model download timeout in seconds
const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 300;
/// Default number of search results
const DEFAULT_TOP_N: usize = 5;
/// Default minimum title similarity for fuzzy duplicates
const DEFAULT_FUZZY_THRESHOLD: f64 = 0.85;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("config is malformed: {0}")]
    Parse(#[from] serde_yml::Error),

    #[error("invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}

impl ConfigError {
    fn invalid(field: &str, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Configuration for semantic search functionality
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SemanticSearchConfig {
    /// Model name for embeddings (e.g., "all-MiniLM-L6-v2")
    #[serde(default = "default_semantic_model")]
    pub model: String,

    /// Rebuild the embedding cache once it is older than this
    #[serde(default = "default_max_cache_age_days")]
    pub max_cache_age_days: u64,

    /// Rebuild the embedding cache on every search
    #[serde(default)]
    pub force_refresh: bool,

    /// Compute device: auto, accelerator or cpu
    #[serde(default)]
    pub device: DevicePreference,

    /// Timeout for model download in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,

    /// Results returned when the caller doesn't ask for a count
    #[serde(default = "default_top_n")]
    pub default_top_n: usize,
}

impl Default for SemanticSearchConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_cache_age_days: DEFAULT_MAX_CACHE_AGE_DAYS,
            force_refresh: false,
            device: DevicePreference::Auto,
            download_timeout_secs: DEFAULT_DOWNLOAD_TIMEOUT_SECS,
            default_top_n: DEFAULT_TOP_N,
        }
    }
}

fn default_semantic_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_max_cache_age_days() -> u64 {
    DEFAULT_MAX_CACHE_AGE_DAYS
}

fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT_SECS
}

fn default_top_n() -> usize {
    DEFAULT_TOP_N
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DuplicatesConfig {
    /// Minimum title similarity [0.0, 1.0]
    #[serde(default = "default_fuzzy_threshold")]
    pub fuzzy_threshold: f64,
}

impl Default for DuplicatesConfig {
    fn default() -> Self {
        Self {
            fuzzy_threshold: DEFAULT_FUZZY_THRESHOLD,
        }
    }
}

fn default_fuzzy_threshold() -> f64 {
    DEFAULT_FUZZY_THRESHOLD
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub semantic_search: SemanticSearchConfig,
    #[serde(default)]
    pub duplicates: DuplicatesConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.base_path.join("cache")
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let sem = &self.semantic_search;
        if sem.model.trim().is_empty() {
            return Err(ConfigError::invalid("semantic_search.model", "must not be empty"));
        }

        if sem.download_timeout_secs == 0 {
            return Err(ConfigError::invalid(
                "semantic_search.download_timeout_secs",
                "must be greater than 0",
            ));
        }

        if sem.default_top_n == 0 {
            return Err(ConfigError::invalid(
                "semantic_search.default_top_n",
                "must be greater than 0",
            ));
        }

        let threshold = self.duplicates.fuzzy_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(ConfigError::invalid(
                "duplicates.fuzzy_threshold",
                format!("must be between 0.0 and 1.0, got {threshold}"),
            ));
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults if it
    /// doesn't exist.
    pub fn load_with(base_path: &Path) -> Result<Self, ConfigError> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let config = Self {
                base_path: base_path.to_path_buf(),
                ..Default::default()
            };
            config.save()?;
        }

        let config_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Io {
            path: path.clone(),
            source,
        })?;
        let mut config: Self = serde_yml::from_str(&config_str)?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            log::info!("upgrading {}", path.display());
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> Result<(), ConfigError> {
        let io_error = |source| ConfigError::Io {
            path: self.base_path.join(CONFIG_FILE),
            source,
        };

        std::fs::create_dir_all(&self.base_path).map_err(io_error)?;
        let config_str = serde_yml::to_string(&self)?;
        std::fs::write(self.base_path.join(CONFIG_FILE), config_str).map_err(io_error)?;
        Ok(())
    }

    /// Apply `FORCE_REFRESH`, `CACHE_EXPIRY_DAYS` and `USE_CUDA`.
    ///
    /// Overrides only live in memory; `save` after this would persist them.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("FORCE_REFRESH") {
            self.semantic_search.force_refresh = parse_flag("FORCE_REFRESH", &value)?;
        }

        if let Some(value) = lookup("CACHE_EXPIRY_DAYS") {
            self.semantic_search.max_cache_age_days =
                value.trim().parse().map_err(|_| {
                    ConfigError::invalid(
                        "CACHE_EXPIRY_DAYS",
                        format!("expected a number of days, got '{value}'"),
                    )
                })?;
        }

        if let Some(value) = lookup("USE_CUDA") {
            if parse_flag("USE_CUDA", &value)? {
                self.semantic_search.device = DevicePreference::Accelerator;
            }
        }

        Ok(())
    }
}

fn parse_flag(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Ok(true),
        "" | "0" | "false" | "no" => Ok(false),
        _ => Err(ConfigError::invalid(name, format!("expected 0 or 1, got '{value}'"))),
    }
}
