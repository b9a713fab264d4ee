//! Harness configuration.
//!
//! Loaded from `gamebench.yml`. Every field has a default, so an absent file
//! or an empty document yields a usable configuration.

use crate::participant::DEFAULT_MAX_RETRIES;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "gamebench.yml";

/// Top-level harness configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarnessConfig {
    /// Root directory for episode results.
    #[serde(default = "default_results_dir")]
    pub results_dir: PathBuf,

    /// Additional attempts after a transient backend failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Cap on consecutive reprompts of one player. Unbounded when absent.
    #[serde(default)]
    pub max_reprompts: Option<usize>,

    /// Render transcripts after each scored episode.
    #[serde(default = "default_true")]
    pub write_transcripts: bool,

    /// Skip configuration warnings.
    #[serde(default, rename = "_suppress_warnings")]
    pub suppress_warnings: bool,
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("results")
}

fn default_max_retries() -> usize {
    DEFAULT_MAX_RETRIES
}

fn default_true() -> bool {
    true
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            results_dir: default_results_dir(),
            max_retries: default_max_retries(),
            max_reprompts: None,
            write_transcripts: true,
            suppress_warnings: false,
        }
    }
}

impl HarnessConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path_ref)?;
        let config = Self::parse_yaml(&content)?;
        debug!(
            results_dir = %config.results_dir.display(),
            max_retries = config.max_retries,
            max_reprompts = ?config.max_reprompts,
            "Configuration loaded"
        );
        Ok(config)
    }

    /// Loads configuration from `path` if it exists, otherwise returns defaults.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        if path_ref.exists() {
            Self::from_file(path_ref)
        } else {
            debug!(path = %path_ref.display(), "No configuration file, using defaults");
            Ok(Self::default())
        }
    }

    /// Parses a YAML document. An empty document yields defaults.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(content)?)
    }

    /// Validates the configuration and returns warnings.
    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if self.suppress_warnings {
            return warnings;
        }

        if self.max_retries == 0 {
            warnings.push(ConfigWarning::InvalidValue {
                field: "max_retries".to_string(),
                message: "Transient backend failures will not be retried".to_string(),
            });
        }

        if self.max_reprompts == Some(0) {
            warnings.push(ConfigWarning::InvalidValue {
                field: "max_reprompts".to_string(),
                message: "Games that reprompt will never get a second attempt".to_string(),
            });
        }

        if self.results_dir.as_os_str().is_empty() {
            warnings.push(ConfigWarning::InvalidValue {
                field: "results_dir".to_string(),
                message: "Empty path, results will be written to the working directory"
                    .to_string(),
            });
        }

        warnings
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Field has a legal but suspicious value.
    InvalidValue { field: String, message: String },
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::InvalidValue { field, message } => {
                write!(f, "Warning [{}]: {}", field, message)
            }
        }
    }
}

/// Configuration errors. All of them abort a batch before any episode runs.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("No model pairing for experiment '{0}': pass --model or declare player_models")]
    NoPairing(String),

    #[error("Game '{game}' takes {players} player(s) but {supplied} model(s) were supplied")]
    TooManyPlayers {
        game: String,
        players: usize,
        supplied: usize,
    },

    #[error("Unknown game '{name}'. Available: {available}")]
    UnknownGame { name: String, available: String },

    #[error("Unknown experiment: '{0}'")]
    UnknownExperiment(String),

    #[error("Validation error: {0}")]
    Validation(String),
}
