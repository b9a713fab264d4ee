//! Instance specification files.
//!
//! An instance file holds named experiments, each with arbitrary shared
//! parameters and a list of game instances:
//!
//! ```json
//! {"experiments": [{"name": "easy", "max_turns": 3,
//!                   "game_instances": [{"game_id": 0, "target": "apple"}]}]}
//! ```

use gamebench_proto::ModelSpec;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::fs;
use std::path::Path;
use tracing::debug;

/// Experiment parameter holding a pairing declared inside the instance file.
pub const PLAYER_MODELS_KEY: &str = "player_models";

/// File name of a persisted game instance snapshot.
pub const INSTANCE_FILE: &str = "instance.json";

/// The top-level contents of an instance specification file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceFile {
    pub experiments: Vec<Experiment>,
}

impl InstanceFile {
    /// Loads and validates an instance file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, InstanceError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading instance file");
        let content = fs::read_to_string(path_ref)?;
        let file: Self = serde_json::from_str(&content)?;
        file.validate()?;
        debug!(experiments = file.experiments.len(), "Instance file loaded");
        Ok(file)
    }

    /// Checks that experiments exist and have unique, non-empty names.
    pub fn validate(&self) -> Result<(), InstanceError> {
        if self.experiments.is_empty() {
            return Err(InstanceError::Validation(
                "Instance file must contain at least one experiment".to_string(),
            ));
        }

        let mut names = HashSet::new();
        for experiment in &self.experiments {
            if experiment.name.is_empty() {
                return Err(InstanceError::Validation(
                    "Experiment name must not be empty".to_string(),
                ));
            }
            if !names.insert(&experiment.name) {
                return Err(InstanceError::Validation(format!(
                    "Duplicate experiment name: '{}'",
                    experiment.name
                )));
            }
        }

        Ok(())
    }

    /// Returns `(index, experiment)` pairs, optionally restricted to one name.
    ///
    /// Indices refer to the position in the file, not in the filtered list.
    pub fn select(&self, name: Option<&str>) -> Vec<(usize, &Experiment)> {
        self.experiments
            .iter()
            .enumerate()
            .filter(|(_, e)| name.is_none_or(|n| e.name == n))
            .collect()
    }
}

/// A named collection of game instances sharing parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,

    #[serde(default)]
    pub game_instances: Vec<GameInstance>,

    /// Every other key of the experiment object.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl Experiment {
    /// Creates an experiment with no parameters.
    pub fn new(name: impl Into<String>, game_instances: Vec<GameInstance>) -> Self {
        Self {
            name: name.into(),
            game_instances,
            params: Map::new(),
        }
    }

    /// Adds a parameter.
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    /// Returns a parameter.
    pub fn param(&self, key: &str) -> Option<&Value> {
        self.params.get(key)
    }

    /// Returns the experiment without its instance list, name first.
    pub fn static_params(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("name".to_string(), Value::String(self.name.clone()));
        for (key, value) in &self.params {
            map.insert(key.clone(), value.clone());
        }
        map
    }

    /// Returns the pairing declared under `player_models`, if any.
    ///
    /// Entries may be `{"name": .., "temperature": ..}` objects or bare model names.
    pub fn declared_pairing(&self) -> Result<Option<Vec<ModelSpec>>, InstanceError> {
        let Some(value) = self.params.get(PLAYER_MODELS_KEY) else {
            return Ok(None);
        };
        let entries = value.as_array().ok_or_else(|| {
            InstanceError::Validation(format!(
                "Experiment '{}': '{}' must be a list",
                self.name, PLAYER_MODELS_KEY
            ))
        })?;

        let mut models = Vec::with_capacity(entries.len());
        for entry in entries {
            let model = match entry {
                Value::String(name) => ModelSpec::new(name.clone(), 0.0),
                other => serde_json::from_value(other.clone())?,
            };
            models.push(model);
        }
        Ok(Some(models))
    }
}

/// A single game instance: one episode per pairing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameInstance {
    pub game_id: Value,

    /// Game-specific instance data.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl GameInstance {
    /// Creates an instance with no extra fields.
    pub fn new(game_id: impl Into<Value>) -> Self {
        Self {
            game_id: game_id.into(),
            fields: Map::new(),
        }
    }

    /// Adds a field.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Returns a field.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.fields.get(key)
    }

    /// Returns a string field.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Writes `instance.json` into `dir`.
    pub fn store(&self, dir: impl AsRef<Path>) -> Result<(), InstanceError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(INSTANCE_FILE), serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// Errors raised while loading instance files.
#[derive(Debug, thiserror::Error)]
pub enum InstanceError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Validation error: {0}")]
    Validation(String),
}
