//! Model specifications and pairing descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a response source and its sampling temperature.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Model name (e.g. `"mock"`, `"human"`, `"programmatic"`).
    #[serde(alias = "model_name")]
    pub name: String,

    /// Sampling temperature passed to the backend.
    #[serde(default)]
    pub temperature: f64,
}

impl ModelSpec {
    /// Creates a new model spec.
    pub fn new(name: impl Into<String>, temperature: f64) -> Self {
        Self {
            name: name.into(),
            temperature,
        }
    }

    /// Returns `<name>-t<temperature>`, the per-model part of a pairing descriptor.
    ///
    /// Whole-number temperatures keep one decimal place (`0.0`, `1.0`).
    pub fn descriptor(&self) -> String {
        format!("{}-t{}", self.name, format_temperature(self.temperature))
    }
}

impl fmt::Display for ModelSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

fn format_temperature(temperature: f64) -> String {
    if temperature.is_finite() && temperature.fract() == 0.0 {
        format!("{:.1}", temperature)
    } else {
        format!("{}", temperature)
    }
}

/// Joins model descriptors into the directory discriminator for a result set.
///
/// `[modelA@0.7, modelA@0.7]` becomes `"modelA-t0.7--modelA-t0.7"`.
pub fn pairing_descriptor(models: &[ModelSpec]) -> String {
    models
        .iter()
        .map(ModelSpec::descriptor)
        .collect::<Vec<_>>()
        .join("--")
}
