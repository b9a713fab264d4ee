//! Response sources available from the command line.

use gamebench_core::testing::MockBackend;
use gamebench_core::{BackendProvider, ModelSource};
use gamebench_proto::{BackendError, ModelSpec};

/// Backend name for the echoing mock backend.
pub const MOCK: &str = "mock";
/// Backend name for a human at the terminal.
pub const HUMAN: &str = "human";
/// Backend name for game-computed responses.
pub const PROGRAMMATIC: &str = "programmatic";

/// Maps model names to the built-in response sources.
#[derive(Debug, Default, Clone, Copy)]
pub struct BuiltinProvider;

impl BuiltinProvider {
    /// Returns the model names this provider can serve.
    pub fn names() -> [&'static str; 3] {
        [MOCK, HUMAN, PROGRAMMATIC]
    }

    /// Returns true if any model in the pairing reads from the terminal.
    pub fn is_interactive(models: &[ModelSpec]) -> bool {
        models.iter().any(|m| m.name == HUMAN)
    }
}

impl BackendProvider for BuiltinProvider {
    fn backend_for(&self, spec: &ModelSpec) -> Result<ModelSource, BackendError> {
        match spec.name.as_str() {
            MOCK => Ok(ModelSource::backend(
                spec.clone(),
                Box::new(MockBackend::echo().with_model(MOCK)),
            )),
            HUMAN => Ok(ModelSource::human_stdio()),
            PROGRAMMATIC => Ok(ModelSource::Programmatic),
            other => Err(BackendError::Unavailable(other.to_string())),
        }
    }
}

/// Parses `name` or `name:temperature`.
///
/// The suffix after the last `:` is a temperature only if it is numeric, so
/// names such as `ollama:llama3` stay whole.
pub fn parse_model(s: &str) -> Result<ModelSpec, String> {
    let (name, temperature) = s
        .rsplit_once(':')
        .and_then(|(name, temp)| temp.parse::<f64>().ok().map(|t| (name, t)))
        .unwrap_or((s, 0.0));
    if name.is_empty() {
        return Err("model name must not be empty".to_string());
    }
    if !(0.0..=2.0).contains(&temperature) {
        return Err(format!("temperature {} is outside 0.0..=2.0", temperature));
    }
    Ok(ModelSpec::new(name, temperature))
}
