//! The response backend contract.
//!
//! Concrete backends (remote APIs, local models) live outside this workspace
//! and are consumed only through [`ResponseBackend::generate_response`].

use crate::Message;
use serde_json::Value;

/// Output of a single backend call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    /// The prompt exactly as sent to the backend, after any manipulation.
    pub prompt: Value,

    /// The raw response object returned by the backend.
    pub response: Value,

    /// The extracted response text.
    pub text: String,
}

impl Generation {
    /// Creates a new generation.
    pub fn new(prompt: Value, response: Value, text: impl Into<String>) -> Self {
        Self {
            prompt,
            response,
            text: text.into(),
        }
    }
}

/// Errors raised by response backends.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// A failure worth retrying (rate limits, timeouts, dropped connections).
    #[error("Transient backend failure: {0}")]
    Transient(String),

    /// A failure that retrying will not fix.
    #[error("Backend failure: {0}")]
    Fatal(String),

    /// No backend is available for the requested model.
    #[error("No backend available for model '{0}'")]
    Unavailable(String),
}

impl BackendError {
    /// Returns true if the call may succeed when repeated.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Transient(_))
    }
}

/// A source of model responses.
///
/// Implementations must return [`BackendError::Transient`] for failures that
/// are worth retrying and any other variant otherwise.
pub trait ResponseBackend: Send {
    /// Generates a response for the given conversation history.
    fn generate_response(&mut self, messages: &[Message]) -> Result<Generation, BackendError>;

    /// Returns the name of the underlying model.
    fn model_name(&self) -> &str;
}
