//! Scripted response backends.

use gamebench_proto::{BackendError, Generation, Message, ResponseBackend};
use serde_json::json;
use std::sync::{Arc, Mutex, PoisonError};

/// Model name reported by [`MockBackend`].
pub const MOCK_MODEL: &str = "mock";

/// A backend that serves scripted responses.
///
/// Responses are served in order; once the script runs out the last response
/// repeats. With an empty script the backend echoes the last message it was
/// given. Clones share the execution record, so a test can keep a handle
/// after boxing the backend into a participant.
#[derive(Debug, Clone)]
pub struct MockBackend {
    model: String,
    responses: Arc<Vec<String>>,
    executions: Arc<Mutex<Vec<ExecutionRecord>>>,
}

/// One recorded call to a [`MockBackend`].
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRecord {
    pub messages: Vec<Message>,
    pub response: String,
}

impl MockBackend {
    /// Creates a backend with scripted responses.
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            model: MOCK_MODEL.to_string(),
            responses: Arc::new(responses),
            executions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Creates a backend that echoes the last message content.
    pub fn echo() -> Self {
        Self::new(Vec::new())
    }

    /// Sets the reported model name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    /// Returns every call made so far.
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the number of calls made so far.
    pub fn execution_count(&self) -> usize {
        self.executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn next_response(&self, index: usize, messages: &[Message]) -> String {
        match self.responses.get(index).or(self.responses.last()) {
            Some(response) => response.clone(),
            None => messages
                .last()
                .map(|m| m.content.clone())
                .unwrap_or_default(),
        }
    }
}

impl ResponseBackend for MockBackend {
    fn generate_response(&mut self, messages: &[Message]) -> Result<Generation, BackendError> {
        let mut executions = self
            .executions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let text = self.next_response(executions.len(), messages);
        executions.push(ExecutionRecord {
            messages: messages.to_vec(),
            response: text.clone(),
        });

        let prompt =
            serde_json::to_value(messages).map_err(|e| BackendError::Fatal(e.to_string()))?;
        let response = json!({
            "model": self.model,
            "choices": [{"message": {"role": "assistant", "content": text}}],
        });
        Ok(Generation::new(prompt, response, text))
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Transient,
    Fatal,
}

/// A backend that fails a fixed number of times before responding.
#[derive(Debug, Clone)]
pub struct FailingBackend {
    kind: FailureKind,
    remaining_failures: usize,
    response: String,
}

impl FailingBackend {
    /// Fails with a retryable error `failures` times.
    pub fn transient(failures: usize) -> Self {
        Self {
            kind: FailureKind::Transient,
            remaining_failures: failures,
            response: String::new(),
        }
    }

    /// Fails once with a non-retryable error.
    pub fn fatal() -> Self {
        Self {
            kind: FailureKind::Fatal,
            remaining_failures: 1,
            response: String::new(),
        }
    }

    /// Sets the response served after the failures are used up.
    pub fn then_respond(mut self, response: impl Into<String>) -> Self {
        self.response = response.into();
        self
    }
}

impl ResponseBackend for FailingBackend {
    fn generate_response(&mut self, messages: &[Message]) -> Result<Generation, BackendError> {
        if self.remaining_failures > 0 {
            self.remaining_failures -= 1;
            return Err(match self.kind {
                FailureKind::Transient => BackendError::Transient("rate limited".to_string()),
                FailureKind::Fatal => BackendError::Fatal("invalid request".to_string()),
            });
        }
        let prompt =
            serde_json::to_value(messages).map_err(|e| BackendError::Fatal(e.to_string()))?;
        Ok(Generation::new(prompt, json!({}), self.response.clone()))
    }

    fn model_name(&self) -> &str {
        "failing"
    }
}
