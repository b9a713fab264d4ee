//! Response participants.
//!
//! A `Participant` wraps one response source and gives every variant the
//! same call contract: the caller passes the conversation history and gets
//! back the prompt, a response record, and the response text. The response
//! record always carries a `"participant"` block with call timing, so logs
//! look the same no matter which variant produced them.

use crate::recorder::timestamp_now;
use gamebench_proto::{BackendError, Generation, Message, ModelSpec, ResponseBackend};
use serde_json::{Value, json};
use std::fmt;
use std::io::{self, BufRead, Write};
use std::time::Instant;
use tracing::{debug, warn};

/// Key under which call metadata is attached to every response record.
pub const PARTICIPANT_KEY: &str = "participant";

/// Model name reported by human-terminal participants.
pub const HUMAN_MODEL: &str = "human";

/// Model name reported by programmatic participants.
pub const PROGRAMMATIC_MODEL: &str = "programmatic";

/// Default number of additional attempts after a transient backend failure.
pub const DEFAULT_MAX_RETRIES: usize = 3;

/// Game-specific logic that produces responses for programmatic participants.
pub trait CustomResponder: Send {
    /// Produces the response for the current history.
    fn respond(&mut self, history: &[Message], turn: usize) -> Result<String, ParticipantError>;
}

impl<F> CustomResponder for F
where
    F: FnMut(&[Message], usize) -> String + Send,
{
    fn respond(&mut self, history: &[Message], turn: usize) -> Result<String, ParticipantError> {
        Ok(self(history, turn))
    }
}

/// Where a participant's responses come from.
pub enum ModelSource {
    /// Delegates to an external backend, retrying transient failures.
    Backend {
        spec: ModelSpec,
        backend: Box<dyn ResponseBackend>,
        max_retries: usize,
    },

    /// Reads one line per call from an interactive terminal.
    Human {
        reader: Box<dyn BufRead + Send>,
        writer: Box<dyn Write + Send>,
    },

    /// Responses are computed by the game through a [`CustomResponder`].
    Programmatic,
}

impl ModelSource {
    /// Creates a backend-driven source with the default retry bound.
    pub fn backend(spec: ModelSpec, backend: Box<dyn ResponseBackend>) -> Self {
        ModelSource::Backend {
            spec,
            backend,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    /// Creates a human source reading from stdin and prompting on stdout.
    pub fn human_stdio() -> Self {
        Self::human(
            Box::new(io::BufReader::new(io::stdin())),
            Box::new(io::stdout()),
        )
    }

    /// Creates a human source over arbitrary streams.
    pub fn human(reader: Box<dyn BufRead + Send>, writer: Box<dyn Write + Send>) -> Self {
        ModelSource::Human { reader, writer }
    }

    /// Sets the retry bound for backend sources. No effect on other variants.
    pub fn with_max_retries(mut self, retries: usize) -> Self {
        if let ModelSource::Backend { max_retries, .. } = &mut self {
            *max_retries = retries;
        }
        self
    }

    /// Returns the model name used in descriptions and call metadata.
    pub fn name(&self) -> &str {
        match self {
            ModelSource::Backend { spec, .. } => &spec.name,
            ModelSource::Human { .. } => HUMAN_MODEL,
            ModelSource::Programmatic => PROGRAMMATIC_MODEL,
        }
    }
}

impl fmt::Debug for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelSource::Backend {
                spec, max_retries, ..
            } => f
                .debug_struct("Backend")
                .field("spec", spec)
                .field("max_retries", max_retries)
                .finish_non_exhaustive(),
            ModelSource::Human { .. } => f.write_str("Human"),
            ModelSource::Programmatic => f.write_str("Programmatic"),
        }
    }
}

/// Errors raised while acquiring a response.
#[derive(Debug, thiserror::Error)]
pub enum ParticipantError {
    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("Programmatic participant '{0}' has no custom responder")]
    NotImplemented(String),

    #[error("Human input closed before a response was entered")]
    InputClosed,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Custom responder failed: {0}")]
    Custom(String),
}

/// Everything produced by a single participant invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct ParticipantCall {
    /// The prompt as sent to the response source.
    pub prompt: Value,
    /// The raw response record with the participant block attached.
    pub response: Value,
    /// The response text.
    pub text: String,
}

/// One response-producing role in an episode.
pub struct Participant {
    label: String,
    source: ModelSource,
    custom: Option<Box<dyn CustomResponder>>,
}

impl Participant {
    /// Creates a participant with a role label such as `"Guesser"`.
    pub fn new(label: impl Into<String>, source: ModelSource) -> Self {
        Self {
            label: label.into(),
            source,
            custom: None,
        }
    }

    /// Attaches the game logic used when the source is programmatic.
    pub fn with_custom_response(mut self, responder: impl CustomResponder + 'static) -> Self {
        self.custom = Some(Box::new(responder));
        self
    }

    /// Returns the role label.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Returns the response source.
    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Returns `"<label>, <model name>"` for the players metadata.
    pub fn description(&self) -> String {
        format!("{}, {}", self.label, self.source.name())
    }

    /// Invokes the response source on `history`.
    pub fn call(
        &mut self,
        history: &[Message],
        turn: usize,
    ) -> Result<ParticipantCall, ParticipantError> {
        let call_start = timestamp_now();
        let started = Instant::now();

        let (prompt, response, text) = match &mut self.source {
            ModelSource::Backend {
                spec,
                backend,
                max_retries,
            } => {
                let generation = generate_with_retries(backend.as_mut(), spec, history, *max_retries)?;
                (generation.prompt, generation.response, generation.text)
            }
            ModelSource::Human { reader, writer } => {
                let text = read_human_response(reader.as_mut(), writer.as_mut(), history)?;
                (history_value(history), json!({}), text)
            }
            ModelSource::Programmatic => {
                let responder = self
                    .custom
                    .as_mut()
                    .ok_or_else(|| ParticipantError::NotImplemented(self.label.clone()))?;
                let text = responder.respond(history, turn)?;
                (history_value(history), json!({}), text)
            }
        };

        let duration = started.elapsed();
        debug!(
            label = %self.label,
            model = %self.source.name(),
            turn,
            duration_ms = duration.as_millis() as u64,
            "Participant responded"
        );

        let block = json!({
            "call_start": call_start,
            "call_duration": duration.as_secs_f64(),
            "response_text": text,
            "model_name": self.source.name(),
        });

        Ok(ParticipantCall {
            prompt,
            response: attach_block(response, block),
            text,
        })
    }
}

impl fmt::Debug for Participant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Participant")
            .field("label", &self.label)
            .field("source", &self.source)
            .field("custom", &self.custom.is_some())
            .finish()
    }
}

fn generate_with_retries(
    backend: &mut dyn ResponseBackend,
    spec: &ModelSpec,
    history: &[Message],
    max_retries: usize,
) -> Result<Generation, ParticipantError> {
    let mut attempt = 0;
    loop {
        match backend.generate_response(history) {
            Ok(generation) => return Ok(generation),
            Err(err) if err.is_retryable() && attempt < max_retries => {
                attempt += 1;
                warn!(
                    model = %spec.name,
                    attempt,
                    max_retries,
                    error = %err,
                    "Retrying backend call"
                );
            }
            Err(err) => return Err(err.into()),
        }
    }
}

fn read_human_response(
    reader: &mut dyn BufRead,
    writer: &mut dyn Write,
    history: &[Message],
) -> Result<String, ParticipantError> {
    if let Some(last) = history.last() {
        writeln!(writer, "{}", last.content)?;
    }
    write!(writer, "Your response: ")?;
    writer.flush()?;

    let mut line = String::new();
    if reader.read_line(&mut line)? == 0 {
        return Err(ParticipantError::InputClosed);
    }
    Ok(line.trim_end_matches(['\r', '\n']).to_string())
}

fn history_value(history: &[Message]) -> Value {
    serde_json::to_value(history).unwrap_or(Value::Null)
}

fn attach_block(response: Value, block: Value) -> Value {
    match response {
        Value::Object(mut map) => {
            map.insert(PARTICIPANT_KEY.to_string(), block);
            Value::Object(map)
        }
        other => json!({ "response": other, PARTICIPANT_KEY: block }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailingBackend, MockBackend};
    use std::io::Cursor;

    fn history() -> Vec<Message> {
        vec![Message::user("What is your guess?")]
    }

    #[test]
    fn test_backend_call_attaches_block() {
        let backend = MockBackend::new(vec!["GUESS: apple".into()]);
        let mut participant = Participant::new(
            "Guesser",
            ModelSource::backend(ModelSpec::new("mock", 0.0), Box::new(backend)),
        );

        let call = participant.call(&history(), 0).unwrap();
        assert_eq!(call.text, "GUESS: apple");
        let block = &call.response[PARTICIPANT_KEY];
        assert_eq!(block["response_text"], "GUESS: apple");
        assert_eq!(block["model_name"], "mock");
        assert!(block["call_start"].is_string());
        assert!(block["call_duration"].as_f64().unwrap() >= 0.0);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let backend = FailingBackend::transient(2).then_respond("ok");
        let mut participant = Participant::new(
            "Player",
            ModelSource::backend(ModelSpec::new("flaky", 0.0), Box::new(backend)).with_max_retries(2),
        );
        assert_eq!(participant.call(&history(), 0).unwrap().text, "ok");
    }

    #[test]
    fn test_retries_exhausted_propagates() {
        let backend = FailingBackend::transient(5).then_respond("ok");
        let mut participant = Participant::new(
            "Player",
            ModelSource::backend(ModelSpec::new("flaky", 0.0), Box::new(backend)).with_max_retries(1),
        );
        let err = participant.call(&history(), 0).unwrap_err();
        assert!(matches!(err, ParticipantError::Backend(BackendError::Transient(_))));
    }

    #[test]
    fn test_fatal_failures_are_not_retried() {
        let backend = FailingBackend::fatal().then_respond("never");
        let mut participant = Participant::new(
            "Player",
            ModelSource::backend(ModelSpec::new("broken", 0.0), Box::new(backend)),
        );
        let err = participant.call(&history(), 0).unwrap_err();
        assert!(matches!(err, ParticipantError::Backend(BackendError::Fatal(_))));
    }

    #[test]
    fn test_human_reads_one_line() {
        let input = Cursor::new(b"my answer\nsecond line\n".to_vec());
        let mut participant = Participant::new(
            "Guesser",
            ModelSource::human(Box::new(input), Box::new(io::sink())),
        );

        let call = participant.call(&history(), 0).unwrap();
        assert_eq!(call.text, "my answer");
        assert_eq!(call.response[PARTICIPANT_KEY]["model_name"], HUMAN_MODEL);
        assert_eq!(participant.description(), "Guesser, human");
    }

    #[test]
    fn test_human_closed_input_fails() {
        let mut participant = Participant::new(
            "Guesser",
            ModelSource::human(Box::new(Cursor::new(Vec::new())), Box::new(io::sink())),
        );
        assert!(matches!(
            participant.call(&history(), 0),
            Err(ParticipantError::InputClosed)
        ));
    }

    #[test]
    fn test_programmatic_without_responder_fails() {
        let mut participant = Participant::new("Judge", ModelSource::Programmatic);
        let err = participant.call(&history(), 0).unwrap_err();
        assert!(matches!(err, ParticipantError::NotImplemented(label) if label == "Judge"));
    }

    #[test]
    fn test_programmatic_uses_custom_response() {
        let mut participant = Participant::new("Judge", ModelSource::Programmatic)
            .with_custom_response(|history: &[Message], turn: usize| {
                format!("turn {} saw {} messages", turn, history.len())
            });

        let call = participant.call(&history(), 3).unwrap();
        assert_eq!(call.text, "turn 3 saw 1 messages");
        assert_eq!(call.response[PARTICIPANT_KEY]["model_name"], PROGRAMMATIC_MODEL);
        assert_eq!(call.prompt[0]["content"], "What is your guess?");
    }

    #[test]
    fn test_non_object_response_is_wrapped() {
        let wrapped = attach_block(json!("raw"), json!({"k": 1}));
        assert_eq!(wrapped["response"], "raw");
        assert_eq!(wrapped[PARTICIPANT_KEY]["k"], 1);
    }
}
