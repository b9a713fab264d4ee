//! Event recorder for episode interaction logs.
//!
//! `EventRecorder` accumulates a turn-grouped log of everything that happened
//! during an episode, plus a parallel log of raw backend calls. Both are
//! flushed to `interactions.json` and `requests.json` in the episode directory.
//!
//! Every value handed to the recorder is cloned at the call boundary, so later
//! mutation by the caller can never change a record that was already logged.

use chrono::{SecondsFormat, Utc};
use gamebench_proto::{PlayerName, is_valid_identity};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// File name of the persisted interaction log.
pub const INTERACTIONS_FILE: &str = "interactions.json";

/// File name of the persisted raw-call log.
pub const REQUESTS_FILE: &str = "requests.json";

/// Top-level fields of `interactions.json` that episode keys may not shadow.
pub const RESERVED_KEYS: [&str; 2] = ["players", "turns"];

/// Returns the current time as an ISO-8601 string.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// The payload of a logged event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    /// Action discriminator (e.g. `"send message"`, `"get message"`, `"parse"`).
    #[serde(rename = "type")]
    pub kind: String,

    /// Action content, usually the message text.
    pub content: Value,
}

impl Action {
    pub const SEND_MESSAGE: &'static str = "send message";
    pub const GET_MESSAGE: &'static str = "get message";
    pub const PARSE: &'static str = "parse";
    pub const METADATA: &'static str = "metadata";

    /// Creates a new action.
    pub fn new(kind: impl Into<String>, content: impl Into<Value>) -> Self {
        Self {
            kind: kind.into(),
            content: content.into(),
        }
    }

    /// A message sent by the game master to a player.
    pub fn send_message(content: &str) -> Self {
        Self::new(Self::SEND_MESSAGE, content)
    }

    /// A message received by the game master from a player.
    pub fn get_message(content: &str) -> Self {
        Self::new(Self::GET_MESSAGE, content)
    }

    /// The result of parsing a player response.
    pub fn parse(content: &str) -> Self {
        Self::new(Self::PARSE, content)
    }

    /// Free-form game metadata.
    pub fn metadata(content: impl Into<Value>) -> Self {
        Self::new(Self::METADATA, content)
    }
}

/// A single entry in a turn-group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub from: String,
    pub to: String,
    pub timestamp: String,
    pub action: Action,
}

/// A raw backend call paired with an event by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawCall {
    pub timestamp: String,
    pub manipulated_prompt_obj: Value,
    pub raw_response_obj: Value,
}

/// The structured interaction log of one episode.
///
/// Game-specific keys recorded via [`EventRecorder::log_key`] are flattened
/// into the top-level JSON object next to `players` and `turns`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InteractionLog {
    /// Identity (`"GM"`, `"Player N"`) to description, in insertion order.
    #[serde(default)]
    pub players: Map<String, Value>,

    /// Turn-groups of events, one per opened turn.
    #[serde(default)]
    pub turns: Vec<Vec<Event>>,

    /// Episode-level keys logged by the game.
    #[serde(flatten)]
    pub keys: Map<String, Value>,
}

impl InteractionLog {
    /// Loads a persisted interaction log.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, RecorderError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading interaction log");
        let content = fs::read_to_string(path_ref)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Returns an episode-level key.
    pub fn key(&self, name: &str) -> Option<&Value> {
        self.keys.get(name)
    }

    /// Returns all events across all turns, in order.
    pub fn events(&self) -> impl Iterator<Item = &Event> {
        self.turns.iter().flatten()
    }

    /// Checks the log for data-quality problems.
    ///
    /// `request_count` is the number of raw calls recorded alongside this log.
    pub fn validate(&self, request_count: usize) -> Vec<LogWarning> {
        let mut warnings = Vec::new();

        if self.players.is_empty() {
            warnings.push(LogWarning::MissingPlayers);
        }

        for identity in self.players.keys() {
            if identity != "GM" && !is_valid_identity(identity) {
                warnings.push(LogWarning::MalformedIdentity(identity.clone()));
            }
        }

        if self.turns.is_empty() {
            warnings.push(LogWarning::NoTurns);
        }

        if request_count == 0 {
            warnings.push(LogWarning::NoRequests);
        }

        warnings
    }
}

/// A non-fatal problem detected when flushing an interaction log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogWarning {
    /// `log_players` was never called.
    MissingPlayers,
    /// No turn was ever opened.
    NoTurns,
    /// A players key is neither `"GM"` nor `"Player <n>"`.
    MalformedIdentity(String),
    /// No raw backend call was logged.
    NoRequests,
}

impl fmt::Display for LogWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogWarning::MissingPlayers => f.write_str("players metadata was not logged"),
            LogWarning::NoTurns => f.write_str("interaction log contains no turns"),
            LogWarning::MalformedIdentity(id) => {
                write!(f, "player identity '{}' does not match 'Player <n>'", id)
            }
            LogWarning::NoRequests => f.write_str("no raw backend calls were logged"),
        }
    }
}

/// Errors raised by the recorder.
#[derive(Debug, thiserror::Error)]
pub enum RecorderError {
    #[error("Cannot log event: no turn has been opened")]
    NoTurnOpen,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Records the events of one episode.
///
/// # Example
///
/// ```
/// use gamebench_core::{Action, EventRecorder};
/// use gamebench_proto::PlayerName;
///
/// let mut recorder = EventRecorder::new();
/// recorder.log_players([("GM", "Game master"), ("Player 1", "Guesser, mock")]);
/// recorder.open_turn();
/// recorder
///     .log_event(PlayerName::Gm, PlayerName::Player(1), &Action::send_message("Go"), None)
///     .unwrap();
///
/// assert_eq!(recorder.log().turns.len(), 1);
/// ```
#[derive(Debug, Default)]
pub struct EventRecorder {
    log: InteractionLog,
    requests: Vec<RawCall>,
    current_turn: Option<usize>,
}

impl EventRecorder {
    /// Creates an empty recorder with no turn open.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens a new, empty turn-group and returns its index.
    pub fn open_turn(&mut self) -> usize {
        self.log.turns.push(Vec::new());
        let turn = self.log.turns.len() - 1;
        self.current_turn = Some(turn);
        turn
    }

    /// Returns the index of the currently open turn, if any.
    pub fn current_turn(&self) -> Option<usize> {
        self.current_turn
    }

    /// Appends an event to the current turn and returns its timestamp.
    ///
    /// When `call` carries a `(prompt, response)` pair, a raw-call record with
    /// the same timestamp is appended to the request log.
    pub fn log_event(
        &mut self,
        from: PlayerName,
        to: PlayerName,
        action: &Action,
        call: Option<(&Value, &Value)>,
    ) -> Result<String, RecorderError> {
        let turn = self.current_turn.ok_or(RecorderError::NoTurnOpen)?;
        let timestamp = timestamp_now();

        self.log.turns[turn].push(Event {
            from: from.to_string(),
            to: to.to_string(),
            timestamp: timestamp.clone(),
            action: action.clone(),
        });

        if let Some((prompt, response)) = call {
            self.requests.push(RawCall {
                timestamp: timestamp.clone(),
                manipulated_prompt_obj: prompt.clone(),
                raw_response_obj: response.clone(),
            });
        }

        Ok(timestamp)
    }

    /// Records the identity-to-description mapping of the episode.
    pub fn log_players<I, K, V>(&mut self, players: I)
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.log.players = players
            .into_iter()
            .map(|(id, description)| (id.into(), Value::String(description.into())))
            .collect();
    }

    /// Returns true once players metadata has been recorded.
    pub fn has_players(&self) -> bool {
        !self.log.players.is_empty()
    }

    /// Records an episode-level key, replacing any previous value.
    ///
    /// Keys named like a top-level log field are dropped with a warning.
    pub fn log_key(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        let key = key.into();
        let value = value.into();
        if RESERVED_KEYS.contains(&key.as_str()) {
            warn!(key = %key, value = %value, "Ignoring episode key that shadows a log field");
            return;
        }
        if let Some(previous) = self.log.keys.insert(key.clone(), value) {
            debug!(key = %key, previous = %previous, "Overwrote episode key");
        }
    }

    /// Returns the interaction log recorded so far.
    pub fn log(&self) -> &InteractionLog {
        &self.log
    }

    /// Returns the raw calls recorded so far.
    pub fn requests(&self) -> &[RawCall] {
        &self.requests
    }

    /// Checks the recorded log for data-quality problems.
    pub fn validate(&self) -> Vec<LogWarning> {
        self.log.validate(self.requests.len())
    }

    /// Writes `interactions.json` and `requests.json` into `dir`.
    ///
    /// Data-quality problems are logged as warnings and never fail the flush.
    pub fn flush(&self, dir: impl AsRef<Path>) -> Result<(), RecorderError> {
        let dir = dir.as_ref();

        for warning in self.validate() {
            warn!(dir = %dir.display(), "{}", warning);
        }

        fs::create_dir_all(dir)?;
        fs::write(
            dir.join(INTERACTIONS_FILE),
            serde_json::to_string_pretty(&self.log)?,
        )?;
        fs::write(
            dir.join(REQUESTS_FILE),
            serde_json::to_string_pretty(&self.requests)?,
        )?;

        debug!(
            dir = %dir.display(),
            turns = self.log.turns.len(),
            requests = self.requests.len(),
            "Flushed interaction log"
        );
        Ok(())
    }
}
