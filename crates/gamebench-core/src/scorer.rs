//! Scoring of completed episodes.
//!
//! Scoring is a pure function of the interaction log: [`compute_scores`] runs
//! the game's turn scoring, then the fixed episode-level steps shared by all
//! games, then the game's headline metric.

use crate::metrics;
use crate::recorder::InteractionLog;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::{debug, warn};

/// File name of persisted scores.
pub const SCORES_FILE: &str = "scores.json";

/// Turn-level and episode-level metrics of one episode.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Scores {
    #[serde(rename = "turn scores", default)]
    pub turn_scores: BTreeMap<usize, Map<String, Value>>,

    #[serde(rename = "episode scores", default)]
    pub episode_scores: Map<String, Value>,
}

impl Scores {
    /// Creates an empty score set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a metric for `turn`. Overwriting an existing value logs a warning.
    pub fn log_turn_score(&mut self, turn: usize, name: &str, value: impl Into<Value>) {
        let value = value.into();
        let entry = self.turn_scores.entry(turn).or_default();
        if let Some(previous) = entry.insert(name.to_string(), value.clone()) {
            warn!(
                turn,
                metric = name,
                previous = %previous,
                value = %value,
                "Turn score overwritten"
            );
        }
    }

    /// Records an episode metric. Overwriting an existing value logs a warning.
    pub fn log_episode_score(&mut self, name: &str, value: impl Into<Value>) {
        let value = value.into();
        if let Some(previous) = self.episode_scores.insert(name.to_string(), value.clone()) {
            warn!(
                metric = name,
                previous = %previous,
                value = %value,
                "Episode score overwritten"
            );
        }
    }

    /// Returns an episode metric.
    pub fn episode_score(&self, name: &str) -> Option<&Value> {
        self.episode_scores.get(name)
    }

    /// Returns a turn metric.
    pub fn turn_score(&self, turn: usize, name: &str) -> Option<&Value> {
        self.turn_scores.get(&turn).and_then(|m| m.get(name))
    }

    /// Writes `scores.json` into `dir`.
    pub fn store(&self, dir: impl AsRef<Path>) -> Result<(), ScoringError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        fs::write(dir.join(SCORES_FILE), serde_json::to_string_pretty(self)?)?;
        debug!(dir = %dir.display(), "Stored scores");
        Ok(())
    }

    /// Loads persisted scores.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ScoringError> {
        let content = fs::read_to_string(path.as_ref())?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Errors raised while scoring an episode.
#[derive(Debug, thiserror::Error)]
pub enum ScoringError {
    #[error("Interaction log is missing key '{0}'")]
    MissingKey(String),

    #[error("Interaction log key '{key}' has unexpected value {value}")]
    InvalidValue { key: String, value: Value },

    #[error("Cannot compute '{0}': request count is zero")]
    DivisionByZero(String),

    #[error("Scorer did not set the 'Main Score' metric")]
    MissingMainScore,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Game-specific scoring.
///
/// Both methods are required; the episode-level steps between them are fixed
/// and run by [`compute_scores`].
pub trait GameScorer {
    /// Populates the turn scores from the interaction log.
    fn score_turns(&mut self, log: &InteractionLog, scores: &mut Scores)
    -> Result<(), ScoringError>;

    /// Sets the [`metrics::MAIN_SCORE`] episode metric.
    fn log_main_score(
        &mut self,
        log: &InteractionLog,
        scores: &mut Scores,
    ) -> Result<(), ScoringError>;
}

/// Scores a completed episode.
pub fn compute_scores(
    scorer: &mut dyn GameScorer,
    log: &InteractionLog,
) -> Result<Scores, ScoringError> {
    let mut scores = Scores::new();
    scorer.score_turns(log, &mut scores)?;
    score_game(scorer, log, &mut scores)?;
    Ok(scores)
}

/// Runs the episode-level scoring steps: game end, requests, headline metric.
pub fn score_game(
    scorer: &mut dyn GameScorer,
    log: &InteractionLog,
    scores: &mut Scores,
) -> Result<(), ScoringError> {
    score_game_end(log, scores)?;
    score_requests(log, scores)?;
    scorer.log_main_score(log, scores)?;
    if scores.episode_score(metrics::MAIN_SCORE).is_none() {
        return Err(ScoringError::MissingMainScore);
    }
    Ok(())
}

/// Derives `Aborted`, `Lose`, and `Success` from the episode-end keys.
///
/// An aborted episode never counts as lost: `Lose` is forced to `0`.
pub fn score_game_end(log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
    let aborted = read_flag(log, metrics::ABORTED)?;
    let lose = if aborted {
        false
    } else {
        read_flag(log, metrics::LOSE)?
    };
    let success = !aborted && !lose;

    scores.log_episode_score(metrics::ABORTED, u8::from(aborted));
    scores.log_episode_score(metrics::LOSE, u8::from(lose));
    scores.log_episode_score(metrics::SUCCESS, u8::from(success));
    Ok(())
}

/// Copies the request counters and derives the request success ratio.
pub fn score_requests(log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
    let total = read_count(log, metrics::REQUEST_COUNT)?;
    let parsed = read_count(log, metrics::REQUEST_COUNT_PARSED)?;
    let violated = read_count(log, metrics::REQUEST_COUNT_VIOLATED)?;

    scores.log_episode_score(metrics::REQUEST_COUNT, total);
    scores.log_episode_score(metrics::REQUEST_COUNT_PARSED, parsed);
    scores.log_episode_score(metrics::REQUEST_COUNT_VIOLATED, violated);

    if total == 0 {
        return Err(ScoringError::DivisionByZero(
            metrics::REQUEST_SUCCESS_RATIO.to_string(),
        ));
    }
    scores.log_episode_score(metrics::REQUEST_SUCCESS_RATIO, parsed as f64 / total as f64);
    Ok(())
}

fn required<'a>(log: &'a InteractionLog, key: &str) -> Result<&'a Value, ScoringError> {
    log.key(key)
        .ok_or_else(|| ScoringError::MissingKey(key.to_string()))
}

fn read_flag(log: &InteractionLog, key: &str) -> Result<bool, ScoringError> {
    let value = required(log, key)?;
    match value {
        Value::Bool(flag) => Ok(*flag),
        Value::Number(n) => match n.as_f64() {
            Some(v) => Ok(v != 0.0),
            None => Err(invalid(key, value)),
        },
        _ => Err(invalid(key, value)),
    }
}

fn read_count(log: &InteractionLog, key: &str) -> Result<u64, ScoringError> {
    let value = required(log, key)?;
    value.as_u64().ok_or_else(|| invalid(key, value))
}

fn invalid(key: &str, value: &Value) -> ScoringError {
    ScoringError::InvalidValue {
        key: key.to_string(),
        value: value.clone(),
    }
}
