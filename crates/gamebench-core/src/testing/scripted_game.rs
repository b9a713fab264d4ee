//! A configurable dialogue game for exercising the harness.
//!
//! Players take turns answering; each answer is forwarded to every other
//! player. Instance fields steer the episode:
//!
//! - `rounds`: number of turns to play (default 1, or the experiment's `rounds`)
//! - `fail_on_turn`: return a game error before that turn starts
//! - `panic_on_turn`: panic before that turn starts
//! - `lose`: recorded as the episode's lose signal

use crate::instances::{Experiment, GameInstance};
use crate::master::{DialogueGame, EpisodeContext, MasterError};
use crate::metrics;
use crate::participant::{ModelSource, Participant};
use crate::recorder::{Action, InteractionLog};
use crate::registry::GameFactory;
use crate::scorer::{GameScorer, Scores, ScoringError};
use serde_json::Value;

/// Episode-level key recording how many turns were played.
pub const ROUNDS_PLAYED: &str = "Rounds Played";

/// Game rules driven by instance fields.
#[derive(Debug)]
pub struct ScriptedGame {
    models: Vec<ModelSource>,
    rounds: usize,
    fail_on_turn: Option<usize>,
    panic_on_turn: Option<usize>,
    lose: bool,
}

impl ScriptedGame {
    /// Creates a game with one player per model.
    pub fn new(models: Vec<ModelSource>) -> Self {
        Self {
            models,
            rounds: 1,
            fail_on_turn: None,
            panic_on_turn: None,
            lose: false,
        }
    }

    /// Sets the default number of turns.
    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.rounds = rounds;
        self
    }
}

fn field_usize(instance: &GameInstance, key: &str) -> Option<usize> {
    instance
        .get(key)
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

impl DialogueGame for ScriptedGame {
    fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance) -> Result<(), MasterError> {
        if let Some(rounds) = field_usize(instance, "rounds") {
            self.rounds = rounds;
        }
        self.fail_on_turn = field_usize(instance, "fail_on_turn");
        self.panic_on_turn = field_usize(instance, "panic_on_turn");
        self.lose = instance.get("lose").and_then(Value::as_bool).unwrap_or(false);

        for (i, model) in std::mem::take(&mut self.models).into_iter().enumerate() {
            let player = ctx.add_player(Participant::new(format!("Speaker {}", i + 1), model))?;
            ctx.add_user_message(player, "Say something.")?;
        }
        Ok(())
    }

    fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
        ctx.current_turn() < self.rounds
    }

    fn on_before_turn(&mut self, ctx: &mut EpisodeContext, turn: usize) -> Result<(), MasterError> {
        if self.fail_on_turn == Some(turn) {
            return Err(MasterError::Game(format!("scripted failure on turn {}", turn)));
        }
        if self.panic_on_turn == Some(turn) {
            panic!("scripted panic on turn {}", turn);
        }
        ctx.log_to_self(Action::METADATA, format!("turn {} begins", turn))
    }

    fn after_add_player_response(
        &mut self,
        ctx: &mut EpisodeContext,
        player: gamebench_proto::PlayerName,
        utterance: &str,
    ) -> Result<(), MasterError> {
        for other in ctx.player_names() {
            if other != player {
                ctx.add_user_message(other, utterance)?;
            }
        }
        if ctx.player_count() == 1 {
            ctx.add_user_message(player, "Say something else.")?;
        }
        Ok(())
    }

    fn on_after_game(&mut self, ctx: &mut EpisodeContext) -> Result<(), MasterError> {
        ctx.log_key(metrics::ABORTED, false);
        ctx.log_key(metrics::LOSE, self.lose);
        ctx.log_key(ROUNDS_PLAYED, ctx.current_turn());
        Ok(())
    }
}

/// Scores each turn by its number of answers; the main score is 100 on success.
#[derive(Debug, Default)]
pub struct ScriptedScorer;

impl GameScorer for ScriptedScorer {
    fn score_turns(&mut self, log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
        for (turn, events) in log.turns.iter().enumerate() {
            let answers = events
                .iter()
                .filter(|e| e.action.kind == Action::GET_MESSAGE)
                .count();
            scores.log_turn_score(turn, "Answers", answers);
        }
        Ok(())
    }

    fn log_main_score(&mut self, _log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
        let success = scores
            .episode_score(metrics::SUCCESS)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        scores.log_episode_score(metrics::MAIN_SCORE, success * 100);
        Ok(())
    }
}

/// Factory for [`ScriptedGame`] and [`ScriptedScorer`].
#[derive(Debug, Default, Clone, Copy)]
pub struct ScriptedFactory;

impl GameFactory for ScriptedFactory {
    fn create_game(&self, experiment: &Experiment, models: Vec<ModelSource>) -> Box<dyn DialogueGame> {
        let rounds = experiment
            .param("rounds")
            .and_then(Value::as_u64)
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(1);
        Box::new(ScriptedGame::new(models).with_rounds(rounds))
    }

    fn create_scorer(&self, _experiment: &Experiment, _instance: &GameInstance) -> Box<dyn GameScorer> {
        Box::new(ScriptedScorer)
    }
}
