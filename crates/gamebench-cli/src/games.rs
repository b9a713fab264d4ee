//! Reference games shipped with the CLI.
//!
//! - `guess`: one player guesses a secret word from a clue, answering in the
//!   form `GUESS: <word>`. Malformed answers get one reprompt per turn.
//! - `relay`: a sender must get a secret phrase across to a receiver without
//!   the receiver ever seeing the instance data.

use gamebench_core::metrics;
use gamebench_core::{
    Action, CustomResponder, DialogueGame, EpisodeContext, Experiment, GameFactory, GameInstance,
    GameRegistry, GameScorer, GameSpec, InteractionLog, MasterError, ModelSource, Participant,
    ParticipantError, Scores, ScoringError,
};
use gamebench_proto::{Message, PlayerName};
use regex::Regex;
use serde_json::{Value, json};
use std::sync::LazyLock;

/// Builds the registry of reference games.
pub fn registry() -> GameRegistry {
    GameRegistry::builder()
        .register(
            GameSpec::new("guess", 1, "Guess a secret word from a clue"),
            GuessFactory,
        )
        .register(
            GameSpec::new("relay", 2, "Relay a secret phrase to a partner"),
            RelayFactory,
        )
        .build()
}

fn as_usize(value: Option<&Value>) -> Option<usize> {
    value
        .and_then(Value::as_u64)
        .and_then(|n| usize::try_from(n).ok())
}

fn missing_field(key: &str) -> MasterError {
    MasterError::Game(format!("instance is missing '{}'", key))
}

// ─────────────────────────────────────────────────────────────────────────────
// guess
// ─────────────────────────────────────────────────────────────────────────────

static GUESS_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^\s*GUESS:\s*([a-z]+)\s*$").expect("guess pattern is a valid static regex")
});

const GUESS_OUTCOME: &str = "guess outcome";
const ATTEMPTS_KEY: &str = "Attempts";
const MAX_ATTEMPTS_KEY: &str = "Max Attempts";
const DEFAULT_MAX_ATTEMPTS: usize = 3;

/// Extracts the guessed word from a well-formed answer.
fn parse_guess(utterance: &str) -> Option<String> {
    GUESS_PATTERN
        .captures(utterance)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase())
}

#[derive(Debug)]
struct GuessGame {
    model: Option<ModelSource>,
    default_attempts: usize,
    target: String,
    max_attempts: usize,
    attempts: usize,
    solved: bool,
    aborted: bool,
    last_valid: bool,
    malformed_this_turn: usize,
}

impl GuessGame {
    fn new(model: Option<ModelSource>, default_attempts: usize) -> Self {
        Self {
            model,
            default_attempts,
            target: String::new(),
            max_attempts: default_attempts,
            attempts: 0,
            solved: false,
            aborted: false,
            last_valid: true,
            malformed_this_turn: 0,
        }
    }
}

impl DialogueGame for GuessGame {
    fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance) -> Result<(), MasterError> {
        self.target = instance
            .get_str("target_word")
            .ok_or_else(|| missing_field("target_word"))?
            .to_lowercase();
        let clue = instance.get_str("clue").unwrap_or("no clue this time");
        self.max_attempts = as_usize(instance.get("max_attempts")).unwrap_or(self.default_attempts);

        let model = self
            .model
            .take()
            .ok_or_else(|| MasterError::Game("guess needs exactly one model".to_string()))?;
        let mut guesser = Participant::new("Guesser", model);
        if matches!(guesser.source(), ModelSource::Programmatic) {
            let answer = format!("GUESS: {}", self.target);
            guesser = guesser.with_custom_response(move |_: &[Message], _: usize| answer.clone());
        }
        let player = ctx.add_player(guesser)?;

        ctx.add_system_message(player, "You are playing a word guessing game.")?;
        ctx.add_user_message(
            player,
            format!(
                "Guess the secret word. Clue: {}. You have {} attempts. \
                 Answer only in the form 'GUESS: <word>'.",
                clue, self.max_attempts
            ),
        )?;
        ctx.log_key(MAX_ATTEMPTS_KEY, self.max_attempts);
        Ok(())
    }

    fn does_game_proceed(&mut self, _ctx: &EpisodeContext) -> bool {
        !self.aborted && !self.solved && self.attempts < self.max_attempts
    }

    fn on_before_turn(&mut self, _ctx: &mut EpisodeContext, _turn: usize) -> Result<(), MasterError> {
        self.malformed_this_turn = 0;
        Ok(())
    }

    fn validate_response(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
        utterance: &str,
    ) -> Result<bool, MasterError> {
        let valid = parse_guess(utterance).is_some();
        self.last_valid = valid;
        if !valid {
            self.malformed_this_turn += 1;
            if self.malformed_this_turn > 1 {
                self.aborted = true;
            }
        }
        Ok(valid)
    }

    fn parse_response(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
        utterance: &str,
    ) -> Result<String, MasterError> {
        Ok(parse_guess(utterance).unwrap_or_else(|| utterance.to_string()))
    }

    fn after_add_player_response(
        &mut self,
        ctx: &mut EpisodeContext,
        player: PlayerName,
        utterance: &str,
    ) -> Result<(), MasterError> {
        self.attempts += 1;
        self.solved = utterance == self.target;
        ctx.log_to_self(GUESS_OUTCOME, json!({"guess": utterance, "correct": self.solved}))?;

        let feedback = if self.solved {
            "Correct!".to_string()
        } else {
            format!(
                "'{}' is wrong. {} attempt(s) left.",
                utterance,
                self.max_attempts - self.attempts
            )
        };
        ctx.add_user_message(player, feedback)
    }

    fn should_reprompt(&mut self, _ctx: &EpisodeContext, _player: PlayerName) -> bool {
        !self.last_valid && self.malformed_this_turn == 1 && !self.aborted
    }

    fn on_before_reprompt(&mut self, ctx: &mut EpisodeContext, player: PlayerName) -> Result<(), MasterError> {
        ctx.add_user_message(
            player,
            "Your answer did not follow the format 'GUESS: <word>'. Try again.",
        )
    }

    fn on_after_game(&mut self, ctx: &mut EpisodeContext) -> Result<(), MasterError> {
        ctx.log_key(metrics::ABORTED, self.aborted);
        ctx.log_key(metrics::LOSE, !self.solved);
        ctx.log_key(ATTEMPTS_KEY, self.attempts);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct GuessScorer;

impl GameScorer for GuessScorer {
    fn score_turns(&mut self, log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
        for (turn, events) in log.turns.iter().enumerate() {
            let outcome = events.iter().find(|e| e.action.kind == GUESS_OUTCOME);
            let accuracy = outcome
                .and_then(|e| e.action.content.get("correct"))
                .and_then(Value::as_bool)
                .map(u8::from);
            // A turn without an outcome had only malformed answers.
            scores.log_turn_score(turn, "Accuracy", accuracy.unwrap_or(0));
        }
        Ok(())
    }

    fn log_main_score(&mut self, log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
        let success = scores
            .episode_score(metrics::SUCCESS)
            .and_then(Value::as_u64)
            .unwrap_or(0);
        if success == 0 {
            scores.log_episode_score(metrics::MAIN_SCORE, 0);
            return Ok(());
        }

        let read = |key: &str| {
            log.key(key)
                .and_then(Value::as_u64)
                .ok_or_else(|| ScoringError::MissingKey(key.to_string()))
        };
        let attempts = read(ATTEMPTS_KEY)?;
        let max_attempts = read(MAX_ATTEMPTS_KEY)?;
        if max_attempts == 0 {
            return Err(ScoringError::DivisionByZero(metrics::MAIN_SCORE.to_string()));
        }
        let speed = (max_attempts + 1).saturating_sub(attempts) as f64 / max_attempts as f64;
        scores.log_episode_score(metrics::MAIN_SCORE, 100.0 * speed);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
struct GuessFactory;

impl GameFactory for GuessFactory {
    fn create_game(&self, experiment: &Experiment, models: Vec<ModelSource>) -> Box<dyn DialogueGame> {
        let attempts = as_usize(experiment.param("max_attempts")).unwrap_or(DEFAULT_MAX_ATTEMPTS);
        Box::new(GuessGame::new(models.into_iter().next(), attempts))
    }

    fn create_scorer(&self, _experiment: &Experiment, _instance: &GameInstance) -> Box<dyn GameScorer> {
        Box::new(GuessScorer)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// relay
// ─────────────────────────────────────────────────────────────────────────────

const DEFAULT_ROUNDS: usize = 3;
const DELIVERED_KEY: &str = "Delivered";

/// Programmatic relay partner: repeats whatever it was told last.
struct Echo;

impl CustomResponder for Echo {
    fn respond(&mut self, history: &[Message], _turn: usize) -> Result<String, ParticipantError> {
        history
            .last()
            .map(|m| m.content.clone())
            .ok_or_else(|| ParticipantError::Custom("nothing to relay yet".to_string()))
    }
}

#[derive(Debug)]
struct RelayGame {
    models: Vec<ModelSource>,
    rounds: usize,
    secret: String,
    delivered: bool,
    aborted: bool,
}

impl RelayGame {
    fn new(models: Vec<ModelSource>, rounds: usize) -> Self {
        Self {
            models,
            rounds,
            secret: String::new(),
            delivered: false,
            aborted: false,
        }
    }

    fn relay_participant(label: &str, model: ModelSource) -> Participant {
        let participant = Participant::new(label, model);
        if matches!(participant.source(), ModelSource::Programmatic) {
            participant.with_custom_response(Echo)
        } else {
            participant
        }
    }
}

impl DialogueGame for RelayGame {
    fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance) -> Result<(), MasterError> {
        self.secret = instance
            .get_str("secret")
            .ok_or_else(|| missing_field("secret"))?
            .to_string();
        if let Some(rounds) = as_usize(instance.get("rounds")) {
            self.rounds = rounds;
        }

        let mut models = std::mem::take(&mut self.models).into_iter();
        let (Some(first), Some(second)) = (models.next(), models.next()) else {
            return Err(MasterError::Game("relay needs two models".to_string()));
        };
        let sender = ctx.add_player(Self::relay_participant("Sender", first))?;
        let receiver = ctx.add_player(Self::relay_participant("Receiver", second))?;

        ctx.add_user_message(
            sender,
            format!(
                "Your partner must learn the phrase '{}'. Tell it to them.",
                self.secret
            ),
        )?;
        ctx.add_user_message(
            receiver,
            "Your partner has a phrase for you. Repeat back exactly what you learn.",
        )?;
        Ok(())
    }

    fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
        !self.aborted && !self.delivered && ctx.current_turn() < self.rounds
    }

    fn validate_response(
        &mut self,
        ctx: &mut EpisodeContext,
        player: PlayerName,
        utterance: &str,
    ) -> Result<bool, MasterError> {
        if utterance.trim().is_empty() {
            self.aborted = true;
            ctx.log_to_self(Action::METADATA, format!("{} gave an empty answer", player))?;
            return Ok(false);
        }
        Ok(true)
    }

    fn after_add_player_response(
        &mut self,
        ctx: &mut EpisodeContext,
        player: PlayerName,
        utterance: &str,
    ) -> Result<(), MasterError> {
        if player == PlayerName::Player(2)
            && utterance.to_lowercase().contains(&self.secret.to_lowercase())
        {
            self.delivered = true;
        }
        for other in ctx.player_names() {
            if other != player {
                ctx.add_user_message(other, utterance)?;
            }
        }
        Ok(())
    }

    fn on_after_game(&mut self, ctx: &mut EpisodeContext) -> Result<(), MasterError> {
        ctx.log_key(metrics::ABORTED, self.aborted);
        ctx.log_key(metrics::LOSE, !self.delivered);
        ctx.log_key(DELIVERED_KEY, self.delivered);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RelayScorer;

impl GameScorer for RelayScorer {
    fn score_turns(&mut self, log: &InteractionLog, scores: &mut Scores) -> Result<(), ScoringError> {
        for (turn, events) in log.turns.iter().enumerate() {
            let words: usize = events
                .iter()
                .filter(|e| e.action.kind == Action::GET_MESSAGE)
                .filter_map(|e| e.action.content.as_str())
                .map(|text| text.split_whitespace().count())
                .sum();
            scores.log_turn_score(turn, "Words", words);
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

#[derive(Debug, Clone, Copy)]
struct RelayFactory;

impl GameFactory for RelayFactory {
    fn create_game(&self, experiment: &Experiment, models: Vec<ModelSource>) -> Box<dyn DialogueGame> {
        let rounds = as_usize(experiment.param("rounds")).unwrap_or(DEFAULT_ROUNDS);
        Box::new(RelayGame::new(models, rounds))
    }

    fn create_scorer(&self, _experiment: &Experiment, _instance: &GameInstance) -> Box<dyn GameScorer> {
        Box::new(RelayScorer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gamebench_core::testing::MockBackend;
    use gamebench_core::{GameMaster, compute_scores};
    use gamebench_proto::ModelSpec;

    fn mock(responses: &[&str]) -> ModelSource {
        let responses = responses.iter().map(|s| (*s).to_string()).collect();
        ModelSource::backend(ModelSpec::new("mock", 0.0), Box::new(MockBackend::new(responses)))
    }

    fn play(game: &str, models: Vec<ModelSource>, instance: &GameInstance) -> (GameMaster, Scores) {
        let registry = registry();
        let entry = registry.get(game).unwrap();
        let experiment = Experiment::new("test", vec![]);
        let mut master = GameMaster::new(game, entry.factory.create_game(&experiment, models));
        master.setup(instance).unwrap();
        master.play().unwrap();
        let mut scorer = entry.factory.create_scorer(&experiment, instance);
        let scores = compute_scores(scorer.as_mut(), master.interaction_log()).unwrap();
        (master, scores)
    }

    fn guess_instance() -> GameInstance {
        GameInstance::new(0)
            .with_field("target_word", "Apple")
            .with_field("clue", "a fruit")
    }

    #[test]
    fn test_parse_guess() {
        assert_eq!(parse_guess("GUESS: Pear"), Some("pear".to_string()));
        assert_eq!(parse_guess("  guess:apple  "), Some("apple".to_string()));
        assert_eq!(parse_guess("I think pear"), None);
        assert_eq!(parse_guess("GUESS: two words"), None);
    }

    #[test]
    fn test_guess_solved_on_second_attempt() {
        let (master, scores) = play("guess", vec![mock(&["GUESS: pear", "GUESS: apple"])], &guess_instance());
        let log = master.interaction_log();

        assert_eq!(log.turns.len(), 2);
        assert_eq!(log.key(ATTEMPTS_KEY), Some(&json!(2)));
        assert_eq!(scores.episode_score(metrics::SUCCESS), Some(&json!(1)));
        assert_eq!(scores.turn_score(0, "Accuracy"), Some(&json!(0)));
        assert_eq!(scores.turn_score(1, "Accuracy"), Some(&json!(1)));
        // (3 + 1 - 2) / 3
        let main = scores.episode_score(metrics::MAIN_SCORE).unwrap().as_f64().unwrap();
        assert!((main - 200.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_guess_reprompts_once_then_aborts() {
        let (master, scores) = play("guess", vec![mock(&["pear", "still no format"])], &guess_instance());
        let log = master.interaction_log();

        assert_eq!(log.turns.len(), 1);
        assert_eq!(log.key(metrics::REQUEST_COUNT), Some(&json!(2)));
        assert_eq!(log.key(metrics::REQUEST_COUNT_VIOLATED), Some(&json!(2)));
        assert_eq!(scores.episode_score(metrics::ABORTED), Some(&json!(1)));
        assert_eq!(scores.episode_score(metrics::LOSE), Some(&json!(0)));
        assert_eq!(scores.episode_score(metrics::MAIN_SCORE), Some(&json!(0)));
    }

    #[test]
    fn test_guess_reprompt_recovers() {
        let (master, scores) = play("guess", vec![mock(&["apple", "GUESS: apple"])], &guess_instance());
        let parses = master
            .interaction_log()
            .events()
            .filter(|e| e.action.kind == Action::PARSE)
            .count();
        assert_eq!(parses, 1);
        assert_eq!(scores.episode_score(metrics::SUCCESS), Some(&json!(1)));
        assert_eq!(scores.episode_score(metrics::REQUEST_SUCCESS_RATIO), Some(&json!(0.5)));
    }

    #[test]
    fn test_guess_runs_out_of_attempts() {
        let instance = guess_instance().with_field("max_attempts", 2);
        let (master, scores) = play("guess", vec![mock(&["GUESS: pear"])], &instance);
        assert_eq!(master.interaction_log().turns.len(), 2);
        assert_eq!(scores.episode_score(metrics::LOSE), Some(&json!(1)));
    }

    #[test]
    fn test_programmatic_guesser_knows_answer() {
        let (_, scores) = play("guess", vec![ModelSource::Programmatic], &guess_instance());
        assert_eq!(scores.episode_score(metrics::MAIN_SCORE), Some(&json!(100.0)));
    }

    #[test]
    fn test_relay_delivers_phrase() {
        let instance = GameInstance::new(0).with_field("secret", "blue whale");
        let (master, scores) = play(
            "relay",
            vec![mock(&["The phrase is blue whale."]), mock(&["Got it: Blue Whale"])],
            &instance,
        );
        let log = master.interaction_log();

        assert_eq!(log.turns.len(), 1);
        assert_eq!(log.key(DELIVERED_KEY), Some(&json!(true)));
        assert_eq!(scores.episode_score(metrics::MAIN_SCORE), Some(&json!(100)));
        assert_eq!(scores.turn_score(0, "Words"), Some(&json!(9)));

        let receiver = master.context().history(PlayerName::Player(2)).unwrap();
        assert_eq!(receiver[1], Message::user("The phrase is blue whale."));
    }

    #[test]
    fn test_echo_needs_something_to_relay() {
        assert!(matches!(Echo.respond(&[], 0), Err(ParticipantError::Custom(_))));
        let history = [Message::system("rules"), Message::user("pass it on")];
        assert_eq!(Echo.respond(&history, 0).unwrap(), "pass it on");
    }

    #[test]
    fn test_relay_programmatic_self_play() {
        let instance = GameInstance::new(0).with_field("secret", "tea");
        let (_, scores) = play(
            "relay",
            vec![ModelSource::Programmatic, ModelSource::Programmatic],
            &instance,
        );
        assert_eq!(scores.episode_score(metrics::SUCCESS), Some(&json!(1)));
    }

    #[test]
    fn test_relay_empty_answer_aborts() {
        let instance = GameInstance::new(0).with_field("secret", "tea");
        let (master, scores) = play("relay", vec![mock(&["  "]), mock(&["tea"])], &instance);
        assert_eq!(master.interaction_log().turns.len(), 1);
        assert_eq!(scores.episode_score(metrics::ABORTED), Some(&json!(1)));
    }

    #[test]
    fn test_missing_instance_field_fails_setup() {
        let registry = registry();
        let entry = registry.get("relay").unwrap();
        let experiment = Experiment::new("test", vec![]);
        let mut master = GameMaster::new(
            "relay",
            entry.factory.create_game(&experiment, vec![mock(&["a"]), mock(&["b"])]),
        );
        assert!(matches!(master.setup(&GameInstance::new(0)), Err(MasterError::Game(_))));
    }
}
