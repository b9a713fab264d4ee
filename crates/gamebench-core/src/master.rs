//! Episode orchestration.
//!
//! `GameMaster` runs one episode of a dialogue game as a turn-taking state
//! machine. Game rules plug in through the [`DialogueGame`] hooks; the master
//! sequences the players, keeps their message histories, and records every
//! message exchanged through the [`EventRecorder`].
//!
//! ```text
//! Created --setup--> SetUp --play--> Running --> Terminal
//! ```
//!
//! Errors raised by players, hooks, or the recorder propagate out of
//! [`GameMaster::play`] unchanged. Recovery belongs to the caller.

use crate::instances::GameInstance;
use crate::metrics;
use crate::participant::{Participant, ParticipantError};
use crate::recorder::{Action, EventRecorder, InteractionLog, RecorderError};
use gamebench_proto::{Message, PlayerName};
use serde_json::Value;
use std::fmt;
use std::path::Path;
use tracing::{debug, info, warn};

/// Lifecycle state of an episode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    /// Constructed, no players yet.
    Created,
    /// Players registered and players metadata logged.
    SetUp,
    /// Inside the turn loop.
    Running,
    /// The game loop finished and the after-game hook ran.
    Terminal,
}

impl MasterState {
    pub fn as_str(self) -> &'static str {
        match self {
            MasterState::Created => "created",
            MasterState::SetUp => "set_up",
            MasterState::Running => "running",
            MasterState::Terminal => "terminal",
        }
    }
}

impl fmt::Display for MasterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised while running an episode.
#[derive(Debug, thiserror::Error)]
pub enum MasterError {
    #[error("Cannot {operation} in state '{state}'")]
    InvalidState {
        operation: &'static str,
        state: MasterState,
    },

    #[error("Players metadata must be logged before the game starts")]
    PlayersNotLogged,

    #[error("Game registered no players during setup")]
    NoPlayers,

    #[error("Players can only be added during setup")]
    PlayersLocked,

    #[error("Unknown player: {0}")]
    UnknownPlayer(PlayerName),

    #[error("Cannot prompt {0}: message history is empty")]
    EmptyHistory(PlayerName),

    #[error("Cannot prompt {0}: last message was authored by the player")]
    AssistantLast(PlayerName),

    #[error("{player} failed to respond: {source}")]
    Participant {
        player: PlayerName,
        #[source]
        source: ParticipantError,
    },

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("Game error: {0}")]
    Game(String),
}

/// Request counters maintained by the master.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestCounts {
    pub total: u64,
    pub parsed: u64,
    pub violated: u64,
}

/// The mutable state of an episode that game hooks operate on.
#[derive(Debug)]
pub struct EpisodeContext {
    game_name: String,
    participants: Vec<Participant>,
    histories: Vec<Vec<Message>>,
    recorder: EventRecorder,
    current_turn: usize,
    requests: RequestCounts,
    players_locked: bool,
}

impl EpisodeContext {
    fn new(game_name: String) -> Self {
        Self {
            game_name,
            participants: Vec::new(),
            histories: Vec::new(),
            recorder: EventRecorder::new(),
            current_turn: 0,
            requests: RequestCounts::default(),
            players_locked: false,
        }
    }

    /// Returns the name of the game being played.
    pub fn game_name(&self) -> &str {
        &self.game_name
    }

    /// Returns the 0-indexed turn currently being played.
    pub fn current_turn(&self) -> usize {
        self.current_turn
    }

    /// Registers a participant and returns its identity.
    ///
    /// The k-th registered participant is always `Player k`.
    pub fn add_player(&mut self, participant: Participant) -> Result<PlayerName, MasterError> {
        if self.players_locked {
            return Err(MasterError::PlayersLocked);
        }
        let name = PlayerName::for_index(self.participants.len());
        debug!(player = %name, description = %participant.description(), "Added player");
        self.participants.push(participant);
        self.histories.push(Vec::new());
        Ok(name)
    }

    /// Returns the identities of all players in registration order.
    pub fn player_names(&self) -> Vec<PlayerName> {
        (0..self.participants.len()).map(PlayerName::for_index).collect()
    }

    /// Returns the number of registered players.
    pub fn player_count(&self) -> usize {
        self.participants.len()
    }

    /// Returns a player's message history.
    pub fn history(&self, name: PlayerName) -> Result<&[Message], MasterError> {
        let index = self.index_of(name)?;
        Ok(&self.histories[index])
    }

    /// Appends a message to a player's history.
    pub fn add_message(&mut self, name: PlayerName, message: Message) -> Result<(), MasterError> {
        let index = self.index_of(name)?;
        self.histories[index].push(message);
        Ok(())
    }

    /// Appends a user message (from the game master) to a player's history.
    pub fn add_user_message(
        &mut self,
        name: PlayerName,
        content: impl Into<String>,
    ) -> Result<(), MasterError> {
        self.add_message(name, Message::user(content))
    }

    /// Appends a system message to a player's history.
    pub fn add_system_message(
        &mut self,
        name: PlayerName,
        content: impl Into<String>,
    ) -> Result<(), MasterError> {
        self.add_message(name, Message::system(content))
    }

    /// Records an episode-level key in the interaction log.
    pub fn log_key(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.recorder.log_key(key, value);
    }

    /// Records a GM-to-GM event in the current turn.
    pub fn log_to_self(
        &mut self,
        kind: impl Into<String>,
        content: impl Into<Value>,
    ) -> Result<(), MasterError> {
        self.log_event(PlayerName::Gm, PlayerName::Gm, &Action::new(kind, content))
    }

    /// Records an event in the current turn.
    pub fn log_event(
        &mut self,
        from: PlayerName,
        to: PlayerName,
        action: &Action,
    ) -> Result<(), MasterError> {
        self.recorder.log_event(from, to, action, None)?;
        Ok(())
    }

    /// Returns the interaction log recorded so far.
    pub fn interaction_log(&self) -> &InteractionLog {
        self.recorder.log()
    }

    /// Returns the request counters.
    pub fn requests(&self) -> RequestCounts {
        self.requests
    }

    fn index_of(&self, name: PlayerName) -> Result<usize, MasterError> {
        name.index()
            .filter(|index| *index < self.participants.len())
            .ok_or(MasterError::UnknownPlayer(name))
    }

    fn log_players(&mut self) {
        let mut players = vec![(
            PlayerName::Gm.to_string(),
            format!("Game master for {}", self.game_name),
        )];
        for (index, participant) in self.participants.iter().enumerate() {
            players.push((PlayerName::for_index(index).to_string(), participant.description()));
        }
        self.recorder.log_players(players);
    }

    /// Records the request counters unless the game already logged its own.
    fn log_request_counts(&mut self) {
        let counts = [
            (metrics::REQUEST_COUNT, self.requests.total),
            (metrics::REQUEST_COUNT_PARSED, self.requests.parsed),
            (metrics::REQUEST_COUNT_VIOLATED, self.requests.violated),
        ];
        for (key, value) in counts {
            if self.recorder.log().key(key).is_none() {
                self.recorder.log_key(key, value);
            }
        }
    }
}

/// Game rules for a dialogue game.
///
/// `setup` and `does_game_proceed` are required. Every other hook has a
/// default that leaves the episode unchanged.
pub trait DialogueGame: Send {
    /// Registers players and prepares their initial histories.
    fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance)
    -> Result<(), MasterError>;

    /// Returns false once the game is over.
    fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool;

    /// Runs after a new turn has been opened.
    fn on_before_turn(&mut self, _ctx: &mut EpisodeContext, _turn: usize) -> Result<(), MasterError> {
        Ok(())
    }

    /// Returns true to leave a player out of the current turn.
    fn should_skip_player(&mut self, _ctx: &EpisodeContext, _player: PlayerName) -> bool {
        false
    }

    /// Returns false to reject a response. Rejected responses are not added
    /// to the player's history.
    fn validate_response(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
        _utterance: &str,
    ) -> Result<bool, MasterError> {
        Ok(true)
    }

    /// Turns an accepted response into the text kept in the history.
    fn parse_response(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
        utterance: &str,
    ) -> Result<String, MasterError> {
        Ok(utterance.to_string())
    }

    /// Runs after an accepted response was added to the player's history.
    /// Typically forwards the utterance into other players' histories.
    fn after_add_player_response(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
        _utterance: &str,
    ) -> Result<(), MasterError> {
        Ok(())
    }

    /// Returns true to prompt the same player again.
    fn should_reprompt(&mut self, _ctx: &EpisodeContext, _player: PlayerName) -> bool {
        false
    }

    /// Prepares the history before a reprompt.
    fn on_before_reprompt(
        &mut self,
        _ctx: &mut EpisodeContext,
        _player: PlayerName,
    ) -> Result<(), MasterError> {
        Ok(())
    }

    /// Runs after every player acted in a turn.
    fn on_after_turn(&mut self, _ctx: &mut EpisodeContext, _turn: usize) -> Result<(), MasterError> {
        Ok(())
    }

    /// Runs once after the turn loop ends.
    fn on_after_game(&mut self, _ctx: &mut EpisodeContext) -> Result<(), MasterError> {
        Ok(())
    }
}

/// Runs one episode of a dialogue game.
pub struct GameMaster {
    game: Box<dyn DialogueGame>,
    ctx: EpisodeContext,
    state: MasterState,
    max_reprompts: Option<usize>,
}

impl GameMaster {
    /// Creates a master for `game`.
    pub fn new(game_name: impl Into<String>, game: Box<dyn DialogueGame>) -> Self {
        Self {
            game,
            ctx: EpisodeContext::new(game_name.into()),
            state: MasterState::Created,
            max_reprompts: None,
        }
    }

    /// Caps consecutive reprompts of one player. `None` leaves them unbounded.
    pub fn with_max_reprompts(mut self, max: Option<usize>) -> Self {
        self.max_reprompts = max;
        self
    }

    /// Returns the lifecycle state.
    pub fn state(&self) -> MasterState {
        self.state
    }

    /// Returns the episode context.
    pub fn context(&self) -> &EpisodeContext {
        &self.ctx
    }

    /// Returns the interaction log recorded so far.
    pub fn interaction_log(&self) -> &InteractionLog {
        self.ctx.recorder.log()
    }

    /// Returns the recorder.
    pub fn recorder(&self) -> &EventRecorder {
        &self.ctx.recorder
    }

    /// Lets the game register its players, then logs the players metadata.
    pub fn setup(&mut self, instance: &GameInstance) -> Result<(), MasterError> {
        self.require_state("set up", MasterState::Created)?;

        self.game.setup(&mut self.ctx, instance)?;
        if self.ctx.participants.is_empty() {
            return Err(MasterError::NoPlayers);
        }
        self.ctx.players_locked = true;
        self.ctx.log_players();

        self.state = MasterState::SetUp;
        debug!(
            game = %self.ctx.game_name,
            players = self.ctx.participants.len(),
            "Episode set up"
        );
        Ok(())
    }

    /// Plays the episode to the end.
    pub fn play(&mut self) -> Result<(), MasterError> {
        self.require_state("play", MasterState::SetUp)?;
        if !self.ctx.recorder.has_players() {
            return Err(MasterError::PlayersNotLogged);
        }
        self.state = MasterState::Running;

        'game: while self.game.does_game_proceed(&self.ctx) {
            self.ctx.recorder.open_turn();
            let turn = self.ctx.current_turn;
            self.game.on_before_turn(&mut self.ctx, turn)?;
            info!(game = %self.ctx.game_name, turn, "Turn started");

            let mut acted = 0;
            for player in self.ctx.player_names() {
                if !self.game.does_game_proceed(&self.ctx) {
                    break 'game;
                }
                if self.game.should_skip_player(&self.ctx, player) {
                    debug!(turn, player = %player, "Skipping player");
                    continue;
                }
                acted += 1;

                self.prompt(player, false)?;
                let mut reprompts = 0;
                while self.game.should_reprompt(&self.ctx, player) {
                    if let Some(max) = self.max_reprompts
                        && reprompts >= max
                    {
                        warn!(turn, player = %player, max, "Reprompt limit reached");
                        break;
                    }
                    self.game.on_before_reprompt(&mut self.ctx, player)?;
                    self.prompt(player, true)?;
                    reprompts += 1;
                }
            }

            self.game.on_after_turn(&mut self.ctx, turn)?;
            self.ctx.current_turn += 1;

            if acted == 0 {
                debug!(turn, "Every player was skipped, ending game");
                break;
            }
        }

        self.game.on_after_game(&mut self.ctx)?;
        self.ctx.log_request_counts();
        self.state = MasterState::Terminal;
        info!(
            game = %self.ctx.game_name,
            turns = self.ctx.recorder.log().turns.len(),
            requests = self.ctx.requests.total,
            "Episode finished"
        );
        Ok(())
    }

    /// Writes the interaction and request logs into `dir`.
    pub fn flush(&self, dir: impl AsRef<Path>) -> Result<(), MasterError> {
        self.ctx.recorder.flush(dir)?;
        Ok(())
    }

    fn require_state(&self, operation: &'static str, expected: MasterState) -> Result<(), MasterError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(MasterError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }

    fn prompt(&mut self, player: PlayerName, is_reprompt: bool) -> Result<(), MasterError> {
        let index = self.ctx.index_of(player)?;

        let last = self.ctx.histories[index]
            .last()
            .ok_or(MasterError::EmptyHistory(player))?;
        if last.is_assistant() {
            return Err(MasterError::AssistantLast(player));
        }
        let message = last.content.clone();
        self.ctx
            .recorder
            .log_event(PlayerName::Gm, player, &Action::send_message(&message), None)?;

        let call = self.ctx.participants[index]
            .call(&self.ctx.histories[index], self.ctx.current_turn)
            .map_err(|source| MasterError::Participant { player, source })?;
        self.ctx.recorder.log_event(
            player,
            PlayerName::Gm,
            &Action::get_message(&call.text),
            Some((&call.prompt, &call.response)),
        )?;
        self.ctx.requests.total += 1;
        debug!(turn = self.ctx.current_turn, player = %player, is_reprompt, "Received response");

        if !self.game.validate_response(&mut self.ctx, player, &call.text)? {
            self.ctx.requests.violated += 1;
            debug!(player = %player, "Response rejected");
            return Ok(());
        }
        self.ctx.requests.parsed += 1;

        let parsed = self.game.parse_response(&mut self.ctx, player, &call.text)?;
        if parsed != call.text {
            self.ctx
                .recorder
                .log_event(PlayerName::Gm, PlayerName::Gm, &Action::parse(&parsed), None)?;
        }
        self.ctx.histories[index].push(Message::assistant(parsed.clone()));
        self.game.after_add_player_response(&mut self.ctx, player, &parsed)
    }
}

impl fmt::Debug for GameMaster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameMaster")
            .field("ctx", &self.ctx)
            .field("state", &self.state)
            .field("max_reprompts", &self.max_reprompts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::participant::ModelSource;
    use crate::testing::MockBackend;
    use gamebench_proto::ModelSpec;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn mock(responses: &[&str]) -> ModelSource {
        let responses = responses.iter().map(|s| (*s).to_string()).collect();
        ModelSource::backend(ModelSpec::new("mock", 0.0), Box::new(MockBackend::new(responses)))
    }

    /// Two players answer in turn for a fixed number of rounds; each answer is
    /// forwarded to the other player.
    struct Conversation {
        models: Vec<ModelSource>,
        rounds: usize,
        proceed_calls: Arc<AtomicUsize>,
    }

    impl Conversation {
        fn new(models: Vec<ModelSource>, rounds: usize) -> Self {
            Self {
                models,
                rounds,
                proceed_calls: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl DialogueGame for Conversation {
        fn setup(&mut self, ctx: &mut EpisodeContext, _: &GameInstance) -> Result<(), MasterError> {
            for (i, model) in self.models.drain(..).enumerate() {
                let player = ctx.add_player(Participant::new(format!("Speaker {}", i + 1), model))?;
                ctx.add_user_message(player, "Start talking.")?;
            }
            ctx.log_key(metrics::ABORTED, false);
            ctx.log_key(metrics::LOSE, false);
            Ok(())
        }

        fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
            self.proceed_calls.fetch_add(1, Ordering::SeqCst);
            ctx.current_turn() < self.rounds
        }

        fn after_add_player_response(
            &mut self,
            ctx: &mut EpisodeContext,
            player: PlayerName,
            utterance: &str,
        ) -> Result<(), MasterError> {
            for other in ctx.player_names() {
                if other != player {
                    ctx.add_user_message(other, utterance)?;
                }
            }
            if ctx.player_count() == 1 {
                ctx.add_user_message(player, "Go on.")?;
            }
            Ok(())
        }
    }

    fn set_up(game: impl DialogueGame + 'static) -> GameMaster {
        let mut master = GameMaster::new("conversation", Box::new(game));
        master.setup(&GameInstance::new(0)).unwrap();
        master
    }

    #[test]
    fn test_identities_follow_registration_order() {
        let master = set_up(Conversation::new(vec![mock(&["a"]), mock(&["b"])], 1));
        let players: Vec<&String> = master.interaction_log().players.keys().collect();
        assert_eq!(players, vec!["GM", "Player 1", "Player 2"]);
        assert_eq!(
            master.interaction_log().players["Player 2"],
            json!("Speaker 2, mock")
        );
        assert_eq!(master.state(), MasterState::SetUp);
    }

    #[test]
    fn test_play_records_turns_and_requests() {
        let mut master = set_up(Conversation::new(vec![mock(&["hi", "bye"]), mock(&["hey", "ciao"])], 2));
        master.play().unwrap();

        let log = master.interaction_log();
        assert_eq!(master.state(), MasterState::Terminal);
        assert_eq!(log.turns.len(), 2);
        // send + get per player per turn
        assert!(log.turns.iter().all(|turn| turn.len() == 4));
        assert_eq!(log.turns[0][0].action.kind, Action::SEND_MESSAGE);
        assert_eq!(log.turns[0][1].action.content, json!("hi"));
        assert_eq!(log.turns[0][3].from, "Player 2");
        assert_eq!(master.recorder().requests().len(), 4);
        assert_eq!(log.key(metrics::REQUEST_COUNT), Some(&json!(4)));
        assert_eq!(log.key(metrics::REQUEST_COUNT_PARSED), Some(&json!(4)));

        // Player 2 saw Player 1's first utterance before answering.
        let history = master.context().history(PlayerName::Player(2)).unwrap();
        assert_eq!(history[1], Message::user("hi"));
        assert_eq!(history[2], Message::assistant("hey"));
    }

    #[test]
    fn test_get_message_timestamps_match_raw_calls() {
        let mut master = set_up(Conversation::new(vec![mock(&["x"])], 3));
        master.play().unwrap();

        let gets: Vec<_> = master
            .interaction_log()
            .events()
            .filter(|e| e.action.kind == Action::GET_MESSAGE)
            .collect();
        let requests = master.recorder().requests();
        assert_eq!(gets.len(), requests.len());
        for (event, call) in gets.iter().zip(requests) {
            assert_eq!(event.timestamp, call.timestamp);
        }
    }

    #[test]
    fn test_predicate_checked_before_turn_and_each_player() {
        let game = Conversation::new(vec![mock(&["a"]), mock(&["b"])], 1);
        let calls = Arc::clone(&game.proceed_calls);
        let mut master = set_up(game);
        master.play().unwrap();
        // turn 0: one outer check and one per player; then the final outer check
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_play_requires_setup() {
        let mut master = GameMaster::new("conversation", Box::new(Conversation::new(vec![], 1)));
        let err = master.play().unwrap_err();
        assert!(matches!(
            err,
            MasterError::InvalidState {
                state: MasterState::Created,
                ..
            }
        ));
    }

    #[test]
    fn test_setup_requires_players() {
        let mut master = GameMaster::new("conversation", Box::new(Conversation::new(vec![], 1)));
        assert!(matches!(
            master.setup(&GameInstance::new(0)),
            Err(MasterError::NoPlayers)
        ));
    }

    #[test]
    fn test_play_twice_is_rejected() {
        let mut master = set_up(Conversation::new(vec![mock(&["a"])], 1));
        master.play().unwrap();
        assert!(matches!(master.play(), Err(MasterError::InvalidState { .. })));
    }

    struct Silent;

    impl DialogueGame for Silent {
        fn setup(&mut self, ctx: &mut EpisodeContext, _: &GameInstance) -> Result<(), MasterError> {
            ctx.add_player(Participant::new("Mute", mock(&["..."])))?;
            Ok(())
        }

        fn does_game_proceed(&mut self, _: &EpisodeContext) -> bool {
            true
        }
    }

    #[test]
    fn test_empty_history_fails_loudly() {
        let mut master = set_up(Silent);
        assert!(matches!(
            master.play(),
            Err(MasterError::EmptyHistory(PlayerName::Player(1)))
        ));
        assert_eq!(master.interaction_log().turns.len(), 1);
    }

    /// Rejects anything that is not upper case and reprompts until it is.
    struct Shouting {
        model: Option<ModelSource>,
        done: bool,
        reprompts: usize,
    }

    impl Shouting {
        fn new(model: ModelSource) -> Self {
            Self {
                model: Some(model),
                done: false,
                reprompts: 0,
            }
        }
    }

    impl DialogueGame for Shouting {
        fn setup(&mut self, ctx: &mut EpisodeContext, _: &GameInstance) -> Result<(), MasterError> {
            let model = self.model.take().ok_or(MasterError::Game("no model".into()))?;
            let player = ctx.add_player(Participant::new("Shouter", model))?;
            ctx.add_user_message(player, "Shout!")
        }

        fn does_game_proceed(&mut self, _: &EpisodeContext) -> bool {
            !self.done
        }

        fn validate_response(
            &mut self,
            _: &mut EpisodeContext,
            _: PlayerName,
            utterance: &str,
        ) -> Result<bool, MasterError> {
            Ok(utterance == utterance.to_uppercase())
        }

        fn parse_response(
            &mut self,
            _: &mut EpisodeContext,
            _: PlayerName,
            utterance: &str,
        ) -> Result<String, MasterError> {
            Ok(utterance.trim_end_matches('!').to_string())
        }

        fn after_add_player_response(
            &mut self,
            _: &mut EpisodeContext,
            _: PlayerName,
            _: &str,
        ) -> Result<(), MasterError> {
            self.done = true;
            Ok(())
        }

        fn should_reprompt(&mut self, _: &EpisodeContext, _: PlayerName) -> bool {
            !self.done
        }

        fn on_before_reprompt(&mut self, ctx: &mut EpisodeContext, player: PlayerName) -> Result<(), MasterError> {
            self.reprompts += 1;
            ctx.add_user_message(player, "Louder!")
        }
    }

    #[test]
    fn test_reprompt_until_valid() {
        let mut master = set_up(Shouting::new(mock(&["hello", "still quiet", "HELLO!"])));
        master.play().unwrap();

        let log = master.interaction_log();
        assert_eq!(log.turns.len(), 1);
        let kinds: Vec<&str> = log.turns[0].iter().map(|e| e.action.kind.as_str()).collect();
        assert_eq!(
            kinds,
            vec!["send message", "get message", "send message", "get message", "send message", "get message", "parse"]
        );
        assert_eq!(log.turns[0][6].action.content, json!("HELLO"));
        assert_eq!(log.key(metrics::REQUEST_COUNT_VIOLATED), Some(&json!(2)));
        assert_eq!(log.key(metrics::REQUEST_COUNT_PARSED), Some(&json!(1)));

        let history = master.context().history(PlayerName::Player(1)).unwrap();
        assert_eq!(history.last(), Some(&Message::assistant("HELLO")));
    }

    #[test]
    fn test_reprompt_cap_stops_loop() {
        let mut master = GameMaster::new(
            "shouting",
            Box::new(OneTurn(Shouting::new(mock(&["quiet"])))),
        )
        .with_max_reprompts(Some(2));
        master.setup(&GameInstance::new(0)).unwrap();
        master.play().unwrap();

        let gets = master
            .interaction_log()
            .events()
            .filter(|e| e.action.kind == Action::GET_MESSAGE)
            .count();
        assert_eq!(gets, 3);
        assert_eq!(master.state(), MasterState::Terminal);
    }

    /// Wraps a game so it ends after its first turn.
    struct OneTurn<G>(G);

    impl<G: DialogueGame> DialogueGame for OneTurn<G> {
        fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance) -> Result<(), MasterError> {
            self.0.setup(ctx, instance)
        }

        fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
            ctx.current_turn() == 0 && self.0.does_game_proceed(ctx)
        }

        fn validate_response(
            &mut self,
            ctx: &mut EpisodeContext,
            p: PlayerName,
            u: &str,
        ) -> Result<bool, MasterError> {
            self.0.validate_response(ctx, p, u)
        }

        fn should_reprompt(&mut self, ctx: &EpisodeContext, p: PlayerName) -> bool {
            self.0.should_reprompt(ctx, p)
        }

        fn on_before_reprompt(&mut self, ctx: &mut EpisodeContext, p: PlayerName) -> Result<(), MasterError> {
            self.0.on_before_reprompt(ctx, p)
        }
    }

    struct SkipEveryone {
        model: Option<ModelSource>,
    }

    impl DialogueGame for SkipEveryone {
        fn setup(&mut self, ctx: &mut EpisodeContext, _: &GameInstance) -> Result<(), MasterError> {
            let model = self.model.take().ok_or(MasterError::Game("no model".into()))?;
            ctx.add_player(Participant::new("Idle", model))?;
            Ok(())
        }

        fn does_game_proceed(&mut self, _: &EpisodeContext) -> bool {
            true
        }

        fn should_skip_player(&mut self, _: &EpisodeContext, _: PlayerName) -> bool {
            true
        }
    }

    #[test]
    fn test_all_players_skipped_ends_game() {
        let mut master = set_up(SkipEveryone {
            model: Some(mock(&["never"])),
        });
        master.play().unwrap();
        assert_eq!(master.interaction_log().turns.len(), 1);
        assert!(master.interaction_log().turns[0].is_empty());
        assert_eq!(master.state(), MasterState::Terminal);
    }

    /// Fails validation of every response, as a game whose referee broke would.
    struct BrokenReferee(Conversation);

    impl DialogueGame for BrokenReferee {
        fn setup(&mut self, ctx: &mut EpisodeContext, instance: &GameInstance) -> Result<(), MasterError> {
            self.0.setup(ctx, instance)
        }

        fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
            self.0.does_game_proceed(ctx)
        }

        fn validate_response(
            &mut self,
            ctx: &mut EpisodeContext,
            player: PlayerName,
            _: &str,
        ) -> Result<bool, MasterError> {
            ctx.log_to_self(Action::METADATA, format!("cannot judge {}", player))?;
            Err(MasterError::Game("referee unavailable".into()))
        }
    }

    #[test]
    fn test_validation_failure_propagates_from_play() {
        let mut master = set_up(BrokenReferee(Conversation::new(vec![mock(&["a"])], 2)));
        let err = master.play().unwrap_err();

        assert!(matches!(err, MasterError::Game(msg) if msg == "referee unavailable"));
        assert_eq!(master.state(), MasterState::Running);
        let history = master.context().history(PlayerName::Player(1)).unwrap();
        assert!(history.iter().all(|m| !m.is_assistant()));
        let kinds: Vec<&str> = master
            .interaction_log()
            .events()
            .map(|e| e.action.kind.as_str())
            .collect();
        assert_eq!(kinds, vec![Action::SEND_MESSAGE, Action::GET_MESSAGE, Action::METADATA]);
        assert_eq!(master.interaction_log().key(metrics::REQUEST_COUNT), None);
    }

    #[test]
    fn test_players_locked_after_setup() {
        struct LateJoiner;
        impl DialogueGame for LateJoiner {
            fn setup(&mut self, ctx: &mut EpisodeContext, _: &GameInstance) -> Result<(), MasterError> {
                let p = ctx.add_player(Participant::new("Early", mock(&["ok"])))?;
                ctx.add_user_message(p, "go")
            }
            fn does_game_proceed(&mut self, ctx: &EpisodeContext) -> bool {
                ctx.current_turn() == 0
            }
            fn on_before_turn(&mut self, ctx: &mut EpisodeContext, _: usize) -> Result<(), MasterError> {
                ctx.add_player(Participant::new("Late", mock(&["ok"])))?;
                Ok(())
            }
        }

        let mut master = set_up(LateJoiner);
        assert!(matches!(master.play(), Err(MasterError::PlayersLocked)));
    }
}
