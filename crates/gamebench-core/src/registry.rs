//! Registry of playable games.
//!
//! Games register explicitly at startup through [`GameRegistry::builder`]. The
//! registry is owned by the caller and handed to whatever needs to look games
//! up; there is no process-wide state.

use crate::config::ConfigError;
use crate::instances::{Experiment, GameInstance};
use crate::master::DialogueGame;
use crate::participant::ModelSource;
use crate::scorer::GameScorer;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Static description of a game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GameSpec {
    pub name: String,
    /// Number of players the game registers (1 or 2).
    pub players: usize,
    pub description: String,
}

impl GameSpec {
    pub fn new(name: impl Into<String>, players: usize, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            players,
            description: description.into(),
        }
    }

    /// Returns true for games played by a single model.
    pub fn is_single_player(&self) -> bool {
        self.players == 1
    }
}

/// Builds fresh game and scorer instances for each episode.
pub trait GameFactory: Send + Sync {
    /// Creates the game rules for one episode. `models` holds one source per
    /// player, in player order.
    fn create_game(&self, experiment: &Experiment, models: Vec<ModelSource>) -> Box<dyn DialogueGame>;

    /// Creates the scorer for one episode.
    fn create_scorer(&self, experiment: &Experiment, instance: &GameInstance) -> Box<dyn GameScorer>;
}

/// A registered game.
#[derive(Clone)]
pub struct GameEntry {
    pub spec: GameSpec,
    pub factory: Arc<dyn GameFactory>,
}

impl fmt::Debug for GameEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameEntry")
            .field("spec", &self.spec)
            .finish_non_exhaustive()
    }
}

/// Caller-owned lookup table of games by name.
#[derive(Debug, Default, Clone)]
pub struct GameRegistry {
    games: BTreeMap<String, GameEntry>,
}

impl GameRegistry {
    /// Starts building a registry.
    pub fn builder() -> GameRegistryBuilder {
        GameRegistryBuilder::default()
    }

    /// Gets a game by name.
    pub fn get(&self, name: &str) -> Option<&GameEntry> {
        self.games.get(name)
    }

    /// Gets a game by name, failing with the list of registered games.
    pub fn lookup(&self, name: &str) -> Result<&GameEntry, ConfigError> {
        self.get(name).ok_or_else(|| ConfigError::UnknownGame {
            name: name.to_string(),
            available: self.names().collect::<Vec<_>>().join(", "),
        })
    }

    /// Returns all registered games in name order.
    pub fn all(&self) -> impl Iterator<Item = &GameEntry> {
        self.games.values()
    }

    /// Returns all game names in order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.games.keys().map(String::as_str)
    }

    /// Returns the number of registered games.
    pub fn len(&self) -> usize {
        self.games.len()
    }

    /// Returns true if no games are registered.
    pub fn is_empty(&self) -> bool {
        self.games.is_empty()
    }
}

/// Builder for [`GameRegistry`].
#[derive(Debug, Default)]
pub struct GameRegistryBuilder {
    games: BTreeMap<String, GameEntry>,
}

impl GameRegistryBuilder {
    /// Registers a game. A later registration under the same name wins.
    pub fn register(mut self, spec: GameSpec, factory: impl GameFactory + 'static) -> Self {
        debug!(game = %spec.name, players = spec.players, "Registering game");
        let name = spec.name.clone();
        let entry = GameEntry {
            spec,
            factory: Arc::new(factory),
        };
        if self.games.insert(name.clone(), entry).is_some() {
            warn!(game = %name, "Game registered twice, keeping the last registration");
        }
        self
    }

    pub fn build(self) -> GameRegistry {
        GameRegistry { games: self.games }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedFactory;

    #[test]
    fn test_builder_registers_games() {
        let registry = GameRegistry::builder()
            .register(GameSpec::new("solo", 1, "one player"), ScriptedFactory)
            .register(GameSpec::new("duet", 2, "two players"), ScriptedFactory)
            .build();

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["duet", "solo"]);
        assert!(registry.get("solo").unwrap().spec.is_single_player());
        assert!(registry.get("missing").is_none());
    }

    #[test]
    fn test_duplicate_registration_keeps_last() {
        let registry = GameRegistry::builder()
            .register(GameSpec::new("solo", 1, "first"), ScriptedFactory)
            .register(GameSpec::new("solo", 1, "second"), ScriptedFactory)
            .build();

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get("solo").unwrap().spec.description, "second");
    }

    #[test]
    fn test_lookup_names_available_games() {
        let registry = GameRegistry::builder()
            .register(GameSpec::new("solo", 1, "one player"), ScriptedFactory)
            .register(GameSpec::new("duet", 2, "two players"), ScriptedFactory)
            .build();

        assert_eq!(registry.lookup("duet").unwrap().spec.players, 2);
        let err = registry.lookup("chess").unwrap_err();
        assert!(matches!(&err, ConfigError::UnknownGame { name, .. } if name == "chess"));
        assert_eq!(err.to_string(), "Unknown game 'chess'. Available: duet, solo");
    }

    #[test]
    fn test_empty_registry() {
        let registry = GameRegistry::builder().build();
        assert!(registry.is_empty());
    }
}
