//! Participant identities within an episode.
//!
//! Every episode has exactly one game master (`"GM"`) and one or more
//! players named `"Player 1"`, `"Player 2"`, ... in the order they were added.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Identity of an actor in the interaction log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PlayerName {
    /// The game master (the orchestrator itself).
    Gm,
    /// The n-th participant added to the episode (1-indexed).
    Player(usize),
}

impl PlayerName {
    /// Returns the identity assigned to the participant at `index` (0-indexed).
    pub fn for_index(index: usize) -> Self {
        PlayerName::Player(index + 1)
    }

    /// Returns the 0-indexed position of a player, or `None` for the GM.
    pub fn index(self) -> Option<usize> {
        match self {
            PlayerName::Gm => None,
            PlayerName::Player(n) => n.checked_sub(1),
        }
    }

    /// Returns true for the game master identity.
    pub fn is_gm(self) -> bool {
        self == PlayerName::Gm
    }
}

impl fmt::Display for PlayerName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerName::Gm => f.write_str("GM"),
            PlayerName::Player(n) => write!(f, "Player {}", n),
        }
    }
}

/// Error returned when a string is neither `"GM"` nor `"Player <n>"`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Invalid participant identity: '{0}'")]
pub struct ParsePlayerNameError(pub String);

impl FromStr for PlayerName {
    type Err = ParsePlayerNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s == "GM" {
            return Ok(PlayerName::Gm);
        }
        s.strip_prefix("Player ")
            .filter(|digits| !digits.starts_with('0') && digits.chars().all(|c| c.is_ascii_digit()))
            .and_then(|digits| digits.parse::<usize>().ok())
            .filter(|n| *n >= 1)
            .map(PlayerName::Player)
            .ok_or_else(|| ParsePlayerNameError(s.to_string()))
    }
}

impl Serialize for PlayerName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PlayerName {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Returns true if `identity` is `"GM"` or `"Player <positive integer>"`.
pub fn is_valid_identity(identity: &str) -> bool {
    identity.parse::<PlayerName>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_and_parse() {
        assert_eq!(PlayerName::Gm.to_string(), "GM");
        assert_eq!(PlayerName::Player(2).to_string(), "Player 2");
        assert_eq!("Player 12".parse::<PlayerName>().unwrap(), PlayerName::Player(12));
        assert_eq!("GM".parse::<PlayerName>().unwrap(), PlayerName::Gm);
    }

    #[test]
    fn test_rejects_malformed_identities() {
        for bad in ["Player 0", "Player", "Player -1", "player 1", "Player 01", "P1", ""] {
            assert!(!is_valid_identity(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn test_for_index_is_one_based() {
        assert_eq!(PlayerName::for_index(0), PlayerName::Player(1));
        assert_eq!(PlayerName::Player(3).index(), Some(2));
        assert_eq!(PlayerName::Gm.index(), None);
    }

    #[test]
    fn test_serde_as_string() {
        let json = serde_json::to_string(&PlayerName::Player(1)).unwrap();
        assert_eq!(json, r#""Player 1""#);
        let parsed: PlayerName = serde_json::from_str(r#""GM""#).unwrap();
        assert!(parsed.is_gm());
    }
}
