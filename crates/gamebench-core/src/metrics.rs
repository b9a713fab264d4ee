//! Names of the metrics and episode keys shared by every game.
//!
//! Games record the episode-level keys in their interaction log, and the
//! scoring engine turns them into the episode scores of the same name.

/// Whether the episode was aborted (e.g. a response violated the game rules).
pub const ABORTED: &str = "Aborted";

/// Whether the players lost the game.
pub const LOSE: &str = "Lose";

/// Derived: `0` when aborted, otherwise `1 - Lose`.
pub const SUCCESS: &str = "Success";

/// Number of responses requested from players.
pub const REQUEST_COUNT: &str = "Request Count";

/// Number of responses that passed validation.
pub const REQUEST_COUNT_PARSED: &str = "Request Count Parsed";

/// Number of responses that failed validation.
pub const REQUEST_COUNT_VIOLATED: &str = "Request Count Violated";

/// Derived: `Request Count Parsed / Request Count`.
pub const REQUEST_SUCCESS_RATIO: &str = "Request Success Ratio";

/// The headline metric every game must set exactly once per episode.
pub const MAIN_SCORE: &str = "Main Score";
