//! Testing utilities for deterministic harness tests.

pub mod mock_backend;
pub mod scripted_game;

pub use mock_backend::{ExecutionRecord, FailingBackend, MockBackend};
pub use scripted_game::{ScriptedFactory, ScriptedGame, ScriptedScorer};
