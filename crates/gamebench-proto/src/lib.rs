//! # gamebench-proto
//!
//! Shared types, error definitions, and traits for the gamebench harness.
//!
//! This crate provides the foundational abstractions used across all gamebench
//! crates, including:
//! - Conversation messages and roles
//! - Participant identities (`GM`, `Player N`)
//! - Model specifications and pairing descriptors
//! - The response backend contract consumed by model-backed participants

mod backend;
mod message;
mod model;
mod player;

pub use backend::{BackendError, Generation, ResponseBackend};
pub use message::{Message, Role};
pub use model::{ModelSpec, pairing_descriptor};
pub use player::{ParsePlayerNameError, PlayerName, is_valid_identity};
