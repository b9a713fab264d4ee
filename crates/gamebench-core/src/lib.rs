//! # gamebench-core
//!
//! Episode orchestration for multi-turn dialogue game benchmarks.
//!
//! This crate provides:
//! - The turn-taking game master and the hooks games implement
//! - Event recording into persisted interaction and raw-call logs
//! - Response participants over backends, human input, or game logic
//! - Two-phase episode scoring
//! - Failure-isolated batch execution of experiments
//! - Configuration loading, game registration, and transcript rendering

pub mod benchmark;
mod config;
pub mod instances;
mod master;
pub mod metrics;
mod participant;
mod recorder;
mod registry;
mod scorer;
pub mod testing;
mod transcript;

pub use benchmark::{
    BackendProvider, BenchmarkError, BenchmarkProgress, BenchmarkReport, EpisodeError,
    ExperimentReport, GameBenchmark, RescoreReport, ResolvedPairing,
};
pub use config::{ConfigError, ConfigWarning, DEFAULT_CONFIG_FILE, HarnessConfig};
pub use instances::{Experiment, GameInstance, InstanceError, InstanceFile};
pub use master::{
    DialogueGame, EpisodeContext, GameMaster, MasterError, MasterState, RequestCounts,
};
pub use participant::{
    CustomResponder, DEFAULT_MAX_RETRIES, ModelSource, Participant, ParticipantCall,
    ParticipantError,
};
pub use recorder::{
    Action, Event, EventRecorder, INTERACTIONS_FILE, InteractionLog, LogWarning, REQUESTS_FILE,
    RESERVED_KEYS, RawCall, RecorderError, timestamp_now,
};
pub use registry::{GameEntry, GameFactory, GameRegistry, GameRegistryBuilder, GameSpec};
pub use scorer::{
    GameScorer, SCORES_FILE, Scores, ScoringError, compute_scores, score_game, score_game_end,
    score_requests,
};
pub use transcript::{MARKDOWN_TRANSCRIPT_FILE, MarkdownTranscript, TranscriptRenderer};
