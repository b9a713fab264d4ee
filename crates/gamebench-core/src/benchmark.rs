//! Batch execution of experiments.
//!
//! `GameBenchmark` expands every selected experiment into one episode per game
//! instance and runs them one after another. Each episode runs inside a
//! failure boundary: an error or panic is logged, counted, and the batch moves
//! on to the next instance. Only configuration errors abort a batch, and they
//! are all detected before the first episode starts.
//!
//! Results are laid out as:
//!
//! ```text
//! <results_dir>/<pairing>/<game>/<idx>_<experiment>/
//!     experiment_<experiment>.json
//!     episode_<n>/{instance,interactions,requests,scores}.json
//! ```

use crate::config::{ConfigError, HarnessConfig};
use crate::instances::{Experiment, GameInstance, INSTANCE_FILE, InstanceError, InstanceFile};
use crate::master::{GameMaster, MasterError};
use crate::participant::ModelSource;
use crate::recorder::{INTERACTIONS_FILE, InteractionLog, RecorderError, timestamp_now};
use crate::registry::GameEntry;
use crate::scorer::{ScoringError, compute_scores};
use crate::transcript::{MarkdownTranscript, TranscriptRenderer};
use gamebench_proto::{BackendError, ModelSpec, pairing_descriptor};
use serde_json::{Map, Value};
use std::any::Any;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, error, info, warn};

/// Prefix of episode directory names.
pub const EPISODE_DIR_PREFIX: &str = "episode_";

/// Resolves model specifications to response sources.
pub trait BackendProvider {
    fn backend_for(&self, spec: &ModelSpec) -> Result<ModelSource, BackendError>;
}

impl<F> BackendProvider for F
where
    F: Fn(&ModelSpec) -> Result<ModelSource, BackendError>,
{
    fn backend_for(&self, spec: &ModelSpec) -> Result<ModelSource, BackendError> {
        self(spec)
    }
}

/// The models playing one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedPairing {
    /// One model per player, in player order.
    pub models: Vec<ModelSpec>,
    /// Directory discriminator, always naming two models.
    pub descriptor: String,
}

/// Progress notifications emitted during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchmarkProgress {
    ExperimentStarted {
        experiment: String,
        pairing: String,
        episodes: usize,
    },
    EpisodeFinished {
        experiment: String,
        episode: usize,
        failed: bool,
    },
    ExperimentFinished {
        experiment: String,
        errors: usize,
        duration: f64,
    },
}

type Observer = Box<dyn Fn(&BenchmarkProgress) + Send + 'static>;

/// Outcome of one experiment.
#[derive(Debug, Clone, PartialEq)]
pub struct ExperimentReport {
    pub name: String,
    pub pairing: String,
    pub directory: PathBuf,
    pub episodes: usize,
    pub errors: usize,
    /// Wall-clock seconds.
    pub duration: f64,
}

/// Outcome of a batch run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BenchmarkReport {
    pub experiments: Vec<ExperimentReport>,
}

impl BenchmarkReport {
    pub fn total_episodes(&self) -> usize {
        self.experiments.iter().map(|e| e.episodes).sum()
    }

    pub fn total_errors(&self) -> usize {
        self.experiments.iter().map(|e| e.errors).sum()
    }
}

/// Outcome of re-processing persisted episodes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RescoreReport {
    pub episodes: usize,
    pub errors: usize,
}

/// Errors that abort a batch.
#[derive(Debug, thiserror::Error)]
pub enum BenchmarkError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors raised inside a single episode. Caught at the episode boundary.
#[derive(Debug, thiserror::Error)]
pub enum EpisodeError {
    #[error(transparent)]
    Instance(#[from] InstanceError),

    #[error("Backend unavailable: {0}")]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Master(#[from] MasterError),

    #[error(transparent)]
    Recorder(#[from] RecorderError),

    #[error("Scoring failed: {0}")]
    Scoring(#[from] ScoringError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Episode panicked: {0}")]
    Panicked(String),
}

/// Runs experiments of one game.
pub struct GameBenchmark {
    entry: GameEntry,
    config: HarnessConfig,
    renderers: Vec<Box<dyn TranscriptRenderer>>,
    observer: Option<Observer>,
}

impl GameBenchmark {
    /// Creates a benchmark for a registered game. Markdown transcripts are
    /// rendered when the config enables them.
    pub fn new(entry: GameEntry, config: HarnessConfig) -> Self {
        let mut renderers: Vec<Box<dyn TranscriptRenderer>> = Vec::new();
        if config.write_transcripts {
            renderers.push(Box::new(MarkdownTranscript));
        }
        Self {
            entry,
            config,
            renderers,
            observer: None,
        }
    }

    /// Adds a transcript renderer.
    pub fn with_renderer(mut self, renderer: impl TranscriptRenderer + 'static) -> Self {
        self.renderers.push(Box::new(renderer));
        self
    }

    /// Sets an observer that receives progress notifications.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: Fn(&BenchmarkProgress) + Send + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Returns the game name.
    pub fn game_name(&self) -> &str {
        &self.entry.spec.name
    }

    /// Returns the configuration.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// Picks the models for an experiment.
    ///
    /// An explicit pairing wins over one declared in the experiment. A single
    /// model is duplicated for two-player games (self-play).
    pub fn resolve_pairing(
        &self,
        experiment: &Experiment,
        explicit: Option<&[ModelSpec]>,
    ) -> Result<ResolvedPairing, ConfigError> {
        let declared = experiment
            .declared_pairing()
            .map_err(|e| ConfigError::Validation(e.to_string()))?;
        let models = match (explicit, declared) {
            (Some(models), _) if !models.is_empty() => models.to_vec(),
            (_, Some(models)) if !models.is_empty() => models,
            _ => return Err(ConfigError::NoPairing(experiment.name.clone())),
        };

        let players = self.entry.spec.players;
        if models.len() > players.max(1) {
            return Err(ConfigError::TooManyPlayers {
                game: self.entry.spec.name.clone(),
                players,
                supplied: models.len(),
            });
        }

        let descriptor_models = match models.as_slice() {
            [single] => vec![single.clone(), single.clone()],
            _ => models.clone(),
        };
        let models = if models.len() < players {
            let mut expanded = models;
            while expanded.len() < players {
                expanded.push(expanded[0].clone());
            }
            expanded
        } else {
            models
        };

        Ok(ResolvedPairing {
            descriptor: pairing_descriptor(&descriptor_models),
            models,
        })
    }

    /// Returns the directory of an experiment run.
    pub fn experiment_dir(&self, descriptor: &str, index: usize, name: &str) -> PathBuf {
        self.config
            .results_dir
            .join(descriptor)
            .join(&self.entry.spec.name)
            .join(format!("{}_{}", index, name))
    }

    /// Runs the selected experiments.
    ///
    /// Pairings for every selected experiment are resolved before any episode
    /// runs, so a configuration error leaves no partial results behind.
    pub fn run(
        &self,
        instances: &InstanceFile,
        filter: Option<&str>,
        pairing: Option<&[ModelSpec]>,
        provider: &dyn BackendProvider,
    ) -> Result<BenchmarkReport, BenchmarkError> {
        let selected = instances.select(filter);
        if let Some(name) = filter
            && selected.is_empty()
        {
            return Err(ConfigError::UnknownExperiment(name.to_string()).into());
        }

        let plans = selected
            .into_iter()
            .map(|(index, experiment)| {
                self.resolve_pairing(experiment, pairing)
                    .map(|resolved| (index, experiment, resolved))
            })
            .collect::<Result<Vec<_>, ConfigError>>()?;

        let mut report = BenchmarkReport::default();
        for (index, experiment, resolved) in plans {
            report
                .experiments
                .push(self.run_experiment(index, experiment, &resolved, provider)?);
        }

        info!(
            game = %self.entry.spec.name,
            experiments = report.experiments.len(),
            episodes = report.total_episodes(),
            errors = report.total_errors(),
            "Benchmark finished"
        );
        Ok(report)
    }

    fn run_experiment(
        &self,
        index: usize,
        experiment: &Experiment,
        pairing: &ResolvedPairing,
        provider: &dyn BackendProvider,
    ) -> Result<ExperimentReport, BenchmarkError> {
        let dir = self.experiment_dir(&pairing.descriptor, index, &experiment.name);
        fs::create_dir_all(&dir)?;
        let sidecar_path = dir.join(format!("experiment_{}.json", experiment.name));

        let mut sidecar = experiment.static_params();
        sidecar.insert("timestamp".to_string(), Value::String(timestamp_now()));
        write_json(&sidecar_path, &sidecar)?;

        let started = Instant::now();
        let episodes = experiment.game_instances.len();
        info!(
            game = %self.entry.spec.name,
            experiment = %experiment.name,
            pairing = %pairing.descriptor,
            episodes,
            "Running experiment"
        );
        self.notify(&BenchmarkProgress::ExperimentStarted {
            experiment: experiment.name.clone(),
            pairing: pairing.descriptor.clone(),
            episodes,
        });

        let mut errors = 0;
        for (episode, instance) in experiment.game_instances.iter().enumerate() {
            let episode_dir = dir.join(format!("{}{}", EPISODE_DIR_PREFIX, episode));
            let result = guarded(|| {
                self.run_episode(experiment, instance, pairing, provider, &episode_dir)
            });
            let failed = result.is_err();
            if let Err(err) = result {
                errors += 1;
                error!(
                    game = %self.entry.spec.name,
                    experiment = %experiment.name,
                    episode,
                    game_id = %instance.game_id,
                    error = %err,
                    "Episode failed"
                );
            }
            self.notify(&BenchmarkProgress::EpisodeFinished {
                experiment: experiment.name.clone(),
                episode,
                failed,
            });
        }

        let duration = started.elapsed().as_secs_f64();
        sidecar.insert("duration".to_string(), Value::from(duration));
        write_json(&sidecar_path, &sidecar)?;

        if errors > 0 {
            warn!(
                experiment = %experiment.name,
                errors,
                episodes,
                "Experiment finished with failed episodes"
            );
        } else {
            info!(experiment = %experiment.name, episodes, duration, "Experiment finished");
        }
        self.notify(&BenchmarkProgress::ExperimentFinished {
            experiment: experiment.name.clone(),
            errors,
            duration,
        });

        Ok(ExperimentReport {
            name: experiment.name.clone(),
            pairing: pairing.descriptor.clone(),
            directory: dir,
            episodes,
            errors,
            duration,
        })
    }

    fn run_episode(
        &self,
        experiment: &Experiment,
        instance: &GameInstance,
        pairing: &ResolvedPairing,
        provider: &dyn BackendProvider,
        dir: &Path,
    ) -> Result<(), EpisodeError> {
        instance.store(dir)?;

        let models = pairing
            .models
            .iter()
            .map(|spec| {
                provider
                    .backend_for(spec)
                    .map(|source| source.with_max_retries(self.config.max_retries))
            })
            .collect::<Result<Vec<_>, _>>()?;

        let game = self.entry.factory.create_game(experiment, models);
        let mut master = GameMaster::new(self.entry.spec.name.clone(), game)
            .with_max_reprompts(self.config.max_reprompts);
        master.setup(instance)?;
        master.play()?;
        master.flush(dir)?;

        let mut scorer = self.entry.factory.create_scorer(experiment, instance);
        let scores = compute_scores(scorer.as_mut(), master.interaction_log())?;
        scores.store(dir)?;

        self.render_transcripts(master.interaction_log(), dir);
        debug!(dir = %dir.display(), "Episode complete");
        Ok(())
    }

    /// Re-scores every persisted episode of this game under `results_root`.
    ///
    /// Scores are recomputed from `interactions.json` alone, so running this
    /// twice produces identical `scores.json` files.
    pub fn rescore(&self, results_root: &Path) -> Result<RescoreReport, BenchmarkError> {
        let mut report = RescoreReport::default();
        for location in self.persisted_episodes(results_root)? {
            report.episodes += 1;
            let result = guarded(|| self.rescore_episode(&location));
            if let Err(err) = result {
                report.errors += 1;
                error!(
                    game = %self.entry.spec.name,
                    episode = %location.episode_dir.display(),
                    error = %err,
                    "Re-scoring failed"
                );
            }
        }
        info!(
            game = %self.entry.spec.name,
            episodes = report.episodes,
            errors = report.errors,
            "Re-scoring finished"
        );
        Ok(report)
    }

    fn rescore_episode(&self, location: &EpisodeLocation) -> Result<(), EpisodeError> {
        let experiment = load_experiment(&location.experiment_dir)?;
        let instance: GameInstance = serde_json::from_str(&fs::read_to_string(
            location.episode_dir.join(INSTANCE_FILE),
        )?)?;
        let log = InteractionLog::from_file(location.episode_dir.join(INTERACTIONS_FILE))?;

        let mut scorer = self.entry.factory.create_scorer(&experiment, &instance);
        let scores = compute_scores(scorer.as_mut(), &log)?;
        scores.store(&location.episode_dir)?;
        Ok(())
    }

    /// Re-renders transcripts for every persisted episode of this game.
    pub fn transcribe(&self, results_root: &Path) -> Result<RescoreReport, BenchmarkError> {
        let mut report = RescoreReport::default();
        for location in self.persisted_episodes(results_root)? {
            report.episodes += 1;
            match InteractionLog::from_file(location.episode_dir.join(INTERACTIONS_FILE)) {
                Ok(log) => self.render_transcripts(&log, &location.episode_dir),
                Err(err) => {
                    report.errors += 1;
                    warn!(
                        episode = %location.episode_dir.display(),
                        error = %err,
                        "Cannot load interaction log"
                    );
                }
            }
        }
        Ok(report)
    }

    fn render_transcripts(&self, log: &InteractionLog, dir: &Path) {
        for renderer in &self.renderers {
            if let Err(err) = renderer.render(log, dir) {
                warn!(
                    renderer = renderer.name(),
                    dir = %dir.display(),
                    error = %err,
                    "Transcript rendering failed"
                );
            }
        }
    }

    /// Finds episode directories that hold an interaction log.
    ///
    /// Episodes that failed before their log was flushed are skipped.
    fn persisted_episodes(&self, results_root: &Path) -> Result<Vec<EpisodeLocation>, BenchmarkError> {
        let mut locations = Vec::new();
        for pairing_dir in subdirectories(results_root)? {
            let game_dir = pairing_dir.join(&self.entry.spec.name);
            if !game_dir.is_dir() {
                continue;
            }
            for experiment_dir in subdirectories(&game_dir)? {
                for episode_dir in subdirectories(&experiment_dir)? {
                    let is_episode = episode_dir
                        .file_name()
                        .and_then(|n| n.to_str())
                        .is_some_and(|n| n.starts_with(EPISODE_DIR_PREFIX));
                    if is_episode && episode_dir.join(INTERACTIONS_FILE).is_file() {
                        locations.push(EpisodeLocation {
                            experiment_dir: experiment_dir.clone(),
                            episode_dir,
                        });
                    }
                }
            }
        }
        debug!(
            root = %results_root.display(),
            episodes = locations.len(),
            "Found persisted episodes"
        );
        Ok(locations)
    }

    fn notify(&self, progress: &BenchmarkProgress) {
        if let Some(observer) = &self.observer {
            observer(progress);
        }
    }
}

#[derive(Debug, Clone)]
struct EpisodeLocation {
    experiment_dir: PathBuf,
    episode_dir: PathBuf,
}

/// Runs `f`, turning a panic into an episode error.
fn guarded<F>(f: F) -> Result<(), EpisodeError>
where
    F: FnOnce() -> Result<(), EpisodeError>,
{
    panic::catch_unwind(AssertUnwindSafe(f)).unwrap_or_else(|payload| {
        Err(EpisodeError::Panicked(panic_message(payload.as_ref())))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn subdirectories(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}

/// Loads the experiment sidecar of an experiment directory.
fn load_experiment(experiment_dir: &Path) -> Result<Experiment, EpisodeError> {
    for entry in fs::read_dir(experiment_dir)? {
        let path = entry?.path();
        let is_sidecar = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("experiment_") && n.ends_with(".json"));
        if is_sidecar {
            return Ok(serde_json::from_str(&fs::read_to_string(&path)?)?);
        }
    }
    Err(EpisodeError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("no experiment sidecar in {}", experiment_dir.display()),
    )))
}

fn write_json(path: &Path, map: &Map<String, Value>) -> Result<(), BenchmarkError> {
    fs::write(path, serde_json::to_string_pretty(map)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{GameRegistry, GameSpec};
    use crate::testing::ScriptedFactory;

    fn benchmark(players: usize) -> GameBenchmark {
        let registry = GameRegistry::builder()
            .register(GameSpec::new("scripted", players, "test game"), ScriptedFactory)
            .build();
        let entry = registry.get("scripted").unwrap().clone();
        GameBenchmark::new(entry, HarnessConfig::default())
    }

    #[test]
    fn test_single_player_descriptor_duplicates_model() {
        let bench = benchmark(1);
        let models = [ModelSpec::new("modelA", 0.7)];
        let resolved = bench
            .resolve_pairing(&Experiment::new("e", vec![]), Some(&models))
            .unwrap();
        assert_eq!(resolved.descriptor, "modelA-t0.7--modelA-t0.7");
        assert_eq!(resolved.models, vec![ModelSpec::new("modelA", 0.7)]);
    }

    #[test]
    fn test_two_player_self_play() {
        let bench = benchmark(2);
        let models = [ModelSpec::new("m", 0.0)];
        let resolved = bench
            .resolve_pairing(&Experiment::new("e", vec![]), Some(&models))
            .unwrap();
        assert_eq!(resolved.models.len(), 2);
        assert_eq!(resolved.descriptor, "m-t0.0--m-t0.0");
    }

    #[test]
    fn test_explicit_pairing_wins() {
        let bench = benchmark(2);
        let experiment = Experiment::new("e", vec![])
            .with_param("player_models", serde_json::json!(["declared"]));
        let models = [ModelSpec::new("a", 0.0), ModelSpec::new("b", 1.0)];

        let resolved = bench.resolve_pairing(&experiment, Some(&models)).unwrap();
        assert_eq!(resolved.descriptor, "a-t0.0--b-t1.0");

        let declared = bench.resolve_pairing(&experiment, None).unwrap();
        assert_eq!(declared.models[0].name, "declared");
    }

    #[test]
    fn test_missing_pairing_is_config_error() {
        let bench = benchmark(1);
        let err = bench
            .resolve_pairing(&Experiment::new("lonely", vec![]), None)
            .unwrap_err();
        assert!(matches!(err, ConfigError::NoPairing(name) if name == "lonely"));
    }

    #[test]
    fn test_too_many_models_for_single_player() {
        let bench = benchmark(1);
        let models = [ModelSpec::new("a", 0.0), ModelSpec::new("b", 0.0)];
        let err = bench
            .resolve_pairing(&Experiment::new("e", vec![]), Some(&models))
            .unwrap_err();
        assert!(matches!(err, ConfigError::TooManyPlayers { supplied: 2, .. }));
    }

    #[test]
    fn test_guarded_catches_panics() {
        let result = guarded(|| panic!("boom"));
        assert!(matches!(result, Err(EpisodeError::Panicked(msg)) if msg == "boom"));
    }

    #[test]
    fn test_experiment_dir_layout() {
        let bench = benchmark(1);
        let dir = bench.experiment_dir("m-t0.0--m-t0.0", 2, "easy");
        assert_eq!(
            dir,
            PathBuf::from("results/m-t0.0--m-t0.0/scripted/2_easy")
        );
    }
}
