//! # gamebench-cli
//!
//! Binary entry point for gamebench.
//!
//! This crate provides:
//! - CLI argument parsing using `clap`
//! - Configuration loading with command-line overrides
//! - The reference games and built-in response sources
//! - Batch runs, re-scoring, and transcript rendering of persisted results

mod games;
mod provider;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gamebench_core::{
    BenchmarkProgress, GameBenchmark, GameEntry, GameRegistry, HarnessConfig, InstanceFile,
};
use gamebench_proto::ModelSpec;
use indicatif::{ProgressBar, ProgressStyle};
use provider::{BuiltinProvider, parse_model};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// gamebench - run multi-turn dialogue game benchmarks
#[derive(Parser, Debug)]
#[command(name = "gamebench", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to configuration file
    #[arg(short, long, default_value = gamebench_core::DEFAULT_CONFIG_FILE, global = true)]
    config: PathBuf,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the experiments of an instance file
    Run(RunArgs),

    /// Re-score persisted episodes from their interaction logs
    Score(ResultsArgs),

    /// Re-render transcripts of persisted episodes
    Transcribe(ResultsArgs),

    /// List registered games and built-in models
    List,
}

/// Arguments for the run subcommand.
#[derive(Parser, Debug)]
struct RunArgs {
    /// Game to run
    #[arg(short, long)]
    game: String,

    /// Instance specification file (JSON)
    #[arg(short, long)]
    instances: PathBuf,

    /// Run only the named experiment
    #[arg(short, long)]
    experiment: Option<String>,

    /// Model as `name` or `name:temperature`; repeat for two-player games
    #[arg(short, long = "model", value_parser = parse_model)]
    models: Vec<ModelSpec>,

    /// Override the results directory
    #[arg(long)]
    results_dir: Option<PathBuf>,

    /// Override the reprompt cap
    #[arg(long)]
    max_reprompts: Option<usize>,

    /// Override the backend retry bound
    #[arg(long)]
    max_retries: Option<usize>,
}

/// Arguments for commands that read persisted results.
#[derive(Parser, Debug)]
struct ResultsArgs {
    /// Game whose results to process
    #[arg(short, long)]
    game: String,

    /// Override the results directory
    #[arg(long)]
    results_dir: Option<PathBuf>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging; RUST_LOG takes precedence when set
    let filter = if cli.verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let registry = games::registry();
    match cli.command {
        Commands::Run(args) => run_command(&registry, &cli.config, cli.verbose, args),
        Commands::Score(args) => score_command(&registry, &cli.config, args),
        Commands::Transcribe(args) => transcribe_command(&registry, &cli.config, args),
        Commands::List => {
            list_command(&registry);
            Ok(())
        }
    }
}

fn load_config(path: &Path) -> Result<HarnessConfig> {
    let config = HarnessConfig::load_or_default(path)
        .with_context(|| format!("Failed to load config from {:?}", path))?;
    for warning in config.validate() {
        warn!("{}", warning);
    }
    Ok(config)
}

fn lookup<'a>(registry: &'a GameRegistry, game: &str) -> Result<&'a GameEntry> {
    Ok(registry.lookup(game)?)
}

fn run_command(registry: &GameRegistry, config_path: &Path, verbose: bool, args: RunArgs) -> Result<()> {
    let mut config = results_config(config_path, args.results_dir)?;
    if let Some(max) = args.max_reprompts {
        config.max_reprompts = Some(max);
    }
    if let Some(retries) = args.max_retries {
        config.max_retries = retries;
    }

    let entry = lookup(registry, &args.game)?;
    let instances = InstanceFile::from_file(&args.instances)
        .with_context(|| format!("Failed to load instances from {:?}", args.instances))?;

    let episodes: usize = instances
        .select(args.experiment.as_deref())
        .iter()
        .map(|(_, e)| e.game_instances.len())
        .sum();

    let mut benchmark = GameBenchmark::new(entry.clone(), config);
    if !verbose && !is_interactive(&benchmark, &instances, args.experiment.as_deref(), &args.models) {
        let bar = progress_bar(episodes as u64);
        let observer_bar = bar.clone();
        benchmark.set_observer(move |progress| match progress {
            BenchmarkProgress::ExperimentStarted { experiment, pairing, .. } => {
                observer_bar.set_message(format!("{} ({})", experiment, pairing));
            }
            BenchmarkProgress::EpisodeFinished { .. } => observer_bar.inc(1),
            BenchmarkProgress::ExperimentFinished { .. } => {}
        });
        let result = run_benchmark(&benchmark, &instances, args.experiment.as_deref(), &args.models);
        bar.finish_and_clear();
        result
    } else {
        run_benchmark(&benchmark, &instances, args.experiment.as_deref(), &args.models)
    }
}

fn run_benchmark(
    benchmark: &GameBenchmark,
    instances: &InstanceFile,
    experiment: Option<&str>,
    models: &[ModelSpec],
) -> Result<()> {
    let pairing = if models.is_empty() { None } else { Some(models) };
    let report = benchmark
        .run(instances, experiment, pairing, &BuiltinProvider)
        .context("Benchmark aborted")?;

    println!("{:<24} {:<40} {:>8} {:>7} {:>10}", "EXPERIMENT", "PAIRING", "EPISODES", "ERRORS", "DURATION");
    for experiment in &report.experiments {
        println!(
            "{:<24} {:<40} {:>8} {:>7} {:>9.1}s",
            experiment.name, experiment.pairing, experiment.episodes, experiment.errors, experiment.duration
        );
    }
    info!(
        results = %benchmark.config().results_dir.display(),
        episodes = report.total_episodes(),
        errors = report.total_errors(),
        "Run complete"
    );
    Ok(())
}

/// Returns true if a human plays in any selected experiment, whether named on
/// the command line or declared in the instance file.
fn is_interactive(
    benchmark: &GameBenchmark,
    instances: &InstanceFile,
    experiment: Option<&str>,
    models: &[ModelSpec],
) -> bool {
    let explicit = if models.is_empty() { None } else { Some(models) };
    instances
        .select(experiment)
        .into_iter()
        .filter_map(|(_, e)| benchmark.resolve_pairing(e, explicit).ok())
        .any(|pairing| BuiltinProvider::is_interactive(&pairing.models))
}

fn progress_bar(len: u64) -> ProgressBar {
    let style = ProgressStyle::default_bar()
        .template("{spinner} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("█▓░");
    let bar = ProgressBar::new(len);
    bar.set_style(style);
    bar
}

/// Loads the config and applies a results directory override.
fn results_config(config_path: &Path, override_dir: Option<PathBuf>) -> Result<HarnessConfig> {
    let mut config = load_config(config_path)?;
    if let Some(dir) = override_dir {
        config.results_dir = dir;
    }
    Ok(config)
}

fn score_command(registry: &GameRegistry, config_path: &Path, args: ResultsArgs) -> Result<()> {
    let config = results_config(config_path, args.results_dir)?;
    let root = config.results_dir.clone();
    let entry = lookup(registry, &args.game)?;
    let benchmark = GameBenchmark::new(entry.clone(), config);
    let report = benchmark
        .rescore(&root)
        .with_context(|| format!("Failed to read results under {:?}", root))?;
    println!("Scored {} episode(s), {} error(s)", report.episodes, report.errors);
    Ok(())
}

fn transcribe_command(registry: &GameRegistry, config_path: &Path, args: ResultsArgs) -> Result<()> {
    let mut config = results_config(config_path, args.results_dir)?;
    config.write_transcripts = true;
    let root = config.results_dir.clone();
    let entry = lookup(registry, &args.game)?;
    let benchmark = GameBenchmark::new(entry.clone(), config);
    let report = benchmark
        .transcribe(&root)
        .with_context(|| format!("Failed to read results under {:?}", root))?;
    println!("Transcribed {} episode(s), {} error(s)", report.episodes, report.errors);
    Ok(())
}

fn list_command(registry: &GameRegistry) {
    println!("Games:");
    for entry in registry.all() {
        println!(
            "  {:<10} {} player(s)  {}",
            entry.spec.name, entry.spec.players, entry.spec.description
        );
    }
    println!("Models: {}", BuiltinProvider::names().join(", "));
}
