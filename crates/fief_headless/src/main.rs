//! Headless game runner.
//!
//! Runs the simulation without graphics for AI testing, CI verification and
//! determinism sweeps.
//!
//! # Usage
//!
//! ```bash
//! # A default new game for 5000 steps
//! cargo run -p fief_headless -- run
//!
//! # A random-map game with explicit size and seed, saved at the end
//! cargo run -p fief_headless -- run --size 4 --seed 12345 --save out.sav
//!
//! # Resume from a save file
//! cargo run -p fief_headless -- load out.sav --steps 1000
//!
//! # Determinism sweep across 64 seeds
//! cargo run -p fief_headless -- batch --count 64 --steps 2000
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use fief_headless::batch::{run_batch, BatchConfig};
use fief_headless::runner::{run, RunConfig};
use fief_headless::scenario::Scenario;

#[derive(Parser)]
#[command(name = "fief_headless")]
#[command(about = "Headless game runner for AI testing and CI")]
#[command(version)]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single game
    Run {
        /// Scenario RON file (defaults to the built-in scenario)
        #[arg(long)]
        scenario: Option<PathBuf>,

        /// Map size class
        #[arg(long)]
        size: Option<u32>,

        /// Random seed
        #[arg(long)]
        seed: Option<u64>,

        /// Steps to simulate
        #[arg(long, default_value = "5000")]
        steps: u64,

        /// Disable AI drivers
        #[arg(long)]
        no_ai: bool,

        /// Save the final state here
        #[arg(long)]
        save: Option<PathBuf>,
    },

    /// Resume a saved game
    Load {
        /// Save file to resume
        file: PathBuf,

        /// Steps to simulate after loading
        #[arg(long, default_value = "1000")]
        steps: u64,
    },

    /// Run a determinism sweep over many seeds
    Batch {
        /// Number of games
        #[arg(long, default_value = "16")]
        count: u32,

        /// First seed
        #[arg(long, default_value = "0")]
        seed_start: u64,

        /// Steps per game
        #[arg(long, default_value = "1000")]
        steps: u64,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command.unwrap_or(Commands::Run {
        scenario: None,
        size: None,
        seed: None,
        steps: 5000,
        no_ai: false,
        save: None,
    }) {
        Commands::Run {
            scenario,
            size,
            seed,
            steps,
            no_ai,
            save,
        } => {
            let mut scenario = match scenario {
                Some(path) => match Scenario::load(&path) {
                    Ok(s) => s,
                    Err(e) => {
                        eprintln!("failed to load scenario: {e}");
                        return ExitCode::FAILURE;
                    }
                },
                None => Scenario::default(),
            };
            if let Some(size) = size {
                scenario.map_size = size;
            }
            if let Some(seed) = seed {
                scenario.seed = seed;
            }
            let config = RunConfig {
                scenario,
                max_steps: steps,
                with_ai: !no_ai,
                save_path: save,
            };
            match run(&config) {
                Ok(summary) => {
                    match serde_json::to_string(&summary) {
                        Ok(json) => println!("{json}"),
                        Err(_) => println!(
                            "tick {} hash {:016x} land {:?}",
                            summary.tick, summary.state_hash, summary.land_area
                        ),
                    }
                    ExitCode::SUCCESS
                }
                Err(e) => {
                    eprintln!("run failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
        Commands::Load { file, steps } => match fief_core::save::load_from_file(&file) {
            Ok(mut game) => {
                for _ in 0..steps {
                    game.update();
                }
                println!("tick {} hash {:016x}", game.tick(), game.state_hash());
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("failed to load save: {e}");
                ExitCode::FAILURE
            }
        },
        Commands::Batch {
            count,
            seed_start,
            steps,
        } => {
            let config = BatchConfig {
                game_count: count,
                seed_start,
                steps,
                ..BatchConfig::default()
            };
            match run_batch(&config) {
                Ok(results) => {
                    println!(
                        "{} games, {} divergent",
                        results.games.len(),
                        results.divergent
                    );
                    if results.divergent > 0 {
                        ExitCode::FAILURE
                    } else {
                        ExitCode::SUCCESS
                    }
                }
                Err(e) => {
                    eprintln!("batch failed: {e}");
                    ExitCode::FAILURE
                }
            }
        }
    }
}
