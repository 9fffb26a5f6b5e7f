//! Batch runs for CI determinism sweeps.
//!
//! Runs many short games in parallel with rayon. Each seed is run twice and
//! the two final hashes compared, so a batch doubles as a fleet-wide
//! determinism check.

use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use fief_core::error::Result;

use crate::runner::{run, RunConfig};
use crate::scenario::Scenario;

/// Batch configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Template scenario; the seed is replaced per game.
    pub scenario: Scenario,
    /// Number of games.
    pub game_count: u32,
    /// First seed; game `i` uses `seed_start + i`.
    pub seed_start: u64,
    /// Steps per game.
    pub steps: u64,
    /// Drive AI players (disables the determinism comparison, since AI
    /// timing is wall-clock dependent).
    pub with_ai: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::default(),
            game_count: 16,
            seed_start: 0,
            steps: 1_000,
            with_ai: false,
        }
    }
}

/// One game's result in a batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchGameResult {
    /// Seed used.
    pub seed: u64,
    /// Final hash of the first run.
    pub state_hash: u64,
    /// Whether the repeat run reproduced the hash (always true without AI).
    pub reproducible: bool,
}

/// Aggregated batch outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchResults {
    /// Per-game results.
    pub games: Vec<BatchGameResult>,
    /// Count of games that failed to reproduce.
    pub divergent: u32,
}

/// Run the batch; games execute in parallel, each internally sequential.
pub fn run_batch(config: &BatchConfig) -> Result<BatchResults> {
    let games: Vec<BatchGameResult> = (0..config.game_count)
        .into_par_iter()
        .map(|i| {
            let seed = config.seed_start + u64::from(i);
            let mut scenario = config.scenario.clone();
            scenario.seed = seed;
            let run_config = RunConfig {
                scenario,
                max_steps: config.steps,
                with_ai: config.with_ai,
                save_path: None,
            };

            let first = run(&run_config)?;
            let reproducible = if config.with_ai {
                true
            } else {
                let second = run(&run_config)?;
                second.state_hash == first.state_hash
            };
            Ok(BatchGameResult {
                seed,
                state_hash: first.state_hash,
                reproducible,
            })
        })
        .collect::<Result<Vec<_>>>()?;

    let divergent = games.iter().filter(|g| !g.reproducible).count() as u32;
    Ok(BatchResults { games, divergent })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::PlayerConfig;

    #[test]
    fn test_small_batch_reproduces() {
        let config = BatchConfig {
            scenario: Scenario {
                players: vec![PlayerConfig {
                    is_ai: false,
                    ..PlayerConfig::default()
                }],
                ..Scenario::default()
            },
            game_count: 4,
            seed_start: 100,
            steps: 100,
            with_ai: false,
        };
        let results = run_batch(&config).unwrap();
        assert_eq!(results.games.len(), 4);
        assert_eq!(results.divergent, 0);
    }
}
