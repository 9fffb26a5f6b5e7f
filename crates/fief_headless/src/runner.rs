//! The headless game runner.
//!
//! Owns the hosted game, wires AI drivers to the computer slots and drives
//! the tick loop. Two modes: `run_steps` steps the simulation as fast as it
//! goes (CI, batch), `run_timed` emulates the windowed game's fixed
//! real-time step interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use fief_ai::AiPlayer;
use fief_core::error::Result;
use fief_core::save;
use fief_core::{GameHost, GameRef};

use crate::scenario::Scenario;

/// Milliseconds between step events in timed mode, as in the windowed game.
pub const TICK_LENGTH_MS: u64 = 20;

/// Runner configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Scenario to set up.
    pub scenario: Scenario,
    /// Steps to simulate (0 = until stopped).
    pub max_steps: u64,
    /// Drive AI players.
    pub with_ai: bool,
    /// Write the final state here.
    pub save_path: Option<PathBuf>,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            scenario: Scenario::default(),
            max_steps: 5_000,
            with_ai: true,
            save_path: None,
        }
    }
}

/// Outcome of a headless run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Final tick.
    pub tick: u32,
    /// Steps simulated.
    pub steps: u64,
    /// Final state hash.
    pub state_hash: u64,
    /// Per-player land area.
    pub land_area: Vec<u32>,
    /// Per-player completed building total.
    pub buildings: Vec<u32>,
    /// Wall-clock duration of the run.
    pub elapsed_ms: u64,
}

/// A hosted game plus its AI drivers.
pub struct GameRunner {
    host: GameRef,
    ai_handles: Vec<JoinHandle<()>>,
}

impl GameRunner {
    /// Set up the game and (optionally) its AI drivers.
    pub fn new(config: &RunConfig) -> Result<Self> {
        let game = config.scenario.build_game()?;
        let host: GameRef = Arc::new(GameHost::new(game));

        let mut ai_handles = Vec::new();
        if config.with_ai {
            for slot in config.scenario.ai_slots() {
                ai_handles.push(AiPlayer::spawn(host.clone(), slot));
            }
        }
        Ok(Self { host, ai_handles })
    }

    /// The hosted game.
    #[must_use]
    pub fn host(&self) -> &GameRef {
        &self.host
    }

    /// Step the simulation `steps` times as fast as possible.
    pub fn run_steps(&self, steps: u64) -> RunSummary {
        let started = Instant::now();
        for _ in 0..steps {
            let mut game = self.host.lock();
            game.update();
            game.drain_sounds();
        }
        self.summary(steps, started)
    }

    /// Drive the simulation at the windowed game's fixed step interval.
    pub fn run_timed(&self, steps: u64) -> RunSummary {
        let started = Instant::now();
        let interval = Duration::from_millis(TICK_LENGTH_MS);
        let mut next = Instant::now();
        for _ in 0..steps {
            next += interval;
            {
                let mut game = self.host.lock();
                game.update();
                game.drain_sounds();
            }
            let now = Instant::now();
            if next > now {
                std::thread::sleep(next - now);
            }
        }
        self.summary(steps, started)
    }

    fn summary(&self, steps: u64, started: Instant) -> RunSummary {
        let game = self.host.lock();
        let players = game.player_indices();
        RunSummary {
            tick: game.tick(),
            steps,
            state_hash: game.state_hash(),
            land_area: players
                .iter()
                .map(|p| game.player(*p).map_or(0, |p| p.total_land_area))
                .collect(),
            buildings: players
                .iter()
                .map(|p| {
                    game.player(*p)
                        .map_or(0, |p| p.completed_building_count.iter().sum())
                })
                .collect(),
            elapsed_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Write the current state to a save file.
    pub fn save(&self, path: &std::path::Path) -> Result<()> {
        let game = self.host.lock();
        save::save_to_file(&game, path)
    }

    /// Stop the AI drivers and wait for them to exit.
    pub fn shutdown(mut self) {
        self.host.request_ai_stop();
        for handle in self.ai_handles.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Run a configuration to completion and return its summary.
pub fn run(config: &RunConfig) -> Result<RunSummary> {
    let runner = GameRunner::new(config)?;
    let summary = runner.run_steps(config.max_steps);
    if let Some(path) = &config.save_path {
        runner.save(path)?;
    }
    runner.shutdown();
    tracing::info!(
        tick = summary.tick,
        hash = summary.state_hash,
        elapsed_ms = summary.elapsed_ms,
        "headless run finished"
    );
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::PlayerConfig;

    fn quick_config(with_ai: bool) -> RunConfig {
        RunConfig {
            scenario: Scenario {
                players: vec![PlayerConfig {
                    is_ai: with_ai,
                    ..PlayerConfig::default()
                }],
                ..Scenario::default()
            },
            max_steps: 200,
            with_ai,
            save_path: None,
        }
    }

    #[test]
    fn test_run_without_ai_is_deterministic() {
        let a = run(&quick_config(false)).unwrap();
        let b = run(&quick_config(false)).unwrap();
        assert_eq!(a.state_hash, b.state_hash);
        assert_eq!(a.tick, b.tick);
    }

    #[test]
    fn test_run_with_ai_finishes_cleanly() {
        let summary = run(&quick_config(true)).unwrap();
        assert_eq!(summary.steps, 200);
    }

    #[test]
    fn test_save_from_runner() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.sav");
        let config = RunConfig {
            save_path: Some(path.clone()),
            ..quick_config(false)
        };
        run(&config).unwrap();
        let game = fief_core::save::load_from_file(&path).unwrap();
        assert_eq!(game.tick(), 400);
    }
}
