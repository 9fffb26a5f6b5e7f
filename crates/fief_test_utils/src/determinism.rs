//! Determinism testing utilities.
//!
//! The simulation must replay byte-for-byte from a seed and input trace.
//! Sources of non-determinism this harness exists to catch:
//!
//! - **HashMap iteration order**: entity pools iterate in index order; any
//!   traversal of a raw `HashMap` in update code is a bug.
//! - **System randomness**: every draw goes through the game's seeded
//!   generator, under the game lock.
//! - **Thread interleaving**: AI mutations must land between ticks, never
//!   during one.
//!
//! Three levels of checks: repeated runs must hash identically, parallel
//! runs must hash identically, and serialization must round-trip exactly.

use std::thread;

use fief_core::game::Game;
use fief_core::save;

/// Result of a determinism test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeterminismResult {
    /// Whether all runs produced identical results.
    pub is_deterministic: bool,
    /// Final state hash of each run.
    pub hashes: Vec<u64>,
    /// Number of update steps simulated per run.
    pub steps: u64,
}

impl DeterminismResult {
    /// Assert that the runs matched, with a detailed message otherwise.
    ///
    /// # Panics
    ///
    /// Panics when the runs produced different hashes.
    pub fn assert_deterministic(&self) {
        if !self.is_deterministic {
            let mut unique = self.hashes.clone();
            unique.sort_unstable();
            unique.dedup();
            panic!(
                "Simulation is non-deterministic!\n\
                 Runs: {}\n\
                 Steps: {}\n\
                 Unique hashes: {} (expected 1)\n\
                 All hashes: {:?}",
                self.hashes.len(),
                self.steps,
                unique.len(),
                self.hashes
            );
        }
    }
}

/// Run a scenario `runs` times for `steps` update calls each and compare
/// final state hashes.
pub fn verify_determinism<F>(runs: usize, steps: u64, setup: F) -> DeterminismResult
where
    F: Fn() -> Game,
{
    let mut hashes = Vec::with_capacity(runs);
    for _ in 0..runs {
        let mut game = setup();
        for _ in 0..steps {
            game.update();
        }
        hashes.push(game.state_hash());
    }
    DeterminismResult {
        is_deterministic: hashes.windows(2).all(|w| w[0] == w[1]),
        hashes,
        steps,
    }
}

/// Run the scenario in parallel threads; scheduling noise must not leak
/// into the simulation.
pub fn verify_parallel_determinism<F>(sims: usize, steps: u64, setup: F) -> DeterminismResult
where
    F: Fn() -> Game + Sync,
{
    let hashes: Vec<u64> = thread::scope(|s| {
        let handles: Vec<_> = (0..sims)
            .map(|_| {
                s.spawn(|| {
                    let mut game = setup();
                    for _ in 0..steps {
                        game.update();
                    }
                    game.state_hash()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });
    DeterminismResult {
        is_deterministic: hashes.windows(2).all(|w| w[0] == w[1]),
        hashes,
        steps,
    }
}

/// Find the first update step where two runs of the scenario diverge, or
/// `None` when they never do.
pub fn find_first_divergence<F>(steps: u64, setup: F) -> Option<u64>
where
    F: Fn() -> Game,
{
    let mut a = setup();
    let mut b = setup();
    if a.state_hash() != b.state_hash() {
        return Some(0);
    }
    for step in 1..=steps {
        a.update();
        b.update();
        if a.state_hash() != b.state_hash() {
            return Some(step);
        }
    }
    None
}

/// Verify that save/load preserves state exactly after `steps` updates.
pub fn verify_serialization_round_trip<F>(steps: u64, setup: F) -> bool
where
    F: Fn() -> Game,
{
    let mut game = setup();
    for _ in 0..steps {
        game.update();
    }

    let Ok(bytes) = save::save_binary(&game) else {
        return false;
    };
    let Ok(binary_restored) = save::load_binary(&bytes) else {
        return false;
    };
    let Ok(text) = save::save_text(&game) else {
        return false;
    };
    let Ok(text_restored) = save::load_text(&text) else {
        return false;
    };

    game == binary_restored && game == text_restored
}

/// Proptest strategies for simulation inputs.
pub mod strategies {
    use fief_core::map::Direction;
    use fief_core::resource::Resource;
    use proptest::prelude::*;

    /// A map size class the generator accepts.
    pub fn arb_map_size() -> impl Strategy<Value = u32> {
        3u32..=5
    }

    /// Any seed.
    pub fn arb_seed() -> impl Strategy<Value = u64> {
        any::<u64>()
    }

    /// One of the six hex directions.
    pub fn arb_direction() -> impl Strategy<Value = Direction> {
        (0u8..6).prop_map(|i| Direction::from_index(i).unwrap())
    }

    /// A short road as a direction sequence.
    pub fn arb_road_dirs(max_len: usize) -> impl Strategy<Value = Vec<Direction>> {
        proptest::collection::vec(arb_direction(), 1..max_len)
    }

    /// Any resource kind.
    pub fn arb_resource() -> impl Strategy<Value = Resource> {
        (0usize..fief_core::resource::RESOURCE_COUNT)
            .prop_map(|i| Resource::from_index(i).unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;

    #[test]
    fn test_empty_game_determinism() {
        verify_determinism(3, 100, fixtures::flat_game).assert_deterministic();
    }

    #[test]
    fn test_castle_game_determinism() {
        verify_determinism(3, 300, || fixtures::game_with_castle().0).assert_deterministic();
    }

    #[test]
    fn test_transport_game_determinism() {
        verify_determinism(2, 500, || fixtures::game_with_straight_road(3).0)
            .assert_deterministic();
    }

    #[test]
    fn test_parallel_runs_match() {
        verify_parallel_determinism(4, 200, || fixtures::game_with_straight_road(3).0)
            .assert_deterministic();
    }

    #[test]
    fn test_no_divergence_in_long_run() {
        assert_eq!(
            find_first_divergence(400, || fixtures::game_with_castle().0),
            None
        );
    }

    #[test]
    fn test_serialization_round_trip_after_activity() {
        assert!(verify_serialization_round_trip(250, || {
            fixtures::game_with_straight_road(4).0
        }));
    }
}
