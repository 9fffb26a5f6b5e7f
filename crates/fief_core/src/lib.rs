//! # Fief Core
//!
//! Deterministic simulation core for a real-time economic and military
//! strategy game: a hex-tiled world of castles, flags, roads, serfs and
//! the transport network that binds them.
//!
//! This crate contains **only** deterministic logic:
//! - No rendering
//! - No IO beyond serialization
//! - No system randomness (one seeded generator inside [`game::Game`])
//!
//! This separation enables:
//! - Headless runs and CI verification
//! - Byte-identical replays from a seed and input trace
//! - AI drivers that observe and mutate through the same operations a
//!   human player uses
//!
//! ## Crate Structure
//!
//! - [`map`] - toroidal hex grid, terrain, objects and the map generator
//! - [`pathfind`] - tile-level A* road plotting
//! - [`flag`] / [`flag_search`] - the road-network graph and its searches
//! - [`inventory`] / [`building`] / [`serf`] / [`player`] - the entities
//! - [`game`] - the owning aggregate and tick loop
//! - [`save`] - textual (RON) and binary (bincode) round-trip codecs

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod arena;
pub mod building;
mod building_update;
pub mod error;
pub mod flag;
pub mod flag_search;
pub mod game;
pub mod inventory;
pub mod map;
pub mod pathfind;
pub mod player;
pub mod random;
pub mod resource;
pub mod save;
pub mod serf;
mod serf_update;
mod transport;

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Re-export commonly used types.
pub mod prelude {
    pub use crate::building::{Building, BuildingIndex, BuildingType};
    pub use crate::error::{GameError, Result};
    pub use crate::flag::{Flag, FlagIndex};
    pub use crate::game::{Game, GameOptions, Sound};
    pub use crate::inventory::{Inventory, InventoryIndex, InventoryMode};
    pub use crate::map::{Direction, Map, MapGeneratorParams, MapPos, Object, Terrain};
    pub use crate::pathfind::Road;
    pub use crate::player::Player;
    pub use crate::random::Random;
    pub use crate::resource::Resource;
    pub use crate::serf::{Serf, SerfIndex, SerfState, SerfType};
    pub use crate::{GameHost, GameRef};
}

/// Shared handle around a [`game::Game`] for the simulation thread, the AI
/// drivers and the renderer.
///
/// All entity-state mutation is serialized through the single mutex; the AI
/// control flags live outside it so a driver can check for shutdown without
/// taking the lock.
#[derive(Debug)]
pub struct GameHost {
    game: Mutex<game::Game>,
    stop_ai: AtomicBool,
    ai_threads: AtomicU32,
}

impl GameHost {
    /// Wrap a game for shared access.
    #[must_use]
    pub fn new(game: game::Game) -> Self {
        Self {
            game: Mutex::new(game),
            stop_ai: AtomicBool::new(false),
            ai_threads: AtomicU32::new(0),
        }
    }

    /// Take the game lock.
    ///
    /// # Panics
    ///
    /// Panics if a previous holder poisoned the lock.
    pub fn lock(&self) -> MutexGuard<'_, game::Game> {
        self.game.lock().expect("game mutex poisoned")
    }

    /// Ask every AI driver to exit at its next phase boundary.
    pub fn request_ai_stop(&self) {
        self.stop_ai.store(true, Ordering::SeqCst);
    }

    /// Whether AI drivers should exit.
    #[must_use]
    pub fn should_ai_stop(&self) -> bool {
        self.stop_ai.load(Ordering::SeqCst)
    }

    /// Record an AI driver starting.
    pub fn ai_thread_starting(&self) {
        self.ai_threads.fetch_add(1, Ordering::SeqCst);
    }

    /// Record an AI driver exiting.
    pub fn ai_thread_exiting(&self) {
        self.ai_threads.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of live AI drivers.
    #[must_use]
    pub fn ai_thread_count(&self) -> u32 {
        self.ai_threads.load(Ordering::SeqCst)
    }
}

/// Shared reference to a hosted game.
pub type GameRef = Arc<GameHost>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Map, Terrain};

    #[test]
    fn test_host_lock_and_stop_flags() {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
        }
        let host = GameHost::new(game::Game::with_map(map, 1));

        {
            let mut game = host.lock();
            game.update();
            assert_eq!(game.const_tick(), 1);
        }

        assert!(!host.should_ai_stop());
        host.ai_thread_starting();
        assert_eq!(host.ai_thread_count(), 1);
        host.request_ai_stop();
        assert!(host.should_ai_stop());
        host.ai_thread_exiting();
        assert_eq!(host.ai_thread_count(), 0);
    }
}
