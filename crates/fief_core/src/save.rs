//! Save and restore.
//!
//! Two codecs over the same serde model: RON for the human-readable save
//! format and bincode for compact snapshots (determinism harness, batch
//! runs). The round-trip contract is exact: `load(save(g)) == g` on every
//! piece of simulation state.

use std::path::Path;

use crate::error::{GameError, Result};
use crate::game::Game;

/// Serialize a game to the textual save format.
pub fn save_text(game: &Game) -> Result<String> {
    ron::ser::to_string_pretty(game, ron::ser::PrettyConfig::default())
        .map_err(|e| GameError::SaveFailed(e.to_string()))
}

/// Restore a game from the textual save format.
pub fn load_text(data: &str) -> Result<Game> {
    ron::from_str(data).map_err(|e| GameError::LoadFailed(e.to_string()))
}

/// Serialize a game to a compact binary snapshot.
pub fn save_binary(game: &Game) -> Result<Vec<u8>> {
    bincode::serialize(game).map_err(|e| GameError::SaveFailed(e.to_string()))
}

/// Restore a game from a binary snapshot.
pub fn load_binary(data: &[u8]) -> Result<Game> {
    bincode::deserialize(data).map_err(|e| GameError::LoadFailed(e.to_string()))
}

/// Write a textual save to disk.
pub fn save_to_file(game: &Game, path: &Path) -> Result<()> {
    let text = save_text(game)?;
    std::fs::write(path, text).map_err(|e| GameError::SaveFailed(e.to_string()))
}

/// Load a textual save from disk. A failed load leaves the caller's current
/// game untouched; this only ever returns a fresh instance.
pub fn load_from_file(path: &Path) -> Result<Game> {
    let text = std::fs::read_to_string(path).map_err(|e| GameError::LoadFailed(e.to_string()))?;
    load_text(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Map, Terrain};

    fn sample_game() -> Game {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            map.set_height(pos, 10);
        }
        let mut game = Game::with_map(map, 8_667_715_887_436_237);
        let player = game.add_player(12, 64, 35, 30, 40).unwrap();
        let pos = game.map().pos(6, 6);
        assert!(game.build_castle(pos, player));
        for _ in 0..50 {
            game.update();
        }
        game
    }

    #[test]
    fn test_text_round_trip() {
        let game = sample_game();
        let text = save_text(&game).unwrap();
        let restored = load_text(&text).unwrap();
        assert_eq!(game, restored);
    }

    #[test]
    fn test_binary_round_trip() {
        let game = sample_game();
        let bytes = save_binary(&game).unwrap();
        let restored = load_binary(&bytes).unwrap();
        assert_eq!(game, restored);
        assert_eq!(game.state_hash(), restored.state_hash());
    }

    #[test]
    fn test_restored_game_continues_identically() {
        let mut original = sample_game();
        let mut restored = load_binary(&save_binary(&original).unwrap()).unwrap();
        for _ in 0..200 {
            original.update();
            restored.update();
        }
        assert_eq!(original, restored);
    }

    #[test]
    fn test_malformed_text_is_rejected() {
        assert!(load_text("not a save").is_err());
    }
}
