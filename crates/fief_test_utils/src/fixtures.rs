//! Game fixtures used across the workspace's test suites.

use fief_core::game::Game;
use fief_core::map::{Direction, Map, MapPos, Terrain};
use fief_core::pathfind::Road;

/// The reference seed used by the end-to-end scenarios.
pub const SCENARIO_SEED: u64 = 8_667_715_887_436_237;

/// Flat all-grass map of the given size class, height 10 everywhere.
#[must_use]
pub fn flat_map(size: u32) -> Map {
    let mut map = Map::new(size);
    for pos in 0..map.cell_count() {
        map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
        map.set_height(pos, 10);
    }
    map
}

/// Game on a flat size-3 map with the reference seed.
#[must_use]
pub fn flat_game() -> Game {
    Game::with_map(flat_map(3), SCENARIO_SEED)
}

/// Game on a flat map with one player (the default setup values) and a
/// castle at (6,6). Returns the game and the player slot.
#[must_use]
pub fn game_with_castle() -> (Game, u8) {
    let mut game = flat_game();
    let player = game
        .add_player(12, 64, 35, 30, 40)
        .expect("player slot available");
    let pos = game.map().pos(6, 6);
    assert!(game.build_castle(pos, player), "castle placement must succeed");
    (game, player)
}

/// Extend `game_with_castle` with a straight road east from the castle flag
/// to a new flag `len` tiles away. Returns (game, player, castle flag index,
/// far flag index).
#[must_use]
pub fn game_with_straight_road(len: usize) -> (Game, u8, u32, u32) {
    let (mut game, player) = game_with_castle();
    let castle_flag_pos = game
        .map()
        .neighbor(game.map().pos(6, 6), Direction::DownRight);
    let mut far = castle_flag_pos;
    for _ in 0..len {
        far = game.map().neighbor(far, Direction::Right);
    }
    assert!(game.build_flag(far, player));
    let mut road = Road::start(castle_flag_pos);
    for _ in 0..len {
        road.extend(Direction::Right);
    }
    assert!(game.build_road(&road, player));
    let castle_flag_idx = game.map().get_obj_index(castle_flag_pos);
    let far_flag_idx = game.map().get_obj_index(far);
    (game, player, castle_flag_idx, far_flag_idx)
}

/// Walk `n` steps from `pos` in `dir`.
#[must_use]
pub fn walk(map: &Map, mut pos: MapPos, dir: Direction, n: usize) -> MapPos {
    for _ in 0..n {
        pos = map.neighbor(pos, dir);
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixture_castle_game_is_valid() {
        let (game, player) = game_with_castle();
        assert!(game.player(player).unwrap().has_castle);
        game.validate().unwrap();
    }

    #[test]
    fn test_fixture_road_links_flags() {
        let (game, _, castle_flag, far_flag) = game_with_straight_road(3);
        let flag = game.flags().get(castle_flag).unwrap();
        assert_eq!(flag.edge(Direction::Right).unwrap().endpoint, far_flag);
    }
}
