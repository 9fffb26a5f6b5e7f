//! Tick-loop benchmarks.

use criterion::{criterion_group, criterion_main, Criterion};
use fief_core::game::Game;
use fief_core::map::{Direction, Map, Terrain};
use fief_core::pathfind::Road;

fn flat_game() -> Game {
    let mut map = Map::new(3);
    for pos in 0..map.cell_count() {
        map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
        map.set_height(pos, 10);
    }
    Game::with_map(map, 1)
}

fn bench_empty_tick(c: &mut Criterion) {
    let mut game = flat_game();
    c.bench_function("tick_empty", |b| {
        b.iter(|| {
            game.update();
        });
    });
}

fn bench_economy_tick(c: &mut Criterion) {
    let mut game = flat_game();
    let player = game.add_player(12, 64, 35, 30, 40).unwrap();
    let castle_pos = game.map().pos(6, 6);
    game.build_castle(castle_pos, player);
    let mut pos = game.map().neighbor(castle_pos, Direction::DownRight);
    let start = pos;
    for _ in 0..8 {
        pos = game.map().neighbor(pos, Direction::Right);
    }
    game.build_flag(pos, player);
    let mut road = Road::start(start);
    for _ in 0..8 {
        road.extend(Direction::Right);
    }
    game.build_road(&road, player);
    // Warm up until traffic is flowing.
    for _ in 0..500 {
        game.update();
    }

    c.bench_function("tick_economy", |b| {
        b.iter(|| {
            game.update();
        });
    });
}

fn bench_pathfind(c: &mut Criterion) {
    let mut map = Map::new(4);
    for pos in 0..map.cell_count() {
        map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
        map.set_owner(pos, Some(0));
    }
    let start = map.pos(10, 10);
    let end = map.pos(60, 50);
    c.bench_function("plot_road_long", |b| {
        b.iter(|| fief_core::pathfind::plot_road(&map, 0, start, end, false));
    });
}

criterion_group!(benches, bench_empty_tick, bench_economy_tick, bench_pathfind);
criterion_main!(benches);
