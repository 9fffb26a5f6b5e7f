//! Road planning for the computer player.
//!
//! The extended plot produces, in one search, the direct road between two
//! positions *and* a bounded set of alternate solutions that terminate at an
//! intermediate existing flag or at a position where a new flag can split an
//! existing road. Pass-through solutions may ride along existing roads, but
//! once the search enters a path it must follow it until a flag (or a legal
//! split spot); solutions needing two new flags on adjacent cells are
//! rejected, and at most [`MAX_PASSTHRU_FLAGS_PER_SOLUTION`] new flags may
//! appear in one solution.
//!
//! Candidate roads are scored by tile length, convolution against the
//! straight-line distance, a castle-flag penalty, and the number of new
//! splitting flags; the winner is then built through the same game
//! operations a human uses.
//!
//! Open/closed sets are cached per start position to amortize the repeated
//! searches an AI pass makes from one building site; the cache must be
//! flushed whenever the map mutates meaningfully.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet};

use fief_core::arena::Arena;
use fief_core::flag::{Flag, FlagIndex};
use fief_core::flag_search;
use fief_core::map::{Direction, Map, MapPos, Object, Space};
use fief_core::pathfind::{heuristic_cost, step_cost, trace_existing_road, Road};

/// Maximum positions visited in one extended plot before giving up.
pub const PLOT_ROAD_MAX_POS_CONSIDERED: usize = 4000;

/// Maximum length of one plotted solution, in tiles.
pub const PLOT_ROAD_MAX_LENGTH: usize = 150;

/// Cap on new splitting flags per pass-through solution.
pub const MAX_PASSTHRU_FLAGS_PER_SOLUTION: usize = 4;

/// Cap on alternate solutions collected per plot.
pub const MAX_ALTERNATE_SOLUTIONS: usize = 10;

/// Fixed penalty for a non-direct solution whose flag path crosses the
/// castle flag.
pub const CONTAINS_CASTLE_FLAG_PENALTY: u32 = 20;

/// Max ratio of road length to straight-line distance before a candidate is
/// considered too convoluted.
pub const MAX_CONVOLUTION: f64 = 3.0;

/// Which liberties the planner may take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoadOptions {
    /// Only the direct solution is acceptable.
    pub direct: bool,
    /// New flags may split existing roads.
    pub split_roads: bool,
    /// Solutions may ride along existing roads through flags.
    pub allow_passthru: bool,
    /// Penalize solutions whose flag path crosses the castle flag.
    pub penalize_castle_flag: bool,
}

impl Default for RoadOptions {
    fn default() -> Self {
        Self {
            direct: false,
            split_roads: true,
            allow_passthru: false,
            penalize_castle_flag: true,
        }
    }
}

/// A candidate produced by the extended plot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoadCandidate {
    /// The plotted road from the start position.
    pub road: Road,
    /// Whether the endpoint needs a new (splitting) flag.
    pub needs_end_flag: bool,
    /// New splitting flags the solution rides through (endpoint excluded).
    pub passthru_flags: usize,
}

/// Scored candidate, lower is better.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScoredRoad {
    /// The candidate.
    pub candidate: RoadCandidate,
    /// Composite score.
    pub score: u32,
}

/// Snapshot of the world the planner reads; copied under the game lock and
/// released before the search runs.
#[derive(Debug, Clone)]
pub struct PlannerWorld {
    /// Copy of the map.
    pub map: Map,
    /// Copy of the flag pool.
    pub flags: Arena<Flag>,
    /// The player's castle flag index (0 when none).
    pub castle_flag: FlagIndex,
    /// Flag positions of the player's inventories.
    pub inventory_flags: Vec<MapPos>,
}

/// Whether the player could place a flag at `pos` (snapshot predicate,
/// mirrors the game's rule).
#[must_use]
pub fn can_place_flag(map: &Map, pos: MapPos, player: u8) -> bool {
    if map.get_owner(pos) != Some(player) {
        return false;
    }
    if map.get_obj(pos).space() != Space::Open {
        return false;
    }
    if map.is_in_water(pos) {
        return false;
    }
    Direction::ALL
        .into_iter()
        .all(|d| !map.has_flag(map.neighbor(pos, d)))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PlotNode {
    pos: MapPos,
    f_score: u32,
    tie_breaker: MapPos,
}

impl Ord for PlotNode {
    fn cmp(&self, other: &Self) -> Ordering {
        match other.f_score.cmp(&self.f_score) {
            Ordering::Equal => other.tie_breaker.cmp(&self.tie_breaker),
            ord => ord,
        }
    }
}

impl PartialOrd for PlotNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, Default)]
struct CacheEntry {
    closed: HashSet<MapPos>,
    g_score: HashMap<MapPos, u32>,
    came_from: HashMap<MapPos, (MapPos, Direction)>,
}

/// The AI road planner with its per-start-position plot cache.
#[derive(Debug, Default)]
pub struct RoadBuilder {
    plot_cache: HashMap<MapPos, CacheEntry>,
    cache_enabled: bool,
}

impl RoadBuilder {
    /// New planner with caching enabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            plot_cache: HashMap::new(),
            cache_enabled: true,
        }
    }

    /// Flush the plot cache; call after any mutation near a cached root
    /// (new/removed flag or path).
    pub fn invalidate_cache(&mut self) {
        self.plot_cache.clear();
    }

    /// Extended plot: the direct road plus alternate solutions.
    ///
    /// Returns the direct road (invalid when none was found within bounds)
    /// and pushes alternates into `alternates`.
    pub fn plot_road(
        &mut self,
        world: &PlannerWorld,
        player: u8,
        start: MapPos,
        end: MapPos,
        options: RoadOptions,
        alternates: &mut Vec<RoadCandidate>,
    ) -> Road {
        let map = &world.map;
        if start == end {
            return Road::default();
        }

        // Cache fast path: an earlier search from this start already
        // reached `end`, so its parent links retrace the road without
        // touching the map again. Alternates were reported by that call.
        if self.cache_enabled {
            if let Some(cached) = self.plot_cache.get(&start) {
                if cached.came_from.contains_key(&end) {
                    if let Some(solution) =
                        self.retrace(world, player, &cached.came_from, start, end, end, options)
                    {
                        return solution.road;
                    }
                }
            }
        }

        let forbidden = ForbiddenRings::around(map, &world.inventory_flags);

        let mut open: BinaryHeap<PlotNode> = BinaryHeap::new();
        let mut entry = CacheEntry::default();

        entry.g_score.insert(start, 0);
        open.push(PlotNode {
            pos: start,
            f_score: heuristic_cost(map, start, end),
            tie_breaker: start,
        });

        let mut direct = Road::default();
        let mut visited = 0usize;

        while let Some(node) = open.pop() {
            if visited >= PLOT_ROAD_MAX_POS_CONSIDERED {
                tracing::debug!(start, end, visited, "extended plot hit visit bound");
                break;
            }
            visited += 1;
            // Let other threads progress during long searches.
            if visited % 1000 == 0 {
                std::thread::yield_now();
            }
            if entry.closed.contains(&node.pos) {
                continue;
            }

            if node.pos == end {
                if let Some(solution) =
                    self.retrace(world, player, &entry.came_from, start, node.pos, end, options)
                {
                    direct = solution.road;
                }
                break;
            }

            // An intermediate existing flag, or a legal new split spot, is
            // an alternate solution in its own right.
            if node.pos != start && alternates.len() < MAX_ALTERNATE_SOLUTIONS {
                let is_existing_flag = map.has_flag(node.pos);
                let is_split_spot = !is_existing_flag
                    && map.has_any_path(node.pos)
                    && options.split_roads
                    && can_place_flag(map, node.pos, player);
                if (is_existing_flag && !options.direct) || is_split_spot {
                    if let Some(solution) =
                        self.retrace(world, player, &entry.came_from, start, node.pos, end, options)
                    {
                        alternates.push(solution);
                    }
                }
            }

            entry.closed.insert(node.pos);

            // Length bound: a solution deeper than the cap is abandoned.
            let depth = entry.g_score.get(&node.pos).copied().unwrap_or(0) / 256;
            if depth as usize >= PLOT_ROAD_MAX_LENGTH {
                continue;
            }

            let following_path = entry
                .came_from
                .get(&node.pos)
                .map(|(prev, dir)| map.has_path(*prev, *dir))
                .unwrap_or(false);

            for dir in Direction::ALL {
                let new_pos = map.neighbor(node.pos, dir);

                if !self.step_valid(
                    world,
                    player,
                    node.pos,
                    dir,
                    new_pos,
                    start,
                    end,
                    options,
                    following_path,
                    &forbidden,
                ) {
                    continue;
                }
                if entry.closed.contains(&new_pos) {
                    continue;
                }

                let cost = step_cost(map, node.pos, dir);
                let current_g = entry.g_score.get(&node.pos).copied().unwrap_or(u32::MAX);
                let tentative = current_g.saturating_add(cost);
                let known = entry.g_score.get(&new_pos).copied().unwrap_or(u32::MAX);
                if tentative < known {
                    entry.g_score.insert(new_pos, tentative);
                    entry.came_from.insert(new_pos, (node.pos, dir));
                    open.push(PlotNode {
                        pos: new_pos,
                        f_score: tentative + heuristic_cost(map, new_pos, end),
                        tie_breaker: new_pos,
                    });
                }
            }
        }

        if self.cache_enabled {
            self.plot_cache.insert(start, entry);
        }
        direct
    }

    /// One step's validity in the extended search.
    #[allow(clippy::too_many_arguments)]
    fn step_valid(
        &self,
        world: &PlannerWorld,
        player: u8,
        pos: MapPos,
        dir: Direction,
        new_pos: MapPos,
        start: MapPos,
        end: MapPos,
        options: RoadOptions,
        following_path: bool,
        forbidden: &ForbiddenRings,
    ) -> bool {
        let map = &world.map;

        if map.get_obj(new_pos).space() >= Space::Semipassable {
            return false;
        }
        if map.get_owner(new_pos) != Some(player) {
            return false;
        }
        // The AI never mixes water into its roads.
        if map.is_water_tile(pos) || map.is_water_tile(new_pos) {
            return false;
        }
        // Castle-clutter rule: both segment ends inside the same forbidden
        // ring around an inventory flag is illegal.
        if forbidden.segment_forbidden(pos, new_pos) {
            return false;
        }

        let step_on_path = map.has_path(pos, dir);
        if following_path {
            // Once riding a road, stay on it until a flag or a legal exit.
            if step_on_path {
                return true;
            }
            let can_exit = map.has_flag(pos)
                || (options.allow_passthru
                    && options.split_roads
                    && can_place_flag(map, pos, player));
            if !can_exit {
                return false;
            }
            if map.has_any_path(new_pos) && !map.has_flag(new_pos) {
                // Exiting straight onto another blocking road is illegal.
                return self.split_spot_allowed(map, player, new_pos, end, options);
            }
            return true;
        }

        if step_on_path {
            // Entering an existing road mid-plot requires pass-through.
            let from_flag_or_split = map.has_flag(pos)
                || (options.split_roads && can_place_flag(map, pos, player));
            return options.allow_passthru && from_flag_or_split;
        }

        if map.has_flag(new_pos) {
            // A foreign flag is a valid endpoint or pass-through station.
            return new_pos == end
                || new_pos != start && (options.allow_passthru || !options.direct);
        }

        if map.has_any_path(new_pos) {
            // A cell with a road but no flag: only as a splitting flag.
            return self.split_spot_allowed(map, player, new_pos, end, options);
        }

        true
    }

    fn split_spot_allowed(
        &self,
        map: &Map,
        player: u8,
        pos: MapPos,
        end: MapPos,
        options: RoadOptions,
    ) -> bool {
        if !options.split_roads {
            return false;
        }
        if !can_place_flag(map, pos, player) {
            return false;
        }
        // Flags cannot stand on adjacent cells; a split spot adjacent to
        // the end position (which may itself need a new flag) is illegal.
        if pos != end
            && Direction::ALL
                .into_iter()
                .any(|d| map.neighbor(pos, d) == end)
            && !map.has_flag(end)
        {
            return false;
        }
        true
    }

    /// Trace a solution back from `goal` and sanity-check its pass-through
    /// structure.
    #[allow(clippy::too_many_arguments)]
    fn retrace(
        &self,
        world: &PlannerWorld,
        player: u8,
        came_from: &HashMap<MapPos, (MapPos, Direction)>,
        start: MapPos,
        goal: MapPos,
        end: MapPos,
        _options: RoadOptions,
    ) -> Option<RoadCandidate> {
        let map = &world.map;
        let mut rev_dirs = Vec::new();
        let mut pos = goal;
        let mut passthru_flags = 0usize;
        let mut last_new_flag: Option<MapPos> = None;

        while pos != start {
            let (prev, dir) = came_from.get(&pos).copied()?;

            // A cell with a road and no flag that the solution rides
            // through needs a new splitting flag there.
            if pos != goal && !map.has_flag(pos) && map.has_any_path(pos) {
                if !can_place_flag(map, pos, player) {
                    return None;
                }
                passthru_flags += 1;
                if passthru_flags > MAX_PASSTHRU_FLAGS_PER_SOLUTION {
                    return None;
                }
                // No two new flags on adjacent cells; nor adjacent to a
                // new endpoint flag.
                let adjacent_conflict = Direction::ALL.into_iter().any(|d| {
                    let n = map.neighbor(pos, d);
                    Some(n) == last_new_flag || (n == end && !map.has_flag(end))
                });
                if adjacent_conflict {
                    return None;
                }
                last_new_flag = Some(pos);
            }

            rev_dirs.push(dir);
            pos = prev;
            if rev_dirs.len() > PLOT_ROAD_MAX_LENGTH {
                return None;
            }
        }

        let mut road = Road::start(start);
        for dir in rev_dirs.into_iter().rev() {
            road.extend(dir);
        }
        if !road.is_valid() {
            return None;
        }
        Some(RoadCandidate {
            needs_end_flag: !map.has_flag(goal),
            passthru_flags,
            road,
        })
    }

    /// Score candidates against a target flag position; lower wins.
    ///
    /// The score combines tile length, flag distance from the candidate's
    /// endpoint to the target, new splitting flags and the castle-flag
    /// penalty. Candidates that exceed the convolution cap are dropped.
    #[must_use]
    pub fn score_candidates(
        &self,
        world: &PlannerWorld,
        candidates: Vec<RoadCandidate>,
        start: MapPos,
        target_flag_pos: MapPos,
        options: RoadOptions,
    ) -> Vec<ScoredRoad> {
        let map = &world.map;
        let mut scored = Vec::new();
        for candidate in candidates {
            let Some(end_pos) = candidate.road.end(map) else {
                continue;
            };
            let tiles = candidate.road.length() as u32;

            // Convolution: an overlong road relative to the crow-flight
            // distance is clutter no matter its score.
            let crow = map.hex_dist(start, end_pos).max(1);
            if f64::from(tiles) / f64::from(crow) > MAX_CONVOLUTION {
                continue;
            }

            // Distance from the candidate's endpoint onward to the target
            // over the existing graph.
            let (onward_flags, onward_tiles, via_castle) =
                self.onward_score(world, end_pos, target_flag_pos);
            let Some(onward_flags) = onward_flags else {
                // Endpoint cannot reach the target at all; a new endpoint
                // flag will be linked by this very road, so only solutions
                // ending at the target position itself stay valid.
                if end_pos != target_flag_pos {
                    continue;
                }
                scored.push(ScoredRoad {
                    score: tiles + candidate.passthru_flags as u32 * 2,
                    candidate,
                });
                continue;
            };

            let mut score = tiles
                + onward_tiles
                + onward_flags * 2
                + candidate.passthru_flags as u32 * 2
                + u32::from(candidate.needs_end_flag);
            if options.penalize_castle_flag && via_castle && target_flag_pos != self_castle_pos(world)
            {
                score += CONTAINS_CASTLE_FLAG_PENALTY;
            }
            scored.push(ScoredRoad { score, candidate });
        }
        scored.sort_by_key(|s| s.score);
        scored
    }

    /// Flag-path distance from an endpoint position to the target flag
    /// position: (flag count, tile count, crosses castle flag).
    fn onward_score(
        &self,
        world: &PlannerWorld,
        end_pos: MapPos,
        target_flag_pos: MapPos,
    ) -> (Option<u32>, u32, bool) {
        if end_pos == target_flag_pos {
            return (Some(0), 0, false);
        }
        let map = &world.map;
        let flags = &world.flags;

        // A splitting endpoint is scored through its best adjacent flag.
        let end_flag = if map.has_flag(end_pos) {
            Some(map.get_obj_index(end_pos))
        } else {
            None
        };
        let target_flag = if map.has_flag(target_flag_pos) {
            Some(map.get_obj_index(target_flag_pos))
        } else {
            None
        };
        let (Some(from), Some(to)) = (end_flag, target_flag) else {
            return (None, 0, false);
        };

        let Some(path) = flag_search::flag_path(flags, from, to) else {
            return (None, 0, false);
        };
        let mut tiles = 0u32;
        for pair in path.windows(2) {
            if let Some(flag) = flags.get(pair[0]) {
                if let Some(dir) = flag.dir_to(pair[1]) {
                    tiles += trace_existing_road(map, flag.pos(), dir).length() as u32;
                }
            }
        }
        let via_castle = path.contains(&world.castle_flag);
        (Some(path.len() as u32 - 1), tiles, via_castle)
    }
}

fn self_castle_pos(world: &PlannerWorld) -> MapPos {
    world
        .flags
        .get(world.castle_flag)
        .map_or(MapPos::MAX, Flag::pos)
}

/// The two forbidden rings around every inventory flag.
///
/// Roads may connect ring 1 to ring 2, but a segment with both ends in the
/// same ring of the same inventory would wall the entrance off.
#[derive(Debug, Default)]
struct ForbiddenRings {
    ring1: HashSet<MapPos>,
    ring2: HashSet<MapPos>,
}

impl ForbiddenRings {
    fn around(map: &Map, inventory_flags: &[MapPos]) -> Self {
        let mut rings = Self::default();
        for flag_pos in inventory_flags {
            let spiral = map.spiral(*flag_pos, 2);
            for pos in &spiral[1..7] {
                rings.ring1.insert(*pos);
            }
            for pos in &spiral[7..] {
                rings.ring2.insert(*pos);
            }
        }
        rings
    }

    fn segment_forbidden(&self, a: MapPos, b: MapPos) -> bool {
        (self.ring1.contains(&a) && self.ring1.contains(&b))
            || (self.ring2.contains(&a) && self.ring2.contains(&b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fief_core::map::Terrain;

    fn owned_world(player: u8) -> PlannerWorld {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            map.set_height(pos, 10);
            map.set_owner(pos, Some(player));
        }
        PlannerWorld {
            map,
            flags: Arena::new("flag", 64),
            castle_flag: 0,
            inventory_flags: Vec::new(),
        }
    }

    fn add_flag(world: &mut PlannerWorld, pos: MapPos) -> FlagIndex {
        let idx = world.flags.insert(Flag::new(pos, 0)).unwrap();
        world.map.set_obj(pos, Object::Flag, idx);
        idx
    }

    #[test]
    fn test_direct_plot() {
        let mut world = owned_world(0);
        let start = world.map.pos(10, 10);
        let end = world.map.pos(16, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, end);

        let mut alternates = Vec::new();
        let mut rb = RoadBuilder::new();
        let direct = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates,
        );
        assert!(direct.is_valid());
        assert_eq!(direct.end(&world.map), Some(end));
    }

    #[test]
    fn test_alternate_at_existing_flag() {
        let mut world = owned_world(0);
        let start = world.map.pos(10, 10);
        let end = world.map.pos(20, 10);
        let mid = world.map.pos(14, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, end);
        add_flag(&mut world, mid);

        let mut alternates = Vec::new();
        let mut rb = RoadBuilder::new();
        let _ = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates,
        );
        assert!(
            alternates
                .iter()
                .any(|c| c.road.end(&world.map) == Some(mid) && !c.needs_end_flag),
            "the intermediate flag should appear as an alternate solution"
        );
    }

    #[test]
    fn test_split_spot_alternate() {
        let mut world = owned_world(0);
        // A north-south road crossing the plot corridor.
        let road_top = world.map.pos(14, 6);
        let mut pos = road_top;
        let a = add_flag(&mut world, road_top);
        for _ in 0..8 {
            world.map.set_path(pos, Direction::DownRight, true);
            pos = world.map.neighbor(pos, Direction::DownRight);
        }
        let b = add_flag(&mut world, pos);
        let _ = (a, b);

        let start = world.map.pos(10, 10);
        let end = world.map.pos(20, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, end);

        let mut alternates = Vec::new();
        let mut rb = RoadBuilder::new();
        let _ = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates,
        );
        assert!(
            alternates.iter().any(|c| c.needs_end_flag),
            "a splitting-flag solution should be found on the crossing road"
        );
    }

    #[test]
    fn test_direct_mode_suppresses_alternates() {
        let mut world = owned_world(0);
        let start = world.map.pos(10, 10);
        let end = world.map.pos(18, 10);
        let mid = world.map.pos(13, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, end);
        add_flag(&mut world, mid);

        let options = RoadOptions {
            direct: true,
            split_roads: false,
            allow_passthru: false,
            penalize_castle_flag: false,
        };
        let mut alternates = Vec::new();
        let mut rb = RoadBuilder::new();
        let _ = rb.plot_road(&world, 0, start, end, options, &mut alternates);
        assert!(alternates.is_empty());
    }

    #[test]
    fn test_forbidden_ring_segments_rejected() {
        let map = {
            let mut map = Map::new(3);
            for pos in 0..map.cell_count() {
                map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            }
            map
        };
        let inv = map.pos(10, 10);
        let rings = ForbiddenRings::around(&map, &[inv]);
        let ring1_a = map.neighbor(inv, Direction::Right);
        let ring1_b = map.neighbor(ring1_a, Direction::Down);
        // Both in ring 1: forbidden.
        assert!(rings.segment_forbidden(ring1_a, ring1_b));
        // Ring 1 to ring 2: allowed.
        let ring2 = map.neighbor(ring1_a, Direction::Right);
        assert!(!rings.segment_forbidden(ring1_a, ring2));
    }

    #[test]
    fn test_scoring_prefers_shorter_road() {
        let mut world = owned_world(0);
        let start = world.map.pos(10, 10);
        let target = world.map.pos(16, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, target);

        let mut short = Road::start(start);
        for _ in 0..6 {
            short.extend(Direction::Right);
        }
        let mut long = Road::start(start);
        for _ in 0..3 {
            long.extend(Direction::DownRight);
        }
        for _ in 0..6 {
            long.extend(Direction::Right);
        }
        for _ in 0..3 {
            long.extend(Direction::Up);
        }

        let rb = RoadBuilder::new();
        let scored = rb.score_candidates(
            &world,
            vec![
                RoadCandidate {
                    road: long,
                    needs_end_flag: false,
                    passthru_flags: 0,
                },
                RoadCandidate {
                    road: short.clone(),
                    needs_end_flag: false,
                    passthru_flags: 0,
                },
            ],
            start,
            target,
            RoadOptions::default(),
        );
        assert_eq!(scored[0].candidate.road, short);
    }

    #[test]
    fn test_cache_flush() {
        let mut world = owned_world(0);
        let start = world.map.pos(10, 10);
        let end = world.map.pos(15, 10);
        add_flag(&mut world, start);
        add_flag(&mut world, end);

        let mut rb = RoadBuilder::new();
        let mut alternates = Vec::new();
        let first = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates,
        );
        assert!(first.is_valid());

        // Cached rerun against the same world gives the same answer.
        let mut alternates2 = Vec::new();
        let second = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates2,
        );
        assert_eq!(first, second);

        rb.invalidate_cache();
        let mut alternates3 = Vec::new();
        let third = rb.plot_road(
            &world,
            0,
            start,
            end,
            RoadOptions::default(),
            &mut alternates3,
        );
        assert_eq!(first, third);
    }
}
