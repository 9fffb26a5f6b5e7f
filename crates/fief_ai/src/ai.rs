//! The computer player.
//!
//! One `AiPlayer` drives one player slot from its own thread. Each loop
//! iteration runs a fixed sequence of phases: place the castle (first loop),
//! consider capitulation, build out the economy category by category,
//! maintenance, geologists, offense and priority tuning. Every phase takes
//! the game mutex, works on a snapshot or issues the same mutating
//! operations a human player would, releases the lock and sleeps for a
//! wall-clock interval scaled down as the game speed rises.

use std::collections::{HashMap, HashSet};
use std::thread::JoinHandle;
use std::time::Duration;

use fief_core::building::{BuildingIndex, BuildingType};
use fief_core::flag::FlagIndex;
use fief_core::map::{Direction, MapPos, Mineral, Object};
use fief_core::pathfind::Road;
use fief_core::resource::Resource;
use fief_core::GameRef;

use crate::roadbuilder::{PlannerWorld, RoadBuilder, RoadCandidate, RoadOptions};

// ---------------------------------------------------------------------
// Tuning
// ---------------------------------------------------------------------

/// Don't convert serfs to knights below this population.
pub const SERFS_MIN: u32 = 5;

/// Attack regardless of score when morale (percent) exceeds this.
pub const MORALE_MAX: u32 = 75;

/// Never attack below this morale (percent) except for prize targets.
pub const MORALE_MIN: u32 = 35;

/// Attackers must outnumber defenders by this factor.
pub const MIN_KNIGHT_RATIO_ATTACK: f64 = 2.0;

/// Knight-count bands for occupation management.
pub const KNIGHTS_MIN: u32 = 3;
/// Middle knight band.
pub const KNIGHTS_MED: u32 = 18;
/// Upper knight band.
pub const KNIGHTS_MAX: u32 = 50;

/// Build a sawmill and lumberjacks while planks are below this.
pub const PLANKS_MAX: u32 = 35;
/// Suspend other construction while planks are below this.
pub const PLANKS_MIN: u32 = 8;
/// Keep a stonecutter while stones are below this.
pub const STONES_MAX: u32 = 25;
/// Food chain target.
pub const FOOD_MAX: u32 = 40;
/// Coal stock cap before coal mines pause.
pub const COAL_MAX: u32 = 50;
/// Iron ore stock cap.
pub const IRON_ORE_MAX: u32 = 25;
/// Gold ore stock cap.
pub const GOLD_ORE_MAX: u32 = 35;
/// Steel stock cap before the smelter pauses.
pub const STEEL_MAX: u32 = 50;

/// Cap on unfinished non-hut buildings per inventory.
pub const MAX_UNFINISHED_BUILDINGS: u32 = 3;
/// Cap on unfinished huts per inventory.
pub const MAX_UNFINISHED_HUTS: u32 = 3;

/// Trees required near a sawmill site.
pub const NEAR_TREES_MIN: u32 = 5;

/// Base phase sleep in milliseconds at normal speed.
const PHASE_SLEEP_MS: u64 = 60;

// ---------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------

/// Distance flavour for nearest-inventory queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistType {
    /// Flag-graph distance only.
    FlagOnly,
    /// Straight-line tile distance only.
    StraightLineOnly,
    /// Both flavours must agree, else no answer.
    FlagAndStraightLine,
}

/// One computer player bound to a hosted game.
pub struct AiPlayer {
    host: GameRef,
    player: u8,
    name: String,
    loop_count: u32,
    paced: bool,
    castle_pos: Option<MapPos>,
    road_builder: RoadBuilder,
    /// Positions where construction proved to be a mistake.
    bad_building_pos: HashSet<MapPos>,
    /// Flags flagged as missing a transporter last pass, with loop stamp.
    no_transporter_since: HashMap<(FlagIndex, Direction), u32>,
    /// Arterial flags per (inventory flag, incoming direction).
    arterial: HashMap<crate::arterial::InventoryDir, Vec<FlagIndex>>,
}

impl AiPlayer {
    /// New driver for a player slot.
    #[must_use]
    pub fn new(host: GameRef, player: u8) -> Self {
        Self {
            host,
            player,
            name: format!("Player{player}"),
            loop_count: 0,
            paced: true,
            castle_pos: None,
            road_builder: RoadBuilder::new(),
            bad_building_pos: HashSet::new(),
            no_transporter_since: HashMap::new(),
            arterial: HashMap::new(),
        }
    }

    /// Disable wall-clock pacing (tests drive loops synchronously).
    pub fn set_paced(&mut self, paced: bool) {
        self.paced = paced;
    }

    /// Spawn the driver on its own thread.
    pub fn spawn(host: GameRef, player: u8) -> JoinHandle<()> {
        std::thread::Builder::new()
            .name(format!("ai-player-{player}"))
            .spawn(move || {
                let mut ai = AiPlayer::new(host, player);
                ai.run();
            })
            .expect("spawn ai thread")
    }

    /// Run until the host signals shutdown.
    pub fn run(&mut self) {
        self.host.ai_thread_starting();
        tracing::info!(player = self.player, "ai driver started");
        while !self.host.should_ai_stop() {
            self.next_loop();
        }
        tracing::info!(player = self.player, "ai driver exiting");
        self.host.ai_thread_exiting();
    }

    /// Sleep between phases, scaled inversely with game speed.
    fn sleep_speed_adjusted(&self, msec: u64) {
        if !self.paced {
            return;
        }
        let speed = { self.host.lock().game_speed() } as u64;
        let adjusted = if speed > 2 { msec / (speed - 1) } else { msec };
        std::thread::sleep(Duration::from_millis(adjusted + 1));
    }

    fn should_stop(&self) -> bool {
        self.host.should_ai_stop()
    }

    /// One full pass over all phases.
    pub fn next_loop(&mut self) {
        self.loop_count += 1;

        macro_rules! phase {
            ($body:expr) => {
                if self.should_stop() {
                    return;
                }
                $body;
                self.sleep_speed_adjusted(PHASE_SLEEP_MS);
            };
        }

        phase!(self.do_place_castle());
        if self.do_consider_capitulation() {
            return;
        }
        phase!(self.do_build_sawmill_lumberjacks());
        phase!(self.do_build_stonecutter());
        phase!(self.do_expand_borders());
        phase!(self.do_build_food_buildings());
        phase!(self.do_place_mines());
        phase!(self.do_build_toolmaker_steelsmelter());
        phase!(self.do_build_gold_smelter());
        phase!(self.do_build_warehouse());
        phase!(self.do_send_geologists());
        phase!(self.do_identify_arterial_roads());
        phase!(self.do_fix_missing_transporters());
        phase!(self.do_remove_road_stubs());
        phase!(self.do_demolish_unproductive_buildings());
        phase!(self.do_attack());
        phase!(self.do_manage_tool_priorities());
        phase!(self.do_manage_mine_food_priorities());
        phase!(self.do_balance_sword_shield_priorities());
        phase!(self.do_manage_knight_occupation_levels());
    }

    // -----------------------------------------------------------------
    // Snapshots and helpers
    // -----------------------------------------------------------------

    /// Copy the state the planner reads, under the lock.
    fn snapshot(&self) -> PlannerWorld {
        let game = self.host.lock();
        let castle_flag = game
            .player(self.player)
            .filter(|p| p.has_castle)
            .and_then(|p| game.buildings().get(p.castle_index))
            .map_or(0, fief_core::building::Building::flag);
        let inventory_flags = game
            .inventories()
            .iter()
            .filter(|(_, inv)| inv.owner() == self.player)
            .filter_map(|(_, inv)| game.flags().get(inv.flag()).map(fief_core::flag::Flag::pos))
            .collect();
        PlannerWorld {
            map: game.map().clone(),
            flags: game.flags().clone(),
            castle_flag,
            inventory_flags,
        }
    }

    /// Total of a resource across the player's inventories.
    fn stock_of(&self, res: Resource) -> u32 {
        let game = self.host.lock();
        game.inventories()
            .iter()
            .filter(|(_, inv)| inv.owner() == self.player)
            .map(|(_, inv)| inv.count_of(res))
            .sum()
    }

    /// Count of the player's buildings of one type, done or not.
    fn building_count(&self, typ: BuildingType) -> (u32, u32) {
        let game = self.host.lock();
        let player = game.player(self.player);
        player.map_or((0, 0), |p| {
            (
                p.completed_building_count[typ.index()],
                p.incomplete_building_count[typ.index()],
            )
        })
    }

    fn unfinished_counts(&self) -> (u32, u32) {
        let game = self.host.lock();
        let Some(p) = game.player(self.player) else {
            return (0, 0);
        };
        let huts = p.incomplete_building_count[BuildingType::Hut.index()];
        let other: u32 = p.incomplete_building_count.iter().sum::<u32>() - huts;
        (other, huts)
    }

    /// Nearest own inventory flag position to `pos`, by the asked flavour.
    fn find_nearest_inventory(
        &self,
        world: &PlannerWorld,
        pos: MapPos,
        dist_type: DistType,
    ) -> Option<MapPos> {
        let by_line = || {
            world
                .inventory_flags
                .iter()
                .copied()
                .min_by_key(|inv| (world.map.hex_dist(pos, *inv), *inv))
        };
        let by_flag = || {
            if !world.map.has_flag(pos) {
                return by_line();
            }
            let from = world.map.get_obj_index(pos);
            fief_core::flag_search::find_nearest_inventory_for_resource(&world.flags, from)
                .and_then(|idx| world.flags.get(idx).map(fief_core::flag::Flag::pos))
                // A flag not yet wired into the graph still needs a target:
                // fall back to the crow-flight nearest inventory.
                .or_else(|| by_line())
        };
        match dist_type {
            DistType::StraightLineOnly => by_line(),
            DistType::FlagOnly => by_flag(),
            DistType::FlagAndStraightLine => {
                let a = by_flag()?;
                let b = by_line()?;
                (a == b).then_some(a)
            }
        }
    }

    /// Count things matching `pred` in a spiral around `pos`.
    fn count_near(
        world: &PlannerWorld,
        pos: MapPos,
        radius: u32,
        pred: impl Fn(&PlannerWorld, MapPos) -> bool,
    ) -> u32 {
        world
            .map
            .spiral(pos, radius)
            .into_iter()
            .filter(|p| pred(world, *p))
            .count() as u32
    }

    /// Pick a constructible site near `center` for the building type.
    fn find_building_site(
        &self,
        center: MapPos,
        typ: BuildingType,
        radius: u32,
    ) -> Option<MapPos> {
        let game = self.host.lock();
        game.map()
            .spiral(center, radius)
            .into_iter()
            .find(|pos| {
                !self.bad_building_pos.contains(pos)
                    && game.can_build_building(*pos, typ, self.player)
            })
    }

    /// Build a building at the best site near `center` and connect its flag
    /// to the road network. Returns the building position on success.
    fn build_connected(
        &mut self,
        center: MapPos,
        typ: BuildingType,
        radius: u32,
    ) -> Option<MapPos> {
        let (other_unfinished, unfinished_huts) = self.unfinished_counts();
        if typ == BuildingType::Hut {
            if unfinished_huts >= MAX_UNFINISHED_HUTS {
                return None;
            }
        } else if other_unfinished >= MAX_UNFINISHED_BUILDINGS {
            return None;
        }

        let site = self.find_building_site(center, typ, radius)?;
        {
            let mut game = self.host.lock();
            if !game.build_building(site, typ, self.player) {
                return None;
            }
        }
        self.road_builder.invalidate_cache();

        let flag_pos = {
            let game = self.host.lock();
            game.map().neighbor(site, Direction::DownRight)
        };
        if !self.build_best_road(flag_pos, RoadOptions::default()) {
            // A building we cannot connect is clutter; take it down.
            {
                let mut game = self.host.lock();
                game.demolish_building(site, self.player);
            }
            self.bad_building_pos.insert(site);
            tracing::debug!(player = self.player, site, ?typ, "unconnectable site demolished");
            return None;
        }
        tracing::debug!(player = self.player, site, ?typ, "building placed and connected");
        Some(site)
    }

    /// Plan and build the best road from `start_flag_pos` toward the
    /// nearest inventory, via the extended plot and candidate scoring.
    pub fn build_best_road(&mut self, start_flag_pos: MapPos, options: RoadOptions) -> bool {
        let world = self.snapshot();
        if !world.map.has_flag(start_flag_pos) {
            return false;
        }
        let Some(target_pos) =
            self.find_nearest_inventory(&world, start_flag_pos, DistType::FlagOnly)
        else {
            return false;
        };
        if target_pos == start_flag_pos {
            return true;
        }

        let mut candidates: Vec<RoadCandidate> = Vec::new();
        let direct = self.road_builder.plot_road(
            &world,
            self.player,
            start_flag_pos,
            target_pos,
            options,
            &mut candidates,
        );
        if direct.is_valid() {
            candidates.push(RoadCandidate {
                needs_end_flag: !world.map.has_flag(direct.end(&world.map).unwrap_or(target_pos)),
                passthru_flags: 0,
                road: direct,
            });
        }
        let scored =
            self.road_builder
                .score_candidates(&world, candidates, start_flag_pos, target_pos, options);

        for entry in scored {
            if self.commit_road(&entry.candidate) {
                self.road_builder.invalidate_cache();
                return true;
            }
        }
        false
    }

    /// Build a candidate road through the same operations a human uses,
    /// splitting it into segments at every flag along the way.
    fn commit_road(&mut self, candidate: &RoadCandidate) -> bool {
        let mut game = self.host.lock();
        let map_road = &candidate.road;
        let Some(start) = map_road.source() else {
            return false;
        };

        // Walk the plotted cells, cutting segments at existing flags and at
        // cells that need a new splitting flag.
        let mut segments: Vec<Road> = Vec::new();
        let mut segment = Road::start(start);
        let mut pos = start;
        let dirs: Vec<Direction> = map_road.dirs().to_vec();
        for (i, dir) in dirs.iter().enumerate() {
            segment.extend(*dir);
            pos = game.map().neighbor(pos, *dir);
            let last = i == dirs.len() - 1;

            let has_flag = game.map().has_flag(pos);
            let needs_flag = !has_flag && (last || game.map().has_any_path(pos));
            if needs_flag {
                if !game.build_flag(pos, self.player) {
                    return false;
                }
            }
            if has_flag || needs_flag {
                segments.push(segment);
                segment = Road::start(pos);
            }
        }
        if segment.is_valid() {
            // The plot must end at a flag; a trailing stub is a plot bug.
            tracing::warn!(player = self.player, "road plot ended off-flag; rejected");
            return false;
        }

        let mut built_any = false;
        for seg in segments {
            if seg.is_valid() && game.build_road(&seg, self.player) {
                built_any = true;
            }
        }
        built_any
    }

    // -----------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------

    /// First loop: choose a castle site by scoring nearby resources.
    fn do_place_castle(&mut self) {
        {
            let game = self.host.lock();
            let Some(p) = game.player(self.player) else {
                return;
            };
            if p.has_castle {
                if self.castle_pos.is_none() {
                    self.castle_pos = game
                        .buildings()
                        .get(p.castle_index)
                        .map(fief_core::building::Building::pos);
                }
                return;
            }
        }

        let world = self.snapshot();
        let map = &world.map;

        // Deterministic sweep over a coarse lattice, scoring trees, stones
        // and open ground around each legal site.
        let mut best: Option<(u32, MapPos)> = None;
        for row in (4..map.rows() - 4).step_by(4) {
            for col in (4..map.cols() - 4).step_by(4) {
                let pos = map.pos(col, row);
                let legal = {
                    let game = self.host.lock();
                    game.can_build_castle(pos, self.player)
                };
                if !legal {
                    continue;
                }
                let trees = Self::count_near(&world, pos, 5, |w, p| w.map.get_obj(p).is_tree());
                let stones = Self::count_near(&world, pos, 5, |w, p| {
                    w.map.get_obj(p).stone_amount().is_some()
                });
                let open = Self::count_near(&world, pos, 5, |w, p| {
                    w.map.get_obj(p) == Object::None && !w.map.is_water_tile(p)
                });
                let score = trees * 2 + stones * 2 + open;
                if best.map_or(true, |(b, _)| score > b) {
                    best = Some((score, pos));
                }
            }
        }

        if let Some((score, pos)) = best {
            let built = {
                let mut game = self.host.lock();
                game.build_castle(pos, self.player)
            };
            if built {
                tracing::info!(player = self.player, pos, score, "castle placed");
                self.castle_pos = Some(pos);
                self.road_builder.invalidate_cache();
            }
        }
    }

    /// A player with no castle and no warehouses is finished.
    fn do_consider_capitulation(&mut self) -> bool {
        let game = self.host.lock();
        let Some(p) = game.player(self.player) else {
            return true;
        };
        let has_inventory_building = game
            .inventories()
            .iter()
            .any(|(_, inv)| inv.owner() == self.player);
        if self.loop_count > 1 && !p.has_castle && !has_inventory_building {
            tracing::info!(player = self.player, "no inventories left; capitulating");
            return true;
        }
        false
    }

    /// Keep one sawmill and two lumberjacks per economy while planks run
    /// short.
    fn do_build_sawmill_lumberjacks(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        if self.stock_of(Resource::Plank) >= PLANKS_MAX {
            return;
        }
        let (sawmills_done, sawmills_building) = self.building_count(BuildingType::Sawmill);
        if sawmills_done + sawmills_building == 0 {
            // Prefer a site with trees around.
            let world = self.snapshot();
            let near_trees =
                Self::count_near(&world, castle_pos, 8, |w, p| w.map.get_obj(p).is_tree());
            if near_trees >= NEAR_TREES_MIN {
                self.build_connected(castle_pos, BuildingType::Sawmill, 7);
            }
        }
        let (lj_done, lj_building) = self.building_count(BuildingType::Lumberjack);
        if lj_done + lj_building < 2 {
            self.build_connected(castle_pos, BuildingType::Lumberjack, 8);
        }
        // A forester keeps the woods renewable once cutting started.
        let (forester_done, forester_building) = self.building_count(BuildingType::Forester);
        if lj_done > 0 && forester_done + forester_building == 0 {
            self.build_connected(castle_pos, BuildingType::Forester, 8);
        }
    }

    /// One stonecutter while stones run short and piles are in reach.
    fn do_build_stonecutter(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        if self.stock_of(Resource::Stone) >= STONES_MAX {
            return;
        }
        let (done, building) = self.building_count(BuildingType::Stonecutter);
        if done + building > 0 {
            return;
        }
        let world = self.snapshot();
        let near_stones = Self::count_near(&world, castle_pos, 9, |w, p| {
            w.map.get_obj(p).stone_amount().is_some_and(|a| a > 0)
        });
        if near_stones > 0 {
            self.build_connected(castle_pos, BuildingType::Stonecutter, 9);
        }
    }

    /// Push the border out with huts toward unowned land.
    fn do_expand_borders(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        let world = self.snapshot();
        // A border cell: ours, with an unowned neighbour.
        let border = world.map.spiral(castle_pos, 9).into_iter().find(|pos| {
            world.map.get_owner(*pos) == Some(self.player)
                && Direction::ALL
                    .into_iter()
                    .any(|d| world.map.get_owner(world.map.neighbor(*pos, d)).is_none())
        });
        if let Some(border_pos) = border {
            self.build_connected(border_pos, BuildingType::Hut, 4);
        }
    }

    /// Food chain: fisher by water, then farm, mill, baker.
    fn do_build_food_buildings(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        let food = self.stock_of(Resource::Fish)
            + self.stock_of(Resource::Bread)
            + self.stock_of(Resource::Meat);
        if food >= FOOD_MAX {
            return;
        }

        let world = self.snapshot();
        let near_water = Self::count_near(&world, castle_pos, 10, |w, p| w.map.is_water_tile(p));
        let (fisher_done, fisher_building) = self.building_count(BuildingType::Fisher);
        if near_water >= 8 && fisher_done + fisher_building == 0 {
            self.build_connected(castle_pos, BuildingType::Fisher, 10);
        }

        let (farms_done, farms_building) = self.building_count(BuildingType::Farm);
        if farms_done + farms_building == 0 {
            self.build_connected(castle_pos, BuildingType::Farm, 9);
        }
        let (mills_done, mills_building) = self.building_count(BuildingType::Mill);
        if farms_done > 0 && mills_done + mills_building == 0 {
            self.build_connected(castle_pos, BuildingType::Mill, 8);
        }
        let (bakers_done, bakers_building) = self.building_count(BuildingType::Baker);
        if mills_done > 0 && bakers_done + bakers_building == 0 {
            self.build_connected(castle_pos, BuildingType::Baker, 8);
        }
    }

    /// Mines on prospected mountain cells, by mineral class.
    fn do_place_mines(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        let plans: [(BuildingType, Mineral, u32); 4] = [
            (BuildingType::CoalMine, Mineral::Coal, COAL_MAX),
            (BuildingType::IronMine, Mineral::Iron, IRON_ORE_MAX),
            (BuildingType::GoldMine, Mineral::Gold, GOLD_ORE_MAX),
            (BuildingType::StoneMine, Mineral::Stone, STONES_MAX),
        ];
        for (typ, mineral, cap) in plans {
            let held = match mineral {
                Mineral::Coal => self.stock_of(Resource::Coal),
                Mineral::Iron => self.stock_of(Resource::IronOre),
                Mineral::Gold => self.stock_of(Resource::GoldOre),
                Mineral::Stone => self.stock_of(Resource::Stone),
            };
            if held >= cap {
                continue;
            }
            let (done, building) = self.building_count(typ);
            if done + building > 0 {
                continue;
            }

            // Only build where a geologist left an encouraging sign.
            let world = self.snapshot();
            let site = world.map.spiral(castle_pos, 12).into_iter().find(|pos| {
                matches!(
                    world.map.get_obj(*pos),
                    Object::SignLarge | Object::SignSmall
                ) && world.map.mineral(*pos).is_some_and(|(m, _)| m == mineral)
            });
            if let Some(sign_pos) = site {
                self.build_connected(sign_pos, typ, 3);
            }
        }
    }

    /// Tool chain: toolmaker, then the steel smelter feeding it.
    fn do_build_toolmaker_steelsmelter(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        if self.stock_of(Resource::Plank) < PLANKS_MIN {
            return;
        }
        let (tm_done, tm_building) = self.building_count(BuildingType::ToolMaker);
        if tm_done + tm_building == 0 {
            self.build_connected(castle_pos, BuildingType::ToolMaker, 8);
        }
        let (ss_done, ss_building) = self.building_count(BuildingType::SteelSmelter);
        let (coal_done, _) = self.building_count(BuildingType::CoalMine);
        let (iron_done, _) = self.building_count(BuildingType::IronMine);
        if ss_done + ss_building == 0
            && (coal_done > 0 || self.stock_of(Resource::Coal) > 0)
            && (iron_done > 0 || self.stock_of(Resource::IronOre) > 0)
            && self.stock_of(Resource::Steel) < STEEL_MAX
        {
            self.build_connected(castle_pos, BuildingType::SteelSmelter, 8);
        }
    }

    /// Gold chain: a smelter once a gold mine is running.
    fn do_build_gold_smelter(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        let (gold_mines_done, _) = self.building_count(BuildingType::GoldMine);
        if gold_mines_done == 0 && self.stock_of(Resource::GoldOre) == 0 {
            return;
        }
        let (done, building) = self.building_count(BuildingType::GoldSmelter);
        if done + building == 0 {
            self.build_connected(castle_pos, BuildingType::GoldSmelter, 8);
        }
    }

    /// A warehouse once the economy outgrows the castle.
    fn do_build_warehouse(&mut self) {
        let Some(castle_pos) = self.castle_pos else {
            return;
        };
        if self.stock_of(Resource::Plank) < PLANKS_MIN * 2 {
            return;
        }
        let flag_count = {
            let game = self.host.lock();
            game.flags()
                .iter()
                .filter(|(_, f)| f.owner() == self.player)
                .count()
        };
        let (done, building) = self.building_count(BuildingType::Stock);
        if flag_count > 24 && done + building == 0 {
            self.build_connected(castle_pos, BuildingType::Stock, 12);
        }
    }

    /// Send geologists at mountain flags that lack signs.
    fn do_send_geologists(&mut self) {
        let world = self.snapshot();
        let target = world.flags.iter().find(|(_, f)| {
            f.owner() == self.player
                && !f.has_inventory()
                && Self::count_near(&world, f.pos(), 3, |w, p| {
                    w.map.type_up(p).is_mountain() && w.map.get_obj(p) == Object::None
                }) >= 3
        });
        if let Some((flag_idx, _)) = target {
            let mut game = self.host.lock();
            if game.send_geologist(flag_idx) {
                tracing::debug!(player = self.player, flag = flag_idx, "geologist sent");
            }
        }
    }

    /// Refresh the arterial-road labels every few loops; maintenance and
    /// defense phases treat arterial flags as load-bearing.
    fn do_identify_arterial_roads(&mut self) {
        if self.loop_count % 8 != 1 {
            return;
        }
        let world = self.snapshot();
        self.arterial = crate::arterial::identify_arterial_roads(&world, self.player);
        if !self.arterial.is_empty() {
            tracing::debug!(
                player = self.player,
                buckets = self.arterial.len(),
                "arterial roads identified"
            );
        }
    }

    /// Whether a flag carries arterial traffic into some inventory.
    fn is_arterial(&self, flag: FlagIndex) -> bool {
        self.arterial.values().any(|flags| flags.contains(&flag))
    }

    /// Repair roads whose transporter vanished.
    fn do_fix_missing_transporters(&mut self) {
        let repaired = {
            let mut game = self.host.lock();
            game.audit_road_staffing()
        };
        if repaired > 0 {
            tracing::debug!(player = self.player, repaired, "road staffing repaired");
        } else {
            // Forget stale timers once the books are clean.
            self.no_transporter_since.clear();
        }
    }

    /// Demolish dead-end flags that serve nothing. Arterial flags are never
    /// touched, whatever their current edge count.
    fn do_remove_road_stubs(&mut self) {
        let world = self.snapshot();
        let stub = world.flags.iter().find(|(idx, f)| {
            f.owner() == self.player
                && !f.has_building()
                && !f.has_inventory()
                && f.edge_count() <= 1
                && f.slot_count() == 0
                && !self.is_arterial(*idx)
        });
        if let Some((_, flag)) = stub {
            let pos = flag.pos();
            let mut game = self.host.lock();
            if game.demolish_flag(pos, self.player) {
                drop(game);
                self.road_builder.invalidate_cache();
                tracing::debug!(player = self.player, pos, "road stub removed");
            }
        }
    }

    /// Demolish producers that ran out of things to produce.
    fn do_demolish_unproductive_buildings(&mut self) {
        let world = self.snapshot();
        let game = self.host.lock();
        let mut to_demolish: Vec<MapPos> = Vec::new();
        for (_, building) in game.buildings().iter() {
            if building.owner() != self.player || !building.is_done() || building.is_burning() {
                continue;
            }
            match building.building_type() {
                BuildingType::Lumberjack => {
                    let trees =
                        Self::count_near(&world, building.pos(), 6, |w, p| w.map.get_obj(p).is_tree());
                    if trees == 0 {
                        to_demolish.push(building.pos());
                    }
                }
                BuildingType::Stonecutter => {
                    let stones = Self::count_near(&world, building.pos(), 6, |w, p| {
                        w.map.get_obj(p).stone_amount().is_some_and(|a| a > 0)
                    });
                    if stones == 0 {
                        to_demolish.push(building.pos());
                    }
                }
                BuildingType::StoneMine
                | BuildingType::CoalMine
                | BuildingType::IronMine
                | BuildingType::GoldMine => {
                    if world.map.mineral(building.pos()).is_none() && building.is_active() {
                        to_demolish.push(building.pos());
                    }
                }
                _ => {}
            }
        }
        drop(game);
        for pos in to_demolish {
            let demolished = {
                let mut game = self.host.lock();
                game.demolish_building(pos, self.player)
            };
            if demolished {
                self.bad_building_pos.insert(pos);
                tracing::debug!(player = self.player, pos, "unproductive building demolished");
            }
        }
    }

    /// Score enemy targets and commit an attack when the odds warrant it.
    fn do_attack(&mut self) {
        let game = self.host.lock();
        let Some(p) = game.player(self.player) else {
            return;
        };
        let morale_pct = (p.knight_morale * 100 / 8192).min(100);
        if morale_pct < MORALE_MIN {
            return;
        }
        let occupation = p.knight_occupation;

        // Knights this player can field.
        let mut available = 0u32;
        for (idx, building) in game.buildings().iter() {
            if building.owner() != self.player
                || !building.is_military()
                || !building.is_done()
                || building.is_burning()
            {
                continue;
            }
            let min_keep = occupation[building.threat_level().min(3) as usize].min as u32;
            let chain = game.knight_chain(idx).len() as u32;
            available += chain.saturating_sub(min_keep);
        }
        if available == 0 {
            return;
        }

        // The weakest reachable enemy military building.
        let mut best: Option<(u32, BuildingIndex, u32)> = None;
        for (idx, building) in game.buildings().iter() {
            if building.owner() == self.player
                || !building.is_military()
                || !building.is_done()
                || building.is_burning()
                || building.building_type() == BuildingType::Castle
            {
                continue;
            }
            let in_reach = game.buildings().iter().any(|(_, own)| {
                own.owner() == self.player
                    && own.is_military()
                    && game.map().hex_dist(own.pos(), building.pos()) <= 24
            });
            if !in_reach {
                continue;
            }
            let defenders = game.knight_chain(idx).len() as u32;
            let score = defenders * 4 + building.threat_level() as u32;
            if best.map_or(true, |(b, _, _)| score < b) {
                best = Some((score, idx, defenders));
            }
        }
        let Some((_, target, defenders)) = best else {
            return;
        };

        let ratio_ok = defenders == 0
            || f64::from(available) / f64::from(defenders.max(1)) >= MIN_KNIGHT_RATIO_ATTACK;
        if !ratio_ok && morale_pct < MORALE_MAX {
            return;
        }

        drop(game);
        let mut game = self.host.lock();
        game.plan_attack(self.player, target, available);
        let sent = game.start_attack(self.player);
        if sent > 0 {
            tracing::info!(player = self.player, target, sent, "attack launched");
        }
    }

    /// Raise priorities for tools the economy is starved of.
    fn do_manage_tool_priorities(&mut self) {
        let picks = self.stock_of(Resource::Pick);
        let hammers = self.stock_of(Resource::Hammer);
        let scythes = self.stock_of(Resource::Scythe);
        let mut game = self.host.lock();
        let Some(p) = game.player_mut(self.player) else {
            return;
        };
        // Tool priority slots follow the resource order from shovel.
        let slot = |res: Resource| res as usize - Resource::Shovel as usize;
        p.tool_prio[slot(Resource::Pick)] = if picks == 0 { 60_000 } else { 4_096 };
        p.tool_prio[slot(Resource::Hammer)] = if hammers == 0 { 50_000 } else { 4_096 };
        p.tool_prio[slot(Resource::Scythe)] = if scythes == 0 { 30_000 } else { 4_096 };
    }

    /// Feed the mines whose ore the economy is short of.
    fn do_manage_mine_food_priorities(&mut self) {
        let coal = self.stock_of(Resource::Coal);
        let iron = self.stock_of(Resource::IronOre);
        let gold = self.stock_of(Resource::GoldOre);
        let mut game = self.host.lock();
        let Some(p) = game.player_mut(self.player) else {
            return;
        };
        p.food_to_mines[1] = if coal < COAL_MAX { 60_000 } else { 8_192 };
        p.food_to_mines[2] = if iron < IRON_ORE_MAX { 55_000 } else { 8_192 };
        p.food_to_mines[3] = if gold < GOLD_ORE_MAX { 65_500 } else { 8_192 };
    }

    /// Push coal and steel to the weapon smith while knights are scarce.
    fn do_balance_sword_shield_priorities(&mut self) {
        let knights = {
            let game = self.host.lock();
            game.player(self.player).map_or(0, |p| {
                p.serf_count[fief_core::serf::SerfType::Knight0 as usize..]
                    .iter()
                    .sum::<u32>()
            })
        };
        let mut game = self.host.lock();
        let Some(p) = game.player_mut(self.player) else {
            return;
        };
        if knights < KNIGHTS_MED {
            p.steel_split[1] = 65_500;
            p.coal_split[2] = 60_000;
        } else {
            p.steel_split[1] = 45_850;
            p.coal_split[2] = 45_850;
        }
    }

    /// Staff frontier posts heavier as the knight pool grows.
    fn do_manage_knight_occupation_levels(&mut self) {
        let knights = {
            let game = self.host.lock();
            game.player(self.player).map_or(0, |p| {
                p.serf_count[fief_core::serf::SerfType::Knight0 as usize..]
                    .iter()
                    .sum::<u32>()
            })
        };
        let mut game = self.host.lock();
        let Some(p) = game.player_mut(self.player) else {
            return;
        };
        use fief_core::player::KnightOccupation;
        p.knight_occupation = if knights < KNIGHTS_MIN {
            [KnightOccupation { min: 1, max: 1 }; 4]
        } else if knights < KNIGHTS_MAX {
            [
                KnightOccupation { min: 1, max: 1 },
                KnightOccupation { min: 1, max: 2 },
                KnightOccupation { min: 2, max: 3 },
                KnightOccupation { min: 3, max: 4 },
            ]
        } else {
            [
                KnightOccupation { min: 1, max: 2 },
                KnightOccupation { min: 2, max: 3 },
                KnightOccupation { min: 3, max: 6 },
                KnightOccupation { min: 4, max: 12 },
            ]
        };
    }
}

impl std::fmt::Debug for AiPlayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AiPlayer")
            .field("name", &self.name)
            .field("player", &self.player)
            .field("loop_count", &self.loop_count)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fief_core::game::Game;
    use fief_core::map::{Map, Terrain};
    use fief_core::GameHost;
    use std::sync::Arc;

    fn hosted_flat_game() -> GameRef {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            map.set_height(pos, 10);
        }
        // Scatter trees and stones so castle scoring has something to see.
        for i in 0..map.cell_count() {
            if i % 37 == 0 {
                map.set_obj(i, Object::Tree1, 0);
            } else if i % 101 == 0 {
                map.set_obj(i, Object::Stone5, 0);
            }
        }
        let mut game = Game::with_map(map, 4242);
        let player = game.add_player(12, 64, 35, 30, 40).unwrap();
        game.player_mut(player).unwrap().is_ai = true;
        Arc::new(GameHost::new(game))
    }

    fn run_ai_and_sim(host: &GameRef, ai: &mut AiPlayer, loops: usize, steps_per_loop: usize) {
        for _ in 0..loops {
            ai.next_loop();
            let mut game = host.lock();
            for _ in 0..steps_per_loop {
                game.update();
            }
        }
    }

    #[test]
    fn test_ai_places_castle_first_loop() {
        let host = hosted_flat_game();
        let mut ai = AiPlayer::new(host.clone(), 0);
        ai.set_paced(false);
        ai.next_loop();

        let game = host.lock();
        assert!(game.player(0).unwrap().has_castle);
        game.validate().unwrap();
    }

    #[test]
    fn test_ai_builds_an_economy() {
        let host = hosted_flat_game();
        let mut ai = AiPlayer::new(host.clone(), 0);
        ai.set_paced(false);
        run_ai_and_sim(&host, &mut ai, 12, 300);

        let game = host.lock();
        let p = game.player(0).unwrap();
        let placed: u32 = p
            .completed_building_count
            .iter()
            .chain(p.incomplete_building_count.iter())
            .sum();
        // Castle plus at least one economy building.
        assert!(placed >= 2, "the AI should have started building, got {placed}");
        game.validate().unwrap();
    }

    #[test]
    fn test_ai_mutations_keep_invariants() {
        let host = hosted_flat_game();
        let mut ai = AiPlayer::new(host.clone(), 0);
        ai.set_paced(false);
        run_ai_and_sim(&host, &mut ai, 8, 200);

        let game = host.lock();
        game.validate().unwrap();
        assert_eq!(game.gold_total(), game.counted_gold());
    }

    #[test]
    fn test_ai_thread_lifecycle() {
        let host = hosted_flat_game();
        let handle = AiPlayer::spawn(host.clone(), 0);
        // Give the driver a moment to come up, then stop it.
        std::thread::sleep(std::time::Duration::from_millis(50));
        host.request_ai_stop();
        handle.join().unwrap();
        assert_eq!(host.ai_thread_count(), 0);
    }
}
