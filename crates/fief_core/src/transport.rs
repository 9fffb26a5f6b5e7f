//! Per-tick transport: flag routing and inventory scheduling.
//!
//! [`Game::update_flags`] scans every flag's resource slots, repairs dead or
//! missing destinations (rerouting toward the nearest accepting inventory),
//! picks the outgoing edge the flag search deems best and calls out
//! transporters for unstaffed roads.
//!
//! [`Game::update_inventories`] runs on a 64-tick cadence: it walks one of
//! three resource priority orders (chosen by a random draw), matches
//! inventories holding a resource against the hungriest reachable building
//! and pushes the resource into the inventory's out-queue with a travel
//! deadline stamped on the request.

use crate::building::REQUEST_TIMEOUT_TICKS_PER_TILE;
use crate::flag::FlagIndex;
use crate::flag_search::{self, FlagSearch, Visit};
use crate::game::Game;
use crate::inventory::{InventoryIndex, InventoryMode};
use crate::map::Direction;
use crate::pathfind::trace_existing_road;
use crate::resource::Resource;

/// Minimum demand priority for the scheduler to ship a resource.
const SCHEDULE_PRIO_THRESHOLD: u8 = 16;

/// A scheduling entry: either one resource kind or the food group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Scheduled {
    Food,
    Res(Resource),
}

/// Default scheduling order: construction first.
const SCHEDULE_ORDER_1: [Scheduled; 12] = [
    Scheduled::Res(Resource::Plank),
    Scheduled::Res(Resource::Stone),
    Scheduled::Res(Resource::Steel),
    Scheduled::Res(Resource::Coal),
    Scheduled::Res(Resource::Lumber),
    Scheduled::Res(Resource::IronOre),
    Scheduled::Food,
    Scheduled::Res(Resource::Pig),
    Scheduled::Res(Resource::Flour),
    Scheduled::Res(Resource::Wheat),
    Scheduled::Res(Resource::GoldBar),
    Scheduled::Res(Resource::GoldOre),
];

/// Alternate order: raw industry first.
const SCHEDULE_ORDER_2: [Scheduled; 12] = [
    Scheduled::Res(Resource::Stone),
    Scheduled::Res(Resource::IronOre),
    Scheduled::Res(Resource::GoldOre),
    Scheduled::Res(Resource::Coal),
    Scheduled::Res(Resource::Steel),
    Scheduled::Res(Resource::GoldBar),
    Scheduled::Food,
    Scheduled::Res(Resource::Pig),
    Scheduled::Res(Resource::Flour),
    Scheduled::Res(Resource::Wheat),
    Scheduled::Res(Resource::Lumber),
    Scheduled::Res(Resource::Plank),
];

/// Alternate order: food chain first.
const SCHEDULE_ORDER_3: [Scheduled; 12] = [
    Scheduled::Food,
    Scheduled::Res(Resource::Wheat),
    Scheduled::Res(Resource::Pig),
    Scheduled::Res(Resource::Flour),
    Scheduled::Res(Resource::GoldBar),
    Scheduled::Res(Resource::Stone),
    Scheduled::Res(Resource::Plank),
    Scheduled::Res(Resource::Steel),
    Scheduled::Res(Resource::Coal),
    Scheduled::Res(Resource::Lumber),
    Scheduled::Res(Resource::GoldOre),
    Scheduled::Res(Resource::IronOre),
];

/// What the routing pass decided for one slot.
enum SlotAction {
    /// Resource is consumed locally (building delivery or inventory).
    DeliverLocal,
    /// New destination and scheduled edge.
    Route(FlagIndex, Option<Direction>),
    /// Clear routing; retry next tick.
    Unroute,
}

impl Game {
    /// Per-tick flag update: route queued resources and staff roads.
    pub(crate) fn update_flags(&mut self) {
        for idx in self.flags.indices() {
            self.update_flag(idx);
        }
    }

    fn update_flag(&mut self, idx: FlagIndex) {
        let Some(flag) = self.flags.get(idx) else {
            return;
        };

        // Decide routing for each slot without holding a mutable borrow.
        let mut actions: Vec<(usize, SlotAction)> = Vec::new();
        for (i, slot) in flag.slots().iter().enumerate() {
            let Some(slot) = slot else {
                continue;
            };
            let mut dest = slot.dest;
            if dest != 0 && !self.flags.exists(dest) {
                dest = 0;
            }
            if dest == idx {
                actions.push((i, SlotAction::DeliverLocal));
                continue;
            }
            if dest == 0 {
                // Try to send the stray home to the nearest inventory.
                match flag_search::find_nearest_inventory_for_resource(&self.flags, idx) {
                    Some(home) if home == idx => {
                        actions.push((i, SlotAction::DeliverLocal));
                        continue;
                    }
                    Some(home) => dest = home,
                    None => {
                        actions.push((i, SlotAction::Unroute));
                        continue;
                    }
                }
            }
            match flag_search::next_dir_toward(&self.flags, idx, dest) {
                Some(dir) if flag.has_edge(dir) => {
                    actions.push((i, SlotAction::Route(dest, Some(dir))));
                }
                _ => actions.push((i, SlotAction::Unroute)),
            }
        }

        // Apply the decisions.
        for (i, action) in actions {
            match action {
                SlotAction::DeliverLocal => {
                    let slot = {
                        let flag = self.flags.get_mut(idx).unwrap();
                        flag.slots_mut()[i].take()
                    };
                    if let Some(slot) = slot {
                        self.deliver_resource_at_flag(idx, slot.res);
                    }
                }
                SlotAction::Route(dest, dir) => {
                    let flag = self.flags.get_mut(idx).unwrap();
                    if let Some(slot) = flag.slots_mut()[i].as_mut() {
                        slot.dest = dest;
                        slot.dir = dir;
                    }
                }
                SlotAction::Unroute => {
                    let flag = self.flags.get_mut(idx).unwrap();
                    if let Some(slot) = flag.slots_mut()[i].as_mut() {
                        slot.dest = 0;
                        slot.dir = None;
                    }
                }
            }
        }

        // Every road wants a transporter; ask once per edge.
        let Some(flag) = self.flags.get(idx) else {
            return;
        };
        let wanting: Vec<Direction> = Direction::ALL
            .into_iter()
            .filter(|d| {
                flag.edge(*d)
                    .is_some_and(|e| !e.has_transporter && !e.serf_requested)
            })
            .collect();
        for dir in wanting {
            self.call_transporter(idx, dir);
        }
    }

    /// Hand a resource that reached its destination flag to the consumer
    /// there: a requesting building, or the inventory behind the flag. An
    /// unwanted resource is requeued with no destination.
    pub(crate) fn deliver_resource_at_flag(&mut self, flag_idx: FlagIndex, res: Resource) {
        let Some(flag) = self.flags.get(flag_idx) else {
            self.lose_resource(res);
            return;
        };
        let building_idx = flag.building();
        let has_inventory = flag.has_inventory();

        if building_idx != 0 {
            let delivered = self
                .buildings
                .get_mut(building_idx)
                .is_some_and(|b| b.requested_resource_delivered(res));
            if delivered {
                return;
            }
        }
        if has_inventory {
            let inv_idx = self
                .buildings
                .get(building_idx)
                .map(crate::building::Building::inventory)
                .unwrap_or(0);
            if let Some(inventory) = self.inventories.get_mut(inv_idx) {
                inventory.push_resource(res);
                return;
            }
        }
        // Nobody here wants it; requeue unrouted and let the next flag
        // update find it a home.
        if let Some(flag) = self.flags.get_mut(flag_idx) {
            if flag.push_resource(res, 0) {
                return;
            }
        }
        self.lose_resource(res);
    }

    /// Tile length of the flag-path between two flags, tracing each road.
    #[must_use]
    pub(crate) fn flag_path_tile_dist(&self, from: FlagIndex, to: FlagIndex) -> Option<u32> {
        let path = flag_search::flag_path(&self.flags, from, to)?;
        let mut tiles = 0u32;
        for pair in path.windows(2) {
            let a = self.flags.get(pair[0])?;
            let dir = a.dir_to(pair[1])?;
            let road = trace_existing_road(&self.map, a.pos(), dir);
            tiles += road.length() as u32;
        }
        Some(tiles)
    }

    /// Periodic scheduling pass moving resources out of inventories toward
    /// the buildings that want them most.
    pub(crate) fn update_inventories(&mut self) {
        let order = match self.random_int() & 7 {
            0 => &SCHEDULE_ORDER_2,
            1 => &SCHEDULE_ORDER_3,
            _ => &SCHEDULE_ORDER_1,
        };

        for entry in order {
            for player_idx in self.player_indices() {
                self.schedule_resource_for_player(player_idx, *entry);
            }
        }
    }

    fn schedule_resource_for_player(&mut self, player_idx: u8, entry: Scheduled) {
        // Inventories able to ship this resource; out-mode inventories push
        // their highest-priority content instead.
        let mut sources: Vec<(InventoryIndex, FlagIndex)> = Vec::new();
        let mut out_mode: Vec<InventoryIndex> = Vec::new();
        for (inv_idx, inventory) in self.inventories.iter() {
            if inventory.owner() != player_idx || inventory.is_queue_full() {
                continue;
            }
            match inventory.res_mode() {
                InventoryMode::In | InventoryMode::Stop => {
                    let has = match entry {
                        Scheduled::Food => inventory.has_food(),
                        Scheduled::Res(res) => inventory.count_of(res) > 0,
                    };
                    if has {
                        sources.push((inv_idx, inventory.flag()));
                    }
                }
                InventoryMode::Out => out_mode.push(inv_idx),
            }
        }

        for inv_idx in out_mode {
            self.push_out_mode_inventory(player_idx, inv_idx);
        }

        if sources.is_empty() {
            return;
        }

        // Multi-source search: each source inventory is a tagged origin; a
        // visited building bids with its stock priority.
        let probe_res = match entry {
            Scheduled::Food => Resource::Fish,
            Scheduled::Res(res) => res,
        };
        let mut best: Vec<(u8, FlagIndex)> = vec![(0, 0); sources.len()];
        {
            let mut search = FlagSearch::new(&self.flags);
            for (tag, (_, flag_idx)) in sources.iter().enumerate() {
                search.add_source(*flag_idx, tag);
            }
            let buildings = &self.buildings;
            search.execute(|flag, visit| {
                if best[visit.tag].0 < u8::MAX && flag.has_building() {
                    if let Some(building) = buildings.get(flag.building()) {
                        if let Some(stock_i) = building.stock_for(probe_res) {
                            let stock = &building.stocks()[stock_i];
                            let prio = stock.prio;
                            if stock.missing() > 0
                                && prio >= SCHEDULE_PRIO_THRESHOLD
                                && prio > best[visit.tag].0
                            {
                                best[visit.tag] = (prio, visit.flag);
                            }
                        }
                    }
                }
                Visit::Continue
            });
        }

        for (tag, (prio, dest_flag)) in best.into_iter().enumerate() {
            if prio == 0 {
                continue;
            }
            let (inv_idx, src_flag) = sources[tag];
            let res = match entry {
                Scheduled::Food => {
                    let Some(inventory) = self.inventories.get(inv_idx) else {
                        continue;
                    };
                    if inventory.count_of(Resource::Fish) > 0 {
                        Resource::Fish
                    } else if inventory.count_of(Resource::Meat) > 0 {
                        Resource::Meat
                    } else {
                        Resource::Bread
                    }
                }
                Scheduled::Res(res) => res,
            };

            let tiles = self.flag_path_tile_dist(src_flag, dest_flag).unwrap_or(0);
            let timeout = self
                .tick
                .wrapping_add(REQUEST_TIMEOUT_TICKS_PER_TILE * tiles.max(1));

            let building_idx = self.flags.get(dest_flag).map_or(0, |f| f.building());
            let granted = self.buildings.get_mut(building_idx).is_some_and(|b| {
                b.stock_for(res).is_some_and(|i| {
                    let stock = &mut b.stocks_mut()[i];
                    if stock.missing() == 0 {
                        return false;
                    }
                    stock.push_request(timeout);
                    true
                })
            });
            if !granted {
                continue;
            }
            let queued = self
                .inventories
                .get_mut(inv_idx)
                .is_some_and(|inv| inv.add_to_queue(res, dest_flag));
            if !queued {
                // Undo the request; nothing is actually coming.
                if let Some(building) = self.buildings.get_mut(building_idx) {
                    if let Some(i) = building.stock_for(res) {
                        building.stocks_mut()[i].consume_request();
                    }
                }
            } else {
                tracing::trace!(
                    res = ?res,
                    from = src_flag,
                    to = dest_flag,
                    timeout,
                    "resource scheduled"
                );
            }
        }
    }

    /// Re-check every edge marked as staffed against the serfs actually
    /// serving it, clearing stale marks so the next flag update re-requests
    /// a transporter. Returns how many edges were repaired.
    ///
    /// Exposed for maintenance passes (the AI runs this when it suspects a
    /// road lost its carrier).
    pub fn audit_road_staffing(&mut self) -> u32 {
        use crate::serf::SerfState;

        // Anchors of live transporter assignments.
        let mut anchors: Vec<(FlagIndex, Direction)> = Vec::new();
        for (_, serf) in self.serfs.iter() {
            match serf.state() {
                SerfState::Transporting { flag, dir, .. }
                | SerfState::IdleOnPath { flag, dir }
                | SerfState::WaitIdleOnPath { flag, dir }
                | SerfState::WakeAtFlag { flag, dir }
                | SerfState::WakeOnPath { flag, dir } => anchors.push((*flag, *dir)),
                SerfState::Walking {
                    mission: crate::serf::Mission::ServeRoad { flag, dir },
                    ..
                } => anchors.push((*flag, *dir)),
                _ => {}
            }
        }

        let mut repaired = 0;
        for flag_idx in self.flags.indices() {
            for dir in Direction::ALL {
                let Some(flag) = self.flags.get(flag_idx) else {
                    continue;
                };
                let Some(edge) = flag.edge(dir) else {
                    continue;
                };
                if !edge.has_transporter {
                    continue;
                }
                let far_idx = edge.endpoint;
                let far_dir = self.flags.get(far_idx).and_then(|f| f.dir_to(flag_idx));
                let served = anchors.iter().any(|(f, d)| {
                    (*f == flag_idx && *d == dir)
                        || (*f == far_idx && Some(*d) == far_dir)
                });
                if !served {
                    if let Some(flag) = self.flags.get_mut(flag_idx) {
                        if let Some(edge) = flag.edge_mut(dir) {
                            edge.has_transporter = false;
                            edge.serf_requested = false;
                        }
                    }
                    repaired += 1;
                }
            }
        }
        repaired
    }

    /// An out-mode inventory pushes its highest-priority resource toward
    /// any other accepting inventory.
    fn push_out_mode_inventory(&mut self, player_idx: u8, inv_idx: InventoryIndex) {
        let pick = {
            let Some(player) = self.player(player_idx) else {
                return;
            };
            let Some(inventory) = self.inventories.get(inv_idx) else {
                return;
            };
            let mut pick: Option<(u8, Resource)> = None;
            for res in Resource::ALL {
                if inventory.count_of(res) == 0 {
                    continue;
                }
                let prio = player.inventory_prio_of(res);
                if pick.map_or(true, |(best, _)| prio > best) {
                    pick = Some((prio, res));
                }
            }
            pick
        };
        if let Some((_, res)) = pick {
            if let Some(inventory) = self.inventories.get_mut(inv_idx) {
                inventory.add_to_queue(res, 0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::map::{Map, Terrain};
    use crate::pathfind::Road;

    fn flat_game() -> Game {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            map.set_height(pos, 10);
        }
        Game::with_map(map, 42)
    }

    /// Castle at (6,6) plus a second flag three tiles east of its flag.
    fn game_with_road() -> (Game, u8, FlagIndex, FlagIndex) {
        let mut game = flat_game();
        let player = game.add_player(12, 64, 35, 30, 40).unwrap();
        let castle_pos = game.map().pos(6, 6);
        assert!(game.build_castle(castle_pos, player));
        let a = game.map().neighbor(castle_pos, Direction::DownRight);
        let mut b = a;
        for _ in 0..3 {
            b = game.map().neighbor(b, Direction::Right);
        }
        assert!(game.build_flag(b, player));
        let mut road = Road::start(a);
        for _ in 0..3 {
            road.extend(Direction::Right);
        }
        assert!(game.build_road(&road, player));
        let a_idx = game.map().get_obj_index(a);
        let b_idx = game.map().get_obj_index(b);
        (game, player, a_idx, b_idx)
    }

    #[test]
    fn test_flag_update_routes_toward_destination() {
        let (mut game, _, a_idx, b_idx) = game_with_road();
        game.flags
            .get_mut(a_idx)
            .unwrap()
            .push_resource(Resource::Plank, b_idx);
        game.update_flags();

        let flag = game.flags().get(a_idx).unwrap();
        let slot = flag.slots()[0].unwrap();
        assert_eq!(slot.dest, b_idx);
        assert_eq!(slot.dir, Some(Direction::Right));
    }

    #[test]
    fn test_flag_update_reroutes_dead_destination() {
        let (mut game, _, a_idx, b_idx) = game_with_road();
        // Castle flag is a_idx and accepts resources; a slot pointing at a
        // flag that no longer exists goes home instead.
        game.flags
            .get_mut(b_idx)
            .unwrap()
            .push_resource(Resource::Stone, 999);
        game.update_flags();

        let flag = game.flags().get(b_idx).unwrap();
        let slot = flag.slots()[0].unwrap();
        assert_eq!(slot.dest, a_idx);
    }

    #[test]
    fn test_roads_request_transporters() {
        let (mut game, _, a_idx, _) = game_with_road();
        game.update_flags();
        let edge = game
            .flags()
            .get(a_idx)
            .unwrap()
            .edge(Direction::Right)
            .unwrap();
        assert!(
            edge.serf_requested || edge.has_transporter,
            "road should have asked for a transporter"
        );
    }

    #[test]
    fn test_flag_path_tile_dist() {
        let (game, _, a_idx, b_idx) = game_with_road();
        assert_eq!(game.flag_path_tile_dist(a_idx, b_idx), Some(3));
        assert_eq!(game.flag_path_tile_dist(a_idx, a_idx), Some(0));
    }

    #[test]
    fn test_local_delivery_into_inventory() {
        let (mut game, _, a_idx, _) = game_with_road();
        let before = {
            let inv = game.inventories().iter().next().unwrap().1;
            inv.count_of(Resource::Stone)
        };
        game.flags
            .get_mut(a_idx)
            .unwrap()
            .push_resource(Resource::Stone, a_idx);
        game.update_flags();

        let after = game
            .inventories()
            .iter()
            .next()
            .unwrap()
            .1
            .count_of(Resource::Stone);
        assert_eq!(after, before + 1);
        assert_eq!(game.flags().get(a_idx).unwrap().slot_count(), 0);
    }

    #[test]
    fn test_scheduler_matches_supply_to_demand() {
        let (mut game, _, a_idx, b_idx) = game_with_road();
        // A sawmill-style demand at flag B.
        let building_idx = {
            let pos = game.flags().get(b_idx).unwrap().pos();
            let bpos = game.map().neighbor(pos, Direction::UpLeft);
            let mut building =
                crate::building::Building::new(crate::building::BuildingType::Sawmill, bpos, 0, b_idx);
            building.finish_construction();
            let idx = game.buildings.insert(building).unwrap();
            game.flags.get_mut(b_idx).unwrap().link_building(idx);
            idx
        };
        // Give demand a priority and the castle some lumber.
        {
            let building = game.buildings.get_mut(building_idx).unwrap();
            let i = building.stock_for(Resource::Lumber).unwrap();
            building.stocks_mut()[i].prio = 64;
        }
        let inv_idx = game.inventories().iter().next().unwrap().0;
        game.inventories
            .get_mut(inv_idx)
            .unwrap()
            .set_count(Resource::Lumber, 5);

        game.update_inventories();

        let building = game.buildings().get(building_idx).unwrap();
        let i = building.stock_for(Resource::Lumber).unwrap();
        assert_eq!(building.stocks()[i].requested, 1);
        let inventory = game.inventories().get(inv_idx).unwrap();
        assert!(inventory.has_queued());
        assert_eq!(inventory.count_of(Resource::Lumber), 4);
        // Ignore flags whose route cannot be resolved yet.
        let _ = a_idx;
    }

    #[test]
    fn test_out_mode_inventory_queues_contents() {
        let (mut game, _, _, _) = game_with_road();
        let inv_idx = game.inventories().iter().next().unwrap().0;
        game.inventories
            .get_mut(inv_idx)
            .unwrap()
            .set_count(Resource::Plank, 3);
        game.set_inventory_resource_mode(inv_idx, InventoryMode::Out);

        game.update_inventories();
        assert!(game.inventories().get(inv_idx).unwrap().has_queued());
    }
}
