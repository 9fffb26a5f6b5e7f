//! Per-tick building update.
//!
//! Burning buildings count down and collapse; construction sites keep their
//! plank/stone demand advertised and a builder requested; finished buildings
//! advertise input demand from the owner's priority settings, expire
//! overdue resource requests (rerouting whatever is in flight), keep their
//! worker or garrison requested, and inventories feed their out-queues.

use crate::building::BuildingType;
use crate::game::{Game, SerfRequest};
use crate::map::Object;
use crate::resource::Resource;
use crate::serf::{Mission, SerfState, SerfType};

impl Game {
    /// Update every building, in index order.
    pub(crate) fn update_buildings(&mut self) {
        for idx in self.buildings.indices() {
            self.update_building(idx);
        }
    }

    fn update_building(&mut self, idx: u32) {
        let Some(building) = self.buildings.get(idx) else {
            return;
        };

        if building.is_burning() {
            let pos = building.pos();
            let done = self
                .buildings
                .get_mut(idx)
                .unwrap()
                .decrease_burning_counter(self.tick_diff as i32);
            if done {
                self.map.set_obj(pos, Object::None, 0);
                self.buildings.remove(idx);
            }
            return;
        }

        let tick = self.tick;
        self.buildings.get_mut(idx).unwrap().set_tick(tick);

        self.expire_stock_requests(idx);

        let building = self.buildings.get(idx).unwrap();
        if building.is_done() {
            self.update_done_building(idx);
        } else {
            self.update_unfinished_building(idx);
        }
    }

    /// Cancel requests whose travel deadline passed and reroute the
    /// resources already on the road.
    fn expire_stock_requests(&mut self, idx: u32) {
        if !self.options.resource_requests_time_out {
            return;
        }
        let tick = self.tick;
        let Some(building) = self.buildings.get_mut(idx) else {
            return;
        };
        let flag_idx = building.flag();
        let mut expirations: Vec<(Resource, u32)> = Vec::new();
        for stock in building.stocks_mut() {
            let Some(res) = stock.res else {
                continue;
            };
            let expired = stock.expire_requests(tick);
            if expired > 0 {
                expirations.push((res, expired));
            }
        }
        for (res, count) in expirations {
            tracing::debug!(building = idx, ?res, count, "resource requests timed out");
            for _ in 0..count {
                self.cancel_transported_resource(res, flag_idx);
            }
        }
    }

    fn update_unfinished_building(&mut self, idx: u32) {
        // Advertise construction demand.
        {
            let plank_prio = self
                .player(self.buildings.get(idx).unwrap().owner())
                .map_or(255, |p| (p.planks_split[0] >> 8) as u8);
            let building = self.buildings.get_mut(idx).unwrap();
            for stock in building.stocks_mut() {
                stock.prio = if stock.is_active() && stock.missing() > 0 {
                    plank_prio.max(16)
                } else {
                    0
                };
            }
        }
        // One builder runs the site.
        self.request_building_serf(idx, SerfType::Builder);
    }

    fn update_done_building(&mut self, idx: u32) {
        let typ = self.buildings.get(idx).unwrap().building_type();

        self.refresh_stock_priorities(idx);

        if typ.is_military() {
            self.update_military_building(idx);
            if typ != BuildingType::Castle {
                return;
            }
        }

        if typ.has_inventory() {
            self.service_out_queue(idx);
            return;
        }

        if let Some(worker) = typ.worker() {
            self.request_building_serf(idx, worker);
        }
    }

    /// Demand priority of each input stock, from the owner's settings.
    fn refresh_stock_priorities(&mut self, idx: u32) {
        let Some(building) = self.buildings.get(idx) else {
            return;
        };
        let typ = building.building_type();
        let owner = building.owner();
        let Some(player) = self.player(owner) else {
            return;
        };

        let prio_for = |res: Resource| -> u8 {
            let setting = match (typ, res) {
                (BuildingType::StoneMine, Resource::Fish) => player.food_to_mines[0],
                (BuildingType::CoalMine, Resource::Fish) => player.food_to_mines[1],
                (BuildingType::IronMine, Resource::Fish) => player.food_to_mines[2],
                (BuildingType::GoldMine, Resource::Fish) => player.food_to_mines[3],
                (BuildingType::Boatbuilder, Resource::Plank) => player.planks_split[1],
                (BuildingType::ToolMaker, Resource::Plank) => player.planks_split[2],
                (BuildingType::ToolMaker, Resource::Steel) => player.steel_split[0],
                (BuildingType::WeaponSmith, Resource::Steel) => player.steel_split[1],
                (BuildingType::SteelSmelter, Resource::Coal) => player.coal_split[0],
                (BuildingType::GoldSmelter, Resource::Coal) => player.coal_split[1],
                (BuildingType::WeaponSmith, Resource::Coal) => player.coal_split[2],
                (BuildingType::PigFarm, Resource::Wheat) => player.wheat_split[0],
                (BuildingType::Mill, Resource::Wheat) => player.wheat_split[1],
                // Non-configurable inputs move at a fixed healthy priority.
                _ => 58_000,
            };
            ((setting >> 8) as u8).max(16)
        };

        let prios: Vec<Option<u8>> = building
            .stocks()
            .iter()
            .map(|s| {
                s.res
                    .filter(|_| s.missing() > 0)
                    .map(prio_for)
            })
            .collect();

        let building = self.buildings.get_mut(idx).unwrap();
        for (stock, prio) in building.stocks_mut().iter_mut().zip(prios) {
            stock.prio = prio.unwrap_or(0);
        }
    }

    /// Keep the military building's garrison requested up to the staffing
    /// target for its threat band.
    fn update_military_building(&mut self, idx: u32) {
        let Some(building) = self.buildings.get(idx) else {
            return;
        };
        let owner = building.owner();
        let typ = building.building_type();
        let threat = building.threat_level();
        let flag_idx = building.flag();
        if building.serf_requested() || building.serf_request_failed() {
            return;
        }
        let capacity = typ.knight_capacity();
        if capacity == 0 {
            return;
        }
        let wanted = self
            .player(owner)
            .map_or(1, |p| p.knights_wanted(threat, capacity));
        let garrison = self.knight_chain(idx).len() as u32;
        if garrison >= wanted {
            return;
        }

        let granted = self.send_serf_to_flag(
            flag_idx,
            SerfRequest::Knight { min_rank: 0 },
            Mission::OccupyBuilding { building: idx },
        );
        let Some(building) = self.buildings.get_mut(idx) else {
            return;
        };
        if granted {
            building.set_serf_requested(true);
        } else {
            building.set_serf_request_failed(true);
        }
    }

    /// Request the building's holder serf if it has none yet.
    fn request_building_serf(&mut self, idx: u32, typ: SerfType) {
        let Some(building) = self.buildings.get(idx) else {
            return;
        };
        if building.has_holder() || building.serf_requested() || building.serf_request_failed() {
            return;
        }
        let flag_idx = building.flag();
        let granted = self.send_serf_to_flag(
            flag_idx,
            SerfRequest::Worker(typ),
            Mission::OccupyBuilding { building: idx },
        );
        let Some(building) = self.buildings.get_mut(idx) else {
            return;
        };
        if granted {
            building.set_serf_requested(true);
        } else {
            building.set_serf_request_failed(true);
        }
    }

    /// Move queued inventory resources onto the flag via a carrier serf.
    fn service_out_queue(&mut self, idx: u32) {
        let Some(building) = self.buildings.get(idx) else {
            return;
        };
        let inv_idx = building.inventory();
        let pos = building.pos();
        let Some(inventory) = self.inventories.get(inv_idx) else {
            return;
        };
        if !inventory.has_queued() {
            return;
        }

        // An idle inventory carrier (or, failing that, a generic serf)
        // walks the next entry out to the flag.
        let carrier = self
            .serfs
            .iter()
            .find_map(|(i, serf)| {
                let idle_here = matches!(
                    serf.state(),
                    SerfState::IdleInStock { inventory } if *inventory == inv_idx
                );
                (idle_here
                    && (serf.serf_type() == SerfType::TransporterInventory
                        || serf.serf_type() == SerfType::Generic))
                .then_some(i)
            });
        let Some(carrier_idx) = carrier else {
            return;
        };

        let entry = {
            let inventory = self.inventories.get_mut(inv_idx).unwrap();
            inventory.pop_queue()
        };
        let Some(entry) = entry else {
            return;
        };
        let carrier_type = self.serfs.get(carrier_idx).unwrap().serf_type();
        self.inventories
            .get_mut(inv_idx)
            .unwrap()
            .serf_out(carrier_type);
        if let Some(serf) = self.serfs.get_mut(carrier_idx) {
            serf.set_pos(pos);
            serf.set_counter(31);
            serf.log_state_change(
                carrier_idx,
                SerfState::MoveResourceOut {
                    res: entry.res,
                    res_dest: entry.dest,
                    inventory: inv_idx,
                },
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::building::Building;
    use crate::map::{Direction, Map, Terrain};
    use crate::pathfind::Road;

    fn flat_game() -> Game {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
            map.set_height(pos, 10);
        }
        Game::with_map(map, 42)
    }

    fn game_with_castle() -> (Game, u8) {
        let mut game = flat_game();
        let player = game.add_player(12, 64, 35, 30, 40).unwrap();
        assert!(game.build_castle(game.map().pos(6, 6), player));
        (game, player)
    }

    #[test]
    fn test_burning_building_collapses() {
        let (mut game, player) = game_with_castle();
        let castle_flag = game
            .map()
            .neighbor(game.map().pos(6, 6), Direction::DownRight);
        let b = {
            let mut p = castle_flag;
            for _ in 0..3 {
                p = game.map().neighbor(p, Direction::Right);
            }
            p
        };
        let site = game.map().neighbor(b, Direction::UpLeft);
        assert!(game.build_building(site, BuildingType::Hut, player));
        let building_idx = game.map().get_obj_index(site);

        assert!(game.demolish_building(site, player));
        assert!(game.buildings().get(building_idx).unwrap().is_burning());

        // Enough updates to burn 2047 ticks down.
        for _ in 0..1100 {
            game.update();
        }
        assert!(game.buildings().get(building_idx).is_none());
        assert_eq!(game.map().get_obj(site), Object::None);
    }

    #[test]
    fn test_construction_site_advertises_demand() {
        let (mut game, player) = game_with_castle();
        let castle_flag = game
            .map()
            .neighbor(game.map().pos(6, 6), Direction::DownRight);
        let b = {
            let mut p = castle_flag;
            for _ in 0..3 {
                p = game.map().neighbor(p, Direction::Right);
            }
            p
        };
        let site = game.map().neighbor(b, Direction::UpLeft);
        assert!(game.build_building(site, BuildingType::Lumberjack, player));
        let mut road = Road::start(castle_flag);
        for _ in 0..3 {
            road.extend(Direction::Right);
        }
        assert!(game.build_road(&road, player));

        game.update();
        let building_idx = game.map().get_obj_index(site);
        let building = game.buildings().get(building_idx).unwrap();
        let plank_stock = building.stock_for(Resource::Plank).unwrap();
        assert!(building.stocks()[plank_stock].prio >= 16);
    }

    #[test]
    fn test_scheduler_feeds_construction_site() {
        let (mut game, player) = game_with_castle();
        let castle_flag = game
            .map()
            .neighbor(game.map().pos(6, 6), Direction::DownRight);
        let b = {
            let mut p = castle_flag;
            for _ in 0..3 {
                p = game.map().neighbor(p, Direction::Right);
            }
            p
        };
        let site = game.map().neighbor(b, Direction::UpLeft);
        assert!(game.build_building(site, BuildingType::Lumberjack, player));
        let mut road = Road::start(castle_flag);
        for _ in 0..3 {
            road.extend(Direction::Right);
        }
        assert!(game.build_road(&road, player));

        // A few scheduler cadences.
        for _ in 0..100 {
            game.update();
        }
        let building_idx = game.map().get_obj_index(site);
        let building = game.buildings().get(building_idx).unwrap();
        let plank_stock = building.stock_for(Resource::Plank).unwrap();
        let stock = &building.stocks()[plank_stock];
        assert!(
            stock.available + stock.requested > 0,
            "construction planks should be requested or delivered"
        );
    }

    #[test]
    fn test_timeout_cancels_unreachable_request() {
        let (mut game, _) = game_with_castle();
        // A building with a request that can never be fulfilled.
        let far_pos = game.map().pos(40, 40);
        let flag_pos = game.map().neighbor(far_pos, Direction::DownRight);
        let flag_idx = game.flags.insert(crate::flag::Flag::new(flag_pos, 0)).unwrap();
        let mut building = Building::new(BuildingType::Baker, far_pos, 0, flag_idx);
        building.finish_construction();
        let i = building.stock_for(Resource::Flour).unwrap();
        building.stocks_mut()[i].push_request(game.tick() + 10);
        let idx = game.buildings.insert(building).unwrap();
        game.flags.get_mut(flag_idx).unwrap().link_building(idx);

        for _ in 0..10 {
            game.update();
        }
        let building = game.buildings().get(idx).unwrap();
        assert_eq!(building.stocks()[i].requested, 0);
    }
}
