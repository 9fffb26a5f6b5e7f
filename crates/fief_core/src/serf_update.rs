//! Per-tick serf behaviour.
//!
//! Each serf's update clones its record, burns down the sub-tick counter and
//! dispatches on the state machine; the mutated record is written back at
//! the end (or dropped if the serf died). Handlers never mutate their own
//! serf through the pool, so a state staged by another entity earlier in the
//! tick is observed atomically at this serf's next update, never mid-action.
//!
//! Transient failures follow one rule: a vanished destination, building,
//! flag or road drops the serf to `Lost`, from where it walks home to the
//! nearest inventory accepting serfs, or dies when there is none.

use crate::building::{BuildingIndex, BuildingType};
use crate::flag::FlagIndex;
use crate::flag_search;
use crate::game::Game;
use crate::map::{Direction, MapPos, Object, Space};
use crate::pathfind::trace_existing_road;
use crate::player::NotificationKind;
use crate::resource::Resource;
use crate::serf::{Mission, Serf, SerfIndex, SerfState, WorkKind};

/// Base ticks to walk one tile.
const WALK_TICKS: i32 = 32;

/// Extra ticks per height step climbed.
const CLIMB_TICKS: i32 = 12;

/// Delay entering or leaving a building.
const DOOR_TICKS: i32 = 24;

/// Sleep interval of a parked transporter.
const IDLE_TICKS: i32 = 64;

/// Pause between duel rounds.
const FIGHT_TICKS: i32 = 127;

/// Geologist samples per trip.
const GEO_SAMPLES: u8 = 5;

/// Ticks to hammer one geologist sample.
const GEO_SAMPLE_TICKS: i32 = 512;

/// What to do with the serf after its handler ran.
enum Outcome {
    Keep,
    Delete,
}

impl Game {
    /// Update every serf, in index order.
    pub(crate) fn update_serfs(&mut self) {
        for idx in self.serfs.indices() {
            self.update_serf(idx);
        }
    }

    fn update_serf(&mut self, idx: SerfIndex) {
        let Some(serf) = self.serfs.get(idx) else {
            return;
        };
        let mut serf = serf.clone();
        let delta = self.tick.wrapping_sub(serf.tick()) as i32;
        serf.set_tick(self.tick);
        serf.set_counter(serf.counter() - delta);

        let mut outcome = Outcome::Keep;
        // Bounded dispatch loop: every pass either consumes counter debt or
        // breaks after scheduling a wait.
        for _ in 0..16 {
            if serf.counter() >= 0 {
                break;
            }
            match self.dispatch(idx, &mut serf) {
                Outcome::Keep => {}
                Outcome::Delete => {
                    outcome = Outcome::Delete;
                    break;
                }
            }
        }

        match outcome {
            Outcome::Keep => {
                if let Some(slot) = self.serfs.get_mut(idx) {
                    *slot = serf;
                }
            }
            Outcome::Delete => {
                self.delete_serf(idx);
            }
        }
    }

    fn dispatch(&mut self, idx: SerfIndex, serf: &mut Serf) -> Outcome {
        let state = serf.state().clone();
        match state {
            SerfState::IdleInStock { .. } | SerfState::KnightDefending { .. } => {
                serf.set_counter(0);
                Outcome::Keep
            }
            SerfState::ReadyToLeaveInventory {
                inventory,
                dest,
                mission,
            } => self.handle_ready_to_leave_inventory(idx, serf, inventory, dest, mission),
            SerfState::Walking { dest, mission } => self.handle_walking(idx, serf, dest, mission),
            SerfState::FreeWalking { dest_pos, then } => {
                self.handle_free_walking(idx, serf, dest_pos, *then, false)
            }
            SerfState::Transporting {
                flag,
                dir,
                carrying,
            } => self.handle_transporting(idx, serf, flag, dir, carrying),
            SerfState::IdleOnPath { flag, dir } | SerfState::WaitIdleOnPath { flag, dir } => {
                self.handle_idle_on_path(idx, serf, flag, dir)
            }
            SerfState::WakeAtFlag { flag, dir } | SerfState::WakeOnPath { flag, dir } => {
                self.handle_wake(idx, serf, flag, dir)
            }
            SerfState::EnteringBuilding { building } => {
                self.handle_entering_building(idx, serf, building)
            }
            SerfState::LeavingBuilding { next_state } => {
                let flag_pos = self.map.neighbor(serf.pos(), Direction::DownRight);
                self.move_serf(idx, serf, flag_pos);
                serf.log_state_change(idx, *next_state);
                serf.set_counter(serf.counter() + DOOR_TICKS);
                Outcome::Keep
            }
            SerfState::ReadyToLeave { next_state } => {
                serf.log_state_change(idx, *next_state);
                serf.set_counter(serf.counter() + DOOR_TICKS / 2);
                Outcome::Keep
            }
            SerfState::Digging { building } => self.handle_digging(idx, serf, building),
            SerfState::Constructing { building } => self.handle_constructing(idx, serf, building),
            SerfState::PlanningWork { kind, building } => {
                self.handle_planning_work(idx, serf, kind, building)
            }
            SerfState::Working {
                kind,
                building,
                spot,
            } => self.handle_working(idx, serf, kind, building, spot),
            SerfState::Mining { building } => self.handle_mining(idx, serf, building),
            SerfState::Refining { building } => self.handle_refining(idx, serf, building),
            SerfState::MoveResourceOut {
                res,
                res_dest,
                inventory,
            } => {
                let flag_pos = self
                    .inventories
                    .get(inventory)
                    .and_then(|inv| self.flags.get(inv.flag()))
                    .map(crate::flag::Flag::pos);
                match flag_pos {
                    Some(pos) => {
                        self.move_serf(idx, serf, pos);
                        serf.log_state_change(
                            idx,
                            SerfState::DropResourceOut {
                                res,
                                res_dest,
                                inventory,
                            },
                        );
                        serf.set_counter(serf.counter() + DOOR_TICKS);
                    }
                    None => {
                        self.lose_resource(res);
                        serf.log_state_change(idx, SerfState::Lost);
                    }
                }
                Outcome::Keep
            }
            SerfState::DropResourceOut {
                res,
                res_dest,
                inventory,
            } => self.handle_drop_resource_out(idx, serf, res, res_dest, inventory),
            SerfState::LookingForGeoSpot { flag, samples_left } => {
                self.handle_looking_for_geo_spot(idx, serf, flag, samples_left)
            }
            SerfState::SamplingGeoSpot {
                flag,
                samples_left,
                spot,
            } => self.handle_sampling(idx, serf, flag, samples_left, spot),
            SerfState::KnightEngagingBuilding { building } => {
                self.handle_knight_engaging(idx, serf, building)
            }
            SerfState::KnightPrepareAttacking { building } => {
                let chain = self.knight_chain(building);
                match chain.first() {
                    Some(defender) => {
                        self.play_sound(crate::game::Sound::Fight);
                        serf.log_state_change(
                            idx,
                            SerfState::KnightAttacking {
                                building,
                                defender: *defender,
                            },
                        );
                    }
                    None => {
                        serf.log_state_change(
                            idx,
                            SerfState::KnightOccupyEnemyBuilding { building },
                        );
                    }
                }
                serf.set_counter(serf.counter() + FIGHT_TICKS);
                Outcome::Keep
            }
            SerfState::KnightAttacking { building, defender } => {
                self.handle_knight_attacking(idx, serf, building, defender)
            }
            SerfState::KnightOccupyEnemyBuilding { building } => {
                self.handle_knight_occupy(idx, serf, building)
            }
            SerfState::KnightFreeWalking { dest_pos, building } => self.handle_free_walking(
                idx,
                serf,
                dest_pos,
                SerfState::KnightEngagingBuilding { building },
                true,
            ),
            SerfState::Lost => self.handle_lost(idx, serf),
            SerfState::EscapeBuilding => {
                let out = self.map.neighbor(serf.pos(), Direction::DownRight);
                if self.map.get_obj(out).space() < Space::Impassable {
                    self.move_serf(idx, serf, out);
                }
                serf.log_state_change(idx, SerfState::Lost);
                serf.set_counter(serf.counter() + WALK_TICKS);
                Outcome::Keep
            }
        }
    }

    // ------------------------------------------------------------------
    // Movement helpers
    // ------------------------------------------------------------------

    fn move_serf(&mut self, idx: SerfIndex, serf: &mut Serf, new_pos: MapPos) {
        if self.map.serf_index(serf.pos()) == idx {
            self.map.set_serf_index(serf.pos(), 0);
        }
        serf.set_pos(new_pos);
        if self.map.serf_index(new_pos) == 0 {
            self.map.set_serf_index(new_pos, idx);
        }
    }

    fn walk_cost(&self, from: MapPos, dir: Direction) -> i32 {
        let to = self.map.neighbor(from, dir);
        let climb = (self.map.get_height(to) as i32 - self.map.get_height(from) as i32).max(0);
        WALK_TICKS + climb * CLIMB_TICKS
    }

    /// One road step that does not turn back on itself.
    fn road_continuation(&self, pos: MapPos, came_from: Option<Direction>) -> Option<Direction> {
        Direction::ALL.into_iter().find(|d| {
            self.map.has_path(pos, *d) && Some(d.reverse()) != came_from
        })
    }

    /// Clean up request bits a failed trip leaves behind.
    fn abort_mission(&mut self, mission: Mission) {
        match mission {
            Mission::ServeRoad { flag, dir } => {
                if let Some(f) = self.flags.get_mut(flag) {
                    if let Some(edge) = f.edge_mut(dir) {
                        edge.serf_requested = false;
                    }
                }
            }
            Mission::OccupyBuilding { building } => {
                if let Some(b) = self.buildings.get_mut(building) {
                    b.set_serf_requested(false);
                }
            }
            _ => {}
        }
    }

    /// Mark the road of `(flag, dir)` staffed on both endpoint edges.
    fn mark_road_staffed(&mut self, flag_idx: FlagIndex, dir: Direction, staffed: bool) {
        let far = self
            .flags
            .get(flag_idx)
            .and_then(|f| f.edge(dir))
            .map(|e| e.endpoint);
        if let Some(f) = self.flags.get_mut(flag_idx) {
            if let Some(edge) = f.edge_mut(dir) {
                edge.has_transporter = staffed;
                edge.serf_requested = false;
            }
        }
        if let Some(far_idx) = far {
            let back_dir = self.flags.get(far_idx).and_then(|f| f.dir_to(flag_idx));
            if let Some(back_dir) = back_dir {
                if let Some(f) = self.flags.get_mut(far_idx) {
                    if let Some(edge) = f.edge_mut(back_dir) {
                        edge.has_transporter = staffed;
                        edge.serf_requested = false;
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Inventory exits and road walking
    // ------------------------------------------------------------------

    fn handle_ready_to_leave_inventory(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        inventory: u32,
        dest: FlagIndex,
        mission: Mission,
    ) -> Outcome {
        if !self.flags.exists(dest) {
            self.abort_mission(mission);
            // Never left; settle back into the stock.
            let typ = serf.serf_type();
            if let Some(inv) = self.inventories.get_mut(inventory) {
                inv.serf_in(typ);
                serf.log_state_change(idx, SerfState::IdleInStock { inventory });
            } else {
                serf.log_state_change(idx, SerfState::Lost);
            }
            serf.set_counter(0);
            return Outcome::Keep;
        }
        let flag_pos = self
            .inventories
            .get(inventory)
            .and_then(|inv| self.flags.get(inv.flag()))
            .map(crate::flag::Flag::pos);
        match flag_pos {
            Some(pos) => {
                self.move_serf(idx, serf, pos);
                serf.set_walk_dir(None);
                serf.log_state_change(idx, SerfState::Walking { dest, mission });
                serf.set_counter(serf.counter() + DOOR_TICKS);
            }
            None => {
                self.abort_mission(mission);
                serf.log_state_change(idx, SerfState::Lost);
            }
        }
        Outcome::Keep
    }

    fn handle_walking(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        dest: FlagIndex,
        mission: Mission,
    ) -> Outcome {
        let Some(dest_pos) = self.flags.get(dest).map(crate::flag::Flag::pos) else {
            self.abort_mission(mission);
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return Outcome::Keep;
        };

        if serf.pos() == dest_pos {
            return self.arrive_at_destination(idx, serf, dest, mission);
        }

        // Pick the next step: flags route by graph search, road interiors
        // follow the unique continuation.
        let dir = if self.map.has_flag(serf.pos()) {
            let cur = self.map.get_obj_index(serf.pos());
            flag_search::next_dir_toward(&self.flags, cur, dest)
        } else {
            self.road_continuation(serf.pos(), serf.walk_dir())
        };

        match dir {
            Some(dir) if self.map.has_path(serf.pos(), dir) => {
                let cost = self.walk_cost(serf.pos(), dir);
                let next = self.map.neighbor(serf.pos(), dir);
                self.move_serf(idx, serf, next);
                serf.set_walk_dir(Some(dir));
                serf.set_counter(serf.counter() + cost);
            }
            _ => {
                self.abort_mission(mission);
                serf.log_state_change(idx, SerfState::Lost);
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
        }
        Outcome::Keep
    }

    fn arrive_at_destination(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        dest: FlagIndex,
        mission: Mission,
    ) -> Outcome {
        match mission {
            Mission::OccupyBuilding { building } => {
                let alive = self
                    .buildings
                    .get(building)
                    .is_some_and(|b| !b.is_burning());
                if alive {
                    serf.log_state_change(idx, SerfState::EnteringBuilding { building });
                    serf.set_counter(serf.counter() + DOOR_TICKS);
                } else {
                    self.abort_mission(mission);
                    serf.log_state_change(idx, SerfState::Lost);
                }
            }
            Mission::ServeRoad { flag, dir } => {
                let edge_alive = self.flags.get(flag).is_some_and(|f| f.has_edge(dir));
                if edge_alive {
                    self.mark_road_staffed(flag, dir, true);
                    serf.log_state_change(
                        idx,
                        SerfState::Transporting {
                            flag,
                            dir,
                            carrying: None,
                        },
                    );
                } else {
                    serf.log_state_change(idx, SerfState::Lost);
                }
                serf.set_counter(serf.counter() + WALK_TICKS / 2);
            }
            Mission::Prospect { flag } => {
                serf.log_state_change(
                    idx,
                    SerfState::LookingForGeoSpot {
                        flag,
                        samples_left: GEO_SAMPLES,
                    },
                );
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
            Mission::ReturnHome => {
                let entry = self.flags.get(dest).filter(|f| f.has_inventory()).map(|f| {
                    (
                        f.building(),
                        self.buildings.get(f.building()).map_or(0, |b| b.inventory()),
                    )
                });
                match entry {
                    Some((building_idx, inv_idx)) if inv_idx != 0 => {
                        let typ = serf.serf_type();
                        let building_pos =
                            self.buildings.get(building_idx).map_or(serf.pos(), |b| b.pos());
                        self.move_serf(idx, serf, building_pos);
                        if let Some(inv) = self.inventories.get_mut(inv_idx) {
                            inv.serf_in(typ);
                        }
                        serf.log_state_change(idx, SerfState::IdleInStock { inventory: inv_idx });
                        serf.set_counter(0);
                    }
                    _ => {
                        serf.log_state_change(idx, SerfState::Lost);
                        serf.set_counter(serf.counter() + WALK_TICKS);
                    }
                }
            }
            Mission::Attack { building } => {
                serf.log_state_change(idx, SerfState::KnightEngagingBuilding { building });
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
        }
        Outcome::Keep
    }

    fn handle_free_walking(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        dest_pos: MapPos,
        then: SerfState,
        is_knight: bool,
    ) -> Outcome {
        if serf.pos() == dest_pos {
            serf.log_state_change(idx, then);
            serf.set_counter(serf.counter() + WALK_TICKS / 4);
            return Outcome::Keep;
        }

        let here = self.map.hex_dist(serf.pos(), dest_pos);
        let mut best: Option<(u32, Direction)> = None;
        for dir in Direction::ALL {
            let next = self.map.neighbor(serf.pos(), dir);
            let passable = if next == dest_pos {
                // The goal cell itself may be a building or work object.
                !self.map.is_water_tile(next)
            } else {
                self.map.get_obj(next).space() <= Space::Semipassable
                    && !self.map.is_water_tile(next)
            };
            if !passable {
                continue;
            }
            let d = self.map.hex_dist(next, dest_pos);
            if best.map_or(true, |(bd, _)| d < bd) {
                best = Some((d, dir));
            }
        }

        match best {
            Some((d, dir)) if d < here => {
                let cost = self.walk_cost(serf.pos(), dir);
                let next = self.map.neighbor(serf.pos(), dir);
                self.move_serf(idx, serf, next);
                serf.set_walk_dir(Some(dir));
                serf.set_counter(serf.counter() + cost);
            }
            _ if is_knight => {
                // Knights wait out a blocked route and try again.
                serf.set_counter(serf.counter() + 8 * WALK_TICKS);
            }
            _ => {
                serf.log_state_change(idx, SerfState::Lost);
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
        }
        Outcome::Keep
    }

    // ------------------------------------------------------------------
    // Transport service
    // ------------------------------------------------------------------

    /// Cells of the road anchored at `(flag, dir)`, endpoint flags included.
    fn road_cells(&self, flag_idx: FlagIndex, dir: Direction) -> Option<Vec<MapPos>> {
        let flag = self.flags.get(flag_idx)?;
        let road = trace_existing_road(&self.map, flag.pos(), dir);
        if !road.is_valid() {
            return None;
        }
        let mut cells = vec![flag.pos()];
        let mut pos = flag.pos();
        for d in road.dirs() {
            pos = self.map.neighbor(pos, *d);
            cells.push(pos);
        }
        Some(cells)
    }

    fn step_along(&mut self, idx: SerfIndex, serf: &mut Serf, cells: &[MapPos], target: MapPos) {
        let Some(i) = cells.iter().position(|c| *c == serf.pos()) else {
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return;
        };
        let Some(t) = cells.iter().position(|c| *c == target) else {
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return;
        };
        if i == t {
            return;
        }
        let j = if t > i { i + 1 } else { i - 1 };
        let next = cells[j];
        let dir = Direction::ALL
            .into_iter()
            .find(|d| self.map.neighbor(serf.pos(), *d) == next);
        if let Some(dir) = dir {
            let cost = self.walk_cost(serf.pos(), dir);
            self.move_serf(idx, serf, next);
            serf.set_walk_dir(Some(dir));
            serf.set_counter(serf.counter() + cost);
        } else {
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
        }
    }

    fn handle_transporting(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        flag_idx: FlagIndex,
        dir: Direction,
        carrying: Option<(Resource, FlagIndex)>,
    ) -> Outcome {
        let edge = self.flags.get(flag_idx).and_then(|f| f.edge(dir)).copied();
        let Some(edge) = edge else {
            if let Some((res, _)) = carrying {
                self.lose_resource(res);
            }
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return Outcome::Keep;
        };
        let far_idx = edge.endpoint;
        let Some(cells) = self.road_cells(flag_idx, dir) else {
            if let Some((res, _)) = carrying {
                self.lose_resource(res);
            }
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return Outcome::Keep;
        };
        let near_pos = cells[0];
        let far_pos = *cells.last().unwrap();

        if let Some((res, dest)) = carrying {
            // Carry toward whichever endpoint is closer to the final
            // destination (the near end for unrouted strays).
            let near_better = match (
                flag_search::flag_dist(&self.flags, flag_idx, dest),
                flag_search::flag_dist(&self.flags, far_idx, dest),
            ) {
                (Some(a), Some(b)) => a <= b,
                (Some(_), None) => true,
                (None, Some(_)) => false,
                (None, None) => true,
            };
            let (target_pos, target_idx) = if near_better {
                (near_pos, flag_idx)
            } else {
                (far_pos, far_idx)
            };

            if serf.pos() == target_pos {
                // Drop at the flag: direct delivery when this is the
                // destination, otherwise requeue for the next hop.
                if target_idx == dest {
                    self.deliver_resource_at_flag(target_idx, res);
                } else {
                    let queued = self
                        .flags
                        .get_mut(target_idx)
                        .is_some_and(|f| f.push_resource(res, dest));
                    if !queued {
                        // Flag congested; hold on and retry.
                        serf.set_counter(serf.counter() + IDLE_TICKS);
                        return Outcome::Keep;
                    }
                }
                serf.log_state_change(
                    idx,
                    SerfState::Transporting {
                        flag: flag_idx,
                        dir,
                        carrying: None,
                    },
                );
                serf.set_counter(serf.counter() + WALK_TICKS / 4);
            } else {
                self.step_along(idx, serf, &cells, target_pos);
            }
            return Outcome::Keep;
        }

        // Unladen: look for queued work at either end of the road.
        let near_work = self
            .flags
            .get(flag_idx)
            .is_some_and(|f| f.has_resource_for(dir));
        let far_dir = self.flags.get(far_idx).and_then(|f| f.dir_to(flag_idx));
        let far_work = far_dir.is_some_and(|fd| {
            self.flags
                .get(far_idx)
                .is_some_and(|f| f.has_resource_for(fd))
        });

        if near_work || far_work {
            let (pickup_pos, pickup_flag, pickup_dir) = if near_work {
                (near_pos, flag_idx, dir)
            } else {
                (far_pos, far_idx, far_dir.unwrap())
            };
            if serf.pos() == pickup_pos {
                let slot = self
                    .flags
                    .get_mut(pickup_flag)
                    .and_then(|f| f.pick_up_resource(pickup_dir));
                if let Some(slot) = slot {
                    serf.log_state_change(
                        idx,
                        SerfState::Transporting {
                            flag: flag_idx,
                            dir,
                            carrying: Some((slot.res, slot.dest)),
                        },
                    );
                }
                serf.set_counter(serf.counter() + WALK_TICKS / 4);
            } else {
                self.step_along(idx, serf, &cells, pickup_pos);
            }
            return Outcome::Keep;
        }

        // Nothing to do: park mid-road.
        let park = cells[cells.len() / 2];
        if serf.pos() == park {
            self.map.set_idle_serf(serf.pos(), true);
            serf.log_state_change(idx, SerfState::IdleOnPath { flag: flag_idx, dir });
            serf.set_counter(serf.counter() + IDLE_TICKS);
        } else {
            self.step_along(idx, serf, &cells, park);
        }
        Outcome::Keep
    }

    fn handle_idle_on_path(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        flag_idx: FlagIndex,
        dir: Direction,
    ) -> Outcome {
        let edge_alive = self.flags.get(flag_idx).is_some_and(|f| f.has_edge(dir));
        if !edge_alive {
            self.map.set_idle_serf(serf.pos(), false);
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return Outcome::Keep;
        }

        let near_work = self
            .flags
            .get(flag_idx)
            .is_some_and(|f| f.has_resource_for(dir));
        let far = self
            .flags
            .get(flag_idx)
            .and_then(|f| f.edge(dir))
            .map(|e| e.endpoint);
        let far_work = far.is_some_and(|far_idx| {
            self.flags
                .get(far_idx)
                .and_then(|f| f.dir_to(flag_idx))
                .is_some_and(|fd| {
                    self.flags
                        .get(far_idx)
                        .is_some_and(|f| f.has_resource_for(fd))
                })
        });

        if near_work || far_work {
            self.map.set_idle_serf(serf.pos(), false);
            serf.log_state_change(idx, SerfState::WakeOnPath { flag: flag_idx, dir });
            serf.set_counter(serf.counter());
        } else {
            serf.set_counter(serf.counter() + IDLE_TICKS);
        }
        Outcome::Keep
    }

    fn handle_wake(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        flag_idx: FlagIndex,
        dir: Direction,
    ) -> Outcome {
        self.map.set_idle_serf(serf.pos(), false);
        let edge_alive = self.flags.get(flag_idx).is_some_and(|f| f.has_edge(dir));
        if edge_alive {
            serf.log_state_change(
                idx,
                SerfState::Transporting {
                    flag: flag_idx,
                    dir,
                    carrying: None,
                },
            );
        } else {
            serf.log_state_change(idx, SerfState::Lost);
        }
        serf.set_counter(serf.counter() + WALK_TICKS / 4);
        Outcome::Keep
    }

    // ------------------------------------------------------------------
    // Building entry and work
    // ------------------------------------------------------------------

    fn handle_entering_building(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let building_pos = building.pos();
        let typ = building.building_type();
        let is_done = building.is_done();
        let was_active = building.is_active();
        let leveling = building.is_leveling() && typ.size() == crate::building::BuildingSize::Large;

        self.move_serf(idx, serf, building_pos);
        if let Some(b) = self.buildings.get_mut(building_idx) {
            b.set_serf_requested(false);
        }

        if !is_done {
            // The builder runs the site: level first for large footprints.
            if let Some(b) = self.buildings.get_mut(building_idx) {
                b.set_holder(idx);
            }
            let next = if leveling {
                SerfState::Digging {
                    building: building_idx,
                }
            } else {
                SerfState::Constructing {
                    building: building_idx,
                }
            };
            serf.log_state_change(idx, next);
            serf.set_counter(serf.counter() + DOOR_TICKS);
            return Outcome::Keep;
        }

        if typ.is_military() {
            self.knight_chain_push_from_clone(building_idx, idx, serf);
            if !was_active {
                // First knight in: the post starts projecting territory.
                let owner = serf.owner();
                if let Some(p) = self.player_mut(owner) {
                    p.total_military_score += 1;
                }
                self.update_land_ownership(building_pos);
            } else if let Some(p) = self.player_mut(serf.owner()) {
                p.total_military_score += 1;
            }
            serf.set_counter(0);
            return Outcome::Keep;
        }

        if typ.has_inventory() {
            let inv_idx = self
                .buildings
                .get(building_idx)
                .map_or(0, crate::building::Building::inventory);
            if inv_idx != 0 {
                let styp = serf.serf_type();
                if let Some(inv) = self.inventories.get_mut(inv_idx) {
                    inv.serf_in(styp);
                }
                serf.log_state_change(idx, SerfState::IdleInStock { inventory: inv_idx });
            } else {
                serf.log_state_change(idx, SerfState::Lost);
            }
            serf.set_counter(0);
            return Outcome::Keep;
        }

        // A worker takes up residence.
        if let Some(b) = self.buildings.get_mut(building_idx) {
            b.set_holder(idx);
            b.start_activity();
        }
        let next = match typ {
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => SerfState::Mining {
                building: building_idx,
            },
            BuildingType::Lumberjack => SerfState::PlanningWork {
                kind: WorkKind::Logging,
                building: building_idx,
            },
            BuildingType::Forester => SerfState::PlanningWork {
                kind: WorkKind::PlantingTree,
                building: building_idx,
            },
            BuildingType::Stonecutter => SerfState::PlanningWork {
                kind: WorkKind::Stonecutting,
                building: building_idx,
            },
            BuildingType::Fisher => SerfState::PlanningWork {
                kind: WorkKind::Fishing,
                building: building_idx,
            },
            BuildingType::Farm => SerfState::PlanningWork {
                kind: WorkKind::Farming,
                building: building_idx,
            },
            _ => SerfState::Refining {
                building: building_idx,
            },
        };
        serf.log_state_change(idx, next);
        serf.set_counter(serf.counter() + DOOR_TICKS);
        Outcome::Keep
    }

    /// Chain-push where the pushed knight is the serf currently being
    /// updated (its record lives in the clone, not the pool).
    fn knight_chain_push_from_clone(
        &mut self,
        building_idx: BuildingIndex,
        idx: SerfIndex,
        serf: &mut Serf,
    ) {
        let old_first = self
            .buildings
            .get(building_idx)
            .map_or(0, crate::building::Building::holder);
        serf.log_state_change(
            idx,
            SerfState::KnightDefending {
                building: building_idx,
                next_knight: old_first,
            },
        );
        if let Some(b) = self.buildings.get_mut(building_idx) {
            b.set_holder(idx);
            b.start_activity();
        }
    }

    fn handle_digging(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let pos = building.pos();
        let level = building.level();

        // Level the site and its shell to the target height.
        let ring = self.map.spiral(pos, 1);
        for p in ring {
            self.map.set_height(p, level);
        }
        if let Some(b) = self.buildings.get_mut(building_idx) {
            b.set_progress(1);
        }
        serf.log_state_change(
            idx,
            SerfState::Constructing {
                building: building_idx,
            },
        );
        serf.set_counter(serf.counter() + 512);
        Outcome::Keep
    }

    fn handle_constructing(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let typ = building.building_type();
        let owner = building.owner();
        let flag_idx = building.flag();

        // Burn one delivered material per work step; done when every
        // construction unit is used up.
        let consumed = {
            let b = self.buildings.get_mut(building_idx).unwrap();
            if b.stocks()[0].available > 0 {
                b.plank_used_for_build();
                true
            } else if b.stocks()[1].is_active() && b.stocks()[1].available > 0 {
                b.stone_used_for_build();
                true
            } else {
                false
            }
        };

        if consumed {
            let b = self.buildings.get_mut(building_idx).unwrap();
            b.set_progress(b.progress() + 1);
            serf.set_counter(serf.counter() + 256);
            let all_used = b.stocks()[0].maximum == 0
                && (!b.stocks()[1].is_active() || b.stocks()[1].maximum == 0);
            if all_used {
                b.finish_construction();
                b.clear_holder();
                b.set_serf_requested(false);
                if let Some(p) = self.player_mut(owner) {
                    p.incomplete_building_count[typ.index()] =
                        p.incomplete_building_count[typ.index()].saturating_sub(1);
                    p.completed_building_count[typ.index()] += 1;
                    p.total_building_score += typ.score();
                }
                tracing::debug!(building = building_idx, ?typ, "construction finished");
                // The builder heads home.
                let next = match flag_search::find_nearest_inventory_for_serf(&self.flags, flag_idx)
                {
                    Some(home) => SerfState::Walking {
                        dest: home,
                        mission: Mission::ReturnHome,
                    },
                    None => SerfState::Lost,
                };
                serf.log_state_change(
                    idx,
                    SerfState::LeavingBuilding {
                        next_state: Box::new(next),
                    },
                );
            }
        } else {
            // Waiting on planks and stones.
            serf.set_counter(serf.counter() + 128);
        }
        Outcome::Keep
    }

    fn handle_planning_work(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        kind: WorkKind,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let home = building.pos();
        let owner = building.owner();

        let found = self.find_work_spot(kind, home, owner);
        match found {
            Some((walk_to, spot)) => {
                serf.log_state_change(
                    idx,
                    SerfState::LeavingBuilding {
                        next_state: Box::new(SerfState::FreeWalking {
                            dest_pos: walk_to,
                            then: Box::new(SerfState::Working {
                                kind,
                                building: building_idx,
                                spot,
                            }),
                        }),
                    },
                );
                serf.set_counter(serf.counter() + DOOR_TICKS);
            }
            None => {
                // Nothing to work on nearby; look again later.
                serf.set_counter(serf.counter() + 512);
            }
        }
        Outcome::Keep
    }

    /// A spot for the job near `home`: `(cell to walk to, cell to work)`.
    fn find_work_spot(
        &self,
        kind: WorkKind,
        home: MapPos,
        owner: u8,
    ) -> Option<(MapPos, MapPos)> {
        let spiral = self.map.spiral(home, 6);
        for pos in &spiral[1..] {
            let pos = *pos;
            if self.map.get_owner(pos) != Some(owner) {
                continue;
            }
            match kind {
                WorkKind::Logging => {
                    if self.map.get_obj(pos).is_tree() {
                        return Some((pos, pos));
                    }
                }
                WorkKind::PlantingTree => {
                    if self.map.get_obj(pos) == Object::None
                        && !self.map.is_water_tile(pos)
                        && !self.map.type_up(pos).is_mountain()
                        && !self.map.has_any_path(pos)
                    {
                        return Some((pos, pos));
                    }
                }
                WorkKind::Stonecutting => {
                    if self.map.get_obj(pos).stone_amount().is_some_and(|a| a > 0) {
                        // Work from an adjacent passable cell.
                        let stand = Direction::ALL.into_iter().find_map(|d| {
                            let n = self.map.neighbor(pos, d);
                            (self.map.get_obj(n).space() <= Space::Semipassable
                                && !self.map.is_water_tile(n))
                            .then_some(n)
                        })?;
                        return Some((stand, pos));
                    }
                }
                WorkKind::Fishing => {
                    if !self.map.is_water_tile(pos)
                        && self.map.get_obj(pos) == Object::None
                        && Direction::ALL
                            .into_iter()
                            .any(|d| self.map.is_water_tile(self.map.neighbor(pos, d)))
                    {
                        return Some((pos, pos));
                    }
                }
                WorkKind::Farming => {
                    if self.map.get_obj(pos) == Object::FieldRipe {
                        return Some((pos, pos));
                    }
                    if self.map.get_obj(pos) == Object::None
                        && !self.map.is_water_tile(pos)
                        && !self.map.type_up(pos).is_mountain()
                        && !self.map.has_any_path(pos)
                    {
                        return Some((pos, pos));
                    }
                }
            }
        }
        None
    }

    fn handle_working(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        kind: WorkKind,
        building_idx: BuildingIndex,
        spot: MapPos,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let home = building.pos();
        let flag_idx = building.flag();
        let work_ticks = building.building_type().work_ticks() as i32;
        let owner = serf.owner();

        // Perform the job's effect on the world.
        let yielded = match kind {
            WorkKind::Logging => {
                if self.map.get_obj(spot).is_tree() {
                    self.map.set_obj(spot, Object::Stub, 0);
                    kind.yields()
                } else {
                    None
                }
            }
            WorkKind::PlantingTree => {
                if self.map.get_obj(spot) == Object::None {
                    self.map.set_obj(spot, Object::Sapling, 0);
                }
                None
            }
            WorkKind::Stonecutting => match self.map.get_obj(spot).stone_amount() {
                Some(amount) if amount > 0 => {
                    let next = match amount - 1 {
                        0 => Object::None,
                        1 => Object::Stone1,
                        2 => Object::Stone2,
                        3 => Object::Stone3,
                        4 => Object::Stone4,
                        5 => Object::Stone5,
                        6 => Object::Stone6,
                        _ => Object::Stone7,
                    };
                    self.map.set_obj(spot, next, 0);
                    kind.yields()
                }
                _ => None,
            },
            WorkKind::Fishing => {
                // Not every cast lands a fish.
                if self.random_int() & 3 != 0 {
                    kind.yields()
                } else {
                    None
                }
            }
            WorkKind::Farming => {
                if self.map.get_obj(spot) == Object::FieldRipe {
                    self.map.set_obj(spot, Object::None, 0);
                    kind.yields()
                } else {
                    if self.map.get_obj(spot) == Object::None {
                        self.map.set_obj(spot, Object::FieldSeed, 0);
                    }
                    None
                }
            }
        };

        if let Some(res) = yielded {
            let queued = self
                .flags
                .get_mut(flag_idx)
                .is_some_and(|f| f.push_resource(res, 0));
            if queued {
                if let Some(p) = self.player_mut(owner) {
                    p.resource_count[res as usize] += 1;
                }
            }
        }

        serf.log_state_change(
            idx,
            SerfState::FreeWalking {
                dest_pos: home,
                then: Box::new(SerfState::EnteringBuilding {
                    building: building_idx,
                }),
            },
        );
        serf.set_counter(serf.counter() + work_ticks);
        Outcome::Keep
    }

    fn handle_mining(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let pos = building.pos();
        let flag_idx = building.flag();
        let work_ticks = building.building_type().work_ticks() as i32;
        let owner = serf.owner();

        // Miners eat before they dig.
        let fed = self
            .buildings
            .get_mut(building_idx)
            .is_some_and(|b| b.use_resource_in_stock(0));
        if !fed {
            serf.set_counter(serf.counter() + 1024);
            return Outcome::Keep;
        }

        if let Some(mineral) = self.map.take_mineral(pos) {
            let res = match mineral {
                crate::map::Mineral::Gold => Resource::GoldOre,
                crate::map::Mineral::Iron => Resource::IronOre,
                crate::map::Mineral::Coal => Resource::Coal,
                crate::map::Mineral::Stone => Resource::Stone,
            };
            if res == Resource::GoldOre {
                self.add_gold_total(1);
            }
            let queued = self
                .flags
                .get_mut(flag_idx)
                .is_some_and(|f| f.push_resource(res, 0));
            if queued {
                if let Some(p) = self.player_mut(owner) {
                    p.resource_count[res as usize] += 1;
                }
            } else {
                self.lose_resource(res);
            }
        }
        serf.set_counter(serf.counter() + work_ticks);
        Outcome::Keep
    }

    fn handle_refining(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let typ = building.building_type();
        let flag_idx = building.flag();
        let owner = serf.owner();

        // All active inputs must be on site.
        let inputs_ready = building
            .stocks()
            .iter()
            .filter(|s| s.is_active())
            .all(|s| s.available > 0);
        if !inputs_ready {
            serf.set_counter(serf.counter() + 256);
            return Outcome::Keep;
        }

        let output = {
            let b = self.buildings.get_mut(building_idx).unwrap();
            for i in 0..crate::building::MAX_STOCK {
                if b.stocks()[i].is_active() {
                    b.use_resource_in_stock(i);
                }
            }
            match typ {
                BuildingType::Sawmill => Resource::Plank,
                BuildingType::SteelSmelter => Resource::Steel,
                BuildingType::GoldSmelter => Resource::GoldBar,
                BuildingType::Mill => Resource::Flour,
                BuildingType::Baker => Resource::Bread,
                BuildingType::PigFarm => Resource::Pig,
                BuildingType::Butcher => Resource::Meat,
                BuildingType::Boatbuilder => Resource::Boat,
                BuildingType::WeaponSmith => {
                    b.set_progress(b.progress() + 1);
                    if b.progress() % 2 == 0 {
                        Resource::Sword
                    } else {
                        Resource::Shield
                    }
                }
                BuildingType::ToolMaker => {
                    // Highest-priority tool wins; ties go to the first.
                    let player = self.players[owner as usize].as_ref();
                    let prio = player.map(|p| p.tool_prio.clone()).unwrap_or_default();
                    let best = prio
                        .iter()
                        .enumerate()
                        .max_by_key(|(i, p)| (**p, usize::MAX - *i))
                        .map_or(0, |(i, _)| i);
                    Resource::from_index(Resource::Shovel as usize + best)
                        .unwrap_or(Resource::Shovel)
                }
                _ => Resource::Plank,
            }
        };

        let queued = self
            .flags
            .get_mut(flag_idx)
            .is_some_and(|f| f.push_resource(output, 0));
        if queued {
            if let Some(p) = self.player_mut(owner) {
                p.resource_count[output as usize] += 1;
            }
        }
        serf.set_counter(serf.counter() + typ.work_ticks() as i32);
        Outcome::Keep
    }

    fn handle_drop_resource_out(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        res: Resource,
        res_dest: FlagIndex,
        inventory: u32,
    ) -> Outcome {
        let Some(inv) = self.inventories.get(inventory) else {
            self.lose_resource(res);
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        let flag_idx = inv.flag();
        let building_idx = inv.building();

        let queued = self
            .flags
            .get_mut(flag_idx)
            .is_some_and(|f| f.push_resource(res, res_dest));
        if !queued {
            // Flag congested; wait it out.
            serf.set_counter(serf.counter() + IDLE_TICKS);
            return Outcome::Keep;
        }

        let back_pos = self
            .buildings
            .get(building_idx)
            .map_or(serf.pos(), crate::building::Building::pos);
        let typ = serf.serf_type();
        self.move_serf(idx, serf, back_pos);
        if let Some(inv) = self.inventories.get_mut(inventory) {
            inv.serf_in(typ);
        }
        serf.log_state_change(idx, SerfState::IdleInStock { inventory });
        serf.set_counter(0);
        Outcome::Keep
    }

    // ------------------------------------------------------------------
    // Geologist
    // ------------------------------------------------------------------

    fn handle_looking_for_geo_spot(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        flag_idx: FlagIndex,
        samples_left: u8,
    ) -> Outcome {
        let Some(flag_pos) = self.flags.get(flag_idx).map(crate::flag::Flag::pos) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };

        if samples_left == 0 {
            let next = match flag_search::find_nearest_inventory_for_serf(&self.flags, flag_idx) {
                Some(home) => SerfState::Walking {
                    dest: home,
                    mission: Mission::ReturnHome,
                },
                None => SerfState::Lost,
            };
            serf.log_state_change(idx, next);
            serf.set_counter(serf.counter() + WALK_TICKS);
            return Outcome::Keep;
        }

        // A mountain cell with no sign yet.
        let spot = self.map.spiral(flag_pos, 4).into_iter().skip(1).find(|p| {
            self.map.type_up(*p).is_mountain() && self.map.get_obj(*p) == Object::None
        });
        match spot {
            Some(spot) => {
                serf.log_state_change(
                    idx,
                    SerfState::FreeWalking {
                        dest_pos: spot,
                        then: Box::new(SerfState::SamplingGeoSpot {
                            flag: flag_idx,
                            samples_left,
                            spot,
                        }),
                    },
                );
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
            None => {
                let next =
                    match flag_search::find_nearest_inventory_for_serf(&self.flags, flag_idx) {
                        Some(home) => SerfState::Walking {
                            dest: home,
                            mission: Mission::ReturnHome,
                        },
                        None => SerfState::Lost,
                    };
                serf.log_state_change(idx, next);
                serf.set_counter(serf.counter() + WALK_TICKS);
            }
        }
        Outcome::Keep
    }

    fn handle_sampling(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        flag_idx: FlagIndex,
        samples_left: u8,
        spot: MapPos,
    ) -> Outcome {
        let owner = serf.owner();
        match self.map.mineral(spot) {
            Some((_, amount)) => {
                let sign = if amount > 6 {
                    Object::SignLarge
                } else {
                    Object::SignSmall
                };
                self.map.set_obj(spot, sign, 0);
                if let Some(p) = self.player_mut(owner) {
                    p.add_notification(NotificationKind::MineralFound, spot, owner);
                }
            }
            None => {
                self.map.set_obj(spot, Object::SignEmpty, 0);
            }
        }

        let back = self.flags.get(flag_idx).map(crate::flag::Flag::pos);
        match back {
            Some(flag_pos) => {
                serf.log_state_change(
                    idx,
                    SerfState::FreeWalking {
                        dest_pos: flag_pos,
                        then: Box::new(SerfState::LookingForGeoSpot {
                            flag: flag_idx,
                            samples_left: samples_left.saturating_sub(1),
                        }),
                    },
                );
            }
            None => {
                serf.log_state_change(idx, SerfState::Lost);
            }
        }
        serf.set_counter(serf.counter() + GEO_SAMPLE_TICKS);
        Outcome::Keep
    }

    // ------------------------------------------------------------------
    // Knights
    // ------------------------------------------------------------------

    fn handle_knight_engaging(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        if building.owner() == serf.owner() {
            // Already ours (a fellow attacker finished the job): join in.
            self.knight_chain_push_from_clone(building_idx, idx, serf);
            if let Some(p) = self.player_mut(serf.owner()) {
                p.total_military_score += 1;
            }
            serf.set_counter(0);
            return Outcome::Keep;
        }

        let defenders = self.knight_chain(building_idx);
        if defenders.is_empty() {
            serf.log_state_change(
                idx,
                SerfState::KnightOccupyEnemyBuilding {
                    building: building_idx,
                },
            );
        } else {
            serf.log_state_change(
                idx,
                SerfState::KnightPrepareAttacking {
                    building: building_idx,
                },
            );
        }
        serf.set_counter(serf.counter() + FIGHT_TICKS / 2);
        Outcome::Keep
    }

    fn handle_knight_attacking(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
        defender: SerfIndex,
    ) -> Outcome {
        if !self.serfs.exists(defender) {
            serf.log_state_change(
                idx,
                SerfState::KnightEngagingBuilding {
                    building: building_idx,
                },
            );
            serf.set_counter(serf.counter() + FIGHT_TICKS);
            return Outcome::Keep;
        }

        let attacker_wins = self.resolve_duel(idx, defender);
        self.play_sound(crate::game::Sound::Fight);
        if attacker_wins {
            let def_owner = self.serfs.get(defender).map(Serf::owner);
            self.knight_chain_remove(building_idx, defender);
            self.delete_serf(defender);
            if let Some(p) = def_owner.and_then(|o| self.player_mut(o)) {
                p.total_military_score = p.total_military_score.saturating_sub(1);
            }
            serf.log_state_change(
                idx,
                SerfState::KnightEngagingBuilding {
                    building: building_idx,
                },
            );
            serf.set_counter(serf.counter() + FIGHT_TICKS);
            Outcome::Keep
        } else {
            tracing::debug!(attacker = idx, defender, "attacker fell");
            Outcome::Delete
        }
    }

    fn handle_knight_occupy(
        &mut self,
        idx: SerfIndex,
        serf: &mut Serf,
        building_idx: BuildingIndex,
    ) -> Outcome {
        let Some(building) = self.buildings.get(building_idx) else {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        };
        if building.is_burning() {
            serf.log_state_change(idx, SerfState::Lost);
            return Outcome::Keep;
        }
        let owner = serf.owner();
        if building.owner() != owner {
            self.occupy_enemy_building(building_idx, owner);
        }
        // The castle is razed on capture; everything else is garrisoned.
        let alive = self
            .buildings
            .get(building_idx)
            .is_some_and(|b| !b.is_burning() && b.owner() == owner);
        if alive {
            let building_pos = self.buildings.get(building_idx).unwrap().pos();
            self.move_serf(idx, serf, building_pos);
            self.knight_chain_push_from_clone(building_idx, idx, serf);
            if let Some(p) = self.player_mut(owner) {
                p.total_military_score += 1;
            }
            // Now garrisoned, the post projects the conqueror's territory.
            self.update_land_ownership(building_pos);
            serf.set_counter(0);
        } else {
            serf.log_state_change(idx, SerfState::Lost);
            serf.set_counter(serf.counter() + WALK_TICKS);
        }
        Outcome::Keep
    }

    // ------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------

    fn handle_lost(&mut self, idx: SerfIndex, serf: &mut Serf) -> Outcome {
        // Standing on one of our flags: route home over the road network.
        if self.map.has_flag(serf.pos()) {
            let flag_idx = self.map.get_obj_index(serf.pos());
            let same_owner = self
                .flags
                .get(flag_idx)
                .is_some_and(|f| f.owner() == serf.owner());
            if same_owner {
                match flag_search::find_nearest_inventory_for_serf(&self.flags, flag_idx) {
                    Some(home) => {
                        serf.set_walk_dir(None);
                        serf.log_state_change(
                            idx,
                            SerfState::Walking {
                                dest: home,
                                mission: Mission::ReturnHome,
                            },
                        );
                        serf.set_counter(serf.counter() + WALK_TICKS);
                        return Outcome::Keep;
                    }
                    None => {
                        // On the network but no inventory will take the
                        // serf in: it perishes.
                        tracing::debug!(serf = idx, "lost serf found no shelter");
                        return Outcome::Delete;
                    }
                }
            }
        }

        // Otherwise wander toward the nearest friendly flag.
        let target = self
            .map
            .spiral(serf.pos(), 12)
            .into_iter()
            .skip(1)
            .find(|p| {
                self.map.has_flag(*p)
                    && self
                        .flags
                        .get(self.map.get_obj_index(*p))
                        .is_some_and(|f| f.owner() == serf.owner())
            });
        match target {
            Some(flag_pos) => {
                serf.log_state_change(
                    idx,
                    SerfState::FreeWalking {
                        dest_pos: flag_pos,
                        then: Box::new(SerfState::Lost),
                    },
                );
                serf.set_counter(serf.counter() + WALK_TICKS);
                Outcome::Keep
            }
            None => {
                // Nowhere to go: the serf perishes.
                tracing::debug!(serf = idx, "lost serf died");
                Outcome::Delete
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
        Game::with_map(map, 77)
    }

    /// Castle plus one road to a second flag, `len` tiles east.
    fn game_with_road(len: usize) -> (Game, u8, FlagIndex, FlagIndex) {
        let mut game = flat_game();
        let player = game.add_player(12, 64, 35, 30, 40).unwrap();
        let castle_pos = game.map().pos(6, 6);
        assert!(game.build_castle(castle_pos, player));
        let a = game.map().neighbor(castle_pos, Direction::DownRight);
        let mut b = a;
        for _ in 0..len {
            b = game.map().neighbor(b, Direction::Right);
        }
        assert!(game.build_flag(b, player));
        let mut road = Road::start(a);
        for _ in 0..len {
            road.extend(Direction::Right);
        }
        assert!(game.build_road(&road, player));
        let flag_a = game.map().get_obj_index(a);
        let flag_b = game.map().get_obj_index(b);
        (game, player, flag_a, flag_b)
    }

    #[test]
    fn test_transporter_gets_dispatched_and_staffs_road() {
        let (mut game, _, a_idx, _) = game_with_road(3);
        for _ in 0..400 {
            game.update();
        }
        let edge = game
            .flags()
            .get(a_idx)
            .unwrap()
            .edge(Direction::Right)
            .unwrap();
        assert!(edge.has_transporter, "road should be staffed eventually");
    }

    #[test]
    fn test_resource_travels_road_to_inventory() {
        let (mut game, _, a_idx, b_idx) = game_with_road(3);
        // Drop a stray stone at the far flag; it must make it home into the
        // castle inventory.
        game.flags
            .get_mut(b_idx)
            .unwrap()
            .push_resource(Resource::Stone, 0);
        let before = game
            .inventories()
            .iter()
            .next()
            .unwrap()
            .1
            .count_of(Resource::Stone);

        for _ in 0..2000 {
            game.update();
        }
        let after = game
            .inventories()
            .iter()
            .next()
            .unwrap()
            .1
            .count_of(Resource::Stone);
        assert_eq!(after, before + 1, "stray resource should reach the castle");
        let _ = a_idx;
    }

    #[test]
    fn test_requested_resource_delivered_to_building() {
        let (mut game, player, _a_idx, b_idx) = game_with_road(3);
        // A bakery on flag B requesting flour, castle holding flour.
        let site = game
            .map()
            .neighbor(game.flags().get(b_idx).unwrap().pos(), Direction::UpLeft);
        let mut building =
            crate::building::Building::new(BuildingType::Baker, site, player, b_idx);
        building.finish_construction();
        let building_idx = game.buildings.insert(building).unwrap();
        game.flags.get_mut(b_idx).unwrap().link_building(building_idx);
        let inv_idx = game.inventories().iter().next().unwrap().0;
        game.inventories
            .get_mut(inv_idx)
            .unwrap()
            .set_count(Resource::Flour, 4);

        // Within 3 tiles x the per-tile deadline the delivery must land.
        let deadline = 3 * crate::building::REQUEST_TIMEOUT_TICKS_PER_TILE;
        let mut delivered = false;
        while game.tick() < deadline {
            game.update();
            let building = game.buildings().get(building_idx).unwrap();
            let i = building.stock_for(Resource::Flour).unwrap();
            if building.stocks()[i].available >= 1 && building.stocks()[i].requested == 0 {
                delivered = true;
                break;
            }
        }
        assert!(delivered, "flour should arrive within the timeout window");
    }

    #[test]
    fn test_walking_serf_loses_destination() {
        let (mut game, player, _, b_idx) = game_with_road(4);
        // Send a geologist toward flag B, then demolish the flag mid-walk.
        assert!(game.send_geologist(b_idx));
        for _ in 0..4 {
            game.update();
        }
        let b_pos = game.flags().get(b_idx).unwrap().pos();
        assert!(game.demolish_flag(b_pos, player));

        for _ in 0..50 {
            game.update();
        }
        // The serf must not reference the dead flag: it is lost, walking
        // home, or back in stock; nothing dangles.
        game.validate().unwrap();
    }

    #[test]
    fn test_serf_counts_conserved_by_dispatch() {
        let (mut game, player, _, _) = game_with_road(3);
        let total_before: u32 = game
            .player(player)
            .unwrap()
            .serf_count
            .iter()
            .sum();
        for _ in 0..600 {
            game.update();
        }
        let player_ref = game.player(player).unwrap();
        let total_after: u32 = player_ref.serf_count.iter().sum();
        // Reproduction may add serfs; dispatch itself must not destroy any.
        assert!(total_after >= total_before);
    }
}
