//! Serfs: the autonomous agents of the simulation.
//!
//! A serf is a position, a sub-tick counter and a state machine of roughly
//! thirty states, each with its own small payload. All transitions funnel
//! through [`Serf::log_state_change`] so a trace of the run shows every hop.
//! The two-phase exits ([`SerfState::LeavingBuilding`],
//! [`SerfState::ReadyToLeave`]) stage the follow-up state and apply it at the
//! serf's next update, never mid-tick.

use serde::{Deserialize, Serialize};

use crate::building::BuildingIndex;
use crate::flag::FlagIndex;
use crate::inventory::InventoryIndex;
use crate::map::{Direction, MapPos};
use crate::resource::Resource;

/// Index into the serf pool; 0 means "no serf".
pub type SerfIndex = u32;

/// Number of serf types.
pub const SERF_TYPE_COUNT: usize = 27;

/// Serf professions. The five knight ranks close the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SerfType {
    /// Carries resources over one road.
    Transporter = 0,
    /// Carries resources over one water road.
    Sailor,
    /// Levels ground for large buildings.
    Digger,
    /// Erects buildings.
    Builder,
    /// Works the castle interior.
    TransporterInventory,
    /// Fells trees.
    Lumberjack,
    /// Saws lumber into planks.
    Sawmiller,
    /// Quarries stone piles.
    Stonecutter,
    /// Plants saplings.
    Forester,
    /// Works mines.
    Miner,
    /// Smelts steel or gold.
    Smelter,
    /// Catches fish.
    Fisher,
    /// Raises pigs.
    PigFarmer,
    /// Slaughters pigs.
    Butcher,
    /// Sows and harvests wheat.
    Farmer,
    /// Mills wheat.
    Miller,
    /// Bakes bread.
    Baker,
    /// Builds boats.
    BoatBuilder,
    /// Forges tools.
    Toolmaker,
    /// Forges weapons.
    WeaponSmith,
    /// Prospects mountains for minerals.
    Geologist,
    /// Unspecialized; can take any profession given tools.
    Generic,
    /// Knight, lowest rank.
    Knight0,
    /// Knight.
    Knight1,
    /// Knight.
    Knight2,
    /// Knight.
    Knight3,
    /// Knight, highest rank.
    Knight4,
}

impl SerfType {
    /// All types in discriminant order.
    pub const ALL: [SerfType; SERF_TYPE_COUNT] = [
        SerfType::Transporter,
        SerfType::Sailor,
        SerfType::Digger,
        SerfType::Builder,
        SerfType::TransporterInventory,
        SerfType::Lumberjack,
        SerfType::Sawmiller,
        SerfType::Stonecutter,
        SerfType::Forester,
        SerfType::Miner,
        SerfType::Smelter,
        SerfType::Fisher,
        SerfType::PigFarmer,
        SerfType::Butcher,
        SerfType::Farmer,
        SerfType::Miller,
        SerfType::Baker,
        SerfType::BoatBuilder,
        SerfType::Toolmaker,
        SerfType::WeaponSmith,
        SerfType::Geologist,
        SerfType::Generic,
        SerfType::Knight0,
        SerfType::Knight1,
        SerfType::Knight2,
        SerfType::Knight3,
        SerfType::Knight4,
    ];

    /// Whether this is one of the five knight ranks.
    #[must_use]
    pub const fn is_knight(self) -> bool {
        matches!(
            self,
            SerfType::Knight0
                | SerfType::Knight1
                | SerfType::Knight2
                | SerfType::Knight3
                | SerfType::Knight4
        )
    }

    /// Knight rank 0..=4, if a knight.
    #[must_use]
    pub const fn knight_rank(self) -> Option<u8> {
        match self {
            SerfType::Knight0 => Some(0),
            SerfType::Knight1 => Some(1),
            SerfType::Knight2 => Some(2),
            SerfType::Knight3 => Some(3),
            SerfType::Knight4 => Some(4),
            _ => None,
        }
    }

    /// Knight type of a given rank.
    #[must_use]
    pub const fn knight_of_rank(rank: u8) -> SerfType {
        match rank {
            0 => SerfType::Knight0,
            1 => SerfType::Knight1,
            2 => SerfType::Knight2,
            3 => SerfType::Knight3,
            _ => SerfType::Knight4,
        }
    }

    /// Tools (or weapons) an inventory must spend to specialize a generic
    /// serf into this profession.
    #[must_use]
    pub const fn required_tools(self) -> &'static [Resource] {
        match self {
            SerfType::Digger => &[Resource::Shovel],
            SerfType::Builder | SerfType::BoatBuilder | SerfType::Geologist => {
                &[Resource::Hammer]
            }
            SerfType::Lumberjack => &[Resource::Axe],
            SerfType::Sawmiller => &[Resource::Saw],
            SerfType::Stonecutter | SerfType::Miner => &[Resource::Pick],
            SerfType::Fisher => &[Resource::Rod],
            SerfType::Butcher => &[Resource::Cleaver],
            SerfType::Farmer => &[Resource::Scythe],
            SerfType::Toolmaker => &[Resource::Hammer, Resource::Saw],
            SerfType::WeaponSmith => &[Resource::Hammer, Resource::Pincer],
            SerfType::Knight0 => &[Resource::Sword, Resource::Shield],
            _ => &[],
        }
    }
}

/// Why a walking serf is on the road.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mission {
    /// Take up work (or garrison duty) in a building.
    OccupyBuilding {
        /// Target building.
        building: BuildingIndex,
    },
    /// Become the transporter of one road edge.
    ServeRoad {
        /// Flag anchoring the edge.
        flag: FlagIndex,
        /// Direction of the edge at that flag.
        dir: Direction,
    },
    /// Prospect the mountains around a flag.
    Prospect {
        /// Flag to prospect around.
        flag: FlagIndex,
    },
    /// Walk back into an inventory.
    ReturnHome,
    /// March on an enemy building.
    Attack {
        /// Target military building.
        building: BuildingIndex,
    },
}

/// Outdoor jobs that share the plan/work state pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkKind {
    /// Fell a tree, bring back lumber.
    Logging,
    /// Plant a sapling on open grass.
    PlantingTree,
    /// Chip stone off a pile.
    Stonecutting,
    /// Catch a fish at the shore.
    Fishing,
    /// Sow or harvest a field.
    Farming,
}

impl WorkKind {
    /// Resource the job yields, if any (planting yields none).
    #[must_use]
    pub const fn yields(self) -> Option<Resource> {
        match self {
            WorkKind::Logging => Some(Resource::Lumber),
            WorkKind::PlantingTree => None,
            WorkKind::Stonecutting => Some(Resource::Stone),
            WorkKind::Fishing => Some(Resource::Fish),
            WorkKind::Farming => Some(Resource::Wheat),
        }
    }
}

/// The serf state machine.
///
/// Each variant carries exactly the data that state needs; nothing dangles
/// across ticks because vanished references drop the serf to [`Self::Lost`]
/// during its next update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SerfState {
    /// Resting inside an inventory.
    IdleInStock {
        /// Inventory housing the serf.
        inventory: InventoryIndex,
    },
    /// Called out of an inventory, waiting to step onto the flag.
    ReadyToLeaveInventory {
        /// Inventory being left.
        inventory: InventoryIndex,
        /// Destination flag.
        dest: FlagIndex,
        /// Purpose of the trip.
        mission: Mission,
    },
    /// Walking the road network toward a flag.
    Walking {
        /// Destination flag.
        dest: FlagIndex,
        /// Purpose of the trip.
        mission: Mission,
    },
    /// Walking off-road toward a position.
    FreeWalking {
        /// Target position.
        dest_pos: MapPos,
        /// State to adopt on arrival.
        then: Box<SerfState>,
    },
    /// Serving one road edge, possibly carrying a resource.
    Transporting {
        /// Flag anchoring the served edge.
        flag: FlagIndex,
        /// Edge direction at that flag.
        dir: Direction,
        /// Carried resource and its destination.
        carrying: Option<(Resource, FlagIndex)>,
    },
    /// Transporter parked on its road, nothing to do.
    IdleOnPath {
        /// Flag anchoring the served edge.
        flag: FlagIndex,
        /// Edge direction at that flag.
        dir: Direction,
    },
    /// Transporter parked, road about to be dissolved; waits for a decision.
    WaitIdleOnPath {
        /// Flag anchoring the served edge.
        flag: FlagIndex,
        /// Edge direction at that flag.
        dir: Direction,
    },
    /// Woken because work appeared at the flag end of the road.
    WakeAtFlag {
        /// Flag anchoring the served edge.
        flag: FlagIndex,
        /// Edge direction at that flag.
        dir: Direction,
    },
    /// Woken mid-road.
    WakeOnPath {
        /// Flag anchoring the served edge.
        flag: FlagIndex,
        /// Edge direction at that flag.
        dir: Direction,
    },
    /// Stepping from the flag into a building.
    EnteringBuilding {
        /// Building being entered.
        building: BuildingIndex,
    },
    /// First phase of leaving a building; `next_state` applies afterwards.
    LeavingBuilding {
        /// State staged for after the exit completes.
        next_state: Box<SerfState>,
    },
    /// Second exit phase, standing on the flag.
    ReadyToLeave {
        /// State staged for after the exit completes.
        next_state: Box<SerfState>,
    },
    /// Leveling the ground of a large construction site.
    Digging {
        /// Site being leveled.
        building: BuildingIndex,
    },
    /// Erecting a building from delivered planks and stones.
    Constructing {
        /// Site being built.
        building: BuildingIndex,
    },
    /// Deciding where to do an outdoor job.
    PlanningWork {
        /// Job kind.
        kind: WorkKind,
        /// Home building.
        building: BuildingIndex,
    },
    /// Doing an outdoor job at a spot.
    Working {
        /// Job kind.
        kind: WorkKind,
        /// Home building.
        building: BuildingIndex,
        /// Work spot.
        spot: MapPos,
    },
    /// Digging ore underground; consumes food.
    Mining {
        /// Home mine.
        building: BuildingIndex,
    },
    /// Indoor production (sawing, smelting, milling, baking, forging).
    Refining {
        /// Home workshop.
        building: BuildingIndex,
    },
    /// Carrying a resource from the inventory toward the flag.
    MoveResourceOut {
        /// Resource being carried out.
        res: Resource,
        /// Destination flag (0 = any accepting inventory).
        res_dest: FlagIndex,
        /// Inventory being served.
        inventory: InventoryIndex,
    },
    /// Dropping the carried resource at the inventory flag.
    DropResourceOut {
        /// Resource being dropped.
        res: Resource,
        /// Destination flag.
        res_dest: FlagIndex,
        /// Inventory being served.
        inventory: InventoryIndex,
    },
    /// Geologist scanning for a spot to sample.
    LookingForGeoSpot {
        /// Flag the prospecting trip centers on.
        flag: FlagIndex,
        /// Samples left to take.
        samples_left: u8,
    },
    /// Geologist hammering at a spot.
    SamplingGeoSpot {
        /// Flag the prospecting trip centers on.
        flag: FlagIndex,
        /// Samples left to take.
        samples_left: u8,
        /// Spot being sampled.
        spot: MapPos,
    },
    /// Attacker arrived at the target building's flag.
    KnightEngagingBuilding {
        /// Target building.
        building: BuildingIndex,
    },
    /// Attacker squaring off against a defender.
    KnightPrepareAttacking {
        /// Target building.
        building: BuildingIndex,
    },
    /// Duel in progress.
    KnightAttacking {
        /// Target building.
        building: BuildingIndex,
        /// Defender met in the duel.
        defender: SerfIndex,
    },
    /// Garrisoned knight; links the defender chain of its building.
    KnightDefending {
        /// Building defended.
        building: BuildingIndex,
        /// Next knight in the chain (0 ends it).
        next_knight: SerfIndex,
    },
    /// Victorious attacker taking possession.
    KnightOccupyEnemyBuilding {
        /// Conquered building.
        building: BuildingIndex,
    },
    /// Knight walking free ground toward a fight or home.
    KnightFreeWalking {
        /// Target position.
        dest_pos: MapPos,
        /// Building the walk concerns.
        building: BuildingIndex,
    },
    /// Lost; looks for any inventory taking serfs, dies if none.
    Lost,
    /// Fleeing a burning building.
    EscapeBuilding,
}

impl SerfState {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            SerfState::IdleInStock { .. } => "idle_in_stock",
            SerfState::ReadyToLeaveInventory { .. } => "ready_to_leave_inventory",
            SerfState::Walking { .. } => "walking",
            SerfState::FreeWalking { .. } => "free_walking",
            SerfState::Transporting { .. } => "transporting",
            SerfState::IdleOnPath { .. } => "idle_on_path",
            SerfState::WaitIdleOnPath { .. } => "wait_idle_on_path",
            SerfState::WakeAtFlag { .. } => "wake_at_flag",
            SerfState::WakeOnPath { .. } => "wake_on_path",
            SerfState::EnteringBuilding { .. } => "entering_building",
            SerfState::LeavingBuilding { .. } => "leaving_building",
            SerfState::ReadyToLeave { .. } => "ready_to_leave",
            SerfState::Digging { .. } => "digging",
            SerfState::Constructing { .. } => "constructing",
            SerfState::PlanningWork { .. } => "planning_work",
            SerfState::Working { .. } => "working",
            SerfState::Mining { .. } => "mining",
            SerfState::Refining { .. } => "refining",
            SerfState::MoveResourceOut { .. } => "move_resource_out",
            SerfState::DropResourceOut { .. } => "drop_resource_out",
            SerfState::LookingForGeoSpot { .. } => "looking_for_geo_spot",
            SerfState::SamplingGeoSpot { .. } => "sampling_geo_spot",
            SerfState::KnightEngagingBuilding { .. } => "knight_engaging_building",
            SerfState::KnightPrepareAttacking { .. } => "knight_prepare_attacking",
            SerfState::KnightAttacking { .. } => "knight_attacking",
            SerfState::KnightDefending { .. } => "knight_defending",
            SerfState::KnightOccupyEnemyBuilding { .. } => "knight_occupy_enemy_building",
            SerfState::KnightFreeWalking { .. } => "knight_free_walking",
            SerfState::Lost => "lost",
            SerfState::EscapeBuilding => "escape_building",
        }
    }
}

/// One serf.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Serf {
    typ: SerfType,
    owner: u8,
    pos: MapPos,
    /// Animation sprite selector; pure presentation state.
    animation: u16,
    /// Sub-tick progress; actions fire while it is below zero.
    counter: i32,
    tick: u32,
    /// Direction of the last step; road walking follows this to avoid
    /// turning back.
    walk_dir: Option<Direction>,
    state: SerfState,
}

impl Serf {
    /// New serf resting in an inventory.
    #[must_use]
    pub fn new(typ: SerfType, owner: u8, pos: MapPos, inventory: InventoryIndex) -> Self {
        Self {
            typ,
            owner,
            pos,
            animation: 0,
            counter: 0,
            tick: 0,
            walk_dir: None,
            state: SerfState::IdleInStock { inventory },
        }
    }

    /// Profession.
    #[must_use]
    pub const fn serf_type(&self) -> SerfType {
        self.typ
    }

    /// Change profession (specialization, knight promotion/demotion).
    pub fn set_serf_type(&mut self, typ: SerfType) {
        self.typ = typ;
    }

    /// Owning player.
    #[must_use]
    pub const fn owner(&self) -> u8 {
        self.owner
    }

    /// Current position.
    #[must_use]
    pub const fn pos(&self) -> MapPos {
        self.pos
    }

    /// Move the serf (the map's serf index is maintained by the game).
    pub fn set_pos(&mut self, pos: MapPos) {
        self.pos = pos;
    }

    /// Animation sprite selector.
    #[must_use]
    pub const fn animation(&self) -> u16 {
        self.animation
    }

    /// Set the animation sprite selector.
    pub fn set_animation(&mut self, animation: u16) {
        self.animation = animation;
    }

    /// Sub-tick counter.
    #[must_use]
    pub const fn counter(&self) -> i32 {
        self.counter
    }

    /// Set the sub-tick counter.
    pub fn set_counter(&mut self, counter: i32) {
        self.counter = counter;
    }

    /// Last update tick.
    #[must_use]
    pub const fn tick(&self) -> u32 {
        self.tick
    }

    /// Record the update tick.
    pub fn set_tick(&mut self, tick: u32) {
        self.tick = tick;
    }

    /// Direction of the serf's last step.
    #[must_use]
    pub const fn walk_dir(&self) -> Option<Direction> {
        self.walk_dir
    }

    /// Record the direction of a step (or clear it when standing).
    pub fn set_walk_dir(&mut self, dir: Option<Direction>) {
        self.walk_dir = dir;
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> &SerfState {
        &self.state
    }

    /// Transition to a new state, logging the change.
    ///
    /// Every transition in the simulation goes through here.
    pub fn log_state_change(&mut self, index: SerfIndex, new_state: SerfState) {
        tracing::trace!(
            serf = index,
            from = self.state.name(),
            to = new_state.name(),
            "serf state change"
        );
        self.state = new_state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_knight_ranks() {
        assert!(SerfType::Knight0.is_knight());
        assert!(SerfType::Knight4.is_knight());
        assert!(!SerfType::Miner.is_knight());
        assert_eq!(SerfType::Knight2.knight_rank(), Some(2));
        assert_eq!(SerfType::knight_of_rank(4), SerfType::Knight4);
    }

    #[test]
    fn test_type_count_matches_all() {
        assert_eq!(SerfType::ALL.len(), SERF_TYPE_COUNT);
        for (i, typ) in SerfType::ALL.iter().enumerate() {
            assert_eq!(*typ as usize, i);
        }
    }

    #[test]
    fn test_state_change_replaces_state() {
        let mut serf = Serf::new(SerfType::Generic, 0, 5, 1);
        assert!(matches!(serf.state(), SerfState::IdleInStock { .. }));
        serf.log_state_change(1, SerfState::Lost);
        assert!(matches!(serf.state(), SerfState::Lost));
    }

    #[test]
    fn test_staged_next_state_payload() {
        let staged = SerfState::LeavingBuilding {
            next_state: Box::new(SerfState::Walking {
                dest: 3,
                mission: Mission::ReturnHome,
            }),
        };
        if let SerfState::LeavingBuilding { next_state } = staged {
            assert!(matches!(*next_state, SerfState::Walking { dest: 3, .. }));
        } else {
            panic!("expected leaving_building");
        }
    }

    #[test]
    fn test_work_kind_yields() {
        assert_eq!(WorkKind::Logging.yields(), Some(Resource::Lumber));
        assert_eq!(WorkKind::PlantingTree.yields(), None);
    }
}
