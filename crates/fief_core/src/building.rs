//! Buildings: construction sites, workshops, mines and military posts.
//!
//! A building owns up to three input stocks. Each stock tracks the resource
//! kind, how many units are on site, how many are requested and a ceiling;
//! every outstanding request carries a timeout tick so resources that never
//! arrive are cancelled and rerouted instead of being waited on forever.

use serde::{Deserialize, Serialize};

use crate::flag::FlagIndex;
use crate::inventory::InventoryIndex;
use crate::map::MapPos;
use crate::resource::Resource;
use crate::serf::{SerfIndex, SerfType};

/// Index into the building pool; 0 means "no building".
pub type BuildingIndex = u32;

/// Max number of different input stocks per building.
pub const MAX_STOCK: usize = 3;

/// Max outstanding requests per stock.
pub const STOCK_REQUEST_MAX: usize = 8;

/// Ticks allowed per tile of flag-path distance before a requested resource
/// is given up on. Sized for the steepest roads with reasonable traffic.
pub const REQUEST_TIMEOUT_TICKS_PER_TILE: u32 = 350;

/// Burn-down counter for ordinary buildings.
pub const BURNING_COUNTER: i32 = 2047;

/// Burn-down counter for the castle.
pub const CASTLE_BURNING_COUNTER: i32 = 8191;

/// Serfs allowed to escape a burning inventory before the rest perish.
pub const MAX_ESCAPING_SERFS: usize = 12;

/// The building types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BuildingType {
    /// Catches fish on the shore.
    Fisher,
    /// Fells trees.
    Lumberjack,
    /// Builds boats from planks.
    Boatbuilder,
    /// Quarries surface stone piles.
    Stonecutter,
    /// Mines stone underground.
    StoneMine,
    /// Mines coal.
    CoalMine,
    /// Mines iron ore.
    IronMine,
    /// Mines gold ore.
    GoldMine,
    /// Plants saplings.
    Forester,
    /// Warehouse with its own inventory.
    Stock,
    /// Small military post.
    Hut,
    /// Grows wheat.
    Farm,
    /// Slaughters pigs into meat.
    Butcher,
    /// Raises pigs on wheat.
    PigFarm,
    /// Mills wheat into flour.
    Mill,
    /// Bakes flour into bread.
    Baker,
    /// Saws lumber into planks.
    Sawmill,
    /// Smelts iron ore and coal into steel.
    SteelSmelter,
    /// Forges tools from planks and steel.
    ToolMaker,
    /// Forges swords and shields from coal and steel.
    WeaponSmith,
    /// Medium military post.
    Tower,
    /// Large military post.
    Fortress,
    /// Smelts gold ore and coal into bars.
    GoldSmelter,
    /// The player's seat; holds the main inventory.
    Castle,
}

/// Footprint/terrain class a building needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BuildingSize {
    /// One open cell.
    Small,
    /// Open cell plus a leveled second shell.
    Large,
    /// A mountain cell.
    Mine,
}

impl BuildingType {
    /// All constructible types (castle included last).
    pub const ALL: [BuildingType; 24] = [
        BuildingType::Fisher,
        BuildingType::Lumberjack,
        BuildingType::Boatbuilder,
        BuildingType::Stonecutter,
        BuildingType::StoneMine,
        BuildingType::CoalMine,
        BuildingType::IronMine,
        BuildingType::GoldMine,
        BuildingType::Forester,
        BuildingType::Stock,
        BuildingType::Hut,
        BuildingType::Farm,
        BuildingType::Butcher,
        BuildingType::PigFarm,
        BuildingType::Mill,
        BuildingType::Baker,
        BuildingType::Sawmill,
        BuildingType::SteelSmelter,
        BuildingType::ToolMaker,
        BuildingType::WeaponSmith,
        BuildingType::Tower,
        BuildingType::Fortress,
        BuildingType::GoldSmelter,
        BuildingType::Castle,
    ];

    /// Stable index for per-type count arrays.
    #[must_use]
    pub fn index(self) -> usize {
        Self::ALL.iter().position(|t| *t == self).unwrap()
    }

    /// Footprint class.
    #[must_use]
    pub const fn size(self) -> BuildingSize {
        match self {
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => BuildingSize::Mine,
            BuildingType::Stock
            | BuildingType::Farm
            | BuildingType::Sawmill
            | BuildingType::SteelSmelter
            | BuildingType::ToolMaker
            | BuildingType::WeaponSmith
            | BuildingType::GoldSmelter
            | BuildingType::PigFarm
            | BuildingType::Tower
            | BuildingType::Fortress
            | BuildingType::Castle => BuildingSize::Large,
            _ => BuildingSize::Small,
        }
    }

    /// Whether knights garrison this building.
    #[must_use]
    pub const fn is_military(self) -> bool {
        matches!(
            self,
            BuildingType::Hut | BuildingType::Tower | BuildingType::Fortress | BuildingType::Castle
        )
    }

    /// Whether this building holds an inventory.
    #[must_use]
    pub const fn has_inventory(self) -> bool {
        matches!(self, BuildingType::Castle | BuildingType::Stock)
    }

    /// Construction cost in (planks, stones).
    #[must_use]
    pub const fn construction_cost(self) -> (u32, u32) {
        match self {
            BuildingType::Lumberjack
            | BuildingType::Forester
            | BuildingType::Fisher
            | BuildingType::Stonecutter => (2, 0),
            BuildingType::Hut => (2, 1),
            BuildingType::Boatbuilder | BuildingType::Mill => (3, 1),
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => (4, 1),
            BuildingType::Butcher => (3, 2),
            BuildingType::Baker => (4, 2),
            BuildingType::Farm | BuildingType::PigFarm => (4, 3),
            BuildingType::Sawmill
            | BuildingType::SteelSmelter
            | BuildingType::GoldSmelter
            | BuildingType::ToolMaker => (4, 3),
            BuildingType::WeaponSmith => (4, 4),
            BuildingType::Tower => (4, 5),
            BuildingType::Stock => (6, 6),
            BuildingType::Fortress => (8, 8),
            BuildingType::Castle => (0, 0),
        }
    }

    /// The serf profession that works this building, if any.
    #[must_use]
    pub const fn worker(self) -> Option<SerfType> {
        match self {
            BuildingType::Fisher => Some(SerfType::Fisher),
            BuildingType::Lumberjack => Some(SerfType::Lumberjack),
            BuildingType::Boatbuilder => Some(SerfType::BoatBuilder),
            BuildingType::Stonecutter => Some(SerfType::Stonecutter),
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => Some(SerfType::Miner),
            BuildingType::Forester => Some(SerfType::Forester),
            BuildingType::Farm => Some(SerfType::Farmer),
            BuildingType::Butcher => Some(SerfType::Butcher),
            BuildingType::PigFarm => Some(SerfType::PigFarmer),
            BuildingType::Mill => Some(SerfType::Miller),
            BuildingType::Baker => Some(SerfType::Baker),
            BuildingType::Sawmill => Some(SerfType::Sawmiller),
            BuildingType::SteelSmelter | BuildingType::GoldSmelter => Some(SerfType::Smelter),
            BuildingType::ToolMaker => Some(SerfType::Toolmaker),
            BuildingType::WeaponSmith => Some(SerfType::WeaponSmith),
            BuildingType::Hut
            | BuildingType::Tower
            | BuildingType::Fortress
            | BuildingType::Stock
            | BuildingType::Castle => None,
        }
    }

    /// Input stocks of the finished building: (resource, maximum).
    #[must_use]
    pub fn stocks(self) -> Vec<(Resource, u32)> {
        match self {
            BuildingType::Boatbuilder => vec![(Resource::Plank, 8)],
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => vec![(Resource::Fish, 8)],
            BuildingType::Butcher => vec![(Resource::Pig, 8)],
            BuildingType::PigFarm => vec![(Resource::Wheat, 8)],
            BuildingType::Mill => vec![(Resource::Wheat, 8)],
            BuildingType::Baker => vec![(Resource::Flour, 8)],
            BuildingType::Sawmill => vec![(Resource::Lumber, 8)],
            BuildingType::SteelSmelter => vec![(Resource::Coal, 8), (Resource::IronOre, 8)],
            BuildingType::ToolMaker => vec![(Resource::Plank, 8), (Resource::Steel, 8)],
            BuildingType::WeaponSmith => vec![(Resource::Coal, 8), (Resource::Steel, 8)],
            BuildingType::GoldSmelter => vec![(Resource::Coal, 8), (Resource::GoldOre, 8)],
            BuildingType::Hut => vec![(Resource::GoldBar, 2)],
            BuildingType::Tower => vec![(Resource::GoldBar, 4)],
            BuildingType::Fortress => vec![(Resource::GoldBar, 8)],
            _ => Vec::new(),
        }
    }

    /// Knight capacity of a military building.
    #[must_use]
    pub const fn knight_capacity(self) -> u32 {
        match self {
            BuildingType::Hut => 3,
            BuildingType::Tower => 6,
            BuildingType::Fortress => 12,
            _ => 0,
        }
    }

    /// Score contribution of a completed building.
    #[must_use]
    pub const fn score(self) -> u32 {
        match self {
            BuildingType::Fisher
            | BuildingType::Lumberjack
            | BuildingType::Forester
            | BuildingType::Stonecutter => 2,
            BuildingType::Boatbuilder | BuildingType::Hut => 4,
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine => 6,
            BuildingType::Farm | BuildingType::Mill | BuildingType::Butcher
            | BuildingType::PigFarm | BuildingType::Baker => 6,
            BuildingType::GoldMine => 10,
            BuildingType::Sawmill | BuildingType::SteelSmelter => 8,
            BuildingType::ToolMaker | BuildingType::GoldSmelter => 10,
            BuildingType::WeaponSmith => 12,
            BuildingType::Tower => 10,
            BuildingType::Stock => 12,
            BuildingType::Fortress => 20,
            BuildingType::Castle => 50,
        }
    }

    /// Ticks of work per produced unit, once inputs are on site.
    #[must_use]
    pub const fn work_ticks(self) -> u32 {
        match self {
            BuildingType::Lumberjack | BuildingType::Stonecutter | BuildingType::Fisher => 1024,
            BuildingType::Forester | BuildingType::Farm => 1536,
            BuildingType::StoneMine
            | BuildingType::CoalMine
            | BuildingType::IronMine
            | BuildingType::GoldMine => 2048,
            _ => 1024,
        }
    }
}

/// One input stock of a building.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Stock {
    /// Resource kind accepted, `None` for an inactive slot.
    pub res: Option<Resource>,
    /// Routing priority for this stock.
    pub prio: u8,
    /// Units on site.
    pub available: u32,
    /// Units requested and presumed in flight.
    pub requested: u32,
    /// Ceiling for `available + requested`.
    pub maximum: u32,
    /// Timeout tick per outstanding request (0 = unused entry).
    pub request_timeout_tick: [u32; STOCK_REQUEST_MAX],
}

impl Stock {
    /// Activate the stock for `res` with ceiling `maximum`.
    #[must_use]
    pub fn init(res: Resource, maximum: u32) -> Self {
        Self {
            res: Some(res),
            prio: 0,
            available: 0,
            requested: 0,
            maximum,
            request_timeout_tick: [0; STOCK_REQUEST_MAX],
        }
    }

    /// Whether the slot is active.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.res.is_some()
    }

    /// Room left for further requests.
    #[must_use]
    pub const fn missing(&self) -> u32 {
        let filled = self.available + self.requested;
        if filled >= self.maximum {
            0
        } else {
            self.maximum - filled
        }
    }

    /// Record a granted request with its timeout deadline.
    pub fn push_request(&mut self, timeout_tick: u32) {
        self.requested += 1;
        for entry in &mut self.request_timeout_tick {
            if *entry == 0 {
                *entry = timeout_tick;
                return;
            }
        }
    }

    /// Consume the earliest outstanding request on delivery.
    pub fn consume_request(&mut self) {
        if self.requested > 0 {
            self.requested -= 1;
        }
        let mut earliest: Option<usize> = None;
        for (i, entry) in self.request_timeout_tick.iter().enumerate() {
            if *entry != 0 && earliest.map_or(true, |e| self.request_timeout_tick[e] > *entry) {
                earliest = Some(i);
            }
        }
        if let Some(i) = earliest {
            self.request_timeout_tick[i] = 0;
        }
    }

    /// Cancel requests whose deadline has passed; returns how many expired.
    pub fn expire_requests(&mut self, current_tick: u32) -> u32 {
        let mut expired = 0;
        for entry in &mut self.request_timeout_tick {
            if *entry != 0 && *entry <= current_tick {
                *entry = 0;
                if self.requested > 0 {
                    self.requested -= 1;
                }
                expired += 1;
            }
        }
        expired
    }
}

/// A building on the map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Building {
    typ: BuildingType,
    pos: MapPos,
    owner: u8,
    /// Entry flag at the down-right neighbour.
    flag: FlagIndex,
    constructing: bool,
    active: bool,
    burning: bool,
    burning_counter: i32,
    /// Threat band, 0 (interior) to 3 (frontier).
    threat_level: u8,
    serf_requested: bool,
    serf_request_failed: bool,
    /// Holder serf, or the first knight of the defending chain.
    holder: SerfIndex,
    stocks: [Stock; MAX_STOCK],
    /// Construction or work progress.
    progress: u32,
    /// Leveling height target while under construction.
    level: u8,
    tick: u32,
    /// Inventory for castle/stock buildings (0 otherwise).
    inventory: InventoryIndex,
    /// Gold delivered to this military building, for morale accounting.
    gold_delivered: u32,
}

impl Building {
    /// New construction site (or a finished castle when `typ` is `Castle`).
    #[must_use]
    pub fn new(typ: BuildingType, pos: MapPos, owner: u8, flag: FlagIndex) -> Self {
        let mut building = Self {
            typ,
            pos,
            owner,
            flag,
            constructing: typ != BuildingType::Castle,
            active: false,
            burning: false,
            burning_counter: 0,
            threat_level: 0,
            serf_requested: false,
            serf_request_failed: false,
            holder: 0,
            stocks: [Stock::default(), Stock::default(), Stock::default()],
            progress: 0,
            level: 0,
            tick: 0,
            inventory: 0,
            gold_delivered: 0,
        };
        if building.constructing {
            // Construction consumes planks (stock 0) and stones (stock 1).
            let (planks, stones) = typ.construction_cost();
            building.stocks[0] = Stock::init(Resource::Plank, planks);
            if stones > 0 {
                building.stocks[1] = Stock::init(Resource::Stone, stones);
            }
        }
        building
    }

    /// Building type.
    #[must_use]
    pub const fn building_type(&self) -> BuildingType {
        self.typ
    }

    /// Map position.
    #[must_use]
    pub const fn pos(&self) -> MapPos {
        self.pos
    }

    /// Owning player.
    #[must_use]
    pub const fn owner(&self) -> u8 {
        self.owner
    }

    /// Reassign to another player (conquest).
    pub fn set_owner(&mut self, owner: u8) {
        self.owner = owner;
    }

    /// Entry flag index.
    #[must_use]
    pub const fn flag(&self) -> FlagIndex {
        self.flag
    }

    /// Re-link the entry flag.
    pub fn link_flag(&mut self, flag: FlagIndex) {
        self.flag = flag;
    }

    /// Whether construction is finished.
    #[must_use]
    pub const fn is_done(&self) -> bool {
        !self.constructing
    }

    /// Whether the site is still leveling ground.
    #[must_use]
    pub const fn is_leveling(&self) -> bool {
        self.constructing && self.progress == 0
    }

    /// Whether the building is operating (military: occupied).
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Mark the building operating.
    pub fn start_activity(&mut self) {
        self.active = true;
    }

    /// Mark the building idle.
    pub fn stop_activity(&mut self) {
        self.active = false;
    }

    /// Whether the building is burning down.
    #[must_use]
    pub const fn is_burning(&self) -> bool {
        self.burning
    }

    /// Whether knights garrison this building.
    #[must_use]
    pub const fn is_military(&self) -> bool {
        self.typ.is_military()
    }

    /// Begin the burning lifecycle. Returns false if already burning.
    pub fn burnup(&mut self, tick: u32) -> bool {
        if self.burning {
            return false;
        }
        self.burning = true;
        self.active = false;
        self.burning_counter = if self.typ == BuildingType::Castle && self.is_done() {
            CASTLE_BURNING_COUNTER
        } else {
            BURNING_COUNTER
        };
        self.tick = tick;
        true
    }

    /// Remaining burn-down counter.
    #[must_use]
    pub const fn burning_counter(&self) -> i32 {
        self.burning_counter
    }

    /// Count down the burn; returns true when the ruin should be removed.
    pub fn decrease_burning_counter(&mut self, delta: i32) -> bool {
        self.burning_counter -= delta;
        self.burning_counter <= 0
    }

    /// Threat band from interior (0) to frontier (3).
    #[must_use]
    pub const fn threat_level(&self) -> u8 {
        self.threat_level
    }

    /// Update the threat band.
    pub fn set_threat_level(&mut self, level: u8) {
        self.threat_level = level.min(3);
    }

    /// Holder serf (or first knight), 0 when none.
    #[must_use]
    pub const fn holder(&self) -> SerfIndex {
        self.holder
    }

    /// Whether a holder serf is associated.
    #[must_use]
    pub const fn has_holder(&self) -> bool {
        self.holder != 0
    }

    /// Set the holder serf (or first knight of the chain).
    pub fn set_holder(&mut self, serf: SerfIndex) {
        self.holder = serf;
    }

    /// Drop the holder.
    pub fn clear_holder(&mut self) {
        self.holder = 0;
        self.active = false;
    }

    /// Whether a serf has been requested for this building.
    #[must_use]
    pub const fn serf_requested(&self) -> bool {
        self.serf_requested
    }

    /// Record that a serf request went out.
    pub fn set_serf_requested(&mut self, requested: bool) {
        self.serf_requested = requested;
    }

    /// Whether the last serf request failed (retried next tick).
    #[must_use]
    pub const fn serf_request_failed(&self) -> bool {
        self.serf_request_failed
    }

    /// Record a failed serf request.
    pub fn set_serf_request_failed(&mut self, failed: bool) {
        self.serf_request_failed = failed;
    }

    /// Clear the failure bit so the request can be retried.
    pub fn clear_serf_request_failure(&mut self) {
        self.serf_request_failed = false;
    }

    /// The stock array.
    #[must_use]
    pub fn stocks(&self) -> &[Stock; MAX_STOCK] {
        &self.stocks
    }

    /// Mutable stock array.
    pub fn stocks_mut(&mut self) -> &mut [Stock; MAX_STOCK] {
        &mut self.stocks
    }

    /// Stock slot accepting `res`, if the building takes it right now.
    ///
    /// A stock configured for fish stands for the whole food group, so any
    /// food kind matches it (mines are fed whatever the kitchen has).
    #[must_use]
    pub fn stock_for(&self, res: Resource) -> Option<usize> {
        self.stocks.iter().position(|s| {
            s.is_active()
                && (s.res == Some(res) || (res.is_food() && s.res == Some(Resource::Fish)))
        })
    }

    /// Install the finished building's stocks (called when construction
    /// completes).
    pub fn init_done_stocks(&mut self) {
        self.stocks = [Stock::default(), Stock::default(), Stock::default()];
        for (i, (res, max)) in self.typ.stocks().into_iter().enumerate().take(MAX_STOCK) {
            self.stocks[i] = Stock::init(res, max);
        }
    }

    /// Deactivate all stocks (burning).
    pub fn remove_stock(&mut self) {
        self.stocks = [Stock::default(), Stock::default(), Stock::default()];
    }

    /// A requested resource arrived. Returns false when nothing matching was
    /// requested (the sender should reroute it).
    pub fn requested_resource_delivered(&mut self, res: Resource) -> bool {
        if self.burning {
            return false;
        }
        let Some(i) = self.stock_for(res) else {
            return false;
        };
        if self.stocks[i].requested == 0 {
            return false;
        }
        self.stocks[i].consume_request();
        self.stocks[i].available += 1;
        if res == Resource::GoldBar && self.is_military() {
            self.gold_delivered += 1;
        }
        true
    }

    /// Gold counted toward morale: what was delivered, not what is reachable.
    #[must_use]
    pub const fn military_gold_count(&self) -> u32 {
        if self.is_military() {
            self.gold_delivered
        } else {
            0
        }
    }

    /// Gold physically in stock (for removal bookkeeping on demolition).
    #[must_use]
    pub fn gold_in_stock(&self) -> u32 {
        self.stocks
            .iter()
            .filter(|s| s.res == Some(Resource::GoldBar))
            .map(|s| s.available)
            .sum()
    }

    /// Construction/work progress.
    #[must_use]
    pub const fn progress(&self) -> u32 {
        self.progress
    }

    /// Set progress (leveling, framing, work loops).
    pub fn set_progress(&mut self, progress: u32) {
        self.progress = progress;
    }

    /// Leveling height target.
    #[must_use]
    pub const fn level(&self) -> u8 {
        self.level
    }

    /// Set the leveling height target.
    pub fn set_level(&mut self, level: u8) {
        self.level = level;
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

    /// Inventory index for castle/stock buildings.
    #[must_use]
    pub const fn inventory(&self) -> InventoryIndex {
        self.inventory
    }

    /// Whether the building holds a live inventory.
    #[must_use]
    pub const fn has_inventory(&self) -> bool {
        self.inventory != 0
    }

    /// Attach the inventory.
    pub fn set_inventory(&mut self, inventory: InventoryIndex) {
        self.inventory = inventory;
    }

    /// Detach the inventory (destroyed).
    pub fn clear_inventory(&mut self) {
        self.inventory = 0;
    }

    /// Finish construction: flip to done and install production stocks.
    pub fn finish_construction(&mut self) {
        self.constructing = false;
        self.progress = 0;
        self.init_done_stocks();
    }

    /// Spend one plank from the construction stock.
    pub fn plank_used_for_build(&mut self) {
        if self.stocks[0].available > 0 {
            self.stocks[0].available -= 1;
            self.stocks[0].maximum = self.stocks[0].maximum.saturating_sub(1);
        }
    }

    /// Spend one stone from the construction stock.
    pub fn stone_used_for_build(&mut self) {
        if self.stocks[1].available > 0 {
            self.stocks[1].available -= 1;
            self.stocks[1].maximum = self.stocks[1].maximum.saturating_sub(1);
        }
    }

    /// Consume one unit from stock `i` for work. Returns false when empty.
    pub fn use_resource_in_stock(&mut self, i: usize) -> bool {
        if self.stocks[i].available > 0 {
            self.stocks[i].available -= 1;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_construction_stocks() {
        let b = Building::new(BuildingType::Hut, 0, 0, 1);
        assert!(!b.is_done());
        assert_eq!(b.stocks()[0].res, Some(Resource::Plank));
        assert_eq!(b.stocks()[0].maximum, 2);
        assert_eq!(b.stocks()[1].res, Some(Resource::Stone));
        assert_eq!(b.stocks()[1].maximum, 1);
    }

    #[test]
    fn test_finish_construction_installs_stocks() {
        let mut b = Building::new(BuildingType::Sawmill, 0, 0, 1);
        b.finish_construction();
        assert!(b.is_done());
        assert_eq!(b.stocks()[0].res, Some(Resource::Lumber));
        assert_eq!(b.stocks()[0].maximum, 8);
        assert!(!b.stocks()[1].is_active());
    }

    #[test]
    fn test_request_delivery_cycle() {
        let mut b = Building::new(BuildingType::Baker, 0, 0, 1);
        b.finish_construction();
        let i = b.stock_for(Resource::Flour).unwrap();
        b.stocks_mut()[i].push_request(1000);
        assert_eq!(b.stocks()[i].requested, 1);

        assert!(b.requested_resource_delivered(Resource::Flour));
        assert_eq!(b.stocks()[i].requested, 0);
        assert_eq!(b.stocks()[i].available, 1);
        // Nothing outstanding: a stray delivery is refused.
        assert!(!b.requested_resource_delivered(Resource::Flour));
    }

    #[test]
    fn test_request_timeout_expiry() {
        let mut b = Building::new(BuildingType::Baker, 0, 0, 1);
        b.finish_construction();
        let i = b.stock_for(Resource::Flour).unwrap();
        b.stocks_mut()[i].push_request(500);
        b.stocks_mut()[i].push_request(900);

        assert_eq!(b.stocks_mut()[i].expire_requests(400), 0);
        assert_eq!(b.stocks_mut()[i].expire_requests(600), 1);
        assert_eq!(b.stocks()[i].requested, 1);
        assert_eq!(b.stocks_mut()[i].expire_requests(1000), 1);
        assert_eq!(b.stocks()[i].requested, 0);
    }

    #[test]
    fn test_delivery_consumes_earliest_deadline() {
        let mut stock = Stock::init(Resource::Flour, 8);
        stock.push_request(900);
        stock.push_request(500);
        stock.consume_request();
        // The 500 deadline was consumed; 900 remains.
        assert_eq!(stock.request_timeout_tick.iter().filter(|t| **t != 0).count(), 1);
        assert!(stock.request_timeout_tick.contains(&900));
    }

    #[test]
    fn test_burning_counters() {
        let mut hut = Building::new(BuildingType::Hut, 0, 0, 1);
        hut.finish_construction();
        assert!(hut.burnup(100));
        assert!(!hut.burnup(100));
        assert_eq!(hut.burning_counter(), BURNING_COUNTER);

        let mut castle = Building::new(BuildingType::Castle, 0, 0, 1);
        castle.burnup(100);
        assert_eq!(castle.burning_counter(), CASTLE_BURNING_COUNTER);

        assert!(!castle.decrease_burning_counter(100));
        assert!(castle.decrease_burning_counter(CASTLE_BURNING_COUNTER));
    }

    #[test]
    fn test_military_gold_tracks_deliveries() {
        let mut hut = Building::new(BuildingType::Hut, 0, 0, 1);
        hut.finish_construction();
        let i = hut.stock_for(Resource::GoldBar).unwrap();
        hut.stocks_mut()[i].push_request(1000);
        assert!(hut.requested_resource_delivered(Resource::GoldBar));
        assert_eq!(hut.military_gold_count(), 1);
        assert_eq!(hut.gold_in_stock(), 1);
    }

    #[test]
    fn test_stock_missing_respects_ceiling() {
        let mut stock = Stock::init(Resource::Lumber, 8);
        assert_eq!(stock.missing(), 8);
        stock.available = 3;
        stock.requested = 2;
        assert_eq!(stock.missing(), 3);
        stock.available = 8;
        assert_eq!(stock.missing(), 0);
    }
}
