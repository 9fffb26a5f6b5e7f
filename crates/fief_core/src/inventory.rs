//! Castle and warehouse inventories.
//!
//! An inventory pools resources and serfs behind a flag. Resources and serfs
//! each have an in/stop/out mode; a small out-queue holds up to two resources
//! scheduled to leave through the flag.

use serde::{Deserialize, Serialize};

use crate::flag::FlagIndex;
use crate::resource::{Resource, RESOURCE_COUNT};
use crate::serf::{SerfType, SERF_TYPE_COUNT};

/// Index into the inventory pool; 0 means "no inventory".
pub type InventoryIndex = u32;

/// Flow mode for an inventory's resources or serfs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InventoryMode {
    /// Accept incoming.
    #[default]
    In,
    /// Accept nothing, send nothing.
    Stop,
    /// Push contents out toward other inventories.
    Out,
}

/// Depth of the out-queue.
pub const OUT_QUEUE_LEN: usize = 2;

/// A resource scheduled to leave the inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutQueueEntry {
    /// Resource about to leave.
    pub res: Resource,
    /// Destination flag (0 routes to any accepting inventory).
    pub dest: FlagIndex,
}

/// A resource and serf pool attached to a castle or warehouse.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inventory {
    owner: u8,
    /// Flag in front of the building.
    flag: FlagIndex,
    /// Building this inventory lives in.
    building: u32,
    resources: [u32; RESOURCE_COUNT],
    serfs: [u32; SERF_TYPE_COUNT],
    res_mode: InventoryMode,
    serf_mode: InventoryMode,
    out_queue: [Option<OutQueueEntry>; OUT_QUEUE_LEN],
}

impl Inventory {
    /// New empty inventory.
    #[must_use]
    pub fn new(owner: u8, flag: FlagIndex, building: u32) -> Self {
        Self {
            owner,
            flag,
            building,
            resources: [0; RESOURCE_COUNT],
            serfs: [0; SERF_TYPE_COUNT],
            res_mode: InventoryMode::In,
            serf_mode: InventoryMode::In,
            out_queue: [None; OUT_QUEUE_LEN],
        }
    }

    /// Owning player.
    #[must_use]
    pub const fn owner(&self) -> u8 {
        self.owner
    }

    /// Flag index of the entry flag.
    #[must_use]
    pub const fn flag(&self) -> FlagIndex {
        self.flag
    }

    /// Building index this inventory lives in.
    #[must_use]
    pub const fn building(&self) -> u32 {
        self.building
    }

    /// Count of one resource kind.
    #[must_use]
    pub fn count_of(&self, res: Resource) -> u32 {
        self.resources[res as usize]
    }

    /// Add resources of one kind.
    pub fn push_resource(&mut self, res: Resource) {
        self.resources[res as usize] += 1;
    }

    /// Remove one resource of the kind, if present.
    pub fn pop_resource(&mut self, res: Resource) -> bool {
        if self.resources[res as usize] > 0 {
            self.resources[res as usize] -= 1;
            true
        } else {
            false
        }
    }

    /// Set the stored count of a kind (initial supplies).
    pub fn set_count(&mut self, res: Resource, count: u32) {
        self.resources[res as usize] = count;
    }

    /// Whether any food kind is in store.
    #[must_use]
    pub fn has_food(&self) -> bool {
        self.count_of(Resource::Fish) > 0
            || self.count_of(Resource::Meat) > 0
            || self.count_of(Resource::Bread) > 0
    }

    /// Remove one unit of food, preferring fish, then meat, then bread.
    pub fn pop_food(&mut self) -> Option<Resource> {
        for res in [Resource::Fish, Resource::Meat, Resource::Bread] {
            if self.pop_resource(res) {
                return Some(res);
            }
        }
        None
    }

    /// Total gold (bars and ore) in store.
    #[must_use]
    pub fn gold_count(&self) -> u32 {
        self.count_of(Resource::GoldBar) + self.count_of(Resource::GoldOre)
    }

    /// Count of idle serfs of one type.
    #[must_use]
    pub fn serf_count(&self, typ: SerfType) -> u32 {
        self.serfs[typ as usize]
    }

    /// Whether an idle serf of the type is available.
    #[must_use]
    pub fn has_serf(&self, typ: SerfType) -> bool {
        self.serf_count(typ) > 0
    }

    /// Record a serf entering the inventory.
    pub fn serf_in(&mut self, typ: SerfType) {
        self.serfs[typ as usize] += 1;
    }

    /// Record a serf leaving the inventory.
    pub fn serf_out(&mut self, typ: SerfType) -> bool {
        if self.serfs[typ as usize] > 0 {
            self.serfs[typ as usize] -= 1;
            true
        } else {
            false
        }
    }

    /// Number of unspecialized serfs in the pool.
    #[must_use]
    pub fn generic_count(&self) -> u32 {
        self.serf_count(SerfType::Generic)
    }

    /// Whether this inventory can turn a generic serf into `typ`, consuming
    /// the required tools or weapons.
    #[must_use]
    pub fn can_specialize(&self, typ: SerfType) -> bool {
        if self.generic_count() == 0 {
            return false;
        }
        typ.required_tools()
            .iter()
            .all(|tool| self.count_of(*tool) > 0)
    }

    /// Turn one generic serf into `typ`, consuming tools.
    ///
    /// Returns false when no generic serf or tool is available.
    pub fn specialize_serf(&mut self, typ: SerfType) -> bool {
        if !self.can_specialize(typ) {
            return false;
        }
        for tool in typ.required_tools() {
            self.pop_resource(*tool);
        }
        self.serfs[SerfType::Generic as usize] -= 1;
        self.serfs[typ as usize] += 1;
        true
    }

    /// Resource flow mode.
    #[must_use]
    pub const fn res_mode(&self) -> InventoryMode {
        self.res_mode
    }

    /// Serf flow mode.
    #[must_use]
    pub const fn serf_mode(&self) -> InventoryMode {
        self.serf_mode
    }

    /// Set the resource flow mode.
    pub fn set_res_mode(&mut self, mode: InventoryMode) {
        self.res_mode = mode;
    }

    /// Set the serf flow mode.
    pub fn set_serf_mode(&mut self, mode: InventoryMode) {
        self.serf_mode = mode;
    }

    /// Whether the out-queue has no free entry.
    #[must_use]
    pub fn is_queue_full(&self) -> bool {
        self.out_queue.iter().all(Option::is_some)
    }

    /// Schedule a stored resource to leave toward `dest`.
    ///
    /// The resource is removed from the stored counts immediately; it now
    /// lives in the out-queue until a serf carries it to the flag.
    pub fn add_to_queue(&mut self, res: Resource, dest: FlagIndex) -> bool {
        if self.is_queue_full() || !self.pop_resource(res) {
            return false;
        }
        for entry in &mut self.out_queue {
            if entry.is_none() {
                *entry = Some(OutQueueEntry { res, dest });
                return true;
            }
        }
        unreachable!("queue had a free entry");
    }

    /// Pop the next out-queue entry.
    pub fn pop_queue(&mut self) -> Option<OutQueueEntry> {
        for entry in &mut self.out_queue {
            if let Some(e) = entry.take() {
                return Some(e);
            }
        }
        None
    }

    /// Whether anything waits in the out-queue.
    #[must_use]
    pub fn has_queued(&self) -> bool {
        self.out_queue.iter().any(Option::is_some)
    }

    /// Drop the out-queue (building burning); entries return nothing.
    pub fn lose_queue(&mut self) {
        self.out_queue = [None; OUT_QUEUE_LEN];
    }

    /// Clear out-queue entries destined for `dest`, returning the resources
    /// to store.
    pub fn reset_queue_for_dest(&mut self, dest: FlagIndex) {
        let mut returned = Vec::new();
        for entry in &mut self.out_queue {
            if entry.is_some_and(|e| e.dest == dest) {
                let e = entry.take().unwrap();
                returned.push(e.res);
            }
        }
        for res in returned {
            self.push_resource(res);
        }
    }

    /// Apply the initial supplies for a new castle.
    ///
    /// `supplies` is the 0..=50ish start setting; counts scale linearly.
    pub fn apply_initial_supplies(&mut self, supplies: u32) {
        let scale = |base: u32| base * supplies / 10;
        self.set_count(Resource::Plank, scale(10));
        self.set_count(Resource::Stone, scale(8));
        self.set_count(Resource::Fish, scale(4));
        self.set_count(Resource::Bread, scale(4));
        self.set_count(Resource::Meat, scale(2));
        self.set_count(Resource::Lumber, scale(4));
        self.set_count(Resource::Coal, scale(5));
        self.set_count(Resource::Steel, scale(3));
        self.set_count(Resource::IronOre, scale(2));
        self.set_count(Resource::Sword, scale(1));
        self.set_count(Resource::Shield, scale(1));
        self.set_count(Resource::Shovel, scale(2));
        self.set_count(Resource::Hammer, scale(2));
        self.set_count(Resource::Axe, scale(2));
        self.set_count(Resource::Saw, scale(1));
        self.set_count(Resource::Pick, scale(2));
        self.set_count(Resource::Scythe, scale(1));
        self.set_count(Resource::Rod, scale(1));
        self.set_count(Resource::Cleaver, scale(1));
        self.set_count(Resource::Pincer, scale(1));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_push_pop() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.push_resource(Resource::Plank);
        inv.push_resource(Resource::Plank);
        assert_eq!(inv.count_of(Resource::Plank), 2);
        assert!(inv.pop_resource(Resource::Plank));
        assert_eq!(inv.count_of(Resource::Plank), 1);
        assert!(!inv.pop_resource(Resource::Stone));
    }

    #[test]
    fn test_out_queue_depth_two() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.set_count(Resource::Coal, 3);
        assert!(inv.add_to_queue(Resource::Coal, 5));
        assert!(inv.add_to_queue(Resource::Coal, 6));
        assert!(inv.is_queue_full());
        assert!(!inv.add_to_queue(Resource::Coal, 7));
        assert_eq!(inv.count_of(Resource::Coal), 1);

        let first = inv.pop_queue().unwrap();
        assert_eq!(first.dest, 5);
        assert!(!inv.is_queue_full());
    }

    #[test]
    fn test_reset_queue_returns_resources() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.set_count(Resource::Stone, 2);
        inv.add_to_queue(Resource::Stone, 5);
        inv.add_to_queue(Resource::Stone, 6);
        inv.reset_queue_for_dest(5);
        assert_eq!(inv.count_of(Resource::Stone), 1);
        assert_eq!(inv.pop_queue().unwrap().dest, 6);
    }

    #[test]
    fn test_specialize_consumes_tools() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.serf_in(SerfType::Generic);
        inv.set_count(Resource::Pick, 1);
        assert!(inv.specialize_serf(SerfType::Miner));
        assert_eq!(inv.count_of(Resource::Pick), 0);
        assert_eq!(inv.serf_count(SerfType::Miner), 1);
        assert_eq!(inv.generic_count(), 0);
        // No generic serf left.
        assert!(!inv.specialize_serf(SerfType::Miner));
    }

    #[test]
    fn test_knight_needs_sword_and_shield() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.serf_in(SerfType::Generic);
        inv.set_count(Resource::Sword, 1);
        assert!(!inv.can_specialize(SerfType::Knight0));
        inv.set_count(Resource::Shield, 1);
        assert!(inv.specialize_serf(SerfType::Knight0));
        assert_eq!(inv.count_of(Resource::Sword), 0);
        assert_eq!(inv.count_of(Resource::Shield), 0);
    }

    #[test]
    fn test_pop_food_preference() {
        let mut inv = Inventory::new(0, 1, 1);
        inv.set_count(Resource::Bread, 1);
        inv.set_count(Resource::Fish, 1);
        assert_eq!(inv.pop_food(), Some(Resource::Fish));
        assert_eq!(inv.pop_food(), Some(Resource::Bread));
        assert_eq!(inv.pop_food(), None);
    }
}
