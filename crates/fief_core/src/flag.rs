//! Flags: the vertices of the road network.
//!
//! Each flag carries up to six directed edges, one per hex direction. An
//! edge records the flag at the other end, a banded length bucket, whether a
//! transporter is serving the road and whether one has been requested. Up to
//! eight resources queue at the flag, each tagged with a destination flag
//! index (0 while unrouted).
//!
//! The graph-mutating operations (linking roads, merging on demolition,
//! splitting on insertion) live on `Game`, which owns both the flag pool and
//! the map path bits they must stay consistent with.

use serde::{Deserialize, Serialize};

use crate::map::{Direction, MapPos};
use crate::resource::Resource;

/// Index into the flag pool; 0 means "no flag".
pub type FlagIndex = u32;

/// Number of resource slots per flag.
pub const FLAG_RES_SLOTS: usize = 8;

/// Band a road tile length into the 3-bit bucket stored on the edge.
///
/// Buckets decide transporter staffing, not exact distance; tracing the map
/// path bits recovers the true road.
#[must_use]
pub const fn length_bucket(tiles: usize) -> u8 {
    match tiles {
        0 => 0,
        1..=2 => 1,
        3..=4 => 2,
        5..=7 => 3,
        8..=11 => 4,
        12..=17 => 5,
        18..=26 => 6,
        _ => 7,
    }
}

/// One directed road edge out of a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    /// Flag at the far end of the road.
    pub endpoint: FlagIndex,
    /// Banded road length, `1..=7`.
    pub length_bucket: u8,
    /// A transporter is stationed on (or walking to) this road.
    pub has_transporter: bool,
    /// A transporter has been requested and is on its way.
    pub serf_requested: bool,
    /// Whether the road runs over water (served by a sailor).
    pub water: bool,
}

impl Edge {
    /// New edge with no transporter yet.
    #[must_use]
    pub const fn new(endpoint: FlagIndex, tiles: usize, water: bool) -> Self {
        Self {
            endpoint,
            length_bucket: length_bucket(tiles),
            has_transporter: false,
            serf_requested: false,
            water,
        }
    }
}

/// A resource waiting at a flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSlot {
    /// The queued resource.
    pub res: Resource,
    /// Destination flag (0 while unrouted).
    pub dest: FlagIndex,
    /// Outgoing edge chosen by the last routing pass.
    pub dir: Option<Direction>,
}

/// A road-network vertex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flag {
    pos: MapPos,
    owner: u8,
    edges: [Option<Edge>; 6],
    slots: [Option<ResourceSlot>; FLAG_RES_SLOTS],
    /// Building whose entry this flag is (0 when none).
    building: u32,
    accepts_resources: bool,
    accepts_serfs: bool,
    has_inventory: bool,
}

impl Flag {
    /// New bare flag at `pos` owned by `owner`.
    #[must_use]
    pub fn new(pos: MapPos, owner: u8) -> Self {
        Self {
            pos,
            owner,
            edges: [None; 6],
            slots: [None; FLAG_RES_SLOTS],
            building: 0,
            accepts_resources: false,
            accepts_serfs: false,
            has_inventory: false,
        }
    }

    /// Map position of the flag.
    #[must_use]
    pub const fn pos(&self) -> MapPos {
        self.pos
    }

    /// Owning player.
    #[must_use]
    pub const fn owner(&self) -> u8 {
        self.owner
    }

    /// Reassign the flag to another player (conquest).
    pub fn set_owner(&mut self, owner: u8) {
        self.owner = owner;
    }

    /// Edge record in `dir`, if a road leaves that way.
    #[must_use]
    pub fn edge(&self, dir: Direction) -> Option<&Edge> {
        self.edges[dir as usize].as_ref()
    }

    /// Mutable edge record in `dir`.
    pub fn edge_mut(&mut self, dir: Direction) -> Option<&mut Edge> {
        self.edges[dir as usize].as_mut()
    }

    /// Install an edge in `dir`, replacing any previous road there.
    pub fn set_edge(&mut self, dir: Direction, edge: Edge) {
        self.edges[dir as usize] = Some(edge);
    }

    /// Remove the edge in `dir`.
    pub fn clear_edge(&mut self, dir: Direction) {
        self.edges[dir as usize] = None;
    }

    /// Whether a road leaves the flag in `dir`.
    #[must_use]
    pub fn has_edge(&self, dir: Direction) -> bool {
        self.edges[dir as usize].is_some()
    }

    /// Directions with a road, in direction order.
    #[must_use]
    pub fn edge_dirs(&self) -> Vec<Direction> {
        Direction::ALL
            .into_iter()
            .filter(|d| self.has_edge(*d))
            .collect()
    }

    /// Number of roads leaving the flag.
    #[must_use]
    pub fn edge_count(&self) -> usize {
        self.edges.iter().filter(|e| e.is_some()).count()
    }

    /// The direction whose edge leads to `endpoint`, if any.
    #[must_use]
    pub fn dir_to(&self, endpoint: FlagIndex) -> Option<Direction> {
        Direction::ALL
            .into_iter()
            .find(|d| self.edges[*d as usize].is_some_and(|e| e.endpoint == endpoint))
    }

    /// Building whose entry this flag is (0 when none).
    #[must_use]
    pub const fn building(&self) -> u32 {
        self.building
    }

    /// Whether a building hangs off this flag.
    #[must_use]
    pub const fn has_building(&self) -> bool {
        self.building != 0
    }

    /// Attach a building.
    pub fn link_building(&mut self, building: u32) {
        self.building = building;
    }

    /// Detach the building.
    pub fn unlink_building(&mut self) {
        self.building = 0;
    }

    /// Whether this flag fronts an inventory (castle or warehouse).
    #[must_use]
    pub const fn has_inventory(&self) -> bool {
        self.has_inventory
    }

    /// Whether the inventory behind this flag accepts incoming resources.
    #[must_use]
    pub const fn accepts_resources(&self) -> bool {
        self.accepts_resources
    }

    /// Whether the inventory behind this flag accepts incoming serfs.
    #[must_use]
    pub const fn accepts_serfs(&self) -> bool {
        self.accepts_serfs
    }

    /// Mark this flag as an inventory entry.
    pub fn set_inventory(&mut self, accepts_resources: bool, accepts_serfs: bool) {
        self.has_inventory = true;
        self.accepts_resources = accepts_resources;
        self.accepts_serfs = accepts_serfs;
    }

    /// Clear the inventory marking (inventory destroyed).
    pub fn clear_inventory(&mut self) {
        self.has_inventory = false;
        self.accepts_resources = false;
        self.accepts_serfs = false;
    }

    /// Toggle resource acceptance (inventory mode change).
    pub fn set_accepts_resources(&mut self, accepts: bool) {
        self.accepts_resources = accepts;
    }

    /// Toggle serf acceptance (inventory mode change).
    pub fn set_accepts_serfs(&mut self, accepts: bool) {
        self.accepts_serfs = accepts;
    }

    /// The resource slots.
    #[must_use]
    pub fn slots(&self) -> &[Option<ResourceSlot>; FLAG_RES_SLOTS] {
        &self.slots
    }

    /// Number of occupied resource slots.
    #[must_use]
    pub fn slot_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether every slot is taken.
    #[must_use]
    pub fn slots_full(&self) -> bool {
        self.slot_count() == FLAG_RES_SLOTS
    }

    /// Queue a resource at the flag. Returns false when all slots are full.
    pub fn push_resource(&mut self, res: Resource, dest: FlagIndex) -> bool {
        for slot in &mut self.slots {
            if slot.is_none() {
                *slot = Some(ResourceSlot {
                    res,
                    dest,
                    dir: None,
                });
                return true;
            }
        }
        false
    }

    /// Take the first slot scheduled on `dir`, if any.
    pub fn pick_up_resource(&mut self, dir: Direction) -> Option<ResourceSlot> {
        for slot in &mut self.slots {
            if slot.is_some_and(|s| s.dir == Some(dir)) {
                return slot.take();
            }
        }
        None
    }

    /// Whether any slot is scheduled out through `dir`.
    #[must_use]
    pub fn has_resource_for(&self, dir: Direction) -> bool {
        self.slots
            .iter()
            .any(|s| s.is_some_and(|s| s.dir == Some(dir)))
    }

    /// Mutable access to the slot array for routing passes.
    pub fn slots_mut(&mut self) -> &mut [Option<ResourceSlot>; FLAG_RES_SLOTS] {
        &mut self.slots
    }

    /// Drop every queued resource, returning what was held.
    pub fn remove_all_resources(&mut self) -> Vec<ResourceSlot> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            if let Some(s) = slot.take() {
                out.push(s);
            }
        }
        out
    }

    /// Clear the destination of every slot routed to `dest`.
    pub fn reset_destination(&mut self, dest: FlagIndex) {
        for slot in self.slots.iter_mut().flatten() {
            if slot.dest == dest {
                slot.dest = 0;
                slot.dir = None;
            }
        }
    }

    /// Clear destinations of resources stolen with a captured flag.
    pub fn reset_destinations_of_stolen_resources(&mut self) {
        for slot in self.slots.iter_mut().flatten() {
            slot.dest = 0;
            slot.dir = None;
        }
    }

    /// Whether the flag can be demolished cleanly: at most two connected
    /// roads (which then merge into one).
    #[must_use]
    pub fn can_demolish(&self) -> bool {
        self.edge_count() <= 2 && !self.has_building()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_length_bucket_bands() {
        assert_eq!(length_bucket(0), 0);
        assert_eq!(length_bucket(1), 1);
        assert_eq!(length_bucket(2), 1);
        assert_eq!(length_bucket(3), 2);
        assert_eq!(length_bucket(7), 3);
        assert_eq!(length_bucket(8), 4);
        assert_eq!(length_bucket(17), 5);
        assert_eq!(length_bucket(26), 6);
        assert_eq!(length_bucket(27), 7);
        assert_eq!(length_bucket(500), 7);
    }

    #[test]
    fn test_slots_fill_and_drain() {
        let mut flag = Flag::new(0, 0);
        for i in 0..FLAG_RES_SLOTS {
            assert!(flag.push_resource(Resource::Plank, i as u32 + 1));
        }
        assert!(flag.slots_full());
        assert!(!flag.push_resource(Resource::Stone, 9));

        let removed = flag.remove_all_resources();
        assert_eq!(removed.len(), FLAG_RES_SLOTS);
        assert_eq!(flag.slot_count(), 0);
    }

    #[test]
    fn test_pick_up_scheduled_resource() {
        let mut flag = Flag::new(0, 0);
        flag.push_resource(Resource::Fish, 3);
        flag.slots_mut()[0].as_mut().unwrap().dir = Some(Direction::Right);

        assert!(flag.has_resource_for(Direction::Right));
        assert!(!flag.has_resource_for(Direction::Down));

        let slot = flag.pick_up_resource(Direction::Right).unwrap();
        assert_eq!(slot.res, Resource::Fish);
        assert_eq!(slot.dest, 3);
        assert_eq!(flag.slot_count(), 0);
    }

    #[test]
    fn test_reset_destination() {
        let mut flag = Flag::new(0, 0);
        flag.push_resource(Resource::Coal, 5);
        flag.push_resource(Resource::Coal, 6);
        flag.reset_destination(5);

        let dests: Vec<_> = flag.slots().iter().flatten().map(|s| s.dest).collect();
        assert_eq!(dests, vec![0, 6]);
    }

    #[test]
    fn test_edges_and_dir_to() {
        let mut flag = Flag::new(0, 0);
        flag.set_edge(Direction::Right, Edge::new(7, 4, false));
        flag.set_edge(Direction::UpLeft, Edge::new(9, 12, false));

        assert_eq!(flag.edge_count(), 2);
        assert_eq!(flag.dir_to(7), Some(Direction::Right));
        assert_eq!(flag.dir_to(9), Some(Direction::UpLeft));
        assert_eq!(flag.dir_to(1), None);
        assert_eq!(flag.edge(Direction::Right).unwrap().length_bucket, 2);

        flag.clear_edge(Direction::Right);
        assert_eq!(flag.edge_count(), 1);
    }

    #[test]
    fn test_can_demolish() {
        let mut flag = Flag::new(0, 0);
        assert!(flag.can_demolish());
        flag.set_edge(Direction::Right, Edge::new(2, 1, false));
        flag.set_edge(Direction::Left, Edge::new(3, 1, false));
        assert!(flag.can_demolish());
        flag.set_edge(Direction::Down, Edge::new(4, 1, false));
        assert!(!flag.can_demolish());
        flag.clear_edge(Direction::Down);
        flag.link_building(1);
        assert!(!flag.can_demolish());
    }
}
