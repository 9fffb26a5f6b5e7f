//! Player state: settings, statistics and the attack plan.
//!
//! A player slot holds the routing and production priorities a human tunes
//! in the settings popups, the knight-occupation table by threat band, the
//! rolling statistics histories and the notification queue. The actual
//! entities (flags, buildings, serfs, inventories) are owned by the game;
//! players only keep counts and weak indices.

use serde::{Deserialize, Serialize};

use crate::building::BuildingIndex;
use crate::map::MapPos;
use crate::resource::{Resource, RESOURCE_COUNT};
use crate::serf::SERF_TYPE_COUNT;

/// Number of player slots.
pub const MAX_PLAYERS: usize = 4;

/// Length of each player-statistics history ring.
pub const PLAYER_HISTORY_LEN: usize = 112;

/// Number of (aspect, scale) history modes: 4 aspects x 4 time scales.
pub const PLAYER_HISTORY_MODES: usize = 16;

/// Length of the resource-production history ring.
pub const RESOURCE_HISTORY_LEN: usize = 120;

/// Number of craftable tool kinds, in [`Resource`] order from shovel.
pub const TOOL_COUNT: usize = 9;

/// Knight staffing for one threat band.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnightOccupation {
    /// Minimum knights kept in buildings of the band.
    pub min: u8,
    /// Maximum knights sent to buildings of the band.
    pub max: u8,
}

/// A queued player notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// What happened.
    pub kind: NotificationKind,
    /// Where it happened.
    pub pos: MapPos,
    /// Player the event concerns (attacker, discoverer, ...).
    pub other_player: u8,
}

/// Notification kinds surfaced to the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotificationKind {
    /// An enemy took one of our buildings.
    BuildingLost,
    /// We took an enemy building.
    BuildingCaptured,
    /// One of our buildings is under attack.
    UnderAttack,
    /// A geologist found ore.
    MineralFound,
    /// A new stock is completed.
    NewStock,
    /// The castle was destroyed; the player is defeated.
    CastleLost,
}

/// A planned attack, staged before committing knights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AttackPlan {
    /// Target enemy military building (0 = none staged).
    pub target: BuildingIndex,
    /// Knights the player wants to commit.
    pub wanted_knights: u32,
}

/// One player slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Player {
    /// Portrait of the player; cosmetic (slots are `Option<Player>`).
    pub face: u32,
    /// Player color index.
    pub color: u32,
    /// Whether a computer drives this slot.
    pub is_ai: bool,

    /// Whether the castle has been placed.
    pub has_castle: bool,
    /// Castle building index (0 before placement).
    pub castle_index: BuildingIndex,
    /// Castle score modifier applied to morale (+1 per held castle, -1 lost).
    pub castle_score: i32,
    /// Whether building is currently allowed (serf cap not reached).
    pub can_spawn_serfs: bool,

    /// Initial supplies setting.
    pub supplies: u32,
    /// Reproduction rate setting.
    pub reproduction_rate: u32,
    /// Intelligence setting (drives AI aggressiveness).
    pub intelligence: u32,

    /// Countdown until the next serf may spawn.
    pub reproduction_counter: i32,
    /// Reset value for the reproduction counter.
    pub reproduction_reset: i32,
    /// Rate at which spawned serfs become knights.
    pub serf_to_knight_rate: u32,
    /// Accumulator for knight spawning.
    pub serf_to_knight_counter: u32,
    /// Knights waiting to be spawned.
    pub knights_to_spawn: u32,
    /// Knight cycling countdown (0 when not cycling).
    pub knight_cycle_counter: i32,

    /// Knight morale, recomputed every 256 ticks.
    pub knight_morale: u32,
    /// Gold currently counted toward morale.
    pub gold_deposited: u32,

    /// Land cells owned.
    pub total_land_area: u32,
    /// Sum of per-building military contribution.
    pub total_military_score: u32,
    /// Sum of completed building scores.
    pub total_building_score: u32,

    /// Completed buildings per type.
    pub completed_building_count: Vec<u32>,
    /// Under-construction buildings per type.
    pub incomplete_building_count: Vec<u32>,
    /// Serfs per type.
    pub serf_count: Vec<u32>,
    /// Resources produced since the last history sample.
    pub resource_count: Vec<u32>,

    /// Pickup priority per resource at flags, 1..=26 (higher first).
    pub flag_prio: Vec<u8>,
    /// Departure priority per resource in out-mode inventories, 1..=26.
    pub inventory_prio: Vec<u8>,
    /// Tool crafting priorities (shovel..pincer).
    pub tool_prio: Vec<u16>,

    /// Food routing priority to each mine kind: stone, coal, iron, gold.
    pub food_to_mines: [u16; 4],
    /// Plank split: construction, boatbuilder, toolmaker.
    pub planks_split: [u16; 3],
    /// Steel split: toolmaker, weaponsmith.
    pub steel_split: [u16; 2],
    /// Coal split: steelsmelter, goldsmelter, weaponsmith.
    pub coal_split: [u16; 3],
    /// Wheat split: pigfarm, mill.
    pub wheat_split: [u16; 2],

    /// Knight occupation per threat band (interior..frontier).
    pub knight_occupation: [KnightOccupation; 4],

    /// Staged attack.
    pub attack: AttackPlan,

    /// Statistics history rings, one per (aspect, scale) mode.
    pub stat_history: Vec<Vec<u16>>,
    /// Resource production history rings, one per resource.
    pub resource_history: Vec<Vec<u16>>,

    /// Pending notifications, oldest first.
    pub notifications: Vec<Notification>,

    /// Last tick this player was updated.
    pub last_tick: u32,
}

impl Player {
    /// New player with the default settings.
    #[must_use]
    pub fn new(face: u32, color: u32, supplies: u32, reproduction: u32, intelligence: u32) -> Self {
        Self {
            face,
            color,
            is_ai: false,
            has_castle: false,
            castle_index: 0,
            castle_score: 0,
            can_spawn_serfs: true,
            supplies,
            reproduction_rate: reproduction,
            intelligence,
            reproduction_counter: reproduction as i32 * 20,
            reproduction_reset: (60 - reproduction.min(60)) as i32 * 50 + 500,
            serf_to_knight_rate: 20_000,
            serf_to_knight_counter: 0,
            knights_to_spawn: 0,
            knight_cycle_counter: 0,
            knight_morale: 1024,
            gold_deposited: 0,
            total_land_area: 0,
            total_military_score: 0,
            total_building_score: 0,
            completed_building_count: vec![0; 24],
            incomplete_building_count: vec![0; 24],
            serf_count: vec![0; SERF_TYPE_COUNT],
            resource_count: vec![0; RESOURCE_COUNT],
            flag_prio: default_flag_prio(),
            inventory_prio: default_inventory_prio(),
            tool_prio: vec![4096; TOOL_COUNT],
            food_to_mines: [13_100, 45_850, 45_850, 65_500],
            planks_split: [65_500, 3_275, 19_650],
            steel_split: [45_850, 65_500],
            coal_split: [52_400, 65_500, 45_850],
            wheat_split: [32_750, 65_500],
            knight_occupation: [
                KnightOccupation { min: 1, max: 1 },
                KnightOccupation { min: 1, max: 2 },
                KnightOccupation { min: 2, max: 3 },
                KnightOccupation { min: 3, max: 4 },
            ],
            attack: AttackPlan::default(),
            stat_history: vec![vec![0; PLAYER_HISTORY_LEN]; PLAYER_HISTORY_MODES],
            resource_history: vec![vec![0; RESOURCE_HISTORY_LEN]; RESOURCE_COUNT],
            notifications: Vec::new(),
            last_tick: 0,
        }
    }

    /// Pickup priority of a resource at flags (higher moves first).
    #[must_use]
    pub fn flag_prio_of(&self, res: Resource) -> u8 {
        self.flag_prio[res as usize]
    }

    /// Departure priority of a resource for out-mode inventories.
    #[must_use]
    pub fn inventory_prio_of(&self, res: Resource) -> u8 {
        self.inventory_prio[res as usize]
    }

    /// Knight staffing target for a building's threat band, clamped to its
    /// capacity.
    #[must_use]
    pub fn knights_wanted(&self, threat_level: u8, capacity: u32) -> u32 {
        let occ = self.knight_occupation[threat_level.min(3) as usize];
        (occ.max as u32).min(capacity).max(1)
    }

    /// Queue a notification.
    pub fn add_notification(&mut self, kind: NotificationKind, pos: MapPos, other_player: u8) {
        self.notifications.push(Notification {
            kind,
            pos,
            other_player,
        });
    }

    /// Drain pending notifications, oldest first.
    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Military score contribution of a knight of the given rank.
    #[must_use]
    pub const fn knight_military_score(rank: u8) -> u32 {
        1 + rank as u32
    }
}

/// Default flag pickup priorities: weapons and refined goods move before raw
/// materials.
fn default_flag_prio() -> Vec<u8> {
    let mut prio = vec![0u8; RESOURCE_COUNT];
    let order = [
        Resource::Shield,
        Resource::Sword,
        Resource::Boat,
        Resource::Pincer,
        Resource::Scythe,
        Resource::Rod,
        Resource::Cleaver,
        Resource::Saw,
        Resource::Axe,
        Resource::Pick,
        Resource::Shovel,
        Resource::Hammer,
        Resource::GoldBar,
        Resource::GoldOre,
        Resource::Steel,
        Resource::IronOre,
        Resource::Coal,
        Resource::Bread,
        Resource::Meat,
        Resource::Fish,
        Resource::Pig,
        Resource::Flour,
        Resource::Wheat,
        Resource::Plank,
        Resource::Stone,
        Resource::Lumber,
    ];
    for (i, res) in order.iter().enumerate() {
        prio[*res as usize] = (RESOURCE_COUNT - i) as u8;
    }
    prio
}

/// Default inventory departure priorities: construction material first.
fn default_inventory_prio() -> Vec<u8> {
    let mut prio = vec![0u8; RESOURCE_COUNT];
    let order = [
        Resource::Plank,
        Resource::Stone,
        Resource::Steel,
        Resource::Coal,
        Resource::Lumber,
        Resource::IronOre,
        Resource::Fish,
        Resource::Meat,
        Resource::Bread,
        Resource::Pig,
        Resource::Flour,
        Resource::Wheat,
        Resource::GoldBar,
        Resource::GoldOre,
        Resource::Shovel,
        Resource::Hammer,
        Resource::Rod,
        Resource::Cleaver,
        Resource::Scythe,
        Resource::Axe,
        Resource::Saw,
        Resource::Pick,
        Resource::Pincer,
        Resource::Sword,
        Resource::Shield,
        Resource::Boat,
    ];
    for (i, res) in order.iter().enumerate() {
        prio[*res as usize] = (RESOURCE_COUNT - i) as u8;
    }
    prio
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_priorities_cover_all_resources() {
        let player = Player::new(12, 64, 35, 30, 40);
        let mut flag_sorted = player.flag_prio.clone();
        flag_sorted.sort_unstable();
        let expected: Vec<u8> = (1..=RESOURCE_COUNT as u8).collect();
        assert_eq!(flag_sorted, expected);

        let mut inv_sorted = player.inventory_prio.clone();
        inv_sorted.sort_unstable();
        assert_eq!(inv_sorted, expected);
    }

    #[test]
    fn test_weapons_outrank_raw_materials_at_flags() {
        let player = Player::new(12, 64, 35, 30, 40);
        assert!(player.flag_prio_of(Resource::Sword) > player.flag_prio_of(Resource::Lumber));
        assert!(player.flag_prio_of(Resource::GoldBar) > player.flag_prio_of(Resource::Stone));
    }

    #[test]
    fn test_knights_wanted_clamps_to_capacity() {
        let player = Player::new(12, 64, 35, 30, 40);
        // Frontier band wants 4 but a hut only holds 3.
        assert_eq!(player.knights_wanted(3, 3), 3);
        assert_eq!(player.knights_wanted(0, 3), 1);
        // Always at least one knight.
        assert_eq!(player.knights_wanted(0, 12), 1);
    }

    #[test]
    fn test_notifications_drain_in_order() {
        let mut player = Player::new(12, 64, 35, 30, 40);
        player.add_notification(NotificationKind::UnderAttack, 10, 1);
        player.add_notification(NotificationKind::BuildingLost, 11, 1);
        let drained = player.drain_notifications();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].kind, NotificationKind::UnderAttack);
        assert!(player.notifications.is_empty());
    }
}
