//! Resource kinds moved over the road network.

use serde::{Deserialize, Serialize};

/// The 26 transportable resource kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Resource {
    /// Food from the fisher.
    Fish = 0,
    /// Live pig.
    Pig,
    /// Food from the butcher.
    Meat,
    /// Harvested grain.
    Wheat,
    /// Milled flour.
    Flour,
    /// Food from the baker.
    Bread,
    /// Felled trunk.
    Lumber,
    /// Sawn plank.
    Plank,
    /// Boat.
    Boat,
    /// Quarried stone.
    Stone,
    /// Iron ore.
    IronOre,
    /// Smelted steel.
    Steel,
    /// Coal.
    Coal,
    /// Gold ore.
    GoldOre,
    /// Smelted gold bar.
    GoldBar,
    /// Tool: shovel.
    Shovel,
    /// Tool: hammer.
    Hammer,
    /// Tool: fishing rod.
    Rod,
    /// Tool: cleaver.
    Cleaver,
    /// Tool: scythe.
    Scythe,
    /// Tool: axe.
    Axe,
    /// Tool: saw.
    Saw,
    /// Tool: pick.
    Pick,
    /// Tool: pincer.
    Pincer,
    /// Weapon: sword.
    Sword,
    /// Weapon: shield.
    Shield,
}

/// Number of resource kinds.
pub const RESOURCE_COUNT: usize = 26;

impl Resource {
    /// All resource kinds in discriminant order.
    pub const ALL: [Resource; RESOURCE_COUNT] = [
        Resource::Fish,
        Resource::Pig,
        Resource::Meat,
        Resource::Wheat,
        Resource::Flour,
        Resource::Bread,
        Resource::Lumber,
        Resource::Plank,
        Resource::Boat,
        Resource::Stone,
        Resource::IronOre,
        Resource::Steel,
        Resource::Coal,
        Resource::GoldOre,
        Resource::GoldBar,
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
    ];

    /// Resource from its `0..26` discriminant.
    #[must_use]
    pub fn from_index(index: usize) -> Option<Resource> {
        Resource::ALL.get(index).copied()
    }

    /// Whether this kind feeds miners.
    #[must_use]
    pub const fn is_food(self) -> bool {
        matches!(self, Resource::Fish | Resource::Meat | Resource::Bread)
    }

    /// Whether this kind is a serf tool.
    #[must_use]
    pub const fn is_tool(self) -> bool {
        matches!(
            self,
            Resource::Shovel
                | Resource::Hammer
                | Resource::Rod
                | Resource::Cleaver
                | Resource::Scythe
                | Resource::Axe
                | Resource::Saw
                | Resource::Pick
                | Resource::Pincer
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_covers_every_discriminant() {
        for (i, res) in Resource::ALL.iter().enumerate() {
            assert_eq!(*res as usize, i);
            assert_eq!(Resource::from_index(i), Some(*res));
        }
        assert_eq!(Resource::from_index(RESOURCE_COUNT), None);
    }

    #[test]
    fn test_food_kinds() {
        assert!(Resource::Fish.is_food());
        assert!(Resource::Bread.is_food());
        assert!(!Resource::Wheat.is_food());
    }
}
