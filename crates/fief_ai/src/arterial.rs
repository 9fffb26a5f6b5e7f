//! Arterial road discovery.
//!
//! After a breadth-first search of the flag graph from an inventory flag,
//! every reached flag's path is retraced parent by parent and each
//! intermediate flag's occurrence counted. Within one (inventory, incoming
//! direction) bucket, flags at or above the [`ARTERIAL_PERCENTILE`] of the
//! occurrence distribution are labelled arterial: they carry a
//! disproportionate share of the shortest paths into that inventory and are
//! worth widening, guarding and keeping clear.

use std::collections::HashMap;

use fief_core::flag::FlagIndex;
use fief_core::flag_search::{FlagSearch, Visit};
use fief_core::map::Direction;

use crate::roadbuilder::PlannerWorld;

/// Occurrence percentile above which a flag counts as arterial. A heuristic
/// cutoff, not a load-bearing contract.
pub const ARTERIAL_PERCENTILE: f64 = 0.70;

/// Bucket key: an inventory flag and the direction traffic enters it from.
pub type InventoryDir = (FlagIndex, Direction);

/// Arterial flags per (inventory, incoming direction) bucket.
#[must_use]
pub fn identify_arterial_roads(
    world: &PlannerWorld,
    player: u8,
) -> HashMap<InventoryDir, Vec<FlagIndex>> {
    let flags = &world.flags;
    let mut result: HashMap<InventoryDir, Vec<FlagIndex>> = HashMap::new();

    let inventory_flags: Vec<FlagIndex> = flags
        .iter()
        .filter(|(_, f)| f.owner() == player && f.has_inventory())
        .map(|(i, _)| i)
        .collect();

    for inv_idx in inventory_flags {
        // Parent links of the breadth-first tree rooted at the inventory.
        let mut parents: HashMap<FlagIndex, FlagIndex> = HashMap::new();
        let mut search = FlagSearch::new(flags);
        search.add_source(inv_idx, 0);
        search.execute(|_, v| {
            parents.insert(v.flag, v.parent);
            Visit::Continue
        });

        // Count how often each intermediate flag occurs on retraced paths,
        // bucketed by the direction the path enters the inventory.
        let mut occurrence: HashMap<Direction, HashMap<FlagIndex, u32>> = HashMap::new();
        for leaf in parents.keys() {
            if *leaf == inv_idx {
                continue;
            }
            // Walk up to the inventory, remembering the hop below it.
            let mut path = Vec::new();
            let mut cur = *leaf;
            let mut below_inv = *leaf;
            loop {
                let Some(parent) = parents.get(&cur).copied() else {
                    break;
                };
                if parent == 0 {
                    break;
                }
                path.push(cur);
                if parent == inv_idx {
                    below_inv = cur;
                    break;
                }
                cur = parent;
            }
            let Some(in_dir) = flags.get(inv_idx).and_then(|f| f.dir_to(below_inv)) else {
                continue;
            };
            let bucket = occurrence.entry(in_dir).or_default();
            // Intermediate flags only: the leaf itself is not a waypoint.
            for flag in path.iter().skip(1) {
                *bucket.entry(*flag).or_insert(0) += 1;
            }
        }

        for (dir, counts) in occurrence {
            if counts.is_empty() {
                continue;
            }
            let mut values: Vec<u32> = counts.values().copied().collect();
            values.sort_unstable();
            let cut_index =
                ((values.len() - 1) as f64 * ARTERIAL_PERCENTILE).floor() as usize;
            let threshold = values[cut_index];

            let mut arterial: Vec<FlagIndex> = counts
                .into_iter()
                .filter(|(_, count)| *count >= threshold)
                .map(|(flag, _)| flag)
                .collect();
            arterial.sort_unstable();
            if !arterial.is_empty() {
                result.insert((inv_idx, dir), arterial);
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use fief_core::arena::Arena;
    use fief_core::flag::{Edge, Flag};
    use fief_core::map::{Map, Terrain};

    /// A comb: inventory I - T - (A, B, C) where T funnels three leaves.
    fn comb_world() -> PlannerWorld {
        let mut map = Map::new(3);
        for pos in 0..map.cell_count() {
            map.set_types(pos, Terrain::Grass1, Terrain::Grass1);
        }
        let mut flags: Arena<Flag> = Arena::new("flag", 64);
        let inv = flags.insert(Flag::new(map.pos(10, 10), 0)).unwrap();
        flags.get_mut(inv).unwrap().set_inventory(true, true);
        let trunk = flags.insert(Flag::new(map.pos(13, 10), 0)).unwrap();
        let leaves: Vec<u32> = (0..3)
            .map(|i| flags.insert(Flag::new(map.pos(16, 10 + i), 0)).unwrap())
            .collect();

        let link = |flags: &mut Arena<Flag>, a: u32, da: Direction, b: u32| {
            flags.get_mut(a).unwrap().set_edge(da, Edge::new(b, 3, false));
            flags
                .get_mut(b)
                .unwrap()
                .set_edge(da.reverse(), Edge::new(a, 3, false));
        };
        link(&mut flags, inv, Direction::Right, trunk);
        link(&mut flags, trunk, Direction::DownRight, leaves[0]);
        link(&mut flags, trunk, Direction::Down, leaves[1]);
        link(&mut flags, trunk, Direction::Up, leaves[2]);

        PlannerWorld {
            map,
            flags,
            castle_flag: inv,
            inventory_flags: vec![],
        }
    }

    #[test]
    fn test_trunk_flag_is_arterial() {
        let world = comb_world();
        let arterial = identify_arterial_roads(&world, 0);
        // All traffic enters the inventory from the east trunk; the trunk
        // flag carries every path.
        let bucket = arterial
            .get(&(1, Direction::Right))
            .expect("east bucket exists");
        assert!(bucket.contains(&2), "trunk flag should be arterial");
    }

    #[test]
    fn test_no_paths_no_buckets() {
        let mut world = comb_world();
        // Strip the graph down to the inventory alone.
        let ids: Vec<u32> = world.flags.indices();
        for id in ids {
            if id != 1 {
                world.flags.remove(id);
            }
        }
        for dir in Direction::ALL {
            world.flags.get_mut(1).unwrap().clear_edge(dir);
        }
        let arterial = identify_arterial_roads(&world, 0);
        assert!(arterial.is_empty());
    }
}
