//! Breadth-first search over the flag graph.
//!
//! Used for resource routing to inventories, serf dispatch from inventories
//! (multi-source, each source tagged), geologist dispatch and the
//! nearest-inventory queries the AI leans on.
//!
//! Ordering contract: the frontier is a min-heap on flag distance with ties
//! broken by insertion order, which makes the traversal breadth-first. The
//! comparator must keep ordering lower distances first; the reversed variant
//! degenerates into depth-first exploration and returns wrong "nearest"
//! answers. Dead flags are filtered at dequeue.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

use crate::arena::Arena;
use crate::flag::{Flag, FlagIndex};
use crate::map::Direction;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SearchNode {
    /// Flag-count distance from the search source.
    dist: u32,
    /// Insertion order; breaks distance ties first-in first-out.
    seq: u32,
    flag: FlagIndex,
    /// Caller-provided tag of the source this node grew from.
    tag: usize,
    /// First direction taken out of the source toward this node.
    first_dir: Option<Direction>,
    parent: FlagIndex,
}

impl Ord for SearchNode {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; order is reversed so the node with the
        // *lower* flag distance pops first (breadth-first).
        match other.dist.cmp(&self.dist) {
            Ordering::Equal => other.seq.cmp(&self.seq),
            ord => ord,
        }
    }
}

impl PartialOrd for SearchNode {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Outcome of visiting one flag during a search.
pub enum Visit {
    /// Keep searching.
    Continue,
    /// Stop; the visited flag is the result.
    Found,
}

/// A visited flag handed to the search callback.
#[derive(Debug, Clone, Copy)]
pub struct Visited {
    /// The flag's pool index.
    pub flag: FlagIndex,
    /// Flag-count distance from its source.
    pub dist: u32,
    /// Tag of the source the flag was reached from.
    pub tag: usize,
    /// First direction taken out of that source, when the source has edges.
    pub first_dir: Option<Direction>,
    /// Previous flag on the path (the source itself points at 0).
    pub parent: FlagIndex,
}

/// Breadth-first flag-graph search.
pub struct FlagSearch<'a> {
    flags: &'a Arena<Flag>,
    queue: BinaryHeap<SearchNode>,
    seen: HashMap<FlagIndex, u32>,
    seq: u32,
}

impl<'a> FlagSearch<'a> {
    /// New search over a flag pool (live game or AI snapshot).
    #[must_use]
    pub fn new(flags: &'a Arena<Flag>) -> Self {
        Self {
            flags,
            queue: BinaryHeap::new(),
            seen: HashMap::new(),
            seq: 0,
        }
    }

    /// Add a source flag with a caller tag (source inventory slot, etc.).
    pub fn add_source(&mut self, flag: FlagIndex, tag: usize) {
        if !self.flags.exists(flag) {
            return;
        }
        self.seen.insert(flag, 0);
        self.queue.push(SearchNode {
            dist: 0,
            seq: self.seq,
            flag,
            tag,
            first_dir: None,
            parent: 0,
        });
        self.seq += 1;
    }

    /// Run the search, visiting flags in breadth-first order until the
    /// callback reports [`Visit::Found`] or the graph is exhausted.
    ///
    /// Returns the found flag's visit record, if any.
    pub fn execute<F>(mut self, mut visit: F) -> Option<Visited>
    where
        F: FnMut(&Flag, Visited) -> Visit,
    {
        while let Some(node) = self.queue.pop() {
            // Dead flags are filtered here, not at enqueue: a flag can be
            // demolished between scheduling and visiting.
            let Some(flag) = self.flags.get(node.flag) else {
                continue;
            };

            let record = Visited {
                flag: node.flag,
                dist: node.dist,
                tag: node.tag,
                first_dir: node.first_dir,
                parent: node.parent,
            };
            if matches!(visit(flag, record), Visit::Found) {
                return Some(record);
            }

            for dir in Direction::ALL {
                let Some(edge) = flag.edge(dir) else {
                    continue;
                };
                let next = edge.endpoint;
                if next == 0 || self.seen.contains_key(&next) {
                    continue;
                }
                self.seen.insert(next, node.dist + 1);
                self.queue.push(SearchNode {
                    dist: node.dist + 1,
                    seq: self.seq,
                    flag: next,
                    tag: node.tag,
                    first_dir: node.first_dir.or(Some(dir)),
                    parent: node.flag,
                });
                self.seq += 1;
            }
        }
        None
    }
}

/// Nearest flag with an inventory accepting resources, by flag distance.
#[must_use]
pub fn find_nearest_inventory_for_resource(
    flags: &Arena<Flag>,
    from: FlagIndex,
) -> Option<FlagIndex> {
    let mut search = FlagSearch::new(flags);
    search.add_source(from, 0);
    search
        .execute(|flag, _| {
            if flag.has_inventory() && flag.accepts_resources() {
                Visit::Found
            } else {
                Visit::Continue
            }
        })
        .map(|v| v.flag)
}

/// Nearest flag with an inventory accepting serfs, by flag distance.
#[must_use]
pub fn find_nearest_inventory_for_serf(
    flags: &Arena<Flag>,
    from: FlagIndex,
) -> Option<FlagIndex> {
    let mut search = FlagSearch::new(flags);
    search.add_source(from, 0);
    search
        .execute(|flag, _| {
            if flag.has_inventory() && flag.accepts_serfs() {
                Visit::Found
            } else {
                Visit::Continue
            }
        })
        .map(|v| v.flag)
}

/// First direction to leave `from` in order to reach `dest`, or `None` when
/// unreachable.
#[must_use]
pub fn next_dir_toward(flags: &Arena<Flag>, from: FlagIndex, dest: FlagIndex) -> Option<Direction> {
    if from == dest {
        return None;
    }
    let mut search = FlagSearch::new(flags);
    search.add_source(from, 0);
    search
        .execute(|_, v| {
            if v.flag == dest {
                Visit::Found
            } else {
                Visit::Continue
            }
        })
        .and_then(|v| v.first_dir)
}

/// Flag-count distance between two flags, or `None` when disconnected.
#[must_use]
pub fn flag_dist(flags: &Arena<Flag>, from: FlagIndex, dest: FlagIndex) -> Option<u32> {
    let mut search = FlagSearch::new(flags);
    search.add_source(from, 0);
    search
        .execute(|_, v| {
            if v.flag == dest {
                Visit::Found
            } else {
                Visit::Continue
            }
        })
        .map(|v| v.dist)
}

/// The flag path from `from` to `dest` inclusive, in travel order.
#[must_use]
pub fn flag_path(flags: &Arena<Flag>, from: FlagIndex, dest: FlagIndex) -> Option<Vec<FlagIndex>> {
    let mut parents: HashMap<FlagIndex, FlagIndex> = HashMap::new();
    let mut search = FlagSearch::new(flags);
    search.add_source(from, 0);
    let found = search.execute(|_, v| {
        parents.insert(v.flag, v.parent);
        if v.flag == dest {
            Visit::Found
        } else {
            Visit::Continue
        }
    })?;

    let mut path = vec![found.flag];
    let mut cur = found.flag;
    while let Some(&parent) = parents.get(&cur) {
        if parent == 0 {
            break;
        }
        path.push(parent);
        cur = parent;
    }
    path.reverse();
    (path.first() == Some(&from)).then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::Edge;

    /// Build a chain of flags 1-2-3-...-n, plus edges.
    fn chain(n: usize) -> Arena<Flag> {
        let mut flags = Arena::new("flag", 64);
        for i in 0..n {
            flags.insert(Flag::new(i as u32, 0)).unwrap();
        }
        for i in 1..n as u32 {
            let a = i;
            let b = i + 1;
            flags
                .get_mut(a)
                .unwrap()
                .set_edge(Direction::Right, Edge::new(b, 2, false));
            flags
                .get_mut(b)
                .unwrap()
                .set_edge(Direction::Left, Edge::new(a, 2, false));
        }
        flags
    }

    #[test]
    fn test_bfs_visits_in_distance_order() {
        let flags = chain(5);
        let mut order = Vec::new();
        let mut search = FlagSearch::new(&flags);
        search.add_source(1, 0);
        search.execute(|_, v| {
            order.push((v.flag, v.dist));
            Visit::Continue
        });
        assert_eq!(order, vec![(1, 0), (2, 1), (3, 2), (4, 3), (5, 4)]);
    }

    #[test]
    fn test_breadth_first_not_depth_first() {
        // A star: center 1 connected to 2,3,4; 2 connected onward to 5.
        let mut flags = Arena::new("flag", 64);
        for i in 0..5 {
            flags.insert(Flag::new(i, 0)).unwrap();
        }
        let dirs = [Direction::Right, Direction::Down, Direction::Up];
        for (k, leaf) in [2u32, 3, 4].iter().enumerate() {
            flags
                .get_mut(1)
                .unwrap()
                .set_edge(dirs[k], Edge::new(*leaf, 1, false));
            flags
                .get_mut(*leaf)
                .unwrap()
                .set_edge(dirs[k].reverse(), Edge::new(1, 1, false));
        }
        flags
            .get_mut(2)
            .unwrap()
            .set_edge(Direction::DownRight, Edge::new(5, 1, false));
        flags
            .get_mut(5)
            .unwrap()
            .set_edge(Direction::UpLeft, Edge::new(2, 1, false));

        let mut order = Vec::new();
        let mut search = FlagSearch::new(&flags);
        search.add_source(1, 0);
        search.execute(|_, v| {
            order.push(v.flag);
            Visit::Continue
        });
        // All distance-1 flags before the distance-2 flag: breadth-first.
        assert_eq!(order, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_next_dir_toward() {
        let flags = chain(4);
        assert_eq!(next_dir_toward(&flags, 1, 4), Some(Direction::Right));
        assert_eq!(next_dir_toward(&flags, 4, 1), Some(Direction::Left));
        assert_eq!(next_dir_toward(&flags, 1, 1), None);
    }

    #[test]
    fn test_nearest_inventory() {
        let mut flags = chain(4);
        flags.get_mut(4).unwrap().set_inventory(true, true);
        assert_eq!(find_nearest_inventory_for_resource(&flags, 1), Some(4));

        // A stopped inventory is skipped.
        flags.get_mut(4).unwrap().set_accepts_resources(false);
        assert_eq!(find_nearest_inventory_for_resource(&flags, 1), None);
        assert_eq!(find_nearest_inventory_for_serf(&flags, 1), Some(4));
    }

    #[test]
    fn test_dead_flags_filtered_at_dequeue() {
        let mut flags = chain(3);
        flags.remove(2);
        // 2 is referenced by 1's edge but dead; the search must skip it.
        let mut order = Vec::new();
        let mut search = FlagSearch::new(&flags);
        search.add_source(1, 0);
        search.execute(|_, v| {
            order.push(v.flag);
            Visit::Continue
        });
        assert_eq!(order, vec![1]);
    }

    #[test]
    fn test_multi_source_tags() {
        let flags = chain(5);
        let mut search = FlagSearch::new(&flags);
        search.add_source(1, 10);
        search.add_source(5, 20);
        // Flag 3 is equidistant; the first-inserted source (tag 10) wins.
        let found = search
            .execute(|_, v| {
                if v.flag == 3 {
                    Visit::Found
                } else {
                    Visit::Continue
                }
            })
            .unwrap();
        assert_eq!(found.tag, 10);
        assert_eq!(found.dist, 2);
    }

    #[test]
    fn test_flag_path() {
        let flags = chain(5);
        assert_eq!(flag_path(&flags, 1, 4), Some(vec![1, 2, 3, 4]));
        assert_eq!(flag_path(&flags, 4, 4), Some(vec![4]));
        assert_eq!(flag_dist(&flags, 1, 5), Some(4));
    }
}
