//! Entity pools with stable integer handles.
//!
//! Flags, buildings, inventories and serfs all live in an [`Arena`]: a dense
//! vector of optional slots where the lowest free index is reused first and
//! index 0 is reserved as the null sentinel. Entities reference each other by
//! these indices and resolve them through the owning `Game`, so a destroyed
//! target simply fails to resolve instead of dangling.
//!
//! Iteration is in index order, which keeps every per-tick traversal
//! deterministic.

use serde::{Deserialize, Serialize};

use crate::error::{GameError, Result};

/// A dense pool of entities addressed by `u32` index.
///
/// Slot 0 always exists but is never handed out; an index of 0 therefore
/// means "no entity" everywhere in the simulation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Arena<T> {
    slots: Vec<Option<T>>,
    limit: usize,
    kind: String,
}

impl<T> Arena<T> {
    /// Create an empty pool that will refuse to grow past `limit` entities.
    #[must_use]
    pub fn new(kind: &str, limit: usize) -> Self {
        Self {
            slots: vec![None],
            limit,
            kind: kind.to_owned(),
        }
    }

    /// Insert an entity at the lowest free index and return that index.
    ///
    /// # Errors
    ///
    /// Returns [`GameError::PoolExhausted`] when the pool limit is reached.
    pub fn insert(&mut self, value: T) -> Result<u32> {
        for (i, slot) in self.slots.iter_mut().enumerate().skip(1) {
            if slot.is_none() {
                *slot = Some(value);
                return Ok(i as u32);
            }
        }
        if self.slots.len() >= self.limit {
            return Err(GameError::PoolExhausted {
                kind: self.kind.clone(),
                limit: self.limit,
            });
        }
        self.slots.push(Some(value));
        Ok((self.slots.len() - 1) as u32)
    }

    /// Remove the entity at `index`, returning it if it was present.
    pub fn remove(&mut self, index: u32) -> Option<T> {
        self.slots.get_mut(index as usize).and_then(Option::take)
    }

    /// Borrow the entity at `index`. Index 0 and empty slots resolve to `None`.
    #[must_use]
    pub fn get(&self, index: u32) -> Option<&T> {
        if index == 0 {
            return None;
        }
        self.slots.get(index as usize).and_then(Option::as_ref)
    }

    /// Mutably borrow the entity at `index`.
    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        if index == 0 {
            return None;
        }
        self.slots.get_mut(index as usize).and_then(Option::as_mut)
    }

    /// Whether a live entity occupies `index`.
    #[must_use]
    pub fn exists(&self, index: u32) -> bool {
        self.get(index).is_some()
    }

    /// Number of live entities.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Whether the pool holds no entities.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One past the highest index ever allocated.
    #[must_use]
    pub fn bound(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Iterate `(index, entity)` pairs in index order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        self.slots
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(i, slot)| slot.as_ref().map(|v| (i as u32, v)))
    }

    /// Iterate `(index, entity)` pairs mutably, in index order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (u32, &mut T)> {
        self.slots
            .iter_mut()
            .enumerate()
            .skip(1)
            .filter_map(|(i, slot)| slot.as_mut().map(|v| (i as u32, v)))
    }

    /// Collect the live indices, in order.
    ///
    /// Useful when an update pass needs to mutate entities while walking the
    /// pool: snapshot the indices first, then resolve each one.
    #[must_use]
    pub fn indices(&self) -> Vec<u32> {
        self.iter().map(|(i, _)| i).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_zero_is_never_allocated() {
        let mut arena: Arena<i32> = Arena::new("test", 16);
        let first = arena.insert(10).unwrap();
        assert_eq!(first, 1);
        assert!(arena.get(0).is_none());
    }

    #[test]
    fn test_lowest_free_index_reused() {
        let mut arena: Arena<i32> = Arena::new("test", 16);
        let a = arena.insert(1).unwrap();
        let b = arena.insert(2).unwrap();
        let c = arena.insert(3).unwrap();
        assert_eq!((a, b, c), (1, 2, 3));

        arena.remove(b);
        assert_eq!(arena.insert(4).unwrap(), 2);
    }

    #[test]
    fn test_limit_enforced() {
        let mut arena: Arena<i32> = Arena::new("test", 3);
        arena.insert(1).unwrap();
        arena.insert(2).unwrap();
        assert!(matches!(
            arena.insert(3),
            Err(GameError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_iteration_in_index_order() {
        let mut arena: Arena<i32> = Arena::new("test", 16);
        for v in [5, 6, 7, 8] {
            arena.insert(v).unwrap();
        }
        arena.remove(2);
        let collected: Vec<_> = arena.iter().map(|(i, v)| (i, *v)).collect();
        assert_eq!(collected, vec![(1, 5), (3, 7), (4, 8)]);
    }
}
