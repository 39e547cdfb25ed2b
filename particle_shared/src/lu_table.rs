//! Node identifier lookup table.
//!
//! Fixed-capacity open-addressed map from server-assigned node ids to local
//! handles. The home slot of an id is `id % capacity`.
//!
//! Collisions are resolved with linear probing and the full id is stored in
//! every occupied slot, so two ids sharing a home slot never shadow each
//! other. Removal uses backward-shift deletion (no tombstones), which keeps
//! every probe chain contiguous.
//!
//! The table does no locking; it lives on the network-callback thread.

use thiserror::Error;

/// Errors returned by [`LookupTable::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup table is full ({capacity} slots)")]
    Full { capacity: usize },
    #[error("node {0} is already registered")]
    Duplicate(u32),
}

#[derive(Debug, Clone, Copy)]
enum Slot<T> {
    Empty,
    Occupied { id: u32, value: T },
}

/// Open-addressed id → value table.
#[derive(Debug, Clone)]
pub struct LookupTable<T> {
    slots: Vec<Slot<T>>,
    count: usize,
}

impl<T: Copy> LookupTable<T> {
    /// Creates a table with all `capacity` slots empty.
    ///
    /// A zero capacity is bumped to one so the modulo hash stays defined.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            slots: vec![Slot::Empty; capacity],
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count == self.slots.len()
    }

    fn home(&self, id: u32) -> usize {
        id as usize % self.slots.len()
    }

    fn position(&self, id: u32) -> Option<usize> {
        let cap = self.slots.len();
        let home = self.home(id);
        for step in 0..cap {
            let i = (home + step) % cap;
            match self.slots[i] {
                Slot::Empty => return None,
                Slot::Occupied { id: stored, .. } if stored == id => return Some(i),
                Slot::Occupied { .. } => {}
            }
        }
        None
    }

    /// Registers `value` under `id`.
    ///
    /// Fails without touching the table when it is full or `id` is already
    /// present.
    pub fn add(&mut self, id: u32, value: T) -> Result<(), LookupError> {
        if self.is_full() {
            return Err(LookupError::Full {
                capacity: self.capacity(),
            });
        }
        if self.position(id).is_some() {
            return Err(LookupError::Duplicate(id));
        }

        let cap = self.slots.len();
        let home = self.home(id);
        for step in 0..cap {
            let i = (home + step) % cap;
            if let Slot::Empty = self.slots[i] {
                self.slots[i] = Slot::Occupied { id, value };
                self.count += 1;
                return Ok(());
            }
        }

        // Unreachable while count < capacity.
        Err(LookupError::Full { capacity: cap })
    }

    /// Returns the value stored under `id`.
    pub fn find(&self, id: u32) -> Option<T> {
        self.position(id).and_then(|i| match self.slots[i] {
            Slot::Occupied { value, .. } => Some(value),
            Slot::Empty => None,
        })
    }

    pub fn contains(&self, id: u32) -> bool {
        self.position(id).is_some()
    }

    /// Removes `id`, returning its value if it was present.
    pub fn remove(&mut self, id: u32) -> Option<T> {
        let mut hole = self.position(id)?;
        let removed = match self.slots[hole] {
            Slot::Occupied { value, .. } => value,
            Slot::Empty => return None,
        };
        self.slots[hole] = Slot::Empty;
        self.count -= 1;

        // Pull later members of the probe chain back over the hole.
        let cap = self.slots.len();
        let mut j = (hole + 1) % cap;
        while let Slot::Occupied { id: moved, value } = self.slots[j] {
            let home = self.home(moved);
            let dist_home = (j + cap - home) % cap;
            let dist_hole = (j + cap - hole) % cap;
            if dist_home >= dist_hole {
                self.slots[hole] = Slot::Occupied { id: moved, value };
                self.slots[j] = Slot::Empty;
                hole = j;
            }
            j = (j + 1) % cap;
            if j == hole {
                break;
            }
        }

        Some(removed)
    }

    /// Iterates over all `(id, value)` pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (u32, T)> + '_ {
        self.slots.iter().filter_map(|s| match *s {
            Slot::Occupied { id, value } => Some((id, value)),
            Slot::Empty => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_after_add_returns_value() {
        let mut t = LookupTable::new(16);
        t.add(65_536, 'a').unwrap();
        t.add(3, 'b').unwrap();
        assert_eq!(t.find(65_536), Some('a'));
        assert_eq!(t.find(3), Some('b'));
        assert_eq!(t.find(4), None);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn colliding_ids_are_both_kept() {
        let mut t = LookupTable::new(10);
        t.add(7, 1).unwrap();
        t.add(17, 2).unwrap();
        t.add(27, 3).unwrap();
        assert_eq!(t.find(7), Some(1));
        assert_eq!(t.find(17), Some(2));
        assert_eq!(t.find(27), Some(3));
    }

    #[test]
    fn add_beyond_capacity_fails_without_mutation() {
        let mut t = LookupTable::new(2);
        t.add(1, 10).unwrap();
        t.add(2, 20).unwrap();
        assert_eq!(t.add(3, 30), Err(LookupError::Full { capacity: 2 }));
        assert_eq!(t.len(), 2);
        assert_eq!(t.find(3), None);
        assert_eq!(t.find(1), Some(10));
        assert!(t.len() <= t.capacity());
    }

    #[test]
    fn duplicate_id_is_rejected() {
        let mut t = LookupTable::new(4);
        t.add(9, 'x').unwrap();
        assert_eq!(t.add(9, 'y'), Err(LookupError::Duplicate(9)));
        assert_eq!(t.find(9), Some('x'));
    }

    #[test]
    fn remove_keeps_probe_chain_reachable() {
        let mut t = LookupTable::new(8);
        // 1, 9 and 17 share home slot 1; 2 lands behind them.
        for (id, v) in [(1, 'a'), (9, 'b'), (17, 'c'), (2, 'd')] {
            t.add(id, v).unwrap();
        }
        assert_eq!(t.remove(9), Some('b'));
        assert_eq!(t.find(1), Some('a'));
        assert_eq!(t.find(17), Some('c'));
        assert_eq!(t.find(2), Some('d'));
        assert_eq!(t.find(9), None);
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn remove_wraps_around_the_end() {
        let mut t = LookupTable::new(4);
        t.add(3, 'a').unwrap();
        t.add(7, 'b').unwrap(); // home 3, wraps to slot 0
        t.add(0, 'c').unwrap(); // home 0, pushed to slot 1
        assert_eq!(t.remove(3), Some('a'));
        assert_eq!(t.find(7), Some('b'));
        assert_eq!(t.find(0), Some('c'));
    }

    #[test]
    fn remove_missing_is_noop() {
        let mut t: LookupTable<u8> = LookupTable::new(4);
        assert_eq!(t.remove(5), None);
        assert!(t.is_empty());
    }

    #[test]
    fn full_table_still_finds_everything() {
        let mut t = LookupTable::new(5);
        for id in [5, 10, 15, 20, 25] {
            t.add(id, id * 2).unwrap();
        }
        assert!(t.is_full());
        for id in [5, 10, 15, 20, 25] {
            assert_eq!(t.find(id), Some(id * 2));
        }
        assert_eq!(t.find(30), None);
        assert_eq!(t.remove(15), Some(30));
        assert_eq!(t.find(25), Some(50));
    }
}
