//! Generation-stamped visited set for graph traversal.
//!
//! Marks are `u16` generation stamps in a flat array indexed by internal node
//! id. `clear()` bumps the generation instead of zeroing the array; a full
//! reset happens only when the counter wraps.

use std::cell::RefCell;

thread_local! {
    /// Per-thread scratch set reused across searches and inserts.
    static SCRATCH: RefCell<VisitedSet> = RefCell::new(VisitedSet::new(0));
}

/// Run `f` with this thread's scratch visited set, grown to `capacity`.
///
/// A nested call on the same thread (a search issued from inside a search
/// filter, say) gets a fresh set instead.
pub(crate) fn with_scratch<R>(capacity: usize, f: impl FnOnce(&mut VisitedSet) -> R) -> R {
    SCRATCH.with(|cell| match cell.try_borrow_mut() {
        Ok(mut visited) => {
            visited.ensure_capacity(capacity);
            f(&mut visited)
        }
        Err(_) => f(&mut VisitedSet::new(capacity)),
    })
}

#[derive(Debug)]
pub struct VisitedSet {
    stamps: Vec<u16>,
    generation: u16,
}

impl VisitedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            stamps: vec![0u16; capacity],
            generation: 1,
        }
    }

    /// Forget every mark.
    pub fn clear(&mut self) {
        if self.generation == u16::MAX {
            self.stamps.fill(0);
            self.generation = 1;
        } else {
            self.generation += 1;
        }
    }

    pub fn ensure_capacity(&mut self, capacity: usize) {
        if capacity > self.stamps.len() {
            self.stamps.resize(capacity, 0);
        }
    }

    /// Mark `id`; returns true if it was not already marked.
    #[inline]
    pub fn insert(&mut self, id: u32) -> bool {
        let slot = &mut self.stamps[id as usize];
        if *slot == self.generation {
            false
        } else {
            *slot = self.generation;
            true
        }
    }

    #[inline]
    pub fn contains(&self, id: u32) -> bool {
        self.stamps.get(id as usize) == Some(&self.generation)
    }
}

impl Default for VisitedSet {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_clear() {
        let mut vs = VisitedSet::new(16);
        assert!(vs.insert(3));
        assert!(!vs.insert(3));
        assert!(vs.contains(3));
        vs.clear();
        assert!(!vs.contains(3));
        assert!(vs.insert(3));
    }

    #[test]
    fn test_generation_wraps() {
        let mut vs = VisitedSet::new(4);
        for _ in 0..(u16::MAX - 1) {
            vs.clear();
        }
        assert_eq!(vs.generation, u16::MAX);
        vs.insert(2);
        vs.clear();
        assert_eq!(vs.generation, 1);
        assert!(vs.insert(2));
    }

    #[test]
    fn test_scratch_grows() {
        let grown = with_scratch(64, |vs| {
            vs.clear();
            vs.insert(63)
        });
        assert!(grown);
    }

    #[test]
    fn test_nested_scratch_gets_its_own_set() {
        let (outer, inner) = with_scratch(8, |outer| {
            outer.clear();
            outer.insert(5);
            let inner = with_scratch(8, |inner| inner.insert(5));
            (outer.contains(5), inner)
        });
        assert!(outer);
        assert!(inner);
    }
}
