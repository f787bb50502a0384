//! Per-run lock markers for recursive traversals

use crate::error::{Error, Result};

/// One lock bit per cell, indexed by linear cell id.
///
/// A traversal locks a cell while its subtree is being resolved and
/// unlocks it as soon as the subtree finishes. Each run owns a fresh
/// instance, so no lock survives from one run into the next.
#[derive(Debug, Clone)]
pub struct CellLocks {
    bits: Vec<u64>,
    len: usize,
}

impl CellLocks {
    /// Allocate cleared locks for `len` cells.
    pub fn try_new(len: usize) -> Result<Self> {
        let words = len.div_ceil(64);
        let mut bits = Vec::new();
        bits.try_reserve_exact(words).map_err(|_| Error::Allocation {
            what: "lock array",
            cells: len,
        })?;
        bits.resize(words, 0);
        Ok(Self { bits, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Lock a cell. Returns `false` if it was already locked.
    #[inline]
    pub fn lock(&mut self, index: usize) -> bool {
        debug_assert!(index < self.len);
        let (word, mask) = (index / 64, 1u64 << (index % 64));
        let was_locked = self.bits[word] & mask != 0;
        self.bits[word] |= mask;
        !was_locked
    }

    #[inline]
    pub fn unlock(&mut self, index: usize) {
        debug_assert!(index < self.len);
        self.bits[index / 64] &= !(1u64 << (index % 64));
    }

    #[inline]
    pub fn is_locked(&self, index: usize) -> bool {
        debug_assert!(index < self.len);
        self.bits[index / 64] & (1u64 << (index % 64)) != 0
    }

    /// Whether no cell is currently locked
    pub fn is_clear(&self) -> bool {
        self.bits.iter().all(|&w| w == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_cycle() {
        let mut locks = CellLocks::try_new(130).unwrap();
        assert!(locks.is_clear());
        assert!(locks.lock(129));
        assert!(!locks.lock(129), "Second lock must report contention");
        assert!(locks.is_locked(129));
        assert!(!locks.is_locked(128));
        locks.unlock(129);
        assert!(locks.is_clear());
    }

    #[test]
    fn test_empty_locks() {
        let locks = CellLocks::try_new(0).unwrap();
        assert!(locks.is_empty());
        assert!(locks.is_clear());
    }
}
