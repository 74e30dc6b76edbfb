//! Visit bookkeeping for query deduplication
//!
//! An object spanning several cells is linked into all of them, so a query
//! walking those cells would meet it repeatedly. Every object in a tree owns
//! a small integer (its visit bit) and each query marks the bits it has seen
//! in a private bitset. Bitsets are pooled so steady-state queries do not
//! allocate, and each query checks out its own, which keeps nested queries
//! on one thread independent.

use std::sync::{Mutex, PoisonError};

use bitvec::vec::BitVec;

/// Bitsets kept around for reuse
const MAX_POOLED_SETS: usize = 8;

/// Hands out visit bits, recycling freed ones first
#[derive(Debug, Default)]
pub struct VisitBits {
    next: u32,
    free: Vec<u32>,
}

impl VisitBits {
    /// Create an empty allocator
    pub const fn new() -> Self {
        Self {
            next: 0,
            free: Vec::new(),
        }
    }

    /// Take a bit
    pub fn acquire(&mut self) -> u32 {
        self.free.pop().unwrap_or_else(|| {
            let bit = self.next;
            self.next += 1;
            bit
        })
    }

    /// Return a bit for reuse
    pub fn release(&mut self, bit: u32) {
        debug_assert!(bit < self.next, "visit bit {bit} was never handed out");
        self.free.push(bit);
    }

    /// One past the highest bit ever handed out
    pub const fn high_water(&self) -> u32 {
        self.next
    }

    /// Bits currently held
    pub fn in_use(&self) -> usize {
        self.next as usize - self.free.len()
    }

    /// Forget every bit
    pub fn reset(&mut self) {
        self.next = 0;
        self.free.clear();
    }
}

/// Pool of cleared bitsets shared by a tree's queries
#[derive(Debug, Default)]
pub struct VisitPool {
    free: Mutex<Vec<BitVec>>,
}

impl VisitPool {
    /// Create an empty pool
    pub const fn new() -> Self {
        Self {
            free: Mutex::new(Vec::new()),
        }
    }

    /// Check out a cleared bitset able to hold `bit_count` bits
    pub fn check_out(&self, bit_count: usize) -> VisitSet<'_> {
        let pooled = self.free.lock().unwrap_or_else(PoisonError::into_inner).pop();
        let mut bits = pooled.unwrap_or_default();
        bits.clear();
        bits.resize(bit_count, false);
        VisitSet { pool: self, bits }
    }

    /// Bitsets currently waiting in the pool
    pub fn pooled(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn give_back(&self, bits: BitVec) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < MAX_POOLED_SETS {
            free.push(bits);
        }
    }
}

/// One query's visit marks, returned to the pool on drop
#[derive(Debug)]
pub struct VisitSet<'p> {
    pool: &'p VisitPool,
    bits: BitVec,
}

impl VisitSet<'_> {
    /// Mark `bit` visited; true if it was not visited before.
    ///
    /// Grows on demand for objects inserted after the query started.
    pub fn first_visit(&mut self, bit: u32) -> bool {
        let index = bit as usize;
        if index >= self.bits.len() {
            self.bits.resize(index + 1, false);
        }
        !self.bits.replace(index, true)
    }

    /// Bits the set can hold without growing
    pub fn len(&self) -> usize {
        self.bits.len()
    }

    /// True when sized for no bits
    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

impl Drop for VisitSet<'_> {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.bits));
    }
}
