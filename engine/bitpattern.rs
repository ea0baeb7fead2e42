//! Fixed-length bit patterns over the observation axis.
//!
//! A `BitPattern` records, for one voxel, which observations (subjects or
//! timepoints) carry a "positive" value in the binary series. It doubles as
//! the memoization key for the pattern-result cache, so equality and hashing
//! must be exact: two patterns are equal iff every bit matches.
//!
//! Bits are packed into `u64` blocks. All bits at positions `>= len` are kept
//! zero at all times; `resize` and `unset` re-establish this, which is what
//! makes the derived `Eq`/`Hash`/`Ord` implementations total and exact.

const BLOCK_BITS: usize = 64;

/// A fixed-length ordered set of boolean observation flags.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BitPattern {
    len: usize,
    blocks: Vec<u64>,
}

impl BitPattern {
    /// Creates an all-zero pattern of length `len`.
    pub fn new(len: usize) -> Self {
        Self {
            len,
            blocks: vec![0u64; len.div_ceil(BLOCK_BITS)],
        }
    }

    /// Number of observations this pattern covers.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Sets bit `i`. Panics if `i >= len` (programmer error).
    pub fn set(&mut self, i: usize) {
        assert!(i < self.len, "bit index {i} out of range for pattern of length {}", self.len);
        self.blocks[i / BLOCK_BITS] |= 1u64 << (i % BLOCK_BITS);
    }

    /// Clears bit `i`. Panics if `i >= len`.
    pub fn unset(&mut self, i: usize) {
        assert!(i < self.len, "bit index {i} out of range for pattern of length {}", self.len);
        self.blocks[i / BLOCK_BITS] &= !(1u64 << (i % BLOCK_BITS));
    }

    /// Reads bit `i`. Panics if `i >= len`.
    pub fn get(&self, i: usize) -> bool {
        assert!(i < self.len, "bit index {i} out of range for pattern of length {}", self.len);
        self.blocks[i / BLOCK_BITS] >> (i % BLOCK_BITS) & 1 == 1
    }

    /// Population count: the number of set bits.
    pub fn count(&self) -> usize {
        self.blocks.iter().map(|b| b.count_ones() as usize).sum()
    }

    /// Number of clear bits (`len - count`).
    pub fn count_zeros(&self) -> usize {
        self.len - self.count()
    }

    /// Clears every bit, keeping the length.
    pub fn clear(&mut self) {
        self.blocks.fill(0);
    }

    /// Resizes the pattern to `new_len`, clearing any bits beyond it.
    pub fn resize(&mut self, new_len: usize) {
        self.len = new_len;
        self.blocks.resize(new_len.div_ceil(BLOCK_BITS), 0);
        // Zero the tail of the last block so equality and hashing stay exact.
        let used = new_len % BLOCK_BITS;
        if used != 0 {
            if let Some(last) = self.blocks.last_mut() {
                *last &= (1u64 << used) - 1;
            }
        }
    }

    /// Iterates bit values in index order.
    pub fn iter(&self) -> impl Iterator<Item = bool> + '_ {
        (0..self.len).map(|i| self.get(i))
    }

    /// Builds a pattern from a boolean slice.
    pub fn from_bools(bits: &[bool]) -> Self {
        let mut pattern = Self::new(bits.len());
        for (i, &bit) in bits.iter().enumerate() {
            if bit {
                pattern.set(i);
            }
        }
        pattern
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_get_count() {
        let mut p = BitPattern::new(70);
        p.set(0);
        p.set(63);
        p.set(64);
        p.set(69);
        assert_eq!(p.count(), 4);
        assert!(p.get(63));
        assert!(p.get(64));
        assert!(!p.get(1));
        p.unset(63);
        assert_eq!(p.count(), 3);
        assert!(!p.get(63));
    }

    #[test]
    fn equality_is_exact() {
        let a = BitPattern::from_bools(&[true, true, false, false]);
        let b = BitPattern::from_bools(&[true, true, false, false]);
        let c = BitPattern::from_bools(&[false, true, true, false]);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn resize_clears_tail_bits() {
        let mut a = BitPattern::new(10);
        for i in 0..10 {
            a.set(i);
        }
        a.resize(4);
        a.resize(10);
        // After shrinking and regrowing, bits 4..10 must read as zero,
        // and the pattern must equal one built clean.
        let mut b = BitPattern::new(10);
        for i in 0..4 {
            b.set(i);
        }
        assert_eq!(a, b);
        assert_eq!(a.count(), 4);
    }

    #[test]
    fn usable_as_map_key() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(BitPattern::from_bools(&[true, false]), 1);
        map.insert(BitPattern::from_bools(&[false, true]), 2);
        assert_eq!(map[&BitPattern::from_bools(&[true, false])], 1);
        assert_eq!(map.len(), 2);
    }

    #[test]
    #[should_panic]
    fn out_of_range_set_panics() {
        let mut p = BitPattern::new(3);
        p.set(3);
    }
}
