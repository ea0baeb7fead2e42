//! Per-scan memoization of pattern test results.
//!
//! The scan driver owns exactly one cache per run and never shares it. The
//! cached value is only valid for the dependent variable, permutation, and
//! test configuration the scan was constructed with; changing any of those
//! means constructing a new scan, which constructs a new cache. There is no
//! eviction: the entry count is bounded by the number of distinct patterns
//! actually observed.

use crate::bitpattern::BitPattern;
use crate::stats::VoxelResult;
use std::collections::HashMap;

/// Maps each observed `BitPattern` to its computed result.
#[derive(Debug, Default)]
pub struct PatternCache {
    entries: HashMap<BitPattern, VoxelResult>,
}

impl PatternCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lookup(&self, pattern: &BitPattern) -> Option<&VoxelResult> {
        self.entries.get(pattern)
    }

    pub fn insert(&mut self, pattern: BitPattern, result: VoxelResult) {
        self.entries.insert(pattern, result);
    }

    /// Number of distinct patterns seen so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
