//! Router-side prefix cache index (spec.md §4.9).
//!
//! A bounded, per-instance approximate hash history — separate from the
//! real KV cache — used only to estimate prefix affinity at routing time.
//! `Record` is called by the observer hook after every routing decision;
//! `Query` is called by [`crate::policy::scorer::PrefixAffinity`].

use std::collections::{HashMap, HashSet};

use crate::util::lru::LruList;

/// Per-instance bounded hash history, capped at `per_instance_capacity`
/// entries with LRU eviction (spec.md §4.9 suggests 10000 as a typical
/// cap).
#[derive(Debug)]
pub struct PrefixCacheIndex {
    per_instance_capacity: usize,
    seen: HashMap<u32, LruList<u64, ()>>,
}

impl PrefixCacheIndex {
    pub fn new(num_instances: u32, per_instance_capacity: usize) -> Self {
        let seen = (0..num_instances)
            .map(|i| (i, LruList::new(Some(per_instance_capacity))))
            .collect();
        Self {
            per_instance_capacity,
            seen,
        }
    }

    pub fn per_instance_capacity(&self) -> usize {
        self.per_instance_capacity
    }

    /// Records that `instance` now holds `block_hashes` (called once per
    /// routing decision, after the instance has been chosen).
    pub fn record(&mut self, instance: u32, block_hashes: &[u64]) {
        let list = self
            .seen
            .entry(instance)
            .or_insert_with(|| LruList::new(Some(self.per_instance_capacity)));
        for &h in block_hashes {
            list.touch(h, ());
        }
    }

    /// Proportion of `block_hashes` this index believes are resident on
    /// `instance`. Returns `0.0` for an empty `block_hashes` slice or an
    /// unknown instance, never `NaN`.
    pub fn query(&self, instance: u32, block_hashes: &[u64]) -> f64 {
        if block_hashes.is_empty() {
            return 0.0;
        }
        let Some(list) = self.seen.get(&instance) else {
            return 0.0;
        };
        let unique: HashSet<&u64> = block_hashes.iter().collect();
        let hits = unique.iter().filter(|h| list.contains(h)).count();
        hits as f64 / unique.len() as f64
    }
}
