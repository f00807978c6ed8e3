//! Single-tier KV cache: block pool, prefix hashing, LRU eviction,
//! transactional allocation (spec.md §4.3).
//!
//! Physical blocks are identified by a dense `SlotId`. A slot is in exactly
//! one of three states: allocated (refcount > 0, held by `refcounts`),
//! free-with-content (refcount 0, content hash still indexed, sitting in
//! the LRU free list), or free-virgin (never assigned any content — also
//! sitting in the LRU free list, with no entry in `hash_to_slot`). That
//! third state only exists transiently right after construction; once a
//! virgin slot is first used it becomes a free-with-content slot forever
//! after, which is why a single `free_list` ordering serves both "normal
//! allocation" and "eviction" from spec.md's LRU description — see
//! DESIGN.md's Open Question decisions for why this implementation folds
//! the spec's "front for allocation / back for eviction" distinction into
//! one LRU-tail eviction rule.

use std::collections::HashMap;

use crate::error::KvError;
use crate::event::Tick;
use crate::kv::block::chained_block_hashes_from;
use crate::util::lru::LruList;

pub type SlotId = u32;

/// The result of a successful [`KvStore::try_allocate`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct AllocOutcome {
    /// Hashes that were already resident (a prefix cache hit); their
    /// refcount was incremented.
    pub cached_blocks: Vec<u64>,
    /// Hashes that needed a fresh physical slot.
    pub newly_allocated: Vec<u64>,
}

impl AllocOutcome {
    pub fn all_hashes(&self) -> Vec<u64> {
        let mut v = self.cached_blocks.clone();
        v.extend_from_slice(&self.newly_allocated);
        v
    }
}

/// The contract shared by [`SingleTierKvCache`] and
/// [`crate::kv::tiered::TieredKvCache`] (spec.md §4.3/§4.4, §9 decorator
/// rule — any caller valid against this trait must work identically
/// against either implementation).
pub trait KvStore {
    /// Transactionally allocates blocks for `new_token_ids`, continuing the
    /// prefix hash chain from `prior_hashes` (the hashes the request
    /// already holds, or `&[]` at first allocation). On failure the cache
    /// is left unchanged.
    fn try_allocate(
        &mut self,
        prior_hashes: &[u64],
        new_token_ids: &[u64],
    ) -> Result<AllocOutcome, KvError>;

    /// Releases all blocks in `hashes`, in reverse-allocation order. Blocks
    /// that drop to refcount 0 rejoin the free list at the MRU end; their
    /// hash remains indexed until evicted.
    fn release(&mut self, hashes: &[u64]);

    /// Returns the ordered prefix of `chained_block_hashes(token_ids,
    /// block_size)` that is currently resident (allocated or free-cached).
    fn get_cached_blocks(&self, token_ids: &[u64]) -> Vec<u64>;

    fn free_block_count(&self) -> usize;

    fn utilization(&self) -> f64;

    fn total_blocks(&self) -> usize;

    fn block_size(&self) -> usize;

    /// Whether a request needing `blocks_needed` blocks could *ever* be
    /// served by this cache, regardless of current pressure (spec.md §4.3
    /// "Unservable" — needs more blocks than total capacity). Used by batch
    /// formation's circuit breaker (INV-8).
    fn would_always_be_unservable(&self, blocks_needed: usize) -> bool {
        blocks_needed > self.total_blocks()
    }

    /// Whether `hash` currently names a resident block (allocated or
    /// free-cached). Used by [`crate::kv::tiered::TieredKvCache`] to decide
    /// whether a needed block is a cache hit, a CPU-tier reload candidate,
    /// or a genuine miss.
    fn is_resident(&self, hash: u64) -> bool;

    /// Up to `max` hashes eligible for offload to a colder tier: free
    /// (refcount 0) resident blocks, least-recently-used first. Returns
    /// fewer than `max` if fewer are eligible.
    fn offload_candidates(&self, max: usize) -> Vec<u64>;

    /// Evicts a specific free (refcount 0) resident block, freeing its
    /// slot. Returns `false` (no-op) if `hash` is not currently a free
    /// resident block.
    fn evict_specific(&mut self, hash: u64) -> bool;

    /// Reclaims one free slot and registers it as resident under `hash`
    /// without going through a token chain — used by
    /// [`crate::kv::tiered::TieredKvCache`] to reload a block whose content
    /// already exists in a colder tier. Returns `false` if no free slot is
    /// available.
    fn try_insert_known(&mut self, hash: u64) -> bool;

    /// Advances tier-transfer bookkeeping. A no-op for a single-tier cache;
    /// [`crate::kv::tiered::TieredKvCache`] overrides this to drive its
    /// offload decision once per `Step`.
    fn tick(&mut self, _now: Tick) {}

    /// Drains accumulated tier-transfer latency owed to the next step. Zero
    /// for a single-tier cache.
    fn consume_pending_latency(&mut self) -> Tick {
        0
    }

    /// Count of thrash events (a block bouncing between tiers within the
    /// thrash window). Zero for a single-tier cache.
    fn thrash_count(&self) -> u64 {
        0
    }

    /// CPU-tier occupancy fraction. Zero for a single-tier cache.
    fn cpu_utilization(&self) -> f64 {
        0.0
    }
}

#[derive(Debug)]
pub struct SingleTierKvCache {
    capacity: usize,
    block_size: usize,
    hash_to_slot: HashMap<u64, SlotId>,
    refcounts: HashMap<SlotId, u32>,
    /// Free slots (refcount 0), front = MRU, back = LRU. A slot's hash, if
    /// it has ever held content, lives in `slot_hash`.
    free_list: LruList<SlotId, ()>,
    slot_hash: HashMap<SlotId, u64>,
}

impl SingleTierKvCache {
    pub fn new(capacity: usize, block_size: usize) -> Self {
        let mut free_list = LruList::new(None);
        for slot in 0..capacity as SlotId {
            free_list.touch(slot, ());
        }
        Self {
            capacity,
            block_size,
            hash_to_slot: HashMap::new(),
            refcounts: HashMap::new(),
            free_list,
            slot_hash: HashMap::new(),
        }
    }

    fn allocated_count(&self) -> usize {
        self.refcounts.len()
    }

    /// Reclaims one free slot from the LRU tail, dropping its old hash (if
    /// any) from the index. Returns the reclaimed slot id.
    fn reclaim_one(&mut self) -> Option<SlotId> {
        let (slot, ()) = self.free_list.evict_lru()?;
        if let Some(old_hash) = self.slot_hash.remove(&slot) {
            self.hash_to_slot.remove(&old_hash);
        }
        Some(slot)
    }
}

impl KvStore for SingleTierKvCache {
    fn try_allocate(
        &mut self,
        prior_hashes: &[u64],
        new_token_ids: &[u64],
    ) -> Result<AllocOutcome, KvError> {
        let prev = prior_hashes.last().copied().unwrap_or(0);
        let new_hashes = chained_block_hashes_from(prev, new_token_ids, self.block_size);

        let mut cached_blocks = Vec::new();
        let mut need_new = Vec::new();
        for h in &new_hashes {
            if self.hash_to_slot.contains_key(h) {
                cached_blocks.push(*h);
            } else {
                need_new.push(*h);
            }
        }

        let available = self.free_block_count();
        if need_new.len() > available {
            return Err(KvError::AllocFailure);
        }

        // Commit: no failure path remains below, so the cache can mutate
        // safely from here (transactional semantics preserved).
        for h in &cached_blocks {
            let slot = *self.hash_to_slot.get(h).expect("checked above");
            if let Some(count) = self.refcounts.get_mut(&slot) {
                *count += 1;
            } else {
                // was free-but-cached; reactivate
                self.free_list.remove(&slot);
                self.refcounts.insert(slot, 1);
            }
        }

        let mut newly_allocated = Vec::with_capacity(need_new.len());
        for h in need_new {
            let slot = self.reclaim_one().expect("availability checked above");
            self.slot_hash.insert(slot, h);
            self.hash_to_slot.insert(h, slot);
            self.refcounts.insert(slot, 1);
            newly_allocated.push(h);
        }

        Ok(AllocOutcome {
            cached_blocks,
            newly_allocated,
        })
    }

    fn release(&mut self, hashes: &[u64]) {
        for h in hashes.iter().rev() {
            let Some(&slot) = self.hash_to_slot.get(h) else {
                continue;
            };
            let Some(count) = self.refcounts.get_mut(&slot) else {
                continue;
            };
            *count -= 1;
            if *count == 0 {
                self.refcounts.remove(&slot);
                self.free_list.touch(slot, ());
            }
        }
    }

    fn get_cached_blocks(&self, token_ids: &[u64]) -> Vec<u64> {
        let all = chained_block_hashes_from(0, token_ids, self.block_size);
        let mut resident = Vec::new();
        for h in all {
            if self.hash_to_slot.contains_key(&h) {
                resident.push(h);
            } else {
                break;
            }
        }
        resident
    }

    fn free_block_count(&self) -> usize {
        self.capacity - self.allocated_count()
    }

    fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.allocated_count() as f64 / self.capacity as f64
    }

    fn total_blocks(&self) -> usize {
        self.capacity
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn is_resident(&self, hash: u64) -> bool {
        self.hash_to_slot.contains_key(&hash)
    }

    fn offload_candidates(&self, max: usize) -> Vec<u64> {
        self.free_list
            .lru_order()
            .filter_map(|slot| self.slot_hash.get(slot).copied())
            .take(max)
            .collect()
    }

    fn evict_specific(&mut self, hash: u64) -> bool {
        let Some(&slot) = self.hash_to_slot.get(&hash) else {
            return false;
        };
        if self.refcounts.contains_key(&slot) {
            return false; // still held by a running request
        }
        self.free_list.remove(&slot);
        self.slot_hash.remove(&slot);
        self.hash_to_slot.remove(&hash);
        true
    }

    fn try_insert_known(&mut self, hash: u64) -> bool {
        if self.hash_to_slot.contains_key(&hash) {
            return true; // already resident somehow; treat as success
        }
        let Some(slot) = self.reclaim_one() else {
            return false;
        };
        self.slot_hash.insert(slot, hash);
        self.hash_to_slot.insert(hash, slot);
        self.refcounts.insert(slot, 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(n: u64) -> Vec<u64> {
        (0..n).collect()
    }

    #[test]
    fn allocate_and_release_round_trip_reuses_slots_via_prefix_cache() {
        let mut cache = SingleTierKvCache::new(4, 16);
        let out = cache.try_allocate(&[], &tokens(64)).unwrap();
        assert_eq!(out.newly_allocated.len(), 4);
        assert_eq!(cache.free_block_count(), 0);
        cache.release(&out.all_hashes());
        assert_eq!(cache.free_block_count(), 4);

        // Idempotence: re-allocating the same tokens reuses freed blocks
        // via prefix hashing, not by blind eviction.
        let out2 = cache.try_allocate(&[], &tokens(64)).unwrap();
        assert_eq!(out2.newly_allocated.len(), 0);
        assert_eq!(out2.cached_blocks.len(), 4);
    }

    #[test]
    fn alloc_failure_when_insufficient_capacity_leaves_cache_unchanged() {
        let mut cache = SingleTierKvCache::new(2, 16);
        let before_free = cache.free_block_count();
        let err = cache.try_allocate(&[], &tokens(64)).unwrap_err();
        assert_eq!(err, KvError::AllocFailure);
        assert_eq!(cache.free_block_count(), before_free);
    }

    #[test]
    fn would_always_be_unservable_checks_total_capacity_not_current_pressure() {
        let cache = SingleTierKvCache::new(2, 16);
        assert!(cache.would_always_be_unservable(3));
        assert!(!cache.would_always_be_unservable(2));
    }

    #[test]
    fn shared_prefix_across_requests_reuses_blocks() {
        let mut cache = SingleTierKvCache::new(8, 16);
        let out1 = cache.try_allocate(&[], &tokens(32)).unwrap();
        assert_eq!(out1.newly_allocated.len(), 2);
        // A second request with the same 32-token prefix, extended further.
        let mut shared = tokens(32);
        shared.extend(1000..1016);
        let out2 = cache.try_allocate(&[], &shared).unwrap();
        assert_eq!(out2.cached_blocks.len(), 2);
        assert_eq!(out2.newly_allocated.len(), 1);
    }

    #[test]
    fn cache_hit_block_is_protected_from_eviction_while_refcount_positive() {
        let mut cache = SingleTierKvCache::new(2, 16);
        let out1 = cache.try_allocate(&[], &tokens(16)).unwrap();
        // second request shares the same block, refcount becomes 2
        let out2 = cache.try_allocate(&[], &tokens(16)).unwrap();
        assert_eq!(out2.cached_blocks, out1.newly_allocated);
        cache.release(&out1.all_hashes());
        // still referenced by request 2, so it must not have been evicted
        assert_eq!(cache.free_block_count(), 1);
        let resident = cache.get_cached_blocks(&tokens(16));
        assert_eq!(resident.len(), 1);
    }

    #[test]
    fn get_cached_blocks_returns_longest_resident_prefix() {
        let mut cache = SingleTierKvCache::new(4, 16);
        cache.try_allocate(&[], &tokens(32)).unwrap();
        let mut diverged = tokens(16);
        diverged.extend(999..1015);
        let resident = cache.get_cached_blocks(&diverged);
        assert_eq!(resident.len(), 1);
    }

    #[test]
    fn utilization_tracks_allocated_fraction() {
        let mut cache = SingleTierKvCache::new(4, 16);
        assert_eq!(cache.utilization(), 0.0);
        cache.try_allocate(&[], &tokens(32)).unwrap();
        assert_eq!(cache.utilization(), 0.5);
    }
}
