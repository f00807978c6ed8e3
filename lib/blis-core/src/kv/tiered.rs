//! Tiered KV cache: a decorator adding a bounded CPU tier in front of a
//! single-tier [`KvStore`] (spec.md §4.4).
//!
//! `TieredKvCache<K>` is generic over the inner store rather than a trait
//! object, so the compiler — not a runtime check — enforces that it only
//! ever calls methods the [`KvStore`] contract defines. Any caller holding a
//! `&mut dyn KvStore` (or generic `K: KvStore`) cannot tell whether it is
//! talking to a bare [`super::SingleTierKvCache`] or a tiered one; that is
//! the Liskov substitutability the spec asks for.

use std::collections::HashMap;

use crate::error::KvError;
use crate::event::Tick;
use crate::kv::block::chained_block_hashes_from;
use crate::kv::single_tier::{AllocOutcome, KvStore, SingleTierKvCache};

/// One ms, in ticks (1 tick = 1 microsecond). Blocks moved between tiers
/// twice within this window count toward the thrash counter.
const THRASH_WINDOW_TICKS: Tick = 1_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MoveKind {
    Offload,
    Reload,
}

/// Accumulated latency owed to tier transfers, consumed by the next step's
/// step-time computation. Destructive read is forbidden (spec.md §9): `peek`
/// never mutates, only `consume` does, and there is no `Deref`/`Display`
/// that could be used to read-and-clear by accident.
#[derive(Debug, Default, Clone, Copy)]
pub struct PendingLatency(Tick);

impl PendingLatency {
    pub fn add(&mut self, ticks: Tick) {
        self.0 += ticks;
    }

    pub fn peek(&self) -> Tick {
        self.0
    }

    pub fn consume(&mut self) -> Tick {
        std::mem::take(&mut self.0)
    }
}

/// Wraps an inner [`KvStore`] with a bounded CPU tier.
#[derive(Debug)]
pub struct TieredKvCache<K: KvStore> {
    gpu: K,
    cpu: SingleTierKvCache,
    offload_threshold: f64,
    base_latency: Tick,
    bandwidth_tokens_per_tick: u64,
    pending_latency: PendingLatency,
    last_moved: HashMap<u64, (MoveKind, Tick)>,
    thrash_count: u64,
    now: Tick,
}

impl<K: KvStore> TieredKvCache<K> {
    pub fn new(
        gpu: K,
        cpu_capacity: usize,
        offload_threshold: f64,
        base_latency: Tick,
        bandwidth_tokens_per_tick: u64,
    ) -> Self {
        let block_size = gpu.block_size();
        Self {
            cpu: SingleTierKvCache::new(cpu_capacity, block_size.max(1)),
            gpu,
            offload_threshold,
            base_latency,
            bandwidth_tokens_per_tick: bandwidth_tokens_per_tick.max(1),
            pending_latency: PendingLatency::default(),
            last_moved: HashMap::new(),
            thrash_count: 0,
            now: 0,
        }
    }

    /// Advances the decorator's notion of time (used only for thrash-window
    /// bookkeeping) and opportunistically offloads if GPU utilization is
    /// over threshold. Called by the simulator once per `Step`, before any
    /// allocation for that step.
    pub fn tick(&mut self, now: Tick) {
        self.now = now;
        self.maybe_offload();
    }

    pub fn pending_latency(&self) -> Tick {
        self.pending_latency.peek()
    }

    pub fn consume_pending_latency(&mut self) -> Tick {
        self.pending_latency.consume()
    }

    pub fn thrash_count(&self) -> u64 {
        self.thrash_count
    }

    pub fn cpu_utilization(&self) -> f64 {
        self.cpu.utilization()
    }

    fn maybe_offload(&mut self) {
        if self.gpu.utilization() <= self.offload_threshold {
            return;
        }
        let room = self.cpu.free_block_count();
        if room == 0 {
            return;
        }
        for hash in self.gpu.offload_candidates(room) {
            if self.gpu.evict_specific(hash) && self.cpu.try_insert_known(hash) {
                self.record_move(hash, MoveKind::Offload);
            }
        }
    }

    fn transfer_cost(&self) -> Tick {
        let block_size = self.gpu.block_size() as u64;
        self.base_latency + block_size.div_ceil(self.bandwidth_tokens_per_tick)
    }

    fn record_move(&mut self, hash: u64, kind: MoveKind) {
        if let Some((prev_kind, prev_tick)) = self.last_moved.get(&hash) {
            if *prev_kind != kind && self.now.saturating_sub(*prev_tick) <= THRASH_WINDOW_TICKS {
                self.thrash_count += 1;
            }
        }
        self.last_moved.insert(hash, (kind, self.now));
    }

    /// Reloads any hash in `needed` that is resident in the CPU tier but not
    /// the GPU tier, evicting a GPU slot for it via the normal LRU path.
    /// Returns how many blocks were reloaded.
    fn reload_from_cpu(&mut self, needed: &[u64]) -> usize {
        let mut reloaded = 0;
        for &hash in needed {
            if self.gpu.is_resident(hash) || !self.cpu.is_resident(hash) {
                continue;
            }
            if self.gpu.try_insert_known(hash) {
                self.cpu.evict_specific(hash);
                self.pending_latency.add(self.transfer_cost());
                self.record_move(hash, MoveKind::Reload);
                reloaded += 1;
            }
        }
        reloaded
    }
}

impl<K: KvStore> KvStore for TieredKvCache<K> {
    fn try_allocate(
        &mut self,
        prior_hashes: &[u64],
        new_token_ids: &[u64],
    ) -> Result<AllocOutcome, KvError> {
        match self.gpu.try_allocate(prior_hashes, new_token_ids) {
            Ok(outcome) => Ok(outcome),
            Err(KvError::AllocFailure) => {
                let prev = prior_hashes.last().copied().unwrap_or(0);
                let needed =
                    chained_block_hashes_from(prev, new_token_ids, self.gpu.block_size());
                if self.reload_from_cpu(&needed) > 0 {
                    self.gpu.try_allocate(prior_hashes, new_token_ids)
                } else {
                    Err(KvError::AllocFailure)
                }
            }
            Err(e) => Err(e),
        }
    }

    fn release(&mut self, hashes: &[u64]) {
        self.gpu.release(hashes);
    }

    fn get_cached_blocks(&self, token_ids: &[u64]) -> Vec<u64> {
        let chain = chained_block_hashes_from(0, token_ids, self.gpu.block_size());
        let mut resident = Vec::new();
        for h in chain {
            if self.gpu.is_resident(h) || self.cpu.is_resident(h) {
                resident.push(h);
            } else {
                break;
            }
        }
        resident
    }

    fn free_block_count(&self) -> usize {
        self.gpu.free_block_count()
    }

    fn utilization(&self) -> f64 {
        self.gpu.utilization()
    }

    fn total_blocks(&self) -> usize {
        self.gpu.total_blocks()
    }

    fn block_size(&self) -> usize {
        self.gpu.block_size()
    }

    fn would_always_be_unservable(&self, blocks_needed: usize) -> bool {
        self.gpu.would_always_be_unservable(blocks_needed)
    }

    fn is_resident(&self, hash: u64) -> bool {
        self.gpu.is_resident(hash) || self.cpu.is_resident(hash)
    }

    fn offload_candidates(&self, max: usize) -> Vec<u64> {
        self.gpu.offload_candidates(max)
    }

    fn evict_specific(&mut self, hash: u64) -> bool {
        self.gpu.evict_specific(hash)
    }

    fn try_insert_known(&mut self, hash: u64) -> bool {
        self.gpu.try_insert_known(hash)
    }

    fn tick(&mut self, now: Tick) {
        TieredKvCache::tick(self, now)
    }

    fn consume_pending_latency(&mut self) -> Tick {
        TieredKvCache::consume_pending_latency(self)
    }

    fn thrash_count(&self) -> u64 {
        TieredKvCache::thrash_count(self)
    }

    fn cpu_utilization(&self) -> f64 {
        TieredKvCache::cpu_utilization(self)
    }
}
