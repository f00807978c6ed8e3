//! Per-instance simulator: the four-phase `Step` (spec.md §4.7).
//!
//! `InstanceSim` owns exactly one instance's mutable state — its KV cache,
//! running batch, and wait queue — and knows nothing about other instances
//! or the event queue. [`crate::cluster::ClusterOrchestrator`] drives it by
//! calling [`InstanceSim::enqueue_arrival`] on `Arrival` and
//! [`InstanceSim::step`] on `Step`, then translates the returned outcome
//! into events on the global heap.

use std::collections::HashMap;

use crate::batch::{BatchCtx, BatchFormationStrategy, ContinuousBatching};
use crate::event::Tick;
use crate::invariants::{self, InvariantViolation};
use crate::kv::KvStore;
use crate::latency::LatencyModel;
use crate::policy::priority::PriorityPolicy;
use crate::policy::scheduler::SchedulingPolicy;
use crate::request::{RequestArena, RequestId, RequestState};

/// What a `Step` call produced, for the cluster orchestrator to turn into
/// events and metrics updates.
#[derive(Debug, Default, Clone)]
pub struct StepOutcome {
    pub admitted: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
    pub completed: Vec<RequestId>,
    pub dropped_unservable: Vec<RequestId>,
    pub step_time: Tick,
    /// When the next `Step` event should fire, if this instance still has
    /// work (running or queued) after this step — `None` means the
    /// instance has gone idle and must be kicked awake by the next arrival
    /// (spec.md §4.2, INV-2 work-conserving).
    pub next_step_at: Option<Tick>,
}

pub struct InstanceSim {
    pub id: u32,
    running: Vec<RequestId>,
    wait_queue: Vec<RequestId>,
    kv: Box<dyn KvStore>,
    pending_requests: u32,
    max_num_running_reqs: u32,
    max_num_scheduled_tokens: u32,
    long_prefill_token_threshold: u32,
    batching: ContinuousBatching,
    total_prefill_tokens: u64,
    total_cache_miss_tokens: u64,
    total_preemptions: u64,
    total_alloc_failures: u64,
}

impl InstanceSim {
    pub fn new(
        id: u32,
        kv: Box<dyn KvStore>,
        max_num_running_reqs: u32,
        max_num_scheduled_tokens: u32,
        long_prefill_token_threshold: u32,
    ) -> Self {
        Self {
            id,
            running: Vec::new(),
            wait_queue: Vec::new(),
            kv,
            pending_requests: 0,
            max_num_running_reqs,
            max_num_scheduled_tokens,
            long_prefill_token_threshold,
            batching: ContinuousBatching,
            total_prefill_tokens: 0,
            total_cache_miss_tokens: 0,
            total_preemptions: 0,
            total_alloc_failures: 0,
        }
    }

    /// Called by the cluster the instant a routing decision names this
    /// instance, before the request physically arrives — counted toward
    /// `pending_requests` (spec.md §3 routing snapshot, synchronous field).
    pub fn note_routed(&mut self) {
        self.pending_requests += 1;
    }

    /// Called by the cluster once a request leaves this instance for good,
    /// either by completing or by being dropped unservable. `pending_requests`
    /// stays incremented across the whole dispatch-to-departure window, not
    /// just until arrival, so it reflects dispatched-but-not-yet-finished
    /// work (spec.md §4.11, §4.13).
    pub fn note_departed(&mut self) {
        self.pending_requests = self.pending_requests.saturating_sub(1);
    }

    /// Handles an `Arrival` event: moves the request onto the wait queue.
    /// Returns `true` if the instance was idle (no `Step` event could
    /// possibly be pending for it) and must be kicked awake immediately —
    /// INV-2 forbids a non-empty wait queue with no scheduled `Step`.
    pub fn enqueue_arrival(&mut self, arena: &mut RequestArena, rid: RequestId, now: Tick) -> bool {
        let req = arena.get_mut(rid);
        req.enqueue_time = Some(now);
        req.assigned_instance = Some(self.id);
        let was_idle = self.running.is_empty() && self.wait_queue.is_empty();
        self.wait_queue.push(rid);
        was_idle
    }

    /// Runs the four phases of one `Step`: reorder the wait queue, form the
    /// batch (admission + tail preemption), execute it (advance token
    /// progress and charge latency), then detect completions and decide
    /// whether another `Step` is owed.
    pub fn step(
        &mut self,
        now: Tick,
        arena: &mut RequestArena,
        scheduler: &dyn SchedulingPolicy,
        priority: &dyn PriorityPolicy,
        latency: &dyn LatencyModel,
    ) -> Result<StepOutcome, InvariantViolation> {
        self.kv.tick(now);

        // Phase 1: reorder the wait queue by the configured scheduler,
        // scored by the configured priority policy.
        let scores: HashMap<RequestId, f64> = self
            .wait_queue
            .iter()
            .map(|&rid| (rid, priority.score(arena.get(rid), now)))
            .collect();
        scheduler.reorder(&mut self.wait_queue, &|rid| arena.get(rid), &scores);

        // Snapshot pre-step progress for the currently-running set, so
        // Phase 3 can tell which requests actually advanced this step
        // (batch formation only reports aggregate token counts, not
        // per-request deltas). Requests admitted fresh out of the wait
        // queue this step have no entry here and are treated as `before
        // == 0`, since a freshly admitted request always starts this
        // step's prefill from scratch.
        let before_progress: HashMap<RequestId, u32> = self
            .running
            .iter()
            .map(|&rid| (rid, arena.get(rid).progress))
            .collect();

        // Phase 2: form the batch.
        let mut ctx = BatchCtx {
            running: &mut self.running,
            wait_queue: &mut self.wait_queue,
            kv: self.kv.as_mut(),
            arena,
            max_num_running_reqs: self.max_num_running_reqs,
            max_num_scheduled_tokens: self.max_num_scheduled_tokens,
            long_prefill_token_threshold: self.long_prefill_token_threshold,
            now,
        };
        let outcome = self.batching.form_batch(&mut ctx);

        self.total_prefill_tokens += outcome.composition.prefill_tokens as u64;
        self.total_cache_miss_tokens += outcome.composition.cache_miss_tokens as u64;
        self.total_preemptions += outcome.preempted.len() as u64;
        self.total_alloc_failures += outcome.alloc_failures as u64;

        // Phase 3: execute — charge step latency, advance TTFT/ITL
        // bookkeeping. The first output token is produced on the prefill-
        // to-decode boundary itself (the step whose progress crosses from
        // below `input_tokens` to at-or-above it), not on the following
        // decode step — a request that prefills in one shot therefore gets
        // FirstTokenTime = now + stepTime + alpha2 for *that* step, matching
        // the queueing + prefill-step + per-token-overhead formula. Every
        // later step that advances progress by exactly one token records an
        // inter-token latency instead.
        let mut step_time = latency.step_time(outcome.composition);
        step_time += self.kv.consume_pending_latency();
        let token_overhead = latency.output_token_processing_time();
        let token_time = step_time + token_overhead;

        for rid in self.running.clone() {
            let before = before_progress.get(&rid).copied().unwrap_or(0);
            let req = arena.get_mut(rid);
            // Zero-output-token requests cross the boundary and finish in
            // the same step (phase 4's own fallback records their
            // FirstTokenTime as the completion time); they never produce a
            // real output token here.
            let crossed_prefill_boundary =
                before < req.input_tokens && req.progress >= req.input_tokens && req.output_tokens > 0;
            // The progress unit that lands exactly on `input_tokens` is the
            // one already accounted for by the boundary crossing above
            // (this step or an earlier one), so only a *strictly later*
            // decode unit counts as a fresh token here.
            let produced_decode_token = before > req.input_tokens && req.progress == before + 1;
            if crossed_prefill_boundary {
                req.first_token_time.get_or_insert(now + token_time);
            } else if produced_decode_token {
                req.itl.push(token_time);
            }
        }

        // Phase 4: detect completions, reclaim their KV blocks, check
        // causality before the request leaves the arena's "live" set.
        let mut completed = Vec::new();
        let mut causality_error = None;
        self.running.retain(|&rid| {
            let req = arena.get_mut(rid);
            if !req.is_done() {
                return true;
            }
            let completion_time = now + step_time;
            if req.first_token_time.is_none() {
                req.first_token_time = Some(completion_time); // zero-output-token edge case
            }
            req.completion_time = Some(completion_time);
            req.state = RequestState::Completed;
            self.kv.release(&req.kv_blocks);
            if causality_error.is_none() {
                if let Err(e) = invariants::check_causality(
                    req.id.0,
                    req.arrival,
                    req.enqueue_time.unwrap_or(req.arrival),
                    req.schedule_time.unwrap_or(req.arrival),
                    req.first_token_time.unwrap_or(completion_time),
                    completion_time,
                ) {
                    causality_error = Some(e);
                }
            }
            completed.push(rid);
            false
        });
        if let Some(e) = causality_error {
            return Err(e);
        }

        let next_step_at = if !self.running.is_empty() || !self.wait_queue.is_empty() {
            Some(now + step_time.max(1))
        } else {
            None
        };

        Ok(StepOutcome {
            admitted: outcome.admitted,
            preempted: outcome.preempted,
            completed,
            dropped_unservable: outcome.dropped_unservable,
            step_time,
            next_step_at,
        })
    }

    pub fn queue_depth(&self) -> u32 {
        self.wait_queue.len() as u32
    }

    pub fn batch_size(&self) -> u32 {
        self.running.len() as u32
    }

    pub fn pending_requests(&self) -> u32 {
        self.pending_requests
    }

    pub fn kv_utilization(&self) -> f64 {
        self.kv.utilization()
    }

    pub fn free_kv_blocks(&self) -> u32 {
        self.kv.free_block_count() as u32
    }

    pub fn total_kv_blocks(&self) -> u32 {
        self.kv.total_blocks() as u32
    }

    pub fn cache_hit_rate(&self) -> f64 {
        if self.total_prefill_tokens == 0 {
            return 0.0;
        }
        1.0 - (self.total_cache_miss_tokens as f64 / self.total_prefill_tokens as f64)
    }

    pub fn thrash_count(&self) -> u64 {
        self.kv.thrash_count()
    }

    pub fn cpu_tier_utilization(&self) -> f64 {
        self.kv.cpu_utilization()
    }

    pub fn has_work(&self) -> bool {
        !self.running.is_empty() || !self.wait_queue.is_empty()
    }

    pub fn total_preemptions(&self) -> u64 {
        self.total_preemptions
    }

    pub fn total_alloc_failures(&self) -> u64 {
        self.total_alloc_failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::SingleTierKvCache;
    use crate::latency::BlackboxLatencyModel;
    use crate::policy::priority::Constant;
    use crate::policy::scheduler::Fcfs;
    use crate::request::Request;

    fn model() -> BlackboxLatencyModel {
        BlackboxLatencyModel::new([0.0, 0.0, 0.0], [100.0, 0.0, 0.0])
    }

    fn instance() -> InstanceSim {
        InstanceSim::new(0, Box::new(SingleTierKvCache::new(16, 16)), 4, 1000, 0)
    }

    #[test]
    fn arrival_to_idle_instance_requests_a_step_kick() {
        let mut arena = RequestArena::new();
        let id = arena.insert(Request::new(RequestId(0), 0, 16, 4, None, None, None, None, None));
        let mut sim = instance();
        let needs_kick = sim.enqueue_arrival(&mut arena, id, 0);
        assert!(needs_kick);
        assert_eq!(sim.queue_depth(), 1);
    }

    #[test]
    fn step_admits_and_advances_prefill() {
        let mut arena = RequestArena::new();
        let id = arena.insert(Request::new(RequestId(0), 0, 16, 1, None, None, None, None, None));
        let mut sim = instance();
        sim.enqueue_arrival(&mut arena, id, 0);
        let outcome = sim.step(0, &mut arena, &Fcfs, &Constant, &model()).unwrap();
        assert_eq!(outcome.admitted, vec![id]);
        assert!(arena.get(id).is_prefill_complete());
        assert!(outcome.next_step_at.is_some());
    }

    #[test]
    fn request_completes_after_its_single_output_token() {
        let mut arena = RequestArena::new();
        let id = arena.insert(Request::new(RequestId(0), 0, 16, 1, None, None, None, None, None));
        let mut sim = instance();
        sim.enqueue_arrival(&mut arena, id, 0);
        let o1 = sim.step(0, &mut arena, &Fcfs, &Constant, &model()).unwrap();
        let next = o1.next_step_at.unwrap();
        let o2 = sim.step(next, &mut arena, &Fcfs, &Constant, &model()).unwrap();
        assert_eq!(o2.completed, vec![id]);
        assert!(arena.get(id).completion_time.is_some());
        assert!(arena.get(id).first_token_time.is_some());
        assert_eq!(o2.next_step_at, None);
    }

    #[test]
    fn idle_instance_has_no_pending_step() {
        let sim = instance();
        assert!(!sim.has_work());
    }

    #[test]
    fn pending_requests_survives_arrival_and_clears_only_on_departure() {
        let mut arena = RequestArena::new();
        let id = arena.insert(Request::new(RequestId(0), 0, 16, 1, None, None, None, None, None));
        let mut sim = instance();
        sim.note_routed();
        assert_eq!(sim.pending_requests(), 1);
        sim.enqueue_arrival(&mut arena, id, 0);
        // Arrival alone must not clear it — only completion or drop does.
        assert_eq!(sim.pending_requests(), 1);
        let o1 = sim.step(0, &mut arena, &Fcfs, &Constant, &model()).unwrap();
        let next = o1.next_step_at.unwrap();
        let o2 = sim.step(next, &mut arena, &Fcfs, &Constant, &model()).unwrap();
        assert_eq!(o2.completed, vec![id]);
        sim.note_departed();
        assert_eq!(sim.pending_requests(), 0);
    }
}
