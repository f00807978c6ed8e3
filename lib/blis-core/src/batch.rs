//! Continuous batching: chunked prefill and tail preemption (spec.md §4.6).
//!
//! Invoked once per `Step` by [`crate::simulator::InstanceSim`]. Phase 1
//! advances already-running requests, preempting from the tail of the
//! running batch (most recent admission first) when KV allocation fails.
//! Phase 2 admits new requests from the wait queue, bounded by the step
//! token budget, the chunked-prefill threshold, and `max_num_running_reqs`
//! — and stops entirely if Phase 1 preempted anything this step.
//!
//! [`BatchFormationStrategy`] is a single-method trait (spec.md §9) so a
//! future non-continuous strategy can be added without touching
//! [`crate::simulator::InstanceSim`]; `Continuous` is the only variant
//! spec.md defines.

use crate::error::KvError;
use crate::event::Tick;
use crate::kv::KvStore;
use crate::latency::BatchComposition;
use crate::request::{RequestArena, RequestId, RequestState};

/// Everything [`ContinuousBatching::form_batch`] needs for one instance's
/// `Step`. Borrowed, not owned — [`crate::simulator::InstanceSim`] holds the
/// real state.
pub struct BatchCtx<'a> {
    pub running: &'a mut Vec<RequestId>,
    /// Ordered front-to-back by [`crate::policy::scheduler::SchedulingPolicy`]
    /// before `form_batch` runs; index 0 is next to admit or receive a
    /// preempted request back.
    pub wait_queue: &'a mut Vec<RequestId>,
    pub kv: &'a mut dyn KvStore,
    pub arena: &'a mut RequestArena,
    pub max_num_running_reqs: u32,
    pub max_num_scheduled_tokens: u32,
    pub long_prefill_token_threshold: u32,
    pub now: Tick,
}

/// What happened during one `form_batch` call, enough for
/// [`crate::simulator::InstanceSim`] to push marker events and for the
/// latency model to compute step time.
#[derive(Debug, Default, Clone)]
pub struct BatchOutcome {
    pub admitted: Vec<RequestId>,
    pub preempted: Vec<RequestId>,
    pub dropped_unservable: Vec<RequestId>,
    pub composition: BatchComposition,
    /// Count of `KvError::AllocFailure` results this call encountered
    /// (whether or not they were subsequently recovered by preemption).
    pub alloc_failures: u32,
}

pub trait BatchFormationStrategy {
    fn form_batch(&mut self, ctx: &mut BatchCtx) -> BatchOutcome;
}

/// The only strategy spec.md defines.
#[derive(Debug, Default)]
pub struct ContinuousBatching;

/// Tokens to process this step for a request already prefill-complete: one
/// decode token. For a request still prefilling: the chunk bounded by
/// `threshold` (unbounded when `threshold == 0`) and whatever budget
/// remains, never more than the tokens actually left to process.
fn tokens_needed_this_step(
    progress: u32,
    input_tokens: u32,
    output_tokens: u32,
    threshold: u32,
    budget_remaining: u32,
) -> u32 {
    if progress < input_tokens {
        let remaining_prefill = input_tokens - progress;
        let capped = if threshold == 0 {
            remaining_prefill
        } else {
            remaining_prefill.min(threshold)
        };
        capped.min(budget_remaining)
    } else if progress < input_tokens + output_tokens {
        budget_remaining.min(1)
    } else {
        0
    }
}

fn blocks_needed(total_tokens: u32, block_size: usize) -> usize {
    (total_tokens as usize).div_ceil(block_size.max(1))
}

impl ContinuousBatching {
    /// Returns the token budget left over after advancing every currently
    /// running request, for [`Self::phase2_new_admissions`] to spend.
    fn phase1_continuing(&self, ctx: &mut BatchCtx, outcome: &mut BatchOutcome) -> u32 {
        let snapshot: Vec<RequestId> = ctx.running.clone();
        let mut budget = ctx.max_num_scheduled_tokens;

        for rid in snapshot {
            if !ctx.running.contains(&rid) {
                continue; // already preempted as a side effect below
            }
            if budget == 0 {
                break;
            }

            loop {
                let req = ctx.arena.get(rid);
                let tokens_needed = tokens_needed_this_step(
                    req.progress,
                    req.input_tokens,
                    req.output_tokens,
                    ctx.long_prefill_token_threshold,
                    budget,
                );
                if tokens_needed == 0 {
                    break;
                }
                let start = req.progress as usize;
                let all_tokens = req.token_ids();
                let slice = all_tokens[start..start + tokens_needed as usize].to_vec();
                let prior_hashes = req.kv_blocks.clone();
                let was_prefill = !req.is_prefill_complete();

                match ctx.kv.try_allocate(&prior_hashes, &slice) {
                    Ok(alloc) => {
                        let is_decode = req.is_prefill_complete();
                        outcome.composition.cache_miss_tokens += alloc.newly_allocated.len() as u32;
                        if is_decode {
                            outcome.composition.decode_tokens += tokens_needed;
                        } else {
                            outcome.composition.prefill_tokens += tokens_needed;
                        }
                        let req = ctx.arena.get_mut(rid);
                        req.kv_blocks.extend(alloc.all_hashes());
                        req.progress += tokens_needed;
                        let _ = was_prefill; // prefill->decode boundary timing is the simulator's job
                        budget -= tokens_needed;
                        break;
                    }
                    Err(KvError::AllocFailure) => {
                        outcome.alloc_failures += 1;
                        if ctx.running.len() <= 1 || ctx.running.last() == Some(&rid) {
                            self.preempt(ctx, rid, outcome);
                            break;
                        }
                        let victim = ctx.running.pop().expect("checked non-empty above");
                        self.preempt(ctx, victim, outcome);
                        continue;
                    }
                    Err(KvError::Unservable) => {
                        ctx.running.retain(|&r| r != rid);
                        let req = ctx.arena.get_mut(rid);
                        ctx.kv.release(&req.kv_blocks);
                        req.kv_blocks.clear();
                        req.state = RequestState::DroppedUnservable;
                        outcome.dropped_unservable.push(rid);
                        break;
                    }
                }
            }
        }

        budget
    }

    fn preempt(&self, ctx: &mut BatchCtx, victim: RequestId, outcome: &mut BatchOutcome) {
        ctx.running.retain(|&r| r != victim);
        let req = ctx.arena.get_mut(victim);
        ctx.kv.release(&req.kv_blocks);
        req.reset_on_preemption();
        ctx.wait_queue.insert(0, victim);
        outcome.preempted.push(victim);
    }

    fn phase2_new_admissions(&self, ctx: &mut BatchCtx, outcome: &mut BatchOutcome, budget_in: u32) {
        if !outcome.preempted.is_empty() {
            return; // any Phase 1 preemption stops Phase 2 dequeuing entirely
        }
        let mut budget = budget_in;

        loop {
            if ctx.running.len() >= ctx.max_num_running_reqs as usize || budget == 0 {
                break;
            }
            let Some(&rid) = ctx.wait_queue.first() else {
                break;
            };
            let req = ctx.arena.get(rid);
            let block_size = ctx.kv.block_size();

            if ctx
                .kv
                .would_always_be_unservable(blocks_needed(req.input_tokens, block_size))
            {
                ctx.wait_queue.remove(0);
                let req = ctx.arena.get_mut(rid);
                req.state = RequestState::DroppedUnservable;
                outcome.dropped_unservable.push(rid);
                continue;
            }

            let all_tokens = req.token_ids();
            let cached = ctx.kv.get_cached_blocks(&all_tokens);
            let cached_tokens = (cached.len() * block_size) as u32;
            let remaining_prefill = req.input_tokens.saturating_sub(cached_tokens);
            let to_process = if ctx.long_prefill_token_threshold == 0 {
                remaining_prefill
            } else {
                remaining_prefill.min(ctx.long_prefill_token_threshold)
            }
            .min(budget);

            if to_process == 0 && remaining_prefill > 0 {
                break; // no budget left this step for a genuine admission
            }

            let start = cached_tokens as usize;
            let slice = all_tokens[start..start + to_process as usize].to_vec();

            match ctx.kv.try_allocate(&cached, &slice) {
                Ok(alloc) => {
                    ctx.wait_queue.remove(0);
                    outcome.composition.cache_miss_tokens += alloc.newly_allocated.len() as u32;
                    outcome.composition.prefill_tokens += to_process;
                    let req = ctx.arena.get_mut(rid);
                    req.kv_blocks = cached;
                    req.kv_blocks.extend(alloc.all_hashes());
                    req.progress = (start + to_process as usize) as u32;
                    req.schedule_time.get_or_insert(ctx.now);
                    req.state = RequestState::Running;
                    budget -= to_process;
                    ctx.running.push(rid);
                    outcome.admitted.push(rid);
                }
                Err(KvError::AllocFailure) => {
                    outcome.alloc_failures += 1;
                    break;
                }
                Err(KvError::Unservable) => {
                    ctx.wait_queue.remove(0);
                    let req = ctx.arena.get_mut(rid);
                    req.state = RequestState::DroppedUnservable;
                    outcome.dropped_unservable.push(rid);
                }
            }
        }
    }
}

impl BatchFormationStrategy for ContinuousBatching {
    fn form_batch(&mut self, ctx: &mut BatchCtx) -> BatchOutcome {
        let mut outcome = BatchOutcome::default();
        let budget_remaining = self.phase1_continuing(ctx, &mut outcome);
        self.phase2_new_admissions(ctx, &mut outcome, budget_remaining);
        outcome
    }
}
