//! Scheduling policies: `Reorder(waitQueue, scores)` (spec.md §4.8).
//!
//! All variants sort with a stable total order —
//! `(primary_key, arrival_tick, sequence_id)` — so ties never depend on
//! incoming order, which would break determinism (INV-6).

use std::collections::HashMap;

use crate::event::Tick;
use crate::request::{Request, RequestId};

/// Applies to a wait queue in place. `scores` is keyed by request id and was
/// produced by a [`crate::policy::priority::PriorityPolicy`]; schedulers
/// that don't use scores (fcfs, sjf) simply ignore the map.
pub trait SchedulingPolicy {
    fn reorder(
        &self,
        wait_queue: &mut Vec<RequestId>,
        requests: &dyn Fn(RequestId) -> &Request,
        scores: &HashMap<RequestId, f64>,
    );
}

fn stable_key(r: &Request) -> (Tick, u32) {
    (r.arrival, r.id.0)
}

/// First-come-first-served: a no-op, arrival order is already preserved by
/// append-at-back insertion.
#[derive(Debug, Default)]
pub struct Fcfs;

impl SchedulingPolicy for Fcfs {
    fn reorder(
        &self,
        _wait_queue: &mut Vec<RequestId>,
        _requests: &dyn Fn(RequestId) -> &Request,
        _scores: &HashMap<RequestId, f64>,
    ) {
    }
}

/// Shortest-job-first: ascending input token count, ties by arrival then id.
#[derive(Debug, Default)]
pub struct Sjf;

impl SchedulingPolicy for Sjf {
    fn reorder(
        &self,
        wait_queue: &mut Vec<RequestId>,
        requests: &dyn Fn(RequestId) -> &Request,
        _scores: &HashMap<RequestId, f64>,
    ) {
        wait_queue.sort_by(|&a, &b| {
            let ra = requests(a);
            let rb = requests(b);
            ra.input_tokens
                .cmp(&rb.input_tokens)
                .then_with(|| stable_key(ra).cmp(&stable_key(rb)))
        });
    }
}

/// Descending priority score, ties by arrival then id.
#[derive(Debug, Default)]
pub struct PriorityFcfs;

impl SchedulingPolicy for PriorityFcfs {
    fn reorder(
        &self,
        wait_queue: &mut Vec<RequestId>,
        requests: &dyn Fn(RequestId) -> &Request,
        scores: &HashMap<RequestId, f64>,
    ) {
        wait_queue.sort_by(|&a, &b| {
            let sa = scores.get(&a).copied().unwrap_or(0.0);
            let sb = scores.get(&b).copied().unwrap_or(0.0);
            sb.partial_cmp(&sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| stable_key(requests(a)).cmp(&stable_key(requests(b))))
        });
    }
}

/// Pathological: ascending priority score — actively prefers the policy's
/// own least-preferred requests. Used only in comparison scenarios.
#[derive(Debug, Default)]
pub struct ReversePriority;

impl SchedulingPolicy for ReversePriority {
    fn reorder(
        &self,
        wait_queue: &mut Vec<RequestId>,
        requests: &dyn Fn(RequestId) -> &Request,
        scores: &HashMap<RequestId, f64>,
    ) {
        wait_queue.sort_by(|&a, &b| {
            let sa = scores.get(&a).copied().unwrap_or(0.0);
            let sb = scores.get(&b).copied().unwrap_or(0.0);
            sa.partial_cmp(&sb)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| stable_key(requests(a)).cmp(&stable_key(requests(b))))
        });
    }
}
