//! The `Request` data model and its owning arena (spec.md §3, §9).
//!
//! Requests are created once (by the workload generator, outside this
//! crate) and never move between owners after that; the engine stores them
//! in one dense arena indexed by [`RequestId`] and passes the id through
//! queues and events instead of cloning the request or building a reference
//! graph between requests.

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::xxh3_64;

use crate::event::Tick;

/// Stable identity for a request, assigned by the arena at insertion time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u32);

/// Where a request currently sits in its lifecycle (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RequestState {
    Queued,
    Running,
    Completed,
    DroppedUnservable,
    Rejected,
}

/// A single simulated inference request.
///
/// Created once by the workload generator at `arrival` and, from that point
/// on, mutated only by the instance it gets routed to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    pub arrival: Tick,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub prefix_group: Option<String>,
    pub prefix_length: Option<u32>,
    pub slo_class: Option<String>,
    pub tenant: Option<String>,
    pub priority_hint: Option<f64>,

    // Mutable runtime fields, owned by the instance once routed.
    pub state: RequestState,
    pub progress: u32,
    pub assigned_instance: Option<u32>,
    pub kv_blocks: Vec<u64>,
    pub enqueue_time: Option<Tick>,
    pub schedule_time: Option<Tick>,
    pub first_token_time: Option<Tick>,
    pub completion_time: Option<Tick>,
    pub itl: Vec<Tick>,
}

impl Request {
    /// Canonical constructor — the only place a `Request` is assembled from
    /// scratch (spec.md §9 "canonical constructors").
    pub fn new(
        id: RequestId,
        arrival: Tick,
        input_tokens: u32,
        output_tokens: u32,
        prefix_group: Option<String>,
        prefix_length: Option<u32>,
        slo_class: Option<String>,
        tenant: Option<String>,
        priority_hint: Option<f64>,
    ) -> Self {
        Self {
            id,
            arrival,
            input_tokens,
            output_tokens,
            prefix_group,
            prefix_length,
            slo_class,
            tenant,
            priority_hint,
            state: RequestState::Queued,
            progress: 0,
            assigned_instance: None,
            kv_blocks: Vec::new(),
            enqueue_time: None,
            schedule_time: None,
            first_token_time: None,
            completion_time: None,
            itl: Vec::new(),
        }
    }

    pub fn total_tokens(&self) -> u32 {
        self.input_tokens + self.output_tokens
    }

    pub fn is_prefill_complete(&self) -> bool {
        self.progress >= self.input_tokens
    }

    pub fn is_done(&self) -> bool {
        self.progress >= self.total_tokens()
    }

    /// Synthetic per-request token content, standing in for a real
    /// tokenizer: identical content across requests is what makes KV prefix
    /// reuse observable, so requests sharing a `prefix_group` get identical
    /// ids over their shared prefix and unique ids afterward, while
    /// requests with no `prefix_group` are unique over their whole input
    /// (see [`crate::kv::block::chained_block_hashes`]).
    pub fn token_ids(&self) -> Vec<u64> {
        let total = self.input_tokens as u64;
        let prefix_len = self
            .prefix_group
            .as_ref()
            .map(|_| self.prefix_length.unwrap_or(self.input_tokens) as u64)
            .unwrap_or(0)
            .min(total);
        let mut ids = Vec::with_capacity(total as usize);
        if let Some(group) = &self.prefix_group {
            let group_seed = xxh3_64(group.as_bytes());
            ids.extend((0..prefix_len).map(|i| group_seed.wrapping_add(i)));
        }
        let unique_seed = 0x9E37_79B9_7F4A_7C15u64.wrapping_mul(self.id.0 as u64 + 1);
        ids.extend((prefix_len..total).map(|i| unique_seed.wrapping_add(i)));
        ids
    }

    /// Resets runtime progress to the "recompute" state used on preemption
    /// (spec.md §4.7), leaving arrival/identity fields untouched.
    pub fn reset_on_preemption(&mut self) {
        self.progress = 0;
        self.kv_blocks.clear();
        self.schedule_time = None;
        self.state = RequestState::Queued;
    }
}

/// Dense, append-only arena of requests, indexed by [`RequestId`].
#[derive(Debug, Default)]
pub struct RequestArena {
    requests: Vec<Request>,
}

impl RequestArena {
    pub fn new() -> Self {
        Self {
            requests: Vec::new(),
        }
    }

    /// Inserts a request built with id `RequestId(arena.len())`, returning
    /// that id. Callers should build requests with
    /// `Request::new(RequestId(arena.len() as u32), ...)` immediately
    /// before calling this, or use [`RequestArena::insert_new`].
    pub fn insert(&mut self, request: Request) -> RequestId {
        let id = request.id;
        debug_assert_eq!(id.0 as usize, self.requests.len(), "arena ids must be dense");
        self.requests.push(request);
        id
    }

    pub fn get(&self, id: RequestId) -> &Request {
        &self.requests[id.0 as usize]
    }

    pub fn get_mut(&mut self, id: RequestId) -> &mut Request {
        &mut self.requests[id.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Request> {
        self.requests.iter()
    }
}
