//! Workload generators: the external collaborator that produces the
//! `Vec<Request>` a simulated run consumes (spec.md §1 "Deliberately out of
//! scope", §6 "Workload (input stream)").
//!
//! The frozen interface between this crate and `blis-core` is exactly one
//! type: `Vec<blis_core::Request>`, sorted by `arrival` ascending. Nothing
//! here constructs an engine or touches `ClusterOrchestrator` — that is
//! `blis-run`'s job.

mod distributions;
mod spec;

pub use distributions::{ArrivalProcess, TokenCountDistribution};
pub use spec::{RequestMix, WorkloadSpec};

use blis_core::event::Tick;
use blis_core::request::{Request, RequestId};
use blis_core::rng::PartitionedRng;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WorkloadError {
    #[error("workload spec produced no requests")]
    Empty,
    #[error("workload spec requires num_requests > 0")]
    ZeroRequests,
}

/// A generated, validated workload: requests in non-decreasing arrival
/// order, ids dense from zero (ready to feed straight into
/// `ClusterOrchestrator::submit` in order).
#[derive(Debug, Clone)]
pub struct Workload {
    requests: Vec<Request>,
}

impl Workload {
    /// Builds a `Workload` from an already-generated, unsorted request
    /// list — sorts by arrival (stable, so ties keep generation order) and
    /// reassigns dense ids after sorting, since the generator assigns ids
    /// in generation order, not arrival order.
    fn from_generated(mut requests: Vec<Request>) -> Result<Self, WorkloadError> {
        if requests.is_empty() {
            return Err(WorkloadError::Empty);
        }
        requests.sort_by_key(|r| r.arrival);
        for (i, r) in requests.iter_mut().enumerate() {
            r.id = RequestId(i as u32);
        }
        Ok(Self { requests })
    }

    pub fn requests(&self) -> &[Request] {
        &self.requests
    }

    pub fn into_requests(self) -> Vec<Request> {
        self.requests
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    /// INV-6 support: arrival order is monotone non-decreasing, the
    /// contract `ClusterOrchestrator::submit` depends on.
    pub fn is_sorted_by_arrival(&self) -> bool {
        self.requests.windows(2).all(|w| w[0].arrival <= w[1].arrival)
    }
}

/// Generates a [`Workload`] from a [`WorkloadSpec`], using the `"workload"`
/// named stream of `rng` (spec.md §4.2 — the one stream this crate, not
/// `blis-core`, is allowed to own).
pub fn generate(spec: &WorkloadSpec, rng: &PartitionedRng) -> Result<Workload, WorkloadError> {
    if spec.num_requests == 0 {
        return Err(WorkloadError::ZeroRequests);
    }
    let mut stream = rng.stream("workload");
    let mut requests = Vec::with_capacity(spec.num_requests as usize);
    let mut arrival: Tick = 0;
    for i in 0..spec.num_requests {
        arrival = spec.arrivals.next_arrival(&mut stream, arrival);
        let mix = spec.mix.sample(&mut stream);
        requests.push(Request::new(
            RequestId(i),
            arrival,
            mix.input_tokens,
            mix.output_tokens,
            mix.prefix_group,
            mix.prefix_length,
            mix.slo_class,
            mix.tenant,
            mix.priority_hint,
        ));
    }
    Workload::from_generated(requests)
}
