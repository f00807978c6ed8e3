//! Tagged `Event` variants (spec.md §3, §9).
//!
//! The event set is closed and known at compile time, so it is a plain
//! `enum`, not a trait-object hierarchy — per the Design Notes.

use serde::{Deserialize, Serialize};

use crate::request::RequestId;

/// A simulated timestamp, in ticks (1 tick = 1 microsecond, per the
/// glossary).
pub type Tick = u64;

/// Cluster-scope events sort before per-instance events at equal ticks
/// (spec.md §4.13); within a scope, lower discriminant is not meaningful on
/// its own — ties are broken by `(instance index, sequence id)`, folded
/// separately into the heap key by [`crate::clock::EventQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    /// `ClusterArrival`, `AdmissionDecision`, `RoutingDecision`.
    Cluster = 0,
    /// Everything scoped to a single instance.
    Instance = 1,
}

/// The payload of an [`Event`]. Handlers dispatch on this discriminator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    /// A request has arrived at the cluster boundary and awaits admission.
    ClusterArrival { request: RequestId },
    /// The admission policy's verdict is due to take effect.
    AdmissionDecision { request: RequestId },
    /// The routing policy's verdict is due to take effect.
    RoutingDecision { request: RequestId },
    /// A request has arrived at the instance it was routed to.
    Arrival { request: RequestId, instance: u32 },
    /// A request has been placed on an instance's wait queue.
    Queued { request: RequestId, instance: u32 },
    /// An instance's batch-formation-and-execute step is due.
    Step { instance: u32 },
    /// Marker: a request was newly admitted into a running batch.
    Scheduled { request: RequestId, instance: u32 },
    /// Marker: a request was preempted back to the wait queue.
    Preemption { request: RequestId, instance: u32 },
    /// Marker: a request left the instance (completed or dropped).
    RequestLeft { request: RequestId, instance: u32 },
}

impl EventKind {
    /// The scheduling priority class for this event kind (spec.md §4.13).
    pub fn priority(&self) -> Priority {
        match self {
            EventKind::ClusterArrival { .. }
            | EventKind::AdmissionDecision { .. }
            | EventKind::RoutingDecision { .. } => Priority::Cluster,
            _ => Priority::Instance,
        }
    }

    /// The instance this event concerns, if any (used for per-instance tie
    /// breaking at equal ticks; cluster events use `u32::MAX` so they sort
    /// before any real instance index once priority itself is equal, which
    /// never actually happens since cluster events always have the lower
    /// `Priority`).
    pub fn instance_hint(&self) -> u32 {
        match self {
            EventKind::ClusterArrival { .. }
            | EventKind::AdmissionDecision { .. }
            | EventKind::RoutingDecision { .. } => u32::MAX,
            EventKind::Arrival { instance, .. }
            | EventKind::Queued { instance, .. }
            | EventKind::Step { instance }
            | EventKind::Scheduled { instance, .. }
            | EventKind::Preemption { instance, .. }
            | EventKind::RequestLeft { instance, .. } => *instance,
        }
    }
}

/// A single entry in the global event heap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub timestamp: Tick,
    pub sequence: u64,
    pub kind: EventKind,
}

impl Event {
    fn sort_key(&self) -> (Tick, Priority, u32, u64) {
        (
            self.timestamp,
            self.kind.priority(),
            self.kind.instance_hint(),
            self.sequence,
        )
    }
}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we want min-timestamp-first.
        other.sort_key().cmp(&self.sort_key())
    }
}
