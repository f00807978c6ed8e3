//! Global min-heap event queue and the shared simulation clock
//! (spec.md §4.1).
//!
//! The queue is the only source of control flow in the engine: the loop
//! pops the earliest event, advances the clock to its timestamp, and
//! dispatches it. Pushing at a timestamp strictly less than the current
//! clock is an internal error (violates INV-3) and must abort the run.

use std::collections::BinaryHeap;

use crate::event::{Event, EventKind, Tick};

/// The event queue plus the clock it drives.
#[derive(Debug, Default)]
pub struct EventQueue {
    heap: BinaryHeap<Event>,
    now: Tick,
    next_sequence: u64,
}

/// Returned by [`EventQueue::push`] when the caller asked to schedule an
/// event strictly before the current clock — an internal invariant
/// violation (INV-3), not a recoverable condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClockRegression {
    pub now: Tick,
    pub attempted: Tick,
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            now: 0,
            next_sequence: 0,
        }
    }

    /// The clock's current value. Only advances as events are popped.
    pub fn now(&self) -> Tick {
        self.now
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Schedules `kind` at `timestamp`. Assigns the next monotone sequence
    /// id, which breaks ties at equal `(timestamp, priority, instance)`.
    pub fn push(&mut self, timestamp: Tick, kind: EventKind) -> Result<(), ClockRegression> {
        if timestamp < self.now {
            return Err(ClockRegression {
                now: self.now,
                attempted: timestamp,
            });
        }
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Event {
            timestamp,
            sequence,
            kind,
        });
        Ok(())
    }

    /// Pops the earliest event and advances the clock to its timestamp.
    /// Returns `None` when the heap is empty.
    pub fn pop(&mut self) -> Option<Event> {
        let event = self.heap.pop()?;
        debug_assert!(event.timestamp >= self.now, "INV-3 violated internally");
        self.now = event.timestamp;
        Some(event)
    }

    /// Looks at the earliest event without removing it.
    pub fn peek(&self) -> Option<&Event> {
        self.heap.peek()
    }

    /// True if some pending event is a `Step` for `instance` (used by
    /// [`crate::invariants`]'s INV-2 audit).
    pub fn has_pending_step(&self, instance: u32) -> bool {
        self.heap
            .iter()
            .any(|e| matches!(e.kind, EventKind::Step { instance: i } if i == instance))
    }
}
