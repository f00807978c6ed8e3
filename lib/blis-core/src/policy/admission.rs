//! Admission policies (spec.md §4.10).
//!
//! `Admit` is the only method; the token bucket is the only variant that
//! carries mutable state, and that state is mutated in-place by `admit`
//! (never behind a lock — the engine is single-threaded, spec.md §5).

use crate::event::Tick;
use crate::request::Request;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Reject,
}

pub trait AdmissionPolicy {
    fn admit(&mut self, request: &Request, now: Tick) -> AdmissionDecision;
}

/// Admits everything. Used as the default and in overload scenarios where
/// admission shouldn't be the bottleneck under test.
#[derive(Debug, Default)]
pub struct AlwaysAdmit;

impl AdmissionPolicy for AlwaysAdmit {
    fn admit(&mut self, _request: &Request, _now: Tick) -> AdmissionDecision {
        AdmissionDecision::Admit
    }
}

/// Rejects everything. Pathological baseline for comparison scenarios.
#[derive(Debug, Default)]
pub struct RejectAll;

impl AdmissionPolicy for RejectAll {
    fn admit(&mut self, _request: &Request, _now: Tick) -> AdmissionDecision {
        AdmissionDecision::Reject
    }
}

/// Classic token bucket: `capacity` tokens, refilled at `refill_rate` tokens
/// per tick, consuming tokens equal to the request's input length.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    tokens: f64,
    last_refill: Tick,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_rate: f64) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: 0,
        }
    }

    fn refill(&mut self, now: Tick) {
        let elapsed = now.saturating_sub(self.last_refill) as f64;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.capacity);
        self.last_refill = now;
    }
}

impl AdmissionPolicy for TokenBucket {
    fn admit(&mut self, request: &Request, now: Tick) -> AdmissionDecision {
        self.refill(now);
        let cost = request.input_tokens as f64;
        if self.tokens >= cost {
            self.tokens -= cost;
            AdmissionDecision::Admit
        } else {
            AdmissionDecision::Reject
        }
    }
}
