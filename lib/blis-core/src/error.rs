//! Error taxonomy for the simulation engine.
//!
//! Mirrors spec.md §7: some failures are recovered locally by a policy
//! (admission reject, KV alloc failure, unservable drop) and never surface
//! as a `Result::Err` at all — they are counted in [`crate::metrics`]
//! instead. Only genuine faults (bad config, invariant violations) are
//! represented here.

use thiserror::Error;

use crate::invariants::InvariantViolation;

/// Errors that can occur while building or validating a [`crate::config::Config`].
#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum ConfigError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue {
        field: &'static str,
        reason: String,
    },

    #[error(
        "latency model misconfigured: exactly one of (alpha/beta coefficients) or (roofline bundle) must be present"
    )]
    AmbiguousLatencyModel,

    #[error("unknown policy name {name:?} for {kind}")]
    UnknownPolicy { kind: &'static str, name: String },

    #[error("no instances configured")]
    NoInstances,

    #[error("validation failed: {0}")]
    Validation(String),
}

impl From<validator::ValidationErrors> for ConfigError {
    fn from(e: validator::ValidationErrors) -> Self {
        ConfigError::Validation(e.to_string())
    }
}

/// KV-cache allocation failure kinds (spec.md §4.3).
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum KvError {
    /// Not enough free blocks right now; recoverable by preemption.
    #[error("insufficient free KV blocks")]
    AllocFailure,
    /// The request needs more blocks than the cache could ever hold; fatal
    /// for that request, never for the run.
    #[error("request requires more blocks than total cache capacity")]
    Unservable,
}

/// Top-level engine error. Everything that is not locally recoverable ends
/// up here and is surfaced to the caller (the `blis-run` binary) as a fatal
/// diagnostic; see spec.md §4.15.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invariant violation: {0}")]
    Invariant(#[from] InvariantViolation),

    #[error("pushed event at tick {pushed} but clock already at {now} (INV-3)")]
    ClockRegression { now: u64, pushed: u64 },
}
