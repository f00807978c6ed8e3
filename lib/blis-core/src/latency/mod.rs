//! Latency model interface shared by prefill/decode step-time computation
//! (spec.md §4.5).
//!
//! The scheduler only ever talks to `dyn LatencyModel`; it never knows
//! whether the coefficients came from a blackbox fit or a roofline
//! hardware/model bundle.

pub mod blackbox;
pub mod roofline;

pub use blackbox::BlackboxLatencyModel;
pub use roofline::{HardwareShape, ModelShape, RooflineLatencyModel};

use crate::error::ConfigError;
use crate::event::Tick;

/// Token accounting for a single instance's step, as seen by the latency
/// model. `cache_miss_tokens` counts tokens in the step whose KV blocks were
/// not already resident (a genuine cache miss), independent of whether the
/// token is a prefill or decode token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchComposition {
    pub prefill_tokens: u32,
    pub decode_tokens: u32,
    pub cache_miss_tokens: u32,
}

/// Shared contract for step-time and per-request overhead computation
/// (spec.md §4.5). A single method per concern, so swapping backends never
/// touches call sites.
pub trait LatencyModel {
    /// Time to execute one batch step given its token composition.
    fn step_time(&self, batch: BatchComposition) -> Tick;

    /// Extra delay applied to a request's `Queued` event before it becomes
    /// visible to batch formation. Does not block the server.
    fn queueing_time(&self, input_tokens: u32) -> Tick;

    /// Per-output-token overhead added to both TTFT and every ITL. Does not
    /// block the next step.
    fn output_token_processing_time(&self) -> Tick;

    /// Fails fast if the model's own parameters are internally
    /// inconsistent (e.g. negative coefficients).
    fn validate(&self) -> Result<(), ConfigError>;
}
