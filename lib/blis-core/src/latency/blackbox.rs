//! Blackbox (regression-fit) latency backend (spec.md §4.5).
//!
//! Coefficients are fit offline against real hardware traces and handed in
//! through `Config`; this backend has no notion of FLOPs or bandwidth, only
//! the fitted `alpha`/`beta` terms.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::Tick;
use crate::latency::{BatchComposition, LatencyModel};

/// `StepTime = beta0 + beta1 * cacheMissTokens + beta2 * decodeTokens`.
/// `QueueingTime(r) = alpha0 + alpha1 * inputLen(r)`.
/// `OutputTokenProcessingTime = alpha2`.
///
/// All coefficients are in ticks (microseconds) per unit; `alpha`/`beta` are
/// `[a0, a1, a2]` / `[b0, b1, b2]` respectively, matching spec.md's naming.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BlackboxLatencyModel {
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
}

impl BlackboxLatencyModel {
    pub fn new(alpha: [f64; 3], beta: [f64; 3]) -> Self {
        Self { alpha, beta }
    }

    /// True when every coefficient is exactly zero — the signal `Config`
    /// uses to decide a roofline bundle should be active instead.
    pub fn is_all_zero(&self) -> bool {
        self.alpha.iter().chain(self.beta.iter()).all(|c| *c == 0.0)
    }

    fn round_up_to_tick(ticks: f64) -> Tick {
        ticks.max(0.0).ceil() as Tick
    }
}

impl LatencyModel for BlackboxLatencyModel {
    fn step_time(&self, batch: BatchComposition) -> Tick {
        let ticks = self.beta[0]
            + self.beta[1] * batch.cache_miss_tokens as f64
            + self.beta[2] * batch.decode_tokens as f64;
        Self::round_up_to_tick(ticks)
    }

    fn queueing_time(&self, input_tokens: u32) -> Tick {
        let ticks = self.alpha[0] + self.alpha[1] * input_tokens as f64;
        Self::round_up_to_tick(ticks)
    }

    fn output_token_processing_time(&self) -> Tick {
        Self::round_up_to_tick(self.alpha[2])
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self
            .alpha
            .iter()
            .chain(self.beta.iter())
            .any(|c| !c.is_finite() || *c < 0.0)
        {
            return Err(ConfigError::InvalidValue {
                field: "latency.alpha/beta",
                reason: "coefficients must be finite and non-negative".to_string(),
            });
        }
        Ok(())
    }
}
