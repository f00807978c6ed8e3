//! Roofline latency backend (spec.md §4.5).
//!
//! Activated only when a model/hardware bundle is supplied instead of
//! alpha/beta coefficients. Computes step time as the max of the
//! compute-bound and bandwidth-bound terms, plus per-layer overhead and an
//! all-reduce term for tensor-parallel configurations.
//!
//! The all-reduce term is a bandwidth-bound additive approximation, not a
//! faithful model of every interconnect topology — spec.md's Open Questions
//! flags exact TP all-reduce cost beyond H100/TP∈{1,2,4} as undecided; see
//! DESIGN.md for the decision taken here.

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::event::Tick;
use crate::latency::{BatchComposition, LatencyModel};

/// Per-token compute/memory shape of the served model, independent of the
/// hardware it runs on.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelShape {
    pub flops_per_token: f64,
    pub bytes_per_token: f64,
    pub num_layers: u32,
    pub per_layer_overhead_ticks: f64,
    /// Bytes of activation that must be all-reduced per token when `tp > 1`.
    pub activation_bytes_per_token: f64,
}

/// Hardware performance ceiling the model shape is evaluated against.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HardwareShape {
    pub peak_compute_flops_per_tick: f64,
    pub peak_bandwidth_bytes_per_tick: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RooflineLatencyModel {
    pub model: ModelShape,
    pub hw: HardwareShape,
    pub tensor_parallel: u32,
}

impl RooflineLatencyModel {
    pub fn new(model: ModelShape, hw: HardwareShape, tensor_parallel: u32) -> Self {
        Self {
            model,
            hw,
            tensor_parallel,
        }
    }

    /// Bandwidth-bound approximation of the TP all-reduce contribution:
    /// `2 * (tp - 1) / tp * activation_bytes / peak_bandwidth`, zero when
    /// `tp <= 1`.
    fn all_reduce_ticks(&self) -> f64 {
        let tp = self.tensor_parallel as f64;
        if tp <= 1.0 {
            return 0.0;
        }
        let ring_factor = 2.0 * (tp - 1.0) / tp;
        ring_factor * self.model.activation_bytes_per_token / self.hw.peak_bandwidth_bytes_per_tick
    }
}

impl LatencyModel for RooflineLatencyModel {
    fn step_time(&self, batch: BatchComposition) -> Tick {
        let tokens = (batch.prefill_tokens + batch.decode_tokens) as f64;
        let total_flops = tokens * self.model.flops_per_token;
        let total_bytes = tokens * self.model.bytes_per_token;
        let compute_bound = total_flops / self.hw.peak_compute_flops_per_tick;
        let bandwidth_bound = total_bytes / self.hw.peak_bandwidth_bytes_per_tick;
        let roofline = compute_bound.max(bandwidth_bound);
        let layer_overhead = self.model.num_layers as f64 * self.model.per_layer_overhead_ticks;
        let ticks = roofline + layer_overhead + self.all_reduce_ticks();
        ticks.max(0.0).ceil() as Tick
    }

    fn queueing_time(&self, _input_tokens: u32) -> Tick {
        // The roofline backend models compute, not admission-side queueing;
        // spec.md §4.5 only defines queueing/output-overhead terms for the
        // blackbox backend's alpha coefficients, which roofline configs
        // leave at zero by construction (see Config::validate).
        0
    }

    fn output_token_processing_time(&self) -> Tick {
        0
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.hw.peak_compute_flops_per_tick <= 0.0 || self.hw.peak_bandwidth_bytes_per_tick <= 0.0
        {
            return Err(ConfigError::InvalidValue {
                field: "latency.roofline.hw",
                reason: "peak compute and bandwidth must be positive".to_string(),
            });
        }
        if self.model.flops_per_token < 0.0 || self.model.bytes_per_token < 0.0 {
            return Err(ConfigError::InvalidValue {
                field: "latency.roofline.model",
                reason: "per-token flops/bytes must be non-negative".to_string(),
            });
        }
        if self.tensor_parallel == 0 {
            return Err(ConfigError::InvalidValue {
                field: "latency.roofline.tensor_parallel",
                reason: "tensor parallelism must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}
