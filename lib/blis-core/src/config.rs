//! The frozen `Config` record the engine consumes (spec.md §6).
//!
//! Built only through [`ConfigBuilder`] (spec.md §9 "canonical
//! constructors") and validated with `validator` derive rules so malformed
//! configs fail before the event loop starts (spec.md §7 "Config error").

use derive_builder::Builder;
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::error::ConfigError;
use crate::event::Tick;
use crate::latency::{BlackboxLatencyModel, HardwareShape, ModelShape};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display, strum::EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum TraceLevel {
    Off,
    Decisions,
}

/// Roofline hardware/model bundle — mutually exclusive with non-zero
/// `alpha`/`beta` on [`LatencyConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RooflineConfig {
    pub model: ModelShape,
    pub hardware: HardwareShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct LatencyConfig {
    pub alpha: [f64; 3],
    pub beta: [f64; 3],
    pub roofline: Option<RooflineConfig>,
}

impl LatencyConfig {
    pub fn validate_exclusive(&self) -> Result<(), ConfigError> {
        let blackbox_present = !BlackboxLatencyModel::new(self.alpha, self.beta).is_all_zero();
        match (blackbox_present, self.roofline.is_some()) {
            (true, false) | (false, true) => Ok(()),
            _ => Err(ConfigError::AmbiguousLatencyModel),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct KvConfig {
    #[validate(range(min = 1))]
    pub total_kv_blocks: u32,
    #[validate(range(min = 1))]
    pub block_size_in_tokens: u32,
    pub kv_cpu_blocks: Option<u32>,
    #[validate(range(min = 0.0, max = 1.0))]
    pub kv_offload_threshold: Option<f64>,
    pub kv_transfer_bandwidth: Option<u32>,
    /// Fixed per-transfer latency (ticks), independent of block size —
    /// only meaningful when `kv_cpu_blocks` is set.
    pub kv_transfer_base_latency: Option<u32>,
}

impl KvConfig {
    pub fn is_tiered(&self) -> bool {
        self.kv_cpu_blocks.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AdmissionConfig {
    pub policy: String,
    pub token_bucket_capacity: Option<f64>,
    pub token_bucket_refill_rate: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct RoutingConfig {
    pub policy: String,
    #[validate(nested)]
    pub scorer_weights: Vec<ScorerWeightConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ScorerWeightConfig {
    pub name: String,
    #[validate(range(min = 0.0))]
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct SchedulingConfig {
    pub scheduler: String,
    pub priority: String,
    pub priority_base: Option<f64>,
    pub priority_weight: Option<f64>,
}

/// The frozen record the engine consumes — everything [`crate::cluster`]
/// needs to construct a run, nothing it needs to mutate (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Builder)]
#[builder(setter(into), build_fn(validate = "Config::validate_builder"))]
pub struct Config {
    pub model: String,
    pub hardware: String,
    #[validate(range(min = 1))]
    pub tensor_parallel: u32,

    pub latency: LatencyConfig,

    #[validate(range(min = 1))]
    pub num_instances: u32,
    #[validate(nested)]
    pub kv: KvConfig,

    #[validate(range(min = 1))]
    pub max_num_running_reqs: u32,
    #[validate(range(min = 1))]
    pub max_num_scheduled_tokens: u32,
    pub long_prefill_token_threshold: u32,

    #[validate(nested)]
    pub admission: AdmissionConfig,
    #[validate(nested)]
    pub routing: RoutingConfig,
    #[validate(nested)]
    pub scheduling: SchedulingConfig,

    pub snapshot_refresh_interval: Tick,
    pub admission_latency: Tick,
    pub routing_latency: Tick,

    pub seed: u64,
    pub horizon_ticks: Tick,
    #[validate(range(min = 1))]
    pub counterfactual_k: u32,
    pub trace_level: TraceLevel,

    /// Bounded history cap for the router-side prefix cache index
    /// (spec.md §4.9); not named in spec.md §6's field list but required to
    /// construct [`crate::prefix_index::PrefixCacheIndex`], so it lives here
    /// with a sensible default via [`ConfigBuilder`].
    #[serde(default = "default_prefix_index_capacity")]
    #[builder(default = "10_000")]
    pub prefix_index_capacity: usize,
}

fn default_prefix_index_capacity() -> usize {
    10_000
}

impl Config {
    fn validate_builder(builder: &ConfigBuilder) -> Result<(), String> {
        if let Some(latency) = &builder.latency {
            latency
                .validate_exclusive()
                .map_err(|e| e.to_string())?;
        }
        if let Some(0) = builder.num_instances {
            return Err(ConfigError::NoInstances.to_string());
        }
        Ok(())
    }

    /// Runs both the `validator`-derived field checks and the
    /// cross-field checks the builder doesn't have access to by itself.
    pub fn validate_all(&self) -> Result<(), ConfigError> {
        self.latency.validate_exclusive()?;
        Validate::validate(self)?;
        if self.num_instances == 0 {
            return Err(ConfigError::NoInstances);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ConfigBuilder {
        let mut b = ConfigBuilder::default();
        b.model("llama-3.1-8b")
            .hardware("h100")
            .tensor_parallel(2u32)
            .latency(LatencyConfig {
                alpha: [1601.35, 3.51, 1805.54],
                beta: [6910.42, 17.67, 2.84],
                roofline: None,
            })
            .num_instances(4u32)
            .kv(KvConfig {
                total_kv_blocks: 1000,
                block_size_in_tokens: 16,
                kv_cpu_blocks: None,
                kv_offload_threshold: None,
                kv_transfer_bandwidth: None,
                kv_transfer_base_latency: None,
            })
            .max_num_running_reqs(64u32)
            .max_num_scheduled_tokens(8192u32)
            .long_prefill_token_threshold(256u32)
            .admission(AdmissionConfig {
                policy: "always-admit".into(),
                token_bucket_capacity: None,
                token_bucket_refill_rate: None,
            })
            .routing(RoutingConfig {
                policy: "least-loaded".into(),
                scorer_weights: vec![],
            })
            .scheduling(SchedulingConfig {
                scheduler: "fcfs".into(),
                priority: "constant".into(),
                priority_base: None,
                priority_weight: None,
            })
            .snapshot_refresh_interval(0u64)
            .admission_latency(0u64)
            .routing_latency(0u64)
            .seed(42u64)
            .horizon_ticks(5_000_000u64)
            .counterfactual_k(3u32)
            .trace_level(TraceLevel::Off);
        b
    }

    #[test]
    fn valid_config_builds() {
        let cfg = base().build();
        assert!(cfg.is_ok());
    }

    #[test]
    fn roofline_and_blackbox_both_present_is_ambiguous() {
        let mut b = base();
        b.latency(LatencyConfig {
            alpha: [1.0, 0.0, 0.0],
            beta: [0.0; 3],
            roofline: Some(RooflineConfig {
                model: ModelShape {
                    flops_per_token: 1.0,
                    bytes_per_token: 1.0,
                    num_layers: 1,
                    per_layer_overhead_ticks: 0.0,
                    activation_bytes_per_token: 0.0,
                },
                hardware: HardwareShape {
                    peak_compute_flops_per_tick: 1.0,
                    peak_bandwidth_bytes_per_tick: 1.0,
                },
            }),
        });
        assert!(b.build().is_err());
    }

    #[test]
    fn zero_instances_rejected() {
        let mut b = base();
        b.num_instances(0u32);
        assert!(b.build().is_err());
    }

    #[test]
    fn prefix_index_capacity_defaults_without_explicit_setting() {
        let cfg = base().build().unwrap();
        assert_eq!(cfg.prefix_index_capacity, 10_000);
    }
}
