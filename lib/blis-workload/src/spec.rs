//! Declarative workload specifications (spec.md §6 "Workload (input
//! stream)"). A `WorkloadSpec` is the frozen description an external config
//! layer would deserialize; [`crate::generate`] turns it into a concrete
//! [`crate::Workload`].

use rand::rngs::StdRng;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::distributions::{ArrivalProcess, TokenCountDistribution};

/// One request's sampled mix: token counts plus the optional tagging fields
/// `Request::new` takes (spec.md §3).
pub struct SampledMix {
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub prefix_group: Option<String>,
    pub prefix_length: Option<u32>,
    pub slo_class: Option<String>,
    pub tenant: Option<String>,
    pub priority_hint: Option<f64>,
}

/// How the per-request shape (token counts, optional prefix group, SLO
/// class, tenant) is sampled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RequestMix {
    /// A single distribution shape for every request.
    Fixed {
        input_tokens: TokenCountDistribution,
        output_tokens: TokenCountDistribution,
        prefix_group: Option<String>,
        prefix_length: Option<u32>,
        slo_class: Option<String>,
        tenant: Option<String>,
        priority_hint: Option<f64>,
    },
    /// Two input-length populations (spec.md §8 scenario 5's "bimodal
    /// workload"): a `short_weight` fraction of requests get
    /// `short_input_tokens`, the rest `long_input_tokens`. Output tokens and
    /// tagging fields are shared across both populations.
    Bimodal {
        short_input_tokens: u32,
        long_input_tokens: u32,
        short_weight: f64,
        output_tokens: TokenCountDistribution,
        slo_class: Option<String>,
        tenant: Option<String>,
    },
}

impl RequestMix {
    pub fn sample(&self, rng: &mut StdRng) -> SampledMix {
        match self {
            RequestMix::Fixed {
                input_tokens,
                output_tokens,
                prefix_group,
                prefix_length,
                slo_class,
                tenant,
                priority_hint,
            } => SampledMix {
                input_tokens: input_tokens.sample(rng),
                output_tokens: output_tokens.sample(rng),
                prefix_group: prefix_group.clone(),
                prefix_length: *prefix_length,
                slo_class: slo_class.clone(),
                tenant: tenant.clone(),
                priority_hint: *priority_hint,
            },
            RequestMix::Bimodal {
                short_input_tokens,
                long_input_tokens,
                short_weight,
                output_tokens,
                slo_class,
                tenant,
            } => {
                let is_short = rng.random_range(0.0..1.0) < *short_weight;
                SampledMix {
                    input_tokens: if is_short { *short_input_tokens } else { *long_input_tokens },
                    output_tokens: output_tokens.sample(rng),
                    prefix_group: None,
                    prefix_length: None,
                    slo_class: slo_class.clone(),
                    tenant: tenant.clone(),
                    priority_hint: None,
                }
            }
        }
    }
}

/// The full declarative description of a workload (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadSpec {
    pub num_requests: u32,
    pub arrivals: ArrivalProcess,
    pub mix: RequestMix,
}
