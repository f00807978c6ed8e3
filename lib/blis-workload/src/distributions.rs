//! Arrival processes and token-count distributions (spec.md §6 "Workload
//! (input stream)").

use blis_core::event::Tick;
use rand::rngs::StdRng;
use rand::Rng;
use rand_distr::{Distribution, Exp};
use serde::{Deserialize, Serialize};

/// How successive arrival times are generated, given the previous arrival.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum ArrivalProcess {
    /// Exactly periodic: `next = previous + interval`.
    Fixed { interval: Tick },
    /// Poisson process: inter-arrival gaps drawn from `Exponential(1 /
    /// mean_interval)`, rounded to the nearest tick (minimum 1, so the
    /// process never stalls the clock at a fixed tick forever).
    Poisson { mean_interval: f64 },
}

impl ArrivalProcess {
    pub fn next_arrival(&self, rng: &mut StdRng, previous: Tick) -> Tick {
        match self {
            ArrivalProcess::Fixed { interval } => previous + interval,
            ArrivalProcess::Poisson { mean_interval } => {
                let rate = 1.0 / mean_interval.max(1e-9);
                let gap = Exp::new(rate).expect("mean_interval must be positive").sample(rng);
                previous + (gap.round() as Tick).max(1)
            }
        }
    }
}

/// How a single token count (input or output) is sampled.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "value", rename_all = "kebab-case")]
pub enum TokenCountDistribution {
    Constant(u32),
    Uniform { min: u32, max: u32 },
}

impl TokenCountDistribution {
    pub fn sample(&self, rng: &mut StdRng) -> u32 {
        match *self {
            TokenCountDistribution::Constant(v) => v,
            TokenCountDistribution::Uniform { min, max } => {
                if min >= max {
                    min
                } else {
                    rng.random_range(min..=max)
                }
            }
        }
    }
}
