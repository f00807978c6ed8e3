//! Routing policies (spec.md §4.11) and the per-instance snapshot they
//! consume (spec.md §3 "Routing snapshot").
//!
//! A decision must select a valid instance id from a non-empty snapshot
//! list and be deterministic given identical inputs and RNG state — no
//! policy here reads wall-clock time or any other hidden source of
//! nondeterminism.

use crate::prefix_index::PrefixCacheIndex;

/// Per-instance view consumed by routers. `Synchronous` fields
/// (`pending_requests`) are exact at decision time; `Periodic` fields
/// (everything else) are served from [`crate::cluster::ClusterOrchestrator`]'s
/// refresh-interval-gated cache — see spec.md §4.13.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RoutingSnapshot {
    pub instance: u32,
    pub queue_depth: u32,
    pub batch_size: u32,
    pub kv_utilization: f64,
    pub free_kv_blocks: u32,
    pub cache_hit_rate: f64,
    pub pending_requests: u32,
}

impl RoutingSnapshot {
    /// `QueueDepth + BatchSize + PendingRequests`.
    pub fn effective_load(&self) -> f64 {
        (self.queue_depth + self.batch_size + self.pending_requests) as f64
    }
}

/// One entry of a [`crate::policy::routing::Weighted`] composite.
#[derive(Debug, Clone)]
pub struct ScorerWeight {
    pub name: String,
    pub weight: f64,
}

pub trait RoutingPolicy {
    /// Chooses one instance from `snapshots` (non-empty, one entry per
    /// live instance) for a request whose KV block hashes are
    /// `block_hashes` (used only by scorers that need them, e.g.
    /// prefix-affinity).
    fn route(&mut self, snapshots: &[RoutingSnapshot], block_hashes: &[u64], prefix_index: &PrefixCacheIndex) -> u32;

    /// Per-instance scores for decision tracing and counterfactual regret
    /// (spec.md §4.14, §9 glossary "Counterfactual regret") — observation
    /// only, never consulted by `route` itself. The default gives every
    /// policy a comparable trace even when it has no internal notion of a
    /// score: negated `EffectiveLoad`, so "lower load is better" is the
    /// generic proxy. [`Weighted`] overrides this with its actual composite
    /// score, since it already computes one per instance.
    fn trace_scores(
        &self,
        snapshots: &[RoutingSnapshot],
        block_hashes: &[u64],
        prefix_index: &PrefixCacheIndex,
    ) -> Vec<(u32, f64)> {
        let _ = (block_hashes, prefix_index);
        snapshots.iter().map(|s| (s.instance, -s.effective_load())).collect()
    }
}

/// Counter mod N; ignores all snapshot content.
#[derive(Debug, Default)]
pub struct RoundRobin {
    next: usize,
}

impl RoutingPolicy for RoundRobin {
    fn route(&mut self, snapshots: &[RoutingSnapshot], _block_hashes: &[u64], _prefix_index: &PrefixCacheIndex) -> u32 {
        assert!(!snapshots.is_empty(), "router contract requires a non-empty snapshot list");
        let chosen = snapshots[self.next % snapshots.len()].instance;
        self.next += 1;
        chosen
    }
}

/// `argmin(EffectiveLoad)`, ties broken by lowest instance index.
#[derive(Debug, Default)]
pub struct LeastLoaded;

impl RoutingPolicy for LeastLoaded {
    fn route(&mut self, snapshots: &[RoutingSnapshot], _block_hashes: &[u64], _prefix_index: &PrefixCacheIndex) -> u32 {
        assert!(!snapshots.is_empty(), "router contract requires a non-empty snapshot list");
        snapshots
            .iter()
            .min_by(|a, b| {
                a.effective_load()
                    .partial_cmp(&b.effective_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| a.instance.cmp(&b.instance))
            })
            .expect("non-empty")
            .instance
    }
}

/// `argmax(EffectiveLoad)` — pathological, used to demonstrate routing
/// matters (spec.md §8 scenario 4).
#[derive(Debug, Default)]
pub struct AlwaysBusiest;

impl RoutingPolicy for AlwaysBusiest {
    fn route(&mut self, snapshots: &[RoutingSnapshot], _block_hashes: &[u64], _prefix_index: &PrefixCacheIndex) -> u32 {
        assert!(!snapshots.is_empty(), "router contract requires a non-empty snapshot list");
        snapshots
            .iter()
            .max_by(|a, b| {
                a.effective_load()
                    .partial_cmp(&b.effective_load())
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then_with(|| b.instance.cmp(&a.instance))
            })
            .expect("non-empty")
            .instance
    }
}

/// Composes a configured set of scorers: `final_score = sum(weight_i *
/// score_i(instance))`, argmax wins, ties by lowest index. Weights are
/// normalized to sum to 1 at construction time (only ratios matter).
pub struct Weighted {
    scorers: Vec<(ScorerWeight, Box<dyn Fn(&RoutingSnapshot, &[RoutingSnapshot], &[u64], &PrefixCacheIndex) -> f64>)>,
}

impl std::fmt::Debug for Weighted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Weighted")
            .field("scorers", &self.scorers.iter().map(|(w, _)| w.clone()).collect::<Vec<_>>())
            .finish()
    }
}

impl Weighted {
    pub fn new(
        weights: Vec<ScorerWeight>,
        scorers: Vec<Box<dyn Fn(&RoutingSnapshot, &[RoutingSnapshot], &[u64], &PrefixCacheIndex) -> f64>>,
    ) -> Self {
        let total: f64 = weights.iter().map(|w| w.weight).sum();
        let normalized = if total > 0.0 {
            weights
                .into_iter()
                .map(|w| ScorerWeight {
                    name: w.name,
                    weight: w.weight / total,
                })
                .collect()
        } else {
            weights
        };
        Self {
            scorers: normalized.into_iter().zip(scorers).collect(),
        }
    }
}

impl RoutingPolicy for Weighted {
    fn route(&mut self, snapshots: &[RoutingSnapshot], block_hashes: &[u64], prefix_index: &PrefixCacheIndex) -> u32 {
        assert!(!snapshots.is_empty(), "router contract requires a non-empty snapshot list");
        let mut best_instance = snapshots[0].instance;
        let mut best_score = f64::NEG_INFINITY;
        for snap in snapshots {
            let score: f64 = self
                .scorers
                .iter()
                .map(|(w, f)| w.weight * f(snap, snapshots, block_hashes, prefix_index))
                .sum();
            if score > best_score || (score == best_score && snap.instance < best_instance) {
                best_score = score;
                best_instance = snap.instance;
            }
        }
        best_instance
    }

    fn trace_scores(
        &self,
        snapshots: &[RoutingSnapshot],
        block_hashes: &[u64],
        prefix_index: &PrefixCacheIndex,
    ) -> Vec<(u32, f64)> {
        snapshots
            .iter()
            .map(|snap| {
                let score: f64 = self
                    .scorers
                    .iter()
                    .map(|(w, f)| w.weight * f(snap, snapshots, block_hashes, prefix_index))
                    .sum();
                (snap.instance, score)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(instance: u32, load: u32) -> RoutingSnapshot {
        RoutingSnapshot {
            instance,
            queue_depth: load,
            batch_size: 0,
            kv_utilization: 0.0,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            pending_requests: 0,
        }
    }

    #[test]
    fn round_robin_cycles_through_all_instances() {
        let idx = PrefixCacheIndex::new(3, 10);
        let snaps = vec![snap(0, 0), snap(1, 0), snap(2, 0)];
        let mut rr = RoundRobin::default();
        let chosen: Vec<u32> = (0..5).map(|_| rr.route(&snaps, &[], &idx)).collect();
        assert_eq!(chosen, vec![0, 1, 2, 0, 1]);
    }

    #[test]
    fn least_loaded_picks_minimum_effective_load() {
        let idx = PrefixCacheIndex::new(3, 10);
        let snaps = vec![snap(0, 10), snap(1, 2), snap(2, 5)];
        let mut r = LeastLoaded;
        assert_eq!(r.route(&snaps, &[], &idx), 1);
    }

    #[test]
    fn least_loaded_breaks_ties_by_lowest_index() {
        let idx = PrefixCacheIndex::new(3, 10);
        let snaps = vec![snap(2, 1), snap(0, 1), snap(1, 1)];
        let mut r = LeastLoaded;
        assert_eq!(r.route(&snaps, &[], &idx), 0);
    }

    #[test]
    fn always_busiest_picks_maximum_effective_load() {
        let idx = PrefixCacheIndex::new(3, 10);
        let snaps = vec![snap(0, 10), snap(1, 2), snap(2, 5)];
        let mut r = AlwaysBusiest;
        assert_eq!(r.route(&snaps, &[], &idx), 0);
    }

    #[test]
    fn weighted_normalizes_weights_and_picks_argmax() {
        let idx = PrefixCacheIndex::new(2, 10);
        let snaps = vec![snap(0, 10), snap(1, 0)];
        let weights = vec![
            ScorerWeight {
                name: "load_balance".into(),
                weight: 3.0,
            },
        ];
        let scorers: Vec<Box<dyn Fn(&RoutingSnapshot, &[RoutingSnapshot], &[u64], &PrefixCacheIndex) -> f64>> =
            vec![Box::new(|s: &RoutingSnapshot, _: &[RoutingSnapshot], _: &[u64], _: &PrefixCacheIndex| {
                1.0 / (1.0 + s.effective_load())
            })];
        let mut w = Weighted::new(weights, scorers);
        assert_eq!(w.route(&snaps, &[], &idx), 1);
    }

    #[test]
    fn default_trace_scores_use_negated_effective_load() {
        let idx = PrefixCacheIndex::new(2, 10);
        let snaps = vec![snap(0, 10), snap(1, 2)];
        let scores = LeastLoaded.trace_scores(&snaps, &[], &idx);
        assert_eq!(scores, vec![(0, -10.0), (1, -2.0)]);
    }
}
