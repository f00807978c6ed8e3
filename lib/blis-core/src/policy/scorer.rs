//! Per-instance scorers (spec.md §4.12), each producing a value in `[0,1]`.
//! [`crate::policy::routing::Weighted`] combines them into a single score.

use crate::policy::routing::RoutingSnapshot;
use crate::prefix_index::PrefixCacheIndex;

pub trait Scorer {
    fn score(&self, snapshot: &RoutingSnapshot, block_hashes: &[u64], prefix_index: &PrefixCacheIndex) -> f64;
}

/// Proportion of the request's block hashes found in the instance's
/// router-side prefix cache index.
#[derive(Debug, Default)]
pub struct PrefixAffinity;

impl Scorer for PrefixAffinity {
    fn score(&self, snapshot: &RoutingSnapshot, block_hashes: &[u64], prefix_index: &PrefixCacheIndex) -> f64 {
        prefix_index.query(snapshot.instance, block_hashes)
    }
}

/// Min-max normalization of `EffectiveLoad` across instances, inverted so
/// lower load scores higher. Needs the full snapshot set to normalize
/// against, so it's computed over a slice rather than one instance at a
/// time; [`QueueDepth::score_all`] is the entry point callers use.
#[derive(Debug, Default)]
pub struct QueueDepth;

impl QueueDepth {
    pub fn score_all(snapshots: &[RoutingSnapshot]) -> Vec<f64> {
        let loads: Vec<f64> = snapshots.iter().map(RoutingSnapshot::effective_load).collect();
        let min = loads.iter().cloned().fold(f64::INFINITY, f64::min);
        let max = loads.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
        if (max - min).abs() < f64::EPSILON {
            return vec![1.0; snapshots.len()];
        }
        loads.iter().map(|l| 1.0 - (l - min) / (max - min)).collect()
    }
}

/// `1 - utilization`.
#[derive(Debug, Default)]
pub struct KvUtilization;

impl KvUtilization {
    pub fn score(snapshot: &RoutingSnapshot) -> f64 {
        1.0 - snapshot.kv_utilization
    }
}

/// `1 / (1 + EffectiveLoad)`.
#[derive(Debug, Default)]
pub struct LoadBalance;

impl LoadBalance {
    pub fn score(snapshot: &RoutingSnapshot) -> f64 {
        1.0 / (1.0 + snapshot.effective_load())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(instance: u32, queue_depth: u32, batch_size: u32, pending: u32, kv_util: f64) -> RoutingSnapshot {
        RoutingSnapshot {
            instance,
            queue_depth,
            batch_size,
            kv_utilization: kv_util,
            free_kv_blocks: 0,
            cache_hit_rate: 0.0,
            pending_requests: pending,
        }
    }

    #[test]
    fn kv_utilization_is_inverted_utilization() {
        assert_eq!(KvUtilization::score(&snapshot(0, 0, 0, 0, 0.25)), 0.75);
    }

    #[test]
    fn load_balance_decreases_with_load() {
        let light = LoadBalance::score(&snapshot(0, 0, 0, 0, 0.0));
        let heavy = LoadBalance::score(&snapshot(0, 10, 10, 10, 0.0));
        assert!(light > heavy);
        assert!(heavy > 0.0);
    }

    #[test]
    fn queue_depth_scores_are_in_unit_range_and_favor_lower_load() {
        let snaps = vec![
            snapshot(0, 0, 0, 0, 0.0),
            snapshot(1, 10, 10, 10, 0.0),
        ];
        let scores = QueueDepth::score_all(&snaps);
        assert!(scores.iter().all(|s| (0.0..=1.0).contains(s)));
        assert!(scores[0] > scores[1]);
    }

    #[test]
    fn queue_depth_handles_uniform_load_without_dividing_by_zero() {
        let snaps = vec![snapshot(0, 5, 5, 5, 0.0), snapshot(1, 5, 5, 5, 0.0)];
        let scores = QueueDepth::score_all(&snaps);
        assert_eq!(scores, vec![1.0, 1.0]);
    }
}
