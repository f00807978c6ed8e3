//! Decision tracing and counterfactual regret (spec.md §4.14, §9 glossary
//! "Counterfactual regret").
//!
//! A [`TraceRecorder`] is only ever constructed when [`crate::config::TraceLevel`]
//! is not `Off`; at `Off` [`crate::cluster::ClusterOrchestrator`] simply holds
//! `None` and none of this module's cost is paid.

use serde::{Deserialize, Serialize};

use crate::policy::routing::RoutingPolicy;
use crate::prefix_index::PrefixCacheIndex;
use crate::request::RequestId;

/// One routing decision, with enough context to compute counterfactual
/// regret after the fact: how much better the best-scoring alternative
/// looked than the instance actually chosen.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionTrace {
    pub request: RequestId,
    pub chosen: u32,
    pub chosen_score: f64,
    /// Top-`counterfactual_k` alternatives by score, excluding `chosen`,
    /// sorted descending.
    pub alternatives: Vec<(u32, f64)>,
    /// `max(0, best_alternative_score - chosen_score)` — zero when `chosen`
    /// was itself the best-scoring instance.
    pub regret: f64,
}

/// Records one [`DecisionTrace`] per routing decision while tracing is on.
#[derive(Debug, Default)]
pub struct TraceRecorder {
    records: Vec<DecisionTrace>,
}

impl TraceRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds and stores a trace for a routing decision, using
    /// [`RoutingPolicy::trace_scores`] to recover every instance's score
    /// (not just the chosen one) and keeping the top `counterfactual_k`
    /// non-chosen alternatives by score.
    pub fn record(
        &mut self,
        request: RequestId,
        chosen: u32,
        policy: &dyn RoutingPolicy,
        snapshots: &[crate::policy::routing::RoutingSnapshot],
        block_hashes: &[u64],
        prefix_index: &PrefixCacheIndex,
        counterfactual_k: u32,
    ) {
        let mut scores = policy.trace_scores(snapshots, block_hashes, prefix_index);
        scores.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let chosen_score = scores
            .iter()
            .find(|(instance, _)| *instance == chosen)
            .map(|(_, s)| *s)
            .unwrap_or(f64::NEG_INFINITY);
        let alternatives: Vec<(u32, f64)> = scores
            .iter()
            .filter(|(instance, _)| *instance != chosen)
            .take(counterfactual_k as usize)
            .copied()
            .collect();
        let best_score = scores
            .first()
            .map(|(_, s)| *s)
            .unwrap_or(chosen_score);
        let regret = (best_score - chosen_score).max(0.0);
        self.records.push(DecisionTrace {
            request,
            chosen,
            chosen_score,
            alternatives,
            regret,
        });
    }

    pub fn records(&self) -> &[DecisionTrace] {
        &self.records
    }

    pub fn mean_regret(&self) -> f64 {
        if self.records.is_empty() {
            return 0.0;
        }
        self.records.iter().map(|r| r.regret).sum::<f64>() / self.records.len() as f64
    }

    pub fn into_records(self) -> Vec<DecisionTrace> {
        self.records
    }
}
