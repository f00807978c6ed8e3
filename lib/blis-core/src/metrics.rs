//! Metrics, distributions, and aggregation (spec.md §4.14).
//!
//! Every [`RequestRecord`] is built once, through [`RequestRecord::from_completed`]
//! (spec.md §9 "canonical constructors") — no call site assembles one field
//! by field. Aggregation always sorts its keys before iterating (spec.md §9
//! "sort before iterating over mappings"), since hash-table order is not a
//! stable API and the deterministic output stream must be byte-identical
//! across runs (INV-6).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::event::Tick;
use crate::request::{Request, RequestId};

/// One completed request's recorded metrics (spec.md §4.14).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RequestRecord {
    pub request: RequestId,
    pub instance: u32,
    pub slo_class: Option<String>,
    pub tenant: Option<String>,
    pub arrival: Tick,
    /// Time from arrival to first output token.
    pub ttft: Tick,
    /// Time from arrival to the last output token.
    pub e2e: Tick,
    pub itl: Vec<Tick>,
    /// `schedule_time - arrival`, including any admission/routing/queueing
    /// delay (spec.md §4.14 "includes α-queueing").
    pub scheduling_delay: Tick,
}

impl RequestRecord {
    /// The only place a [`RequestRecord`] is assembled. Panics if `request`
    /// has not actually completed — callers only call this from
    /// [`crate::cluster::ClusterOrchestrator`]'s `RequestLeft` handling for
    /// requests found in its `completed` list.
    pub fn from_completed(request: &Request) -> Self {
        let arrival = request.arrival;
        let first_token = request
            .first_token_time
            .expect("completed request must have a first_token_time (INV-5)");
        let completion = request
            .completion_time
            .expect("completed request must have a completion_time");
        let schedule = request.schedule_time.unwrap_or(arrival);
        Self {
            request: request.id,
            instance: request.assigned_instance.expect("completed request must be assigned"),
            slo_class: request.slo_class.clone(),
            tenant: request.tenant.clone(),
            arrival,
            ttft: first_token - arrival,
            e2e: completion - arrival,
            itl: request.itl.clone(),
            scheduling_delay: schedule - arrival,
        }
    }
}

/// Exact order-statistics histogram: a sorted `Vec<u64>`, re-sorted lazily
/// on first read after a write. Deterministic and simple at simulation
/// scale; no streaming quantile sketch is needed.
#[derive(Debug, Clone, Default)]
pub struct Histogram {
    values: Vec<u64>,
    sorted: bool,
}

/// Serializable snapshot of a [`Histogram`], the shape the deterministic
/// output stream actually carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct HistogramSummary {
    pub count: u64,
    pub mean: f64,
    pub p50: u64,
    pub p90: u64,
    pub p95: u64,
    pub p99: u64,
    pub min: u64,
    pub max: u64,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, value: u64) {
        self.values.push(value);
        self.sorted = false;
    }

    fn ensure_sorted(&mut self) {
        if !self.sorted {
            self.values.sort_unstable();
            self.sorted = true;
        }
    }

    pub fn count(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.values.is_empty() {
            return 0.0;
        }
        self.values.iter().sum::<u64>() as f64 / self.values.len() as f64
    }

    /// `p` in `[0, 100]`. Nearest-rank method: index `ceil(p/100 * n) - 1`,
    /// clamped into range. Requires the values to be sorted first.
    fn percentile_sorted(sorted: &[u64], p: f64) -> u64 {
        if sorted.is_empty() {
            return 0;
        }
        let n = sorted.len();
        let rank = ((p / 100.0) * n as f64).ceil() as usize;
        let idx = rank.saturating_sub(1).min(n - 1);
        sorted[idx]
    }

    pub fn percentile(&mut self, p: f64) -> u64 {
        self.ensure_sorted();
        Self::percentile_sorted(&self.values, p)
    }

    pub fn min(&mut self) -> u64 {
        self.ensure_sorted();
        self.values.first().copied().unwrap_or(0)
    }

    pub fn max(&mut self) -> u64 {
        self.ensure_sorted();
        self.values.last().copied().unwrap_or(0)
    }

    pub fn summary(&mut self) -> HistogramSummary {
        self.ensure_sorted();
        HistogramSummary {
            count: self.values.len() as u64,
            mean: self.mean(),
            p50: Self::percentile_sorted(&self.values, 50.0),
            p90: Self::percentile_sorted(&self.values, 90.0),
            p95: Self::percentile_sorted(&self.values, 95.0),
            p99: Self::percentile_sorted(&self.values, 99.0),
            min: self.values.first().copied().unwrap_or(0),
            max: self.values.last().copied().unwrap_or(0),
        }
    }
}

/// A key under which requests are bucketed for aggregation. Ordered so
/// `MetricsRegistry::aggregate` can sort before it iterates (spec.md §9).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Scope {
    Cluster,
    Instance(u32),
    SloClass(String),
    Tenant(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScopedSummary {
    pub scope: Scope,
    pub ttft: HistogramSummary,
    pub e2e: HistogramSummary,
    pub scheduling_delay: HistogramSummary,
}

/// Counters the serializer must expose so an external verifier can check
/// INV-1 and INV-4 without re-running the simulation (spec.md §6).
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ConservationCounters {
    pub injected: u64,
    pub completed: u64,
    pub still_queued: u64,
    pub still_running: u64,
    pub dropped_unservable: u64,
    pub rejected: u64,
    pub preemptions: u64,
    pub alloc_failures: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AggregateReport {
    pub counters: ConservationCounters,
    /// Sorted by [`Scope`]'s `Ord` — cluster, then instances ascending,
    /// then SLO classes alphabetically, then tenants alphabetically.
    pub by_scope: Vec<ScopedSummary>,
    pub jain_fairness_index: Option<f64>,
}

/// Accumulates [`RequestRecord`]s into per-scope histograms as they
/// complete. [`crate::cluster::ClusterOrchestrator`] feeds it one record per
/// `RequestLeft` for a completed (not dropped) request.
#[derive(Debug, Default)]
pub struct MetricsRegistry {
    ttft: BTreeMap<ScopeKey, Histogram>,
    e2e: BTreeMap<ScopeKey, Histogram>,
    scheduling_delay: BTreeMap<ScopeKey, Histogram>,
    tenant_output_tokens: BTreeMap<String, u64>,
    tenant_span: BTreeMap<String, (Tick, Tick)>,
    all_records: Vec<RequestRecord>,
}

/// The deterministic stdout shape (spec.md §6): one value, written once, at
/// the very end of the run. `blis-run` is the only writer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulationReport {
    pub per_request: Vec<RequestRecord>,
    pub aggregate: AggregateReport,
    pub trace: Option<Vec<crate::trace::DecisionTrace>>,
}

/// Internal map key — `Scope` itself isn't `Copy`/cheap to re-derive per
/// histogram bucket, so the three parallel maps key off this instead, kept
/// in lockstep with the public [`Scope`] via [`ScopeKey::scope`].
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum ScopeKey {
    Cluster,
    Instance(u32),
    SloClass(String),
    Tenant(String),
}

impl ScopeKey {
    fn scope(&self) -> Scope {
        match self {
            ScopeKey::Cluster => Scope::Cluster,
            ScopeKey::Instance(i) => Scope::Instance(*i),
            ScopeKey::SloClass(s) => Scope::SloClass(s.clone()),
            ScopeKey::Tenant(t) => Scope::Tenant(t.clone()),
        }
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, rec: &RequestRecord) {
        self.all_records.push(rec.clone());
        let mut keys = vec![ScopeKey::Cluster, ScopeKey::Instance(rec.instance)];
        if let Some(slo) = &rec.slo_class {
            keys.push(ScopeKey::SloClass(slo.clone()));
        }
        if let Some(tenant) = &rec.tenant {
            keys.push(ScopeKey::Tenant(tenant.clone()));
        }
        for key in keys {
            self.ttft.entry(key.clone()).or_default().record(rec.ttft);
            self.e2e.entry(key.clone()).or_default().record(rec.e2e);
            self.scheduling_delay.entry(key).or_default().record(rec.scheduling_delay);
        }
        if let Some(tenant) = &rec.tenant {
            let output_tokens = rec.itl.len() as u64 + 1; // ITL count + the first token
            *self.tenant_output_tokens.entry(tenant.clone()).or_insert(0) += output_tokens;
            let span = self
                .tenant_span
                .entry(tenant.clone())
                .or_insert((rec.arrival, rec.arrival + rec.e2e));
            span.0 = span.0.min(rec.arrival);
            span.1 = span.1.max(rec.arrival + rec.e2e);
        }
    }

    /// Jain's fairness index across tenant throughputs (output tokens per
    /// tick of that tenant's observed span). `None` if fewer than two
    /// tenants were recorded — fairness across one tenant is undefined, not
    /// 1.0 by convention here, since there is nothing to be fair *between*.
    pub fn jain_fairness_index(&self) -> Option<f64> {
        if self.tenant_output_tokens.len() < 2 {
            return None;
        }
        let throughputs: Vec<f64> = self
            .tenant_output_tokens
            .iter()
            .map(|(tenant, tokens)| {
                let (start, end) = self.tenant_span[tenant];
                let span = (end - start).max(1) as f64;
                *tokens as f64 / span
            })
            .collect();
        let n = throughputs.len() as f64;
        let sum: f64 = throughputs.iter().sum();
        let sum_sq: f64 = throughputs.iter().map(|x| x * x).sum();
        if sum_sq == 0.0 {
            return Some(1.0);
        }
        Some((sum * sum) / (n * sum_sq))
    }

    /// Every recorded [`RequestRecord`], in completion order (spec.md §6
    /// `SimulationReport::per_request`).
    pub fn records(&self) -> &[RequestRecord] {
        &self.all_records
    }

    pub fn aggregate(&mut self, counters: ConservationCounters) -> AggregateReport {
        let mut scope_keys: Vec<ScopeKey> = self.ttft.keys().cloned().collect();
        scope_keys.sort();
        let by_scope = scope_keys
            .into_iter()
            .map(|key| ScopedSummary {
                scope: key.scope(),
                ttft: self.ttft.get_mut(&key).expect("key came from this map").summary(),
                e2e: self.e2e.get_mut(&key).expect("key came from this map").summary(),
                scheduling_delay: self
                    .scheduling_delay
                    .get_mut(&key)
                    .expect("key came from this map")
                    .summary(),
            })
            .collect();
        AggregateReport {
            counters,
            by_scope,
            jain_fairness_index: self.jain_fairness_index(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::RequestState;

    fn completed_request(
        id: u32,
        instance: u32,
        tenant: Option<&str>,
        arrival: Tick,
        ttft: Tick,
        e2e: Tick,
    ) -> Request {
        let mut r = Request::new(
            RequestId(id),
            arrival,
            16,
            4,
            None,
            None,
            None,
            tenant.map(String::from),
            None,
        );
        r.assigned_instance = Some(instance);
        r.schedule_time = Some(arrival);
        r.first_token_time = Some(arrival + ttft);
        r.completion_time = Some(arrival + e2e);
        r.itl = vec![1, 1, 1];
        r.state = RequestState::Completed;
        r
    }

    #[test]
    fn histogram_percentiles_on_known_data() {
        let mut h = Histogram::new();
        for v in 1..=100u64 {
            h.record(v);
        }
        let s = h.summary();
        assert_eq!(s.min, 1);
        assert_eq!(s.max, 100);
        assert_eq!(s.p50, 50);
        assert_eq!(s.p99, 99);
        assert_eq!(s.count, 100);
    }

    #[test]
    fn empty_histogram_summary_is_all_zero() {
        let mut h = Histogram::new();
        let s = h.summary();
        assert_eq!(s.count, 0);
        assert_eq!(s.mean, 0.0);
        assert_eq!(s.p50, 0);
    }

    #[test]
    fn request_record_computes_ttft_e2e_and_scheduling_delay() {
        let req = completed_request(0, 0, None, 100, 20, 80);
        let rec = RequestRecord::from_completed(&req);
        assert_eq!(rec.ttft, 20);
        assert_eq!(rec.e2e, 80);
        assert_eq!(rec.scheduling_delay, 0);
    }

    #[test]
    fn aggregate_buckets_by_cluster_instance_and_tenant() {
        let mut reg = MetricsRegistry::new();
        reg.record(&RequestRecord::from_completed(&completed_request(0, 0, Some("acme"), 0, 10, 50)));
        reg.record(&RequestRecord::from_completed(&completed_request(1, 1, Some("acme"), 0, 30, 90)));
        let report = reg.aggregate(ConservationCounters::default());
        let scopes: Vec<&Scope> = report.by_scope.iter().map(|s| &s.scope).collect();
        assert!(scopes.contains(&&Scope::Cluster));
        assert!(scopes.contains(&&Scope::Instance(0)));
        assert!(scopes.contains(&&Scope::Instance(1)));
        assert!(scopes.contains(&&Scope::Tenant("acme".to_string())));
        let cluster = report.by_scope.iter().find(|s| s.scope == Scope::Cluster).unwrap();
        assert_eq!(cluster.ttft.count, 2);
    }

    #[test]
    fn scope_keys_are_sorted_cluster_first_then_instances_then_names() {
        let mut reg = MetricsRegistry::new();
        reg.record(&RequestRecord::from_completed(&completed_request(0, 2, Some("zeta"), 0, 10, 50)));
        reg.record(&RequestRecord::from_completed(&completed_request(1, 0, Some("acme"), 0, 10, 50)));
        let report = reg.aggregate(ConservationCounters::default());
        assert_eq!(report.by_scope[0].scope, Scope::Cluster);
        let instance_positions: Vec<usize> = report
            .by_scope
            .iter()
            .enumerate()
            .filter(|(_, s)| matches!(s.scope, Scope::Instance(_)))
            .map(|(i, _)| i)
            .collect();
        assert_eq!(instance_positions, vec![1, 2]); // Instance(0) before Instance(2)
    }

    #[test]
    fn jain_fairness_is_one_for_equal_throughputs() {
        let mut reg = MetricsRegistry::new();
        reg.record(&RequestRecord::from_completed(&completed_request(0, 0, Some("a"), 0, 10, 100)));
        reg.record(&RequestRecord::from_completed(&completed_request(1, 0, Some("b"), 0, 10, 100)));
        let idx = reg.jain_fairness_index().unwrap();
        assert!((idx - 1.0).abs() < 1e-9);
    }

    #[test]
    fn jain_fairness_is_none_with_fewer_than_two_tenants() {
        let mut reg = MetricsRegistry::new();
        reg.record(&RequestRecord::from_completed(&completed_request(0, 0, Some("a"), 0, 10, 100)));
        assert_eq!(reg.jain_fairness_index(), None);
    }
}
