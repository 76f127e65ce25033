//! C12 — Metrics & Health (registry definitions).
//!
//! One process-wide `Registry`, scraped at `/metrics` by the HTTP server
//! assembled in `commands::operator`. Every reconciler and pipeline stage
//! increments its own statics here rather than holding a local counter,
//! matching the teacher's per-concern metric naming.

use std::sync::LazyLock;

use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

fn counter(name: &str, help: &str) -> IntCounter {
    let c = IntCounter::new(name, help).expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
}

fn counter_vec(name: &str, help: &str, labels: &[&str]) -> IntCounterVec {
    let c = IntCounterVec::new(Opts::new(name, help), labels).expect("metric definition is valid");
    REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
}

fn gauge(name: &str, help: &str) -> IntGauge {
    let g = IntGauge::new(name, help).expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
}

fn gauge_vec(name: &str, help: &str, labels: &[&str]) -> IntGaugeVec {
    let g = IntGaugeVec::new(Opts::new(name, help), labels).expect("metric definition is valid");
    REGISTRY.register(Box::new(g.clone())).expect("metric not yet registered");
    g
}

fn histogram(name: &str, help: &str) -> Histogram {
    let h = Histogram::with_opts(HistogramOpts::new(name, help)).expect("metric definition is valid");
    REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
}

pub static NODEGROUP_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("nodegroup_reconcile_total", "Total NodeGroup reconciliation cycles"));
pub static NODEGROUP_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| counter("nodegroup_reconcile_errors_total", "Total NodeGroup reconciliation errors"));
pub static NODEGROUP_CURRENT_NODES: LazyLock<IntGaugeVec> = LazyLock::new(|| gauge_vec("nodegroup_current_nodes", "Current node count per pool", &["pool"]));
pub static NODEGROUP_DESIRED_NODES: LazyLock<IntGaugeVec> = LazyLock::new(|| gauge_vec("nodegroup_desired_nodes", "Desired node count per pool", &["pool"]));

pub static VPSIENODE_RECONCILE_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("vpsienode_reconcile_total", "Total VPSieNode reconciliation cycles"));
pub static VPSIENODE_RECONCILE_ERRORS: LazyLock<IntCounter> = LazyLock::new(|| counter("vpsienode_reconcile_errors_total", "Total VPSieNode reconciliation errors"));
pub static VPSIENODE_PHASE_TRANSITIONS: LazyLock<IntCounterVec> = LazyLock::new(|| counter_vec("vpsienode_phase_transitions_total", "Instance phase transitions", &["from", "to"]));

pub static DISCOVERY_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("discovery_timeouts_total", "Instances that exhausted the discovery budget"));
pub static DRAIN_TIMEOUTS_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("drain_timeouts_total", "Instances whose drain exceeded the per-node deadline with pods still present"));

pub static SCHEDULING_EVENTS_BUFFERED: LazyLock<IntGauge> = LazyLock::new(|| gauge("scheduling_events_buffered", "Scheduling-failure events currently buffered"));
pub static SCHEDULING_EVENTS_DROPPED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("scheduling_events_dropped_total", "Scheduling-failure events dropped due to the hard cap"));

pub static SCALE_UP_TRIGGERED_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| counter_vec("scale_up_triggered_total", "Scale-up decisions per pool", &["pool"]));
pub static DYNAMIC_POOLS_CREATED_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("dynamic_pools_created_total", "Pools synthesised by the dynamic pool creator"));

pub static SCALE_DOWN_CANDIDATES_TOTAL: LazyLock<IntCounterVec> = LazyLock::new(|| counter_vec("scale_down_candidates_total", "Scale-down candidate verdicts", &["pool", "verdict"]));

pub static MIGRATION_PLAN_BATCHES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("migration_plan_batches_total", "Rebalancer migration batches executed"));
pub static MIGRATION_PLAN_FAILURES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("migration_plan_failures_total", "Rebalancer migration batches that halted on failure"));

pub static PROVIDER_REQUEST_DURATION: LazyLock<Histogram> = LazyLock::new(|| histogram("provider_request_duration_seconds", "Provider API request latency"));
pub static PROVIDER_RETRIES_TOTAL: LazyLock<IntCounter> = LazyLock::new(|| counter("provider_retries_total", "Provider API calls retried after a transient error"));

/// Forces every metric to register before the first scrape, so `/metrics`
/// lists them even if their code path hasn't executed yet.
pub fn init() {
    LazyLock::force(&NODEGROUP_RECONCILE_TOTAL);
    LazyLock::force(&NODEGROUP_RECONCILE_ERRORS);
    LazyLock::force(&NODEGROUP_CURRENT_NODES);
    LazyLock::force(&NODEGROUP_DESIRED_NODES);
    LazyLock::force(&VPSIENODE_RECONCILE_TOTAL);
    LazyLock::force(&VPSIENODE_RECONCILE_ERRORS);
    LazyLock::force(&VPSIENODE_PHASE_TRANSITIONS);
    LazyLock::force(&DISCOVERY_TIMEOUTS_TOTAL);
    LazyLock::force(&DRAIN_TIMEOUTS_TOTAL);
    LazyLock::force(&SCHEDULING_EVENTS_BUFFERED);
    LazyLock::force(&SCHEDULING_EVENTS_DROPPED_TOTAL);
    LazyLock::force(&SCALE_UP_TRIGGERED_TOTAL);
    LazyLock::force(&DYNAMIC_POOLS_CREATED_TOTAL);
    LazyLock::force(&SCALE_DOWN_CANDIDATES_TOTAL);
    LazyLock::force(&MIGRATION_PLAN_BATCHES_TOTAL);
    LazyLock::force(&MIGRATION_PLAN_FAILURES_TOTAL);
    LazyLock::force(&PROVIDER_REQUEST_DURATION);
    LazyLock::force(&PROVIDER_RETRIES_TOTAL);
}
