mod common;

use chrono::Utc;
use common::make_test_pool_spec;
use vpsie_autoscaler::crd::{NodeGroupStatus, ScaleUpPolicy};
use vpsie_autoscaler::pool_controller::{scale_target, stabilization_gate, StabilizationGate};
use vpsie_autoscaler::scale_down::{self, CandidateNode, PodOnNode, ScaleDownVerdict};
use vpsie_autoscaler::scheduling::NodeWithPods;

// ══════════════════════════════════════════════════════════════════
// Pool reconcile integration tests (no cluster required)
//
// Exercises the Pool reconciler's decision pipeline end-to-end against a
// synthetic Instance list: target clamping → stabilization/cooldown gate
// for scale-up, and per-candidate schedulability simulation for scale-down.
// Mirrors `pool_controller::converge` without needing a live Client.
// ══════════════════════════════════════════════════════════════════

fn candidate(name: &str, cordoned: bool, pods: Vec<PodOnNode>) -> CandidateNode {
    CandidateNode { name: name.to_string(), externally_cordoned: cordoned, scale_down_disabled: false, pods }
}

fn replicated_pod() -> PodOnNode {
    PodOnNode {
        pod: k8s_openapi::api::core::v1::Pod::default(),
        is_daemonset: false,
        controlled_by_replicated_controller: true,
        has_local_storage: false,
        safe_to_evict: false,
        pdb_blocked: false,
        single_replica_system: false,
    }
}

/// Decides whether each `candidates` entry is safe to drain, up to
/// `surplus`, the same stop-when-satisfied order `mark_surplus_for_draining`
/// uses.
fn simulate_scale_down_batch(candidates: &[CandidateNode], remaining: &[NodeWithPods], surplus: usize) -> Vec<String> {
    let mut drained = Vec::new();
    for c in candidates {
        if drained.len() >= surplus {
            break;
        }
        if let ScaleDownVerdict::Safe = scale_down::evaluate_candidate(c, remaining) {
            drained.push(c.name.clone());
        }
    }
    drained
}

// ── Scale target clamping ──

#[test]
fn target_clamps_desired_into_min_max_range() {
    let spec = make_test_pool_spec(2, 5, vec!["small"], "dc1");
    let status = NodeGroupStatus { desired_nodes: 0, ..Default::default() };
    assert_eq!(scale_target(&spec, &status), 2);

    let status = NodeGroupStatus { desired_nodes: 20, ..Default::default() };
    assert_eq!(scale_target(&spec, &status), 5);
}

#[test]
fn target_falls_back_to_min_nodes_when_min_exceeds_max() {
    let mut spec = make_test_pool_spec(5, 3, vec!["small"], "dc1");
    spec.min_nodes = 5;
    spec.max_nodes = 3;
    let status = NodeGroupStatus { desired_nodes: 4, ..Default::default() };
    assert_eq!(scale_target(&spec, &status), 5);
}

// ── Scale-up stabilization / cooldown gate ──

#[test]
fn scale_up_proceeds_immediately_without_a_policy() {
    let status = NodeGroupStatus::default();
    let gate = stabilization_gate(&status, &ScaleUpPolicy::default(), Utc::now());
    assert_eq!(gate, StabilizationGate::Clear);
}

#[test]
fn scale_up_waits_for_a_fresh_below_target_signal_to_stabilize() {
    let now = Utc::now();
    let status = NodeGroupStatus { scale_up_pending_since: Some(now.to_rfc3339()), ..Default::default() };
    let policy = ScaleUpPolicy { stabilization_window_seconds: Some(120), ..Default::default() };
    let gate = stabilization_gate(&status, &policy, now + chrono::Duration::seconds(10));
    assert_eq!(gate, StabilizationGate::NotYetStable { since: now });
}

#[test]
fn scale_up_clears_once_the_stabilization_window_elapses() {
    let now = Utc::now();
    let status = NodeGroupStatus { scale_up_pending_since: Some(now.to_rfc3339()), ..Default::default() };
    let policy = ScaleUpPolicy { stabilization_window_seconds: Some(60), ..Default::default() };
    let gate = stabilization_gate(&status, &policy, now + chrono::Duration::seconds(61));
    assert_eq!(gate, StabilizationGate::Clear);
}

#[test]
fn scale_up_is_suppressed_during_cooldown_even_with_no_stabilization_window() {
    let now = Utc::now();
    let status = NodeGroupStatus { last_scale_up_at: Some(now.to_rfc3339()), ..Default::default() };
    let policy = ScaleUpPolicy { cooldown_seconds: Some(300), ..Default::default() };
    let gate = stabilization_gate(&status, &policy, now + chrono::Duration::seconds(30));
    assert!(matches!(gate, StabilizationGate::InCooldown { .. }));
}

// ── Scale-down candidate selection ──

#[test]
fn scale_down_drains_ready_candidates_up_to_the_surplus() {
    let nodes = vec![
        candidate("node-a", false, vec![replicated_pod()]),
        candidate("node-b", false, vec![replicated_pod()]),
        candidate("node-c", false, vec![replicated_pod()]),
    ];
    let remaining = vec![NodeWithPods::default(), NodeWithPods::default()];

    let drained = simulate_scale_down_batch(&nodes, &remaining, 2);

    assert_eq!(drained, vec!["node-a".to_string(), "node-b".to_string()]);
}

#[test]
fn scale_down_skips_externally_cordoned_nodes_and_tries_the_next_candidate() {
    let nodes = vec![candidate("node-a", true, vec![]), candidate("node-b", false, vec![])];
    let remaining = vec![];

    let drained = simulate_scale_down_batch(&nodes, &remaining, 1);

    assert_eq!(drained, vec!["node-b".to_string()]);
}

#[test]
fn scale_down_stops_once_surplus_is_satisfied_even_with_more_safe_candidates() {
    let nodes = vec![candidate("node-a", false, vec![]), candidate("node-b", false, vec![]), candidate("node-c", false, vec![])];
    let remaining = vec![];

    let drained = simulate_scale_down_batch(&nodes, &remaining, 1);

    assert_eq!(drained, vec!["node-a".to_string()]);
}

#[test]
fn scale_down_of_zero_surplus_drains_nothing() {
    let nodes = vec![candidate("node-a", false, vec![])];
    let drained = simulate_scale_down_batch(&nodes, &[], 0);
    assert!(drained.is_empty());
}
