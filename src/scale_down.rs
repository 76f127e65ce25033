//! C9 — Scale-Down Safety.
//!
//! Per-pod schedulability simulation across remaining candidate nodes,
//! guarded by single-replica/local-storage/PDB/system-critical checks, with
//! precise blocking reasons. This module takes pre-assembled snapshots
//! (no direct Kubernetes API calls) so it is exhaustively unit-testable;
//! the instance/pool reconcilers are responsible for building
//! [`CandidateNode`] and the remaining-node snapshots from live cluster
//! state.

use k8s_openapi::api::core::v1::Pod;

use crate::scheduling::{self, NodeWithPods};

#[derive(Debug, Clone)]
pub struct PodOnNode {
    pub pod: Pod,
    pub is_daemonset: bool,
    pub controlled_by_replicated_controller: bool,
    pub has_local_storage: bool,
    pub safe_to_evict: bool,
    pub pdb_blocked: bool,
    pub single_replica_system: bool,
}

fn pod_ref(pod: &Pod) -> String {
    format!("{}/{}", pod.metadata.namespace.as_deref().unwrap_or(""), pod.metadata.name.as_deref().unwrap_or(""))
}

#[derive(Debug, Clone)]
pub struct CandidateNode {
    pub name: String,
    pub externally_cordoned: bool,
    pub scale_down_disabled: bool,
    pub pods: Vec<PodOnNode>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ScaleDownVerdict {
    Safe,
    Blocked(String),
}

/// Evaluates whether `candidate` may safely be scaled down given the set of
/// `remaining_nodes` that would still exist afterward. DaemonSet pods are
/// ignored entirely — they are expected to be rescheduled by the DaemonSet
/// controller, not by this simulation. Fails fast on the first blocking
/// pod, in the order the spec lists the guards.
pub fn evaluate_candidate(candidate: &CandidateNode, remaining_nodes: &[NodeWithPods]) -> ScaleDownVerdict {
    if candidate.externally_cordoned {
        return ScaleDownVerdict::Blocked(format!("node {} is cordoned by an external actor", candidate.name));
    }
    if candidate.scale_down_disabled {
        return ScaleDownVerdict::Blocked(format!("node {} carries the scale-down-disabled annotation", candidate.name));
    }

    for p in &candidate.pods {
        if p.is_daemonset {
            continue;
        }

        let name = pod_ref(&p.pod);

        if p.single_replica_system {
            return ScaleDownVerdict::Blocked(format!("pod {name} is a single-replica system pod"));
        }
        if !p.controlled_by_replicated_controller {
            return ScaleDownVerdict::Blocked(format!("pod {name} is not controlled by a replicated controller"));
        }
        if p.has_local_storage && !p.safe_to_evict {
            return ScaleDownVerdict::Blocked(format!("pod {name} uses local storage without a safe-to-evict annotation"));
        }
        if p.pdb_blocked {
            return ScaleDownVerdict::Blocked(format!("pod {name} is blocked by a PodDisruptionBudget"));
        }

        if !evictable_pod_reschedulable(&p.pod, remaining_nodes) {
            return ScaleDownVerdict::Blocked(format!("pod {name} has no schedulable remaining node"));
        }
    }

    ScaleDownVerdict::Safe
}

fn evictable_pod_reschedulable(pod: &Pod, remaining_nodes: &[NodeWithPods]) -> bool {
    remaining_nodes.iter().any(|node| scheduling::pod_fits_node(pod, node).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pod(name: &str) -> Pod {
        Pod { metadata: ObjectMeta { name: Some(name.to_string()), namespace: Some("default".to_string()), ..Default::default() }, spec: Some(Default::default()), status: None }
    }

    fn pod_on_node(name: &str) -> PodOnNode {
        PodOnNode { pod: pod(name), is_daemonset: false, controlled_by_replicated_controller: true, has_local_storage: false, safe_to_evict: true, pdb_blocked: false, single_replica_system: false }
    }

    fn remaining_node() -> NodeWithPods {
        NodeWithPods { labels: Default::default(), taints: vec![], pod_labels: vec![] }
    }

    #[test]
    fn safe_when_all_pods_reschedulable() {
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![pod_on_node("a")] };
        assert_eq!(evaluate_candidate(&candidate, &[remaining_node()]), ScaleDownVerdict::Safe);
    }

    #[test]
    fn blocked_by_external_cordon() {
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: true, scale_down_disabled: false, pods: vec![] };
        assert!(matches!(evaluate_candidate(&candidate, &[]), ScaleDownVerdict::Blocked(_)));
    }

    #[test]
    fn blocked_by_scale_down_disabled_annotation() {
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: true, pods: vec![] };
        assert!(matches!(evaluate_candidate(&candidate, &[]), ScaleDownVerdict::Blocked(_)));
    }

    #[test]
    fn blocked_by_pdb() {
        let mut p = pod_on_node("a");
        p.pdb_blocked = true;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        let verdict = evaluate_candidate(&candidate, &[remaining_node()]);
        assert_eq!(verdict, ScaleDownVerdict::Blocked("pod default/a is blocked by a PodDisruptionBudget".to_string()));
    }

    #[test]
    fn blocked_by_unsafe_local_storage() {
        let mut p = pod_on_node("a");
        p.has_local_storage = true;
        p.safe_to_evict = false;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        assert!(matches!(evaluate_candidate(&candidate, &[remaining_node()]), ScaleDownVerdict::Blocked(_)));
    }

    #[test]
    fn local_storage_with_safe_to_evict_is_allowed() {
        let mut p = pod_on_node("a");
        p.has_local_storage = true;
        p.safe_to_evict = true;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        assert_eq!(evaluate_candidate(&candidate, &[remaining_node()]), ScaleDownVerdict::Safe);
    }

    #[test]
    fn blocked_by_unreplicated_controller() {
        let mut p = pod_on_node("a");
        p.controlled_by_replicated_controller = false;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        assert!(matches!(evaluate_candidate(&candidate, &[remaining_node()]), ScaleDownVerdict::Blocked(_)));
    }

    #[test]
    fn blocked_when_no_remaining_node_fits() {
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![pod_on_node("a")] };
        assert!(matches!(evaluate_candidate(&candidate, &[]), ScaleDownVerdict::Blocked(_)));
    }

    #[test]
    fn daemonset_pods_are_ignored() {
        let mut p = pod_on_node("a");
        p.is_daemonset = true;
        p.controlled_by_replicated_controller = false;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        assert_eq!(evaluate_candidate(&candidate, &[]), ScaleDownVerdict::Safe);
    }

    #[test]
    fn single_replica_system_pod_blocks() {
        let mut p = pod_on_node("a");
        p.single_replica_system = true;
        let candidate = CandidateNode { name: "n1".to_string(), externally_cordoned: false, scale_down_disabled: false, pods: vec![p] };
        assert!(matches!(evaluate_candidate(&candidate, &[remaining_node()]), ScaleDownVerdict::Blocked(_)));
    }
}
