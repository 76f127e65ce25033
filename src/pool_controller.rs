//! C4 — Pool Reconciler (NodeGroup reconciler).
//!
//! Converges a Pool's observed Instance set toward its desired count,
//! clamped to `[min, max]`. Scale-up creates Instance records for C3 to
//! provision; scale-down delegates candidate selection to C9 and marks the
//! chosen Instances for draining rather than deleting them directly.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{LabelSelector, Node, Pod};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::{Condition, InstancePhase, NodeGroup, NodeGroupPhase, NodeGroupStatus, VPSieNode, VPSieNodeSpec};
use crate::managed;
use crate::metrics;
use crate::scale_down::{self, CandidateNode, PodOnNode, ScaleDownVerdict};
use crate::scheduling::{NodeWithPods, Taint};

pub const FINALIZER: &str = "vpsie.example.com/pool-cleanup";
const DEFAULT_REQUEUE: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

const REPLICATED_OWNER_KINDS: [&str; 4] = ["ReplicaSet", "StatefulSet", "DaemonSet", "Job"];
const SAFE_TO_EVICT_ANNOTATION: &str = "cluster-autoscaler.kubernetes.io/safe-to-evict";
const SCALE_DOWN_DISABLED_ANNOTATION: &str = "vpsie.example.com/scale-down-disabled";

pub struct PoolContext {
    pub client: Client,
}

fn has_finalizer(pool: &NodeGroup) -> bool {
    pool.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn patch_finalizer(client: &Client, namespace: &str, name: &str, finalizers: Vec<String>) -> kube::Result<()> {
    let api: Api<NodeGroup> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn patch_status(client: &Client, namespace: &str, name: &str, status: &NodeGroupStatus) -> kube::Result<()> {
    let api: Api<NodeGroup> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

pub async fn reconcile(pool: Arc<NodeGroup>, ctx: Arc<PoolContext>) -> Result<Action, kube::Error> {
    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();

    if pool.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&pool, &ctx).await;
    }

    if !managed::is_managed(&pool) {
        return Ok(Action::await_change());
    }

    if !has_finalizer(&pool) {
        let mut finalizers = pool.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        patch_finalizer(&ctx.client, &namespace, &name, finalizers).await?;
    }

    metrics::NODEGROUP_RECONCILE_TOTAL.inc();

    match converge(&pool, &ctx).await {
        Ok(status) => {
            patch_status(&ctx.client, &namespace, &name, &status).await?;
            Ok(Action::requeue(DEFAULT_REQUEUE))
        }
        Err(e) => {
            warn!(pool = %name, error = %e, "nodegroup_reconcile_error");
            Err(e)
        }
    }
}

async fn instances_for_pool(client: &Client, namespace: &str, pool_name: &str) -> kube::Result<Vec<VPSieNode>> {
    let api: Api<VPSieNode> = Api::namespaced(client.clone(), namespace);
    let all = api.list(&ListParams::default()).await?;
    Ok(all.items.into_iter().filter(|i| i.spec.pool_name == pool_name).collect())
}

async fn converge(pool: &NodeGroup, ctx: &PoolContext) -> Result<NodeGroupStatus, kube::Error> {
    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();
    let mut status = pool.status.clone().unwrap_or_default();

    let instances = instances_for_pool(&ctx.client, &namespace, &name).await?;
    let current = instances.iter().filter(|i| i.status.as_ref().map(|s| s.phase) != Some(InstancePhase::Terminated)).count() as u32;
    let ready = instances.iter().filter(|i| i.status.as_ref().map(|s| s.phase) == Some(InstancePhase::Ready)).count() as u32;

    let target = scale_target(&pool.spec, &status);

    if target > current {
        let now = chrono::Utc::now();
        let policy = pool.spec.scale_up_policy.clone().unwrap_or_default();

        match stabilization_gate(&status, &policy, now) {
            StabilizationGate::NotYetStable { since } => {
                status.scale_up_pending_since = Some(since.to_rfc3339());
                info!(pool = %name, "scale_up_awaiting_stabilization_window");
                status.conditions.push(Condition::new("ScalingUp", false, "StabilizationWindow", "waiting for signal to stabilise before scaling up"));
            }
            StabilizationGate::InCooldown { until } => {
                info!(pool = %name, until = %until, "scale_up_suppressed_by_cooldown");
                status.conditions.push(Condition::new("ScalingUp", false, "Cooldown", format!("suppressing scale-up until {until}")));
            }
            StabilizationGate::Clear => {
                let to_create = target - current;
                for _ in 0..to_create {
                    create_instance(pool, ctx).await?;
                }
                status.last_scale_up_at = Some(now.to_rfc3339());
                status.scale_up_pending_since = None;
                metrics::SCALE_UP_TRIGGERED_TOTAL.with_label_values(&[&name]).inc();
                info!(pool = %name, count = to_create, "scale_up_triggered");
                status.conditions.push(Condition::new("ScalingUp", true, "CapacityBelowTarget", format!("creating {to_create} instance(s)")));
            }
        }
    } else if target < current {
        let surplus = current - target;
        let candidates: Vec<&VPSieNode> = instances
            .iter()
            .filter(|i| i.status.as_ref().map(|s| s.phase) == Some(InstancePhase::Ready) && !i.spec.drain_requested)
            .collect();
        mark_surplus_for_draining(&ctx.client, &namespace, &name, candidates, surplus as usize).await?;
        status.scale_up_pending_since = None;
    } else {
        status.scale_up_pending_since = None;
    }

    status.desired_nodes = target;
    status.current_nodes = current;
    status.ready_nodes = ready;
    status.phase = if target > current {
        NodeGroupPhase::ScalingUp
    } else if target < current {
        NodeGroupPhase::ScalingDown
    } else if ready < current {
        NodeGroupPhase::Degraded
    } else {
        NodeGroupPhase::Ready
    };

    metrics::NODEGROUP_CURRENT_NODES.with_label_values(&[&name]).set(current as i64);
    metrics::NODEGROUP_DESIRED_NODES.with_label_values(&[&name]).set(target as i64);

    Ok(status)
}

/// The desired node count clamped into `[min_nodes, max_nodes]`, or
/// `min_nodes` outright if the Pool spec has them inverted. Pure so it can
/// be tested without a live cluster.
pub fn scale_target(spec: &crate::crd::NodeGroupSpec, status: &NodeGroupStatus) -> u32 {
    if spec.min_nodes <= spec.max_nodes {
        status.desired_nodes.clamp(spec.min_nodes, spec.max_nodes)
    } else {
        spec.min_nodes
    }
}

#[derive(Debug, PartialEq)]
pub enum StabilizationGate {
    /// The below-target signal hasn't held for `stabilization_window_seconds` yet.
    NotYetStable { since: chrono::DateTime<chrono::Utc> },
    /// A previous scale-up is still within its `cooldown_seconds` window.
    InCooldown { until: chrono::DateTime<chrono::Utc> },
    Clear,
}

/// Decides whether a pending scale-up may proceed this cycle, given the
/// Pool's `ScaleUpPolicy` and its persisted bookkeeping timestamps. Pure so
/// it can be tested without a live cluster.
pub fn stabilization_gate(status: &NodeGroupStatus, policy: &crate::crd::ScaleUpPolicy, now: chrono::DateTime<chrono::Utc>) -> StabilizationGate {
    if let Some(cooldown) = policy.cooldown_seconds {
        if let Some(last) = status.last_scale_up_at.as_deref().and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) {
            let until = last.with_timezone(&chrono::Utc) + chrono::Duration::seconds(cooldown as i64);
            if now < until {
                return StabilizationGate::InCooldown { until };
            }
        }
    }

    if let Some(window) = policy.stabilization_window_seconds {
        let since = status
            .scale_up_pending_since
            .as_deref()
            .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
            .map(|d| d.with_timezone(&chrono::Utc))
            .unwrap_or(now);
        if now.signed_duration_since(since) < chrono::Duration::seconds(window as i64) {
            return StabilizationGate::NotYetStable { since };
        }
    }

    StabilizationGate::Clear
}

async fn create_instance(pool: &NodeGroup, ctx: &PoolContext) -> kube::Result<()> {
    let pool_name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();
    let suffix = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default() as u64 % 10_000_000_000;
    let instance_name = format!("{pool_name}-{suffix:010}");

    let offering = pool.spec.preferred_instance_type.clone().or_else(|| pool.spec.offering_ids.first().cloned()).unwrap_or_default();

    let owner = OwnerReference {
        api_version: "vpsie.example.com/v1alpha1".to_string(),
        kind: "NodeGroup".to_string(),
        name: pool_name.clone(),
        uid: pool.uid().unwrap_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    };

    let instance = VPSieNode {
        metadata: ObjectMeta { name: Some(instance_name.clone()), namespace: Some(namespace.clone()), owner_references: Some(vec![owner]), ..Default::default() },
        spec: VPSieNodeSpec {
            pool_name,
            datacenter_id: pool.spec.datacenter_id.clone(),
            instance_type: offering,
            os_image_id: pool.spec.os_image_id.clone(),
            kubernetes_version: pool.spec.kubernetes_version.clone(),
            ..Default::default()
        },
        status: None,
    };

    let api: Api<VPSieNode> = Api::namespaced(ctx.client.clone(), &namespace);
    api.create(&PostParams::default(), &instance).await?;
    Ok(())
}

async fn mark_surplus_for_draining(client: &Client, namespace: &str, pool_name: &str, candidates: Vec<&VPSieNode>, surplus: usize) -> kube::Result<()> {
    if surplus == 0 || candidates.is_empty() {
        return Ok(());
    }

    let snapshots = snapshot_remaining_nodes(client, &candidates).await?;
    let mut drained = 0;

    for instance in &candidates {
        if drained >= surplus {
            break;
        }
        let Some(node_name) = instance.status.as_ref().and_then(|s| s.node_name.clone()) else { continue };
        let Some((candidate, _)) = snapshots.get(&node_name) else { continue };

        let remaining: Vec<NodeWithPods> = snapshots
            .iter()
            .filter(|(n, _)| *n != &node_name)
            .map(|(_, (_, node_with_pods))| node_with_pods.clone())
            .collect();

        let verdict = scale_down::evaluate_candidate(candidate, &remaining);
        let verdict_label = match &verdict {
            ScaleDownVerdict::Safe => "safe",
            ScaleDownVerdict::Blocked(_) => "blocked",
        };
        metrics::SCALE_DOWN_CANDIDATES_TOTAL.with_label_values(&[pool_name, verdict_label]).inc();

        match verdict {
            ScaleDownVerdict::Safe => {
                request_drain(client, namespace, &instance.name_any()).await?;
                drained += 1;
            }
            ScaleDownVerdict::Blocked(reason) => {
                warn!(pool = pool_name, instance = %instance.name_any(), reason = %reason, "scale_down_blocked");
            }
        }
    }

    Ok(())
}

/// Offline, read-only report of which Instances in a Pool are currently
/// safe to remove per the C9 simulation, without requesting any drain.
/// Backs the `scale-down simulate` CLI command.
pub async fn simulate_scale_down(
    client: &Client,
    namespace: &str,
    pool_name: &str,
) -> kube::Result<Vec<(String, ScaleDownVerdict)>> {
    let instances = instances_for_pool(client, namespace, pool_name).await?;
    let ready: Vec<&VPSieNode> = instances
        .iter()
        .filter(|i| i.status.as_ref().map(|s| s.phase) == Some(InstancePhase::Ready))
        .collect();

    let snapshots = snapshot_remaining_nodes(client, &ready).await?;
    let mut results = Vec::new();

    for instance in &ready {
        let Some(node_name) = instance.status.as_ref().and_then(|s| s.node_name.clone()) else { continue };
        let Some((candidate, _)) = snapshots.get(&node_name) else { continue };

        let remaining: Vec<NodeWithPods> = snapshots
            .iter()
            .filter(|(n, _)| *n != &node_name)
            .map(|(_, (_, node_with_pods))| node_with_pods.clone())
            .collect();

        let verdict = scale_down::evaluate_candidate(candidate, &remaining);
        results.push((instance.name_any(), verdict));
    }

    Ok(results)
}

async fn request_drain(client: &Client, namespace: &str, instance_name: &str) -> kube::Result<()> {
    let api: Api<VPSieNode> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "spec": { "drainRequested": true } });
    api.patch(instance_name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

type NodeSnapshot = (CandidateNode, NodeWithPods);

async fn snapshot_remaining_nodes(client: &Client, instances: &[&VPSieNode]) -> kube::Result<BTreeMap<String, NodeSnapshot>> {
    let nodes_api: Api<Node> = Api::all(client.clone());
    let pods_api: Api<Pod> = Api::all(client.clone());
    let pdb_api: Api<PodDisruptionBudget> = Api::all(client.clone());
    let pdbs = pdb_api.list(&ListParams::default()).await?.items;

    let mut out = BTreeMap::new();
    for instance in instances {
        let Some(node_name) = instance.status.as_ref().and_then(|s| s.node_name.clone()) else { continue };
        if out.contains_key(&node_name) {
            continue;
        }
        let Ok(node) = nodes_api.get(&node_name).await else { continue };
        let pods = pods_api.list(&ListParams::default().fields(&format!("spec.nodeName={node_name}"))).await?;
        out.insert(node_name.clone(), build_snapshot(&node, &pods.items, &pdbs));
    }
    Ok(out)
}

fn build_snapshot(node: &Node, pods: &[Pod], pdbs: &[PodDisruptionBudget]) -> NodeSnapshot {
    let labels: BTreeMap<String, String> = node.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let taints: Vec<Taint> = node
        .spec
        .as_ref()
        .and_then(|s| s.taints.clone())
        .unwrap_or_default()
        .iter()
        .map(|t| Taint { key: t.key.clone(), value: t.value.clone(), effect: t.effect.clone() })
        .collect();

    let externally_cordoned = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    let scale_down_disabled = node.metadata.annotations.as_ref().is_some_and(|a| a.get(SCALE_DOWN_DISABLED_ANNOTATION).map(|v| v == "true").unwrap_or(false));

    let pod_labels: Vec<BTreeMap<String, String>> = pods.iter().map(|p| p.metadata.labels.clone().unwrap_or_default().into_iter().collect()).collect();

    let pods_on_node: Vec<PodOnNode> = pods.iter().map(|pod| classify_pod(pod, pdbs)).collect();

    let candidate = CandidateNode { name: node.name_any(), externally_cordoned, scale_down_disabled, pods: pods_on_node };
    let node_with_pods = NodeWithPods { labels, taints, pod_labels };
    (candidate, node_with_pods)
}

fn classify_pod(pod: &Pod, pdbs: &[PodDisruptionBudget]) -> PodOnNode {
    let owner_kinds: Vec<String> = pod.metadata.owner_references.clone().unwrap_or_default().into_iter().map(|o| o.kind).collect();
    let is_daemonset = owner_kinds.iter().any(|k| k == "DaemonSet");
    let controlled_by_replicated_controller = owner_kinds.iter().any(|k| REPLICATED_OWNER_KINDS.contains(&k.as_str()));

    let has_local_storage = pod
        .spec
        .as_ref()
        .and_then(|s| s.volumes.as_ref())
        .is_some_and(|vols| vols.iter().any(|v| v.host_path.is_some() || v.empty_dir.is_some()));

    let safe_to_evict = pod.metadata.annotations.as_ref().and_then(|a| a.get(SAFE_TO_EVICT_ANNOTATION)).is_some_and(|v| v == "true");

    let namespace = pod.metadata.namespace.as_deref().unwrap_or_default();
    let pod_labels: BTreeMap<String, String> = pod.metadata.labels.clone().unwrap_or_default().into_iter().collect();
    let pdb_blocked = pdbs.iter().any(|pdb| pdb_blocks_pod(pdb, namespace, &pod_labels));

    // Approximates single-replica system pods as kube-system StatefulSet members
    // (e.g. etcd) rather than querying each owner's live replica count.
    let single_replica_system = namespace == "kube-system" && owner_kinds.iter().any(|k| k == "StatefulSet");

    PodOnNode { pod: pod.clone(), is_daemonset, controlled_by_replicated_controller, has_local_storage, safe_to_evict, pdb_blocked, single_replica_system }
}

fn pdb_blocks_pod(pdb: &PodDisruptionBudget, namespace: &str, pod_labels: &BTreeMap<String, String>) -> bool {
    if pdb.metadata.namespace.as_deref() != Some(namespace) {
        return false;
    }
    let disruptions_allowed = pdb.status.as_ref().map(|s| s.disruptions_allowed).unwrap_or(0);
    if disruptions_allowed > 0 {
        return false;
    }
    let Some(selector) = pdb.spec.as_ref().and_then(|s| s.selector.as_ref()) else { return false };
    selector_matches(selector, pod_labels)
}

// Matches `matchLabels` only; `matchExpressions` on a PodDisruptionBudget
// selector is rare enough in practice to skip for this pass.
fn selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    selector.match_labels.clone().unwrap_or_default().iter().all(|(k, v)| labels.get(k) == Some(v))
}

async fn handle_deletion(pool: &NodeGroup, ctx: &PoolContext) -> Result<Action, kube::Error> {
    let name = pool.name_any();
    let namespace = pool.namespace().unwrap_or_default();

    if !has_finalizer(pool) {
        return Ok(Action::await_change());
    }

    let instances = instances_for_pool(&ctx.client, &namespace, &name).await?;
    let api: Api<VPSieNode> = Api::namespaced(ctx.client.clone(), &namespace);

    let mut all_gone = true;
    for instance in &instances {
        match instance.status.as_ref().map(|s| s.phase) {
            Some(InstancePhase::Terminated) | Some(InstancePhase::Failed) => continue,
            _ => {
                all_gone = false;
                if instance.metadata.deletion_timestamp.is_none() {
                    api.delete(&instance.name_any(), &Default::default()).await.ok();
                }
            }
        }
    }

    if all_gone {
        let remaining: Vec<String> = pool.metadata.finalizers.clone().unwrap_or_default().into_iter().filter(|f| f != FINALIZER).collect();
        patch_finalizer(&ctx.client, &namespace, &name, remaining).await?;
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(DEFAULT_REQUEUE))
    }
}

pub fn error_policy(_pool: Arc<NodeGroup>, error: &kube::Error, _ctx: Arc<PoolContext>) -> Action {
    metrics::NODEGROUP_RECONCILE_ERRORS.inc();
    warn!(error = %error, "nodegroup_reconcile_error");
    Action::requeue(ERROR_REQUEUE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeGroupSpec;

    fn pool(min: u32, max: u32, desired: u32) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta { name: Some("pool-a".to_string()), namespace: Some("default".to_string()), ..Default::default() },
            spec: NodeGroupSpec { min_nodes: min, max_nodes: max, offering_ids: vec!["small".to_string()], datacenter_id: "dc1".to_string(), os_image_id: "ubuntu".to_string(), kubernetes_version: "v1.28.0".to_string(), ..Default::default() },
            status: Some(NodeGroupStatus { desired_nodes: desired, ..Default::default() }),
        }
    }

    #[test]
    fn target_clamps_to_max() {
        let p = pool(1, 3, 10);
        let target = p.status.as_ref().unwrap().desired_nodes.clamp(p.spec.min_nodes, p.spec.max_nodes);
        assert_eq!(target, 3);
    }

    #[test]
    fn target_clamps_to_min() {
        let p = pool(2, 5, 0);
        let target = p.status.as_ref().unwrap().desired_nodes.clamp(p.spec.min_nodes, p.spec.max_nodes);
        assert_eq!(target, 2);
    }

    #[test]
    fn pdb_blocks_pod_requires_matching_namespace_and_exhausted_budget() {
        let pdb = PodDisruptionBudget {
            metadata: ObjectMeta { namespace: Some("default".to_string()), ..Default::default() },
            spec: Some(k8s_openapi::api::policy::v1::PodDisruptionBudgetSpec {
                selector: Some(LabelSelector { match_labels: Some(BTreeMap::from([("app".to_string(), "web".to_string())])), match_expressions: None }),
                ..Default::default()
            }),
            status: Some(k8s_openapi::api::policy::v1::PodDisruptionBudgetStatus { disruptions_allowed: 0, ..Default::default() }),
        };
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        assert!(pdb_blocks_pod(&pdb, "default", &labels));

        let mismatched = BTreeMap::from([("app".to_string(), "other".to_string())]);
        assert!(!pdb_blocks_pod(&pdb, "default", &mismatched));
    }

    #[test]
    fn daemonset_pod_is_never_treated_as_controlled_by_replicated_controller_blocker() {
        let mut pod = Pod { metadata: ObjectMeta::default(), spec: Some(Default::default()), status: None };
        pod.metadata.owner_references = Some(vec![OwnerReference { kind: "DaemonSet".to_string(), ..Default::default() }]);
        let classified = classify_pod(&pod, &[]);
        assert!(classified.is_daemonset);
    }

    #[test]
    fn kube_system_statefulset_pod_is_single_replica_system() {
        let mut pod = Pod { metadata: ObjectMeta { namespace: Some("kube-system".to_string()), ..Default::default() }, spec: Some(Default::default()), status: None };
        pod.metadata.owner_references = Some(vec![OwnerReference { kind: "StatefulSet".to_string(), ..Default::default() }]);
        let classified = classify_pod(&pod, &[]);
        assert!(classified.single_replica_system);
    }

    #[test]
    fn safe_to_evict_annotation_is_honored() {
        let mut pod = Pod { metadata: ObjectMeta::default(), spec: Some(Default::default()), status: None };
        pod.metadata.annotations = Some(BTreeMap::from([(SAFE_TO_EVICT_ANNOTATION.to_string(), "true".to_string())]));
        let classified = classify_pod(&pod, &[]);
        assert!(classified.safe_to_evict);
    }

    use crate::crd::ScaleUpPolicy;

    #[test]
    fn no_policy_clears_immediately() {
        let status = NodeGroupStatus::default();
        let gate = stabilization_gate(&status, &ScaleUpPolicy::default(), chrono::Utc::now());
        assert!(matches!(gate, StabilizationGate::Clear));
    }

    #[test]
    fn fresh_signal_waits_for_stabilization_window() {
        let status = NodeGroupStatus::default();
        let policy = ScaleUpPolicy { stabilization_window_seconds: Some(120), ..Default::default() };
        let gate = stabilization_gate(&status, &policy, chrono::Utc::now());
        assert!(matches!(gate, StabilizationGate::NotYetStable { .. }));
    }

    #[test]
    fn signal_held_past_window_clears() {
        let pending_since = chrono::Utc::now() - chrono::Duration::seconds(200);
        let status = NodeGroupStatus { scale_up_pending_since: Some(pending_since.to_rfc3339()), ..Default::default() };
        let policy = ScaleUpPolicy { stabilization_window_seconds: Some(120), ..Default::default() };
        let gate = stabilization_gate(&status, &policy, chrono::Utc::now());
        assert!(matches!(gate, StabilizationGate::Clear));
    }

    #[test]
    fn recent_scale_up_blocks_on_cooldown() {
        let last = chrono::Utc::now() - chrono::Duration::seconds(30);
        let status = NodeGroupStatus { last_scale_up_at: Some(last.to_rfc3339()), ..Default::default() };
        let policy = ScaleUpPolicy { cooldown_seconds: Some(300), ..Default::default() };
        let gate = stabilization_gate(&status, &policy, chrono::Utc::now());
        assert!(matches!(gate, StabilizationGate::InCooldown { .. }));
    }

    #[test]
    fn cooldown_expires_after_window_elapses() {
        let last = chrono::Utc::now() - chrono::Duration::seconds(400);
        let status = NodeGroupStatus { last_scale_up_at: Some(last.to_rfc3339()), ..Default::default() };
        let policy = ScaleUpPolicy { cooldown_seconds: Some(300), ..Default::default() };
        let gate = stabilization_gate(&status, &policy, chrono::Utc::now());
        assert!(matches!(gate, StabilizationGate::Clear));
    }
}
