//! C3 — Instance State Machine (VPSieNode reconciler).
//!
//! Drives one provisioned instance through
//! `Pending → Provisioning|Discovering → Joining → Ready → Draining →
//! Terminating → Terminated|Failed`, following the teacher's
//! `Controller::new().run(reconcile, error_policy, ctx)` shape.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tracing::{info, warn};

use crate::crd::{Condition, InstancePhase, VPSieNode, VPSieNodeStatus};
use crate::discovery::{self, DiscoveryOutcome};
use crate::managed;
use crate::metrics;
use crate::provider::{CreateVmRequest, ProviderError, VmApi};

pub const FINALIZER: &str = "vpsie.example.com/instance-cleanup";
const FAST_REQUEUE: Duration = Duration::from_secs(10);
const SLOW_REQUEUE: Duration = Duration::from_secs(30);
const ERROR_REQUEUE: Duration = Duration::from_secs(60);

/// Per-pod eviction deadline: a pod whose eviction was already accepted
/// (deletion timestamp set) but that is still present past this long is
/// logged as stuck, though the node's overall drain deadline below is what
/// actually halts the phase.
const DRAIN_POD_DEADLINE: Duration = Duration::from_secs(60);
/// Total budget for draining one node, from the first Draining reconcile.
/// Exceeding it with pods still present fails the Instance rather than
/// forcing pod deletion.
const DRAIN_TOTAL_DEADLINE: Duration = Duration::from_secs(10 * 60);

pub struct InstanceContext {
    pub client: Client,
    pub provider: Arc<dyn VmApi>,
}

/// Finds the Kubernetes Node that belongs to this Instance: by IP first
/// (authoritative), then by the same hostname-prefix convention used by
/// discovery.
fn find_claiming_node<'a>(nodes: &'a [Node], instance_name: &str, ip_address: Option<&str>) -> Option<&'a Node> {
    if let Some(ip) = ip_address {
        if let Some(node) = nodes.iter().find(|n| {
            n.status.as_ref().and_then(|s| s.addresses.as_ref()).is_some_and(|addrs| addrs.iter().any(|a| a.address == ip))
        }) {
            return Some(node);
        }
    }

    let prefix = discovery::vm_name_prefix(instance_name);
    nodes.iter().find(|n| n.name_any().starts_with(&prefix))
}

/// VM ids already bound to a sibling Instance in the same pool, so
/// discovery never double-matches one provider VM to two Instance records.
async fn claimed_vm_ids(client: &Client, namespace: &str, pool_name: &str, self_name: &str) -> kube::Result<HashSet<u64>> {
    let api: Api<VPSieNode> = Api::namespaced(client.clone(), namespace);
    let siblings = api.list(&ListParams::default()).await?;
    Ok(siblings
        .items
        .iter()
        .filter(|i| i.spec.pool_name == pool_name && i.name_any() != self_name && i.spec.provider_vm_id != 0)
        .map(|i| i.spec.provider_vm_id)
        .collect())
}

fn node_is_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .is_some_and(|conds| conds.iter().any(|c| c.type_ == "Ready" && c.status == "True"))
}

fn has_finalizer(instance: &VPSieNode) -> bool {
    instance.metadata.finalizers.as_ref().is_some_and(|f| f.iter().any(|s| s == FINALIZER))
}

async fn patch_finalizer(client: &Client, namespace: &str, name: &str, finalizers: Vec<String>) -> kube::Result<()> {
    let api: Api<VPSieNode> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "metadata": { "finalizers": finalizers } });
    api.patch(name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn patch_status(client: &Client, namespace: &str, name: &str, status: &VPSieNodeStatus) -> kube::Result<()> {
    let api: Api<VPSieNode> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

pub async fn reconcile(instance: Arc<VPSieNode>, ctx: Arc<InstanceContext>) -> Result<Action, kube::Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();

    if instance.metadata.deletion_timestamp.is_some() {
        return handle_deletion(&instance, &ctx).await;
    }

    if !has_finalizer(&instance) {
        let mut finalizers = instance.metadata.finalizers.clone().unwrap_or_default();
        finalizers.push(FINALIZER.to_string());
        patch_finalizer(&ctx.client, &namespace, &name, finalizers).await?;
    }

    metrics::VPSIENODE_RECONCILE_TOTAL.inc();
    let from_phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();

    let outcome = step(&instance, &ctx).await;

    match outcome {
        Ok((status, action)) => {
            if status.phase != from_phase {
                metrics::VPSIENODE_PHASE_TRANSITIONS.with_label_values(&[&format!("{from_phase:?}"), &format!("{:?}", status.phase)]).inc();
                info!(instance = %name, from = ?from_phase, to = ?status.phase, "instance_phase_transition");
            }
            patch_status(&ctx.client, &namespace, &name, &status).await?;
            Ok(action)
        }
        Err(e) => {
            warn!(instance = %name, error = %e, "instance_reconcile_error");
            Err(e)
        }
    }
}

async fn step(instance: &VPSieNode, ctx: &InstanceContext) -> Result<(VPSieNodeStatus, Action), kube::Error> {
    let mut status = instance.status.clone().unwrap_or_default();
    let name = instance.name_any();

    match status.phase {
        InstancePhase::Pending => {
            let req = CreateVmRequest {
                name: discovery::vm_name_prefix(&name),
                datacenter_id: instance.spec.datacenter_id.clone(),
                offering_id: instance.spec.instance_type.clone(),
                os_image_id: instance.spec.os_image_id.clone(),
                ssh_key_ids: instance.spec.ssh_key_ids.clone(),
            };

            match ctx.provider.create_vm(req).await {
                Ok(resp) if resp.accepted => {
                    status.created_at = Some(chrono::Utc::now().to_rfc3339());
                    if let Some(vm_id) = resp.vm_id {
                        status.phase = InstancePhase::Joining;
                        status.conditions.push(Condition::new("Provisioned", true, "VmCreated", format!("provider assigned vm id {vm_id}")));
                    } else {
                        status.phase = InstancePhase::Discovering;
                        status.conditions.push(Condition::new("Provisioned", true, "VmCreateAccepted", "awaiting asynchronous vm id"));
                    }
                    Ok((status, Action::requeue(FAST_REQUEUE)))
                }
                Ok(_) => Ok((status, Action::requeue(ERROR_REQUEUE))),
                Err(e) => Ok((fail_on_terminal_error(status, &e), Action::requeue(requeue_for(&e)))),
            }
        }

        InstancePhase::Discovering => {
            let created_at = status
                .created_at
                .as_deref()
                .and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok())
                .map(|dt| dt.with_timezone(&chrono::Utc))
                .unwrap_or_else(chrono::Utc::now);

            match ctx.provider.list_vms(&instance.spec.datacenter_id).await {
                Ok(vms) => {
                    let claimed = claimed_vm_ids(&ctx.client, &instance.namespace().unwrap_or_default(), &instance.spec.pool_name, &name).await?;
                    let outcome = discovery::discover(
                        &name,
                        &instance.spec.datacenter_id,
                        created_at,
                        chrono::Utc::now(),
                        instance.spec.ip_address.as_deref(),
                        &vms,
                        &claimed,
                    );
                    match outcome {
                        DiscoveryOutcome::Found(vm) => {
                            status.phase = InstancePhase::Joining;
                            status.conditions.push(Condition::new("Discovered", true, "VmMatched", format!("matched provider vm {}", vm.id)));
                            Ok((status, Action::requeue(FAST_REQUEUE)))
                        }
                        DiscoveryOutcome::Pending => Ok((status, Action::requeue(FAST_REQUEUE))),
                        DiscoveryOutcome::TimedOut => {
                            metrics::DISCOVERY_TIMEOUTS_TOTAL.inc();
                            status.phase = InstancePhase::Failed;
                            status.failure_reason = Some("DiscoveryTimeout".to_string());
                            Ok((status, Action::await_change()))
                        }
                    }
                }
                Err(e) => Ok((fail_on_terminal_error(status, &e), Action::requeue(requeue_for(&e)))),
            }
        }

        InstancePhase::Provisioning => {
            status.phase = InstancePhase::Joining;
            Ok((status, Action::requeue(FAST_REQUEUE)))
        }

        InstancePhase::Joining => {
            let nodes_api: Api<Node> = Api::all(ctx.client.clone());
            let nodes = nodes_api.list(&ListParams::default()).await?;

            match find_claiming_node(&nodes.items, &name, instance.spec.ip_address.as_deref()) {
                Some(node) if node_is_ready(node) => {
                    let node_name = node.name_any();
                    apply_node_labels(ctx, &node_name, &instance.spec.pool_name, &name).await?;
                    status.phase = InstancePhase::Ready;
                    status.node_name = Some(node_name);
                    status.conditions.push(Condition::new("Ready", true, "NodeJoined", "node observed ready and labeled"));
                    Ok((status, Action::requeue(SLOW_REQUEUE)))
                }
                _ => Ok((status, Action::requeue(FAST_REQUEUE))),
            }
        }

        InstancePhase::Ready => {
            if instance.spec.drain_requested {
                status.phase = InstancePhase::Draining;
                status.conditions.push(Condition::new("Draining", true, "DrainRequested", "scale-down or rebalance requested removal"));
                Ok((status, Action::requeue(FAST_REQUEUE)))
            } else {
                Ok((status, Action::requeue(SLOW_REQUEUE)))
            }
        }

        InstancePhase::Draining => {
            let Some(node_name) = status.node_name.clone() else {
                status.phase = InstancePhase::Terminating;
                return Ok((status, Action::requeue(FAST_REQUEUE)));
            };

            let now = chrono::Utc::now();
            let drain_started_at = match status.drain_started_at.as_deref().and_then(|s| chrono::DateTime::parse_from_rfc3339(s).ok()) {
                Some(dt) => dt.with_timezone(&chrono::Utc),
                None => {
                    status.drain_started_at = Some(now.to_rfc3339());
                    now
                }
            };

            cordon_node(ctx, &node_name).await?;

            let pods_api: Api<Pod> = Api::all(ctx.client.clone());
            let pods = pods_api.list(&ListParams::default().fields(&format!("spec.nodeName={node_name}"))).await?;
            let evictable: Vec<&Pod> = pods.items.iter().filter(|p| !is_daemonset_or_mirror(p)).collect();

            if evictable.is_empty() {
                status.phase = InstancePhase::Terminating;
                status.drain_started_at = None;
                return Ok((status, Action::requeue(FAST_REQUEUE)));
            }

            if drain_deadline_exceeded(drain_started_at, now, DRAIN_TOTAL_DEADLINE) {
                let stuck: Vec<String> = evictable.iter().map(|p| format!("{}/{}", p.metadata.namespace.as_deref().unwrap_or(""), p.name_any())).collect();
                warn!(instance = %name, node = %node_name, stuck = %stuck.join(", "), "drain_deadline_exceeded");
                metrics::DRAIN_TIMEOUTS_TOTAL.inc();
                status.phase = InstancePhase::Failed;
                status.failure_reason = Some(format!("DrainTimeout: pods still present [{}]", stuck.join(", ")));
                status.conditions.push(Condition::new(
                    "Draining",
                    false,
                    "DrainTimeout",
                    format!("drain exceeded {}s with {} pod(s) still present; vm was not deleted", DRAIN_TOTAL_DEADLINE.as_secs(), stuck.len()),
                ));
                return Ok((status, Action::await_change()));
            }

            for pod in evictable {
                let ns = pod.metadata.namespace.clone().unwrap_or_default();
                let pod_name = pod.name_any();

                if pod_stuck_since_eviction(pod, now, DRAIN_POD_DEADLINE) {
                    warn!(pod = %pod_name, namespace = %ns, "drain_pod_eviction_stuck");
                    continue;
                }

                let api: Api<Pod> = Api::namespaced(ctx.client.clone(), &ns);
                if let Err(e) = api.evict(&pod_name, &EvictParams::default()).await {
                    // A PodDisruptionBudget blocking the eviction (409/429) is
                    // expected and left for the next reconcile to retry; we
                    // never fall back to a hard delete.
                    warn!(pod = %pod_name, namespace = %ns, error = %e, "drain_pod_eviction_blocked");
                }
            }

            Ok((status, Action::requeue(FAST_REQUEUE)))
        }

        InstancePhase::Terminating => {
            if instance.spec.provider_vm_id == 0 {
                status.phase = InstancePhase::Terminated;
                return Ok((status, Action::await_change()));
            }

            match ctx.provider.delete_vm(instance.spec.provider_vm_id).await {
                Ok(()) => {
                    status.phase = InstancePhase::Terminated;
                    status.conditions.push(Condition::new("Terminated", true, "VmDeleted", "provider confirmed vm deletion"));
                    Ok((status, Action::await_change()))
                }
                Err(ProviderError::NotFound(_)) => {
                    status.phase = InstancePhase::Terminated;
                    Ok((status, Action::await_change()))
                }
                Err(e) => Ok((status, Action::requeue(requeue_for(&e)))),
            }
        }

        InstancePhase::Terminated | InstancePhase::Failed => Ok((status, Action::await_change())),
    }
}

fn fail_on_terminal_error(mut status: VPSieNodeStatus, error: &ProviderError) -> VPSieNodeStatus {
    match error {
        ProviderError::QuotaExceeded(msg) => {
            status.phase = InstancePhase::Failed;
            status.failure_reason = Some(format!("QuotaExceeded: {msg}"));
        }
        ProviderError::Invalid(msg) => {
            status.phase = InstancePhase::Failed;
            status.failure_reason = Some(format!("Invalid: {msg}"));
        }
        _ => {}
    }
    status
}

fn requeue_for(error: &ProviderError) -> Duration {
    match error {
        ProviderError::RateLimited { retry_after } => retry_after.unwrap_or(ERROR_REQUEUE),
        _ if error.is_retryable() => ERROR_REQUEUE,
        _ => SLOW_REQUEUE,
    }
}

fn drain_deadline_exceeded(started_at: chrono::DateTime<chrono::Utc>, now: chrono::DateTime<chrono::Utc>, deadline: Duration) -> bool {
    now.signed_duration_since(started_at).to_std().unwrap_or(Duration::ZERO) > deadline
}

/// A pod is "stuck" once its own eviction has been accepted (it carries a
/// deletion timestamp) but it has outlived the per-pod deadline anyway;
/// such a pod is left alone rather than re-evicted every reconcile.
fn pod_stuck_since_eviction(pod: &Pod, now: chrono::DateTime<chrono::Utc>, deadline: Duration) -> bool {
    pod.metadata.deletion_timestamp.as_ref().is_some_and(|ts| now.signed_duration_since(ts.0).to_std().map(|d| d > deadline).unwrap_or(false))
}

fn is_daemonset_or_mirror(pod: &Pod) -> bool {
    let is_mirror = pod.metadata.annotations.as_ref().is_some_and(|a| a.contains_key("kubernetes.io/config.mirror"));
    let is_daemonset = pod.metadata.owner_references.as_ref().is_some_and(|refs| refs.iter().any(|o| o.kind == "DaemonSet"));
    is_mirror || is_daemonset
}

async fn cordon_node(ctx: &InstanceContext, node_name: &str) -> kube::Result<()> {
    let api: Api<Node> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({ "spec": { "unschedulable": true } });
    api.patch(node_name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn apply_node_labels(ctx: &InstanceContext, node_name: &str, pool_name: &str, instance_name: &str) -> kube::Result<()> {
    let api: Api<Node> = Api::all(ctx.client.clone());
    let patch = serde_json::json!({
        "metadata": {
            "labels": {
                managed::LABEL_KEY: managed::LABEL_VALUE,
                "vpsie.example.com/pool": pool_name,
                "vpsie.example.com/instance": instance_name,
            }
        }
    });
    api.patch(node_name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
    Ok(())
}

async fn handle_deletion(instance: &VPSieNode, ctx: &InstanceContext) -> Result<Action, kube::Error> {
    let name = instance.name_any();
    let namespace = instance.namespace().unwrap_or_default();
    let phase = instance.status.as_ref().map(|s| s.phase).unwrap_or_default();

    if !has_finalizer(instance) {
        return Ok(Action::await_change());
    }

    let can_remove = match phase {
        InstancePhase::Terminated | InstancePhase::Failed => true,
        _ if instance.spec.provider_vm_id == 0 => true,
        _ => match ctx.provider.delete_vm(instance.spec.provider_vm_id).await {
            Ok(()) => true,
            Err(ProviderError::NotFound(_)) => true,
            Err(e) => {
                warn!(instance = %name, error = %e, "instance_delete_vm_failed");
                false
            }
        },
    };

    if can_remove {
        let remaining: Vec<String> = instance.metadata.finalizers.clone().unwrap_or_default().into_iter().filter(|f| f != FINALIZER).collect();
        patch_finalizer(&ctx.client, &namespace, &name, remaining).await?;
        Ok(Action::await_change())
    } else {
        Ok(Action::requeue(ERROR_REQUEUE))
    }
}

pub fn error_policy(_instance: Arc<VPSieNode>, error: &kube::Error, _ctx: Arc<InstanceContext>) -> Action {
    metrics::VPSIENODE_RECONCILE_ERRORS.inc();
    warn!(error = %error, "vpsienode_reconcile_error");
    Action::requeue(ERROR_REQUEUE)
}
