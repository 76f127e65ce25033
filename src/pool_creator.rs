//! C8 — Dynamic Pool Creator.
//!
//! Triggered when the Resource Analyzer (C7) returns zero matching Pools for
//! a pending pod. Synthesises a brand-new managed Pool from the pod's
//! node-selector and non-system tolerations, and the cheapest provider K8s
//! offer that both meets the pod's resource request and whose underlying
//! size is not already claimed by an existing provider K8s node group.

use k8s_openapi::api::core::v1::Pod;

use crate::crd::{NodeGroup, NodeGroupSpec, PoolTaint, TaintEffect};
use crate::managed;
use crate::provider::{K8sNodeGroup, K8sOffer};
use crate::resource_analyzer::{self, ResourceRequest};

/// Node-lifecycle tolerations the scheduler injects automatically; these
/// never reflect a deliberate user placement choice and must not become
/// Pool taints.
const SYSTEM_TOLERATION_KEYS: &[&str] = &[
    "node.kubernetes.io/not-ready",
    "node.kubernetes.io/unreachable",
    "node.kubernetes.io/memory-pressure",
    "node.kubernetes.io/disk-pressure",
    "node.kubernetes.io/pid-pressure",
    "node.kubernetes.io/network-unavailable",
    "node.kubernetes.io/unschedulable",
    "node.kubernetes.io/uninitialized",
];

#[derive(Debug, Clone)]
pub struct PoolTemplate {
    pub datacenter_id: String,
    pub cluster_id: String,
    pub kubernetes_version: String,
    pub os_image_id: String,
    pub max_nodes_default: u32,
}

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PoolCreatorError {
    #[error("pool template is missing datacenter, offerings, or cluster id")]
    IncompleteTemplate,
    #[error("no provider offering meets the pod's resource request and available size id")]
    NoViableOffering,
}

fn pool_taints_from_tolerations(pod: &Pod) -> Vec<PoolTaint> {
    let Some(spec) = &pod.spec else { return Vec::new() };
    let Some(tolerations) = &spec.tolerations else { return Vec::new() };

    tolerations
        .iter()
        .filter(|t| t.operator.as_deref().unwrap_or("Equal") == "Equal")
        .filter(|t| t.key.as_deref().is_some_and(|k| !SYSTEM_TOLERATION_KEYS.contains(&k)))
        .filter_map(|t| {
            let key = t.key.clone()?;
            let effect = match t.effect.as_deref() {
                Some("PreferNoSchedule") => TaintEffect::PreferNoSchedule,
                Some("NoExecute") => TaintEffect::NoExecute,
                _ => TaintEffect::NoSchedule,
            };
            Some(PoolTaint { key, value: t.value.clone(), effect })
        })
        .collect()
}

/// Offerings already claimed by an existing provider K8s node group; an
/// offering's id is treated as its provider size id (one pool per size).
fn claimed_size_ids(node_groups: &[K8sNodeGroup]) -> std::collections::HashSet<&str> {
    node_groups.iter().map(|ng| ng.size_id.as_str()).collect()
}

fn cheapest_viable_offering<'a>(need: ResourceRequest, catalog: &'a [K8sOffer], claimed: &std::collections::HashSet<&str>) -> Option<&'a K8sOffer> {
    catalog
        .iter()
        .filter(|o| !claimed.contains(o.offering_id.as_str()))
        .filter(|o| o.cpu_cores as i64 * 1000 >= need.cpu_millis && o.memory_mb as i64 * 1024 * 1024 >= need.memory_bytes)
        .min_by(|a, b| a.monthly_price.partial_cmp(&b.monthly_price).unwrap_or(std::cmp::Ordering::Equal))
}

/// Builds a new managed Pool sized for `pod`, or an error if the template is
/// incomplete or no provider offering can host it.
///
/// `name_entropy` supplies the low-order digits of the generated Pool name
/// (`auto-<dc>-<digits>`); callers pass a nanosecond timestamp modulo
/// `10^10` in production and a fixed value in tests.
pub fn create_pool_for_pod(pod: &Pod, template: &PoolTemplate, catalog: &[K8sOffer], existing_node_groups: &[K8sNodeGroup], name_entropy: u64) -> Result<NodeGroup, PoolCreatorError> {
    if template.datacenter_id.is_empty() || template.cluster_id.is_empty() || catalog.is_empty() {
        return Err(PoolCreatorError::IncompleteTemplate);
    }

    let need = resource_analyzer::pod_resource_request(pod);
    let claimed = claimed_size_ids(existing_node_groups);
    let offer = cheapest_viable_offering(need, catalog, &claimed).ok_or(PoolCreatorError::NoViableOffering)?;

    let labels: std::collections::BTreeMap<String, String> = pod.spec.as_ref().and_then(|s| s.node_selector.clone()).unwrap_or_default().into_iter().collect();

    let mut managed_labels = labels.clone();
    managed::set_managed(&mut managed_labels);

    let name = format!("auto-{}-{}", template.datacenter_id, name_entropy % 10_000_000_000);

    let spec = NodeGroupSpec {
        min_nodes: 1,
        max_nodes: template.max_nodes_default.max(1),
        offering_ids: vec![offer.offering_id.clone()],
        preferred_instance_type: None,
        datacenter_id: template.datacenter_id.clone(),
        os_image_id: template.os_image_id.clone(),
        kubernetes_version: template.kubernetes_version.clone(),
        labels,
        taints: pool_taints_from_tolerations(pod),
        scale_up_policy: None,
        scale_down_policy: None,
        kube_size_id: Some(offer.offering_id.clone()),
    };

    Ok(NodeGroup {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta { name: Some(name), labels: Some(managed_labels), ..Default::default() },
        spec,
        status: None,
    })
}
