use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/* ============================= SHARED TYPES ============================= */

/// A Kubernetes-style taint effect.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "PascalCase")]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A taint applied to every Kubernetes Node joined into this Pool.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PoolTaint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: TaintEffect,
}

/// CPU/memory-threshold policy governing when a Pool may scale up.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleUpPolicy {
    /// Percentage (0-100) utilisation above which scale-up is considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_threshold: Option<u32>,
    /// Seconds to wait for the signal to stabilise before acting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_window_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u32>,
}

/// CPU/memory-threshold policy governing when a Pool may scale down.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct ScaleDownPolicy {
    /// Percentage (0-100) utilisation below which scale-down is considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_threshold: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stabilization_window_seconds: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cooldown_seconds: Option<u32>,
}

/// A condition on a Pool or Instance status, mirroring the conventional
/// Kubernetes condition shape.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    pub fn new(type_: &str, status: bool, reason: &str, message: impl Into<String>) -> Self {
        Self {
            type_: type_.to_string(),
            status: if status { "True".to_string() } else { "False".to_string() },
            reason: Some(reason.to_string()),
            message: Some(message.into()),
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
        }
    }
}

/* ============================= NODEGROUP (Pool) ============================= */

/// NodeGroup (Pool) describes a managed set of provider VM instances that
/// back Kubernetes worker nodes.
///
/// Only NodeGroups carrying the `vpsie.example.com/managed=true` label are
/// ever acted on by this operator — see [`crate::managed`].
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vpsie.example.com",
    version = "v1alpha1",
    kind = "NodeGroup",
    plural = "nodegroups",
    status = "NodeGroupStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    pub min_nodes: u32,
    pub max_nodes: u32,

    /// Non-empty, unique offering ids this pool may provision from.
    pub offering_ids: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_instance_type: Option<String>,

    pub datacenter_id: String,
    pub os_image_id: String,

    /// Semver `v<maj>.<min>.<patch>...`.
    pub kubernetes_version: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<PoolTaint>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_policy: Option<ScaleUpPolicy>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_down_policy: Option<ScaleDownPolicy>,

    /// Provider K8s SKU, if this pool corresponds to a managed K8s node group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kube_size_id: Option<String>,
}

impl Default for NodeGroupSpec {
    fn default() -> Self {
        Self {
            min_nodes: 0,
            max_nodes: 0,
            offering_ids: Vec::new(),
            preferred_instance_type: None,
            datacenter_id: String::new(),
            os_image_id: String::new(),
            kubernetes_version: String::new(),
            labels: BTreeMap::new(),
            taints: Vec::new(),
            scale_up_policy: None,
            scale_down_policy: None,
            kube_size_id: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum NodeGroupPhase {
    #[default]
    Pending,
    Ready,
    ScalingUp,
    ScalingDown,
    Degraded,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    #[serde(default)]
    pub desired_nodes: u32,
    #[serde(default)]
    pub current_nodes: u32,
    #[serde(default)]
    pub ready_nodes: u32,
    #[serde(default)]
    pub phase: NodeGroupPhase,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// RFC3339 timestamp of when target first exceeded current; cleared once
    /// the gap closes. Anchors `ScaleUpPolicy.stabilizationWindowSeconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale_up_pending_since: Option<String>,
    /// RFC3339 timestamp of the last scale-up this Pool actually performed.
    /// Anchors `ScaleUpPolicy.cooldownSeconds`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scale_up_at: Option<String>,
}

/* ============================= VPSIENODE (Instance) ============================= */

/// VPSieNode (Instance) tracks one provisioned provider VM and its journey
/// from request through to a joined, ready Kubernetes node.
#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "vpsie.example.com",
    version = "v1alpha1",
    kind = "VPSieNode",
    plural = "vpsienodes",
    status = "VPSieNodeStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct VPSieNodeSpec {
    pub pool_name: String,
    pub datacenter_id: String,
    pub instance_type: String,
    pub os_image_id: String,
    pub kubernetes_version: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ssh_key_ids: Vec<String>,

    #[serde(default)]
    pub creation_requested: bool,

    #[serde(default)]
    pub provider_vm_id: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ipv6_address: Option<String>,

    /// Set by the Pool reconciler (C4) when this Instance has been chosen
    /// by Scale-Down Safety (C9) for removal.
    #[serde(default)]
    pub drain_requested: bool,
}

impl Default for VPSieNodeSpec {
    fn default() -> Self {
        Self {
            pool_name: String::new(),
            datacenter_id: String::new(),
            instance_type: String::new(),
            os_image_id: String::new(),
            kubernetes_version: String::new(),
            ssh_key_ids: Vec::new(),
            creation_requested: false,
            provider_vm_id: 0,
            ip_address: None,
            ipv6_address: None,
            drain_requested: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "PascalCase")]
pub enum InstancePhase {
    #[default]
    Pending,
    Provisioning,
    Discovering,
    Joining,
    Ready,
    Draining,
    Terminating,
    Terminated,
    Failed,
}

impl InstancePhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, InstancePhase::Terminated | InstancePhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct VPSieNodeStatus {
    #[serde(default)]
    pub phase: InstancePhase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    /// RFC3339 timestamp of when the Draining phase first cordoned this
    /// Instance's node; anchors the overall per-node drain deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub drain_started_at: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/* ============================= TESTS ============================= */
