//! C11 — pure admission-validation logic for Pools, Instances, and Node
//! deletion requests. No I/O: the webhook transport (`commands::webhook`)
//! decodes the `AdmissionReview` body, calls into here, and re-wraps the
//! verdict. Kept separate so every rule is unit-testable without a cluster.

use std::collections::HashSet;

use k8s_openapi::api::core::v1::Node;

use crate::crd::{NodeGroupSpec, TaintEffect, VPSieNodeSpec};
use crate::managed;

/// Result of evaluating an admission request.
#[derive(Debug, Clone)]
pub struct AdmissionVerdict {
    pub allowed: bool,
    pub message: Option<String>,
    pub violations: Vec<String>,
}

impl AdmissionVerdict {
    fn allow() -> Self {
        Self { allowed: true, message: None, violations: Vec::new() }
    }

    fn deny(violations: Vec<String>) -> Self {
        let message = format_denial_message(&violations);
        Self { allowed: false, message: Some(message), violations }
    }
}

pub fn format_denial_message(violations: &[String]) -> String {
    format!("Denied: {}", violations.join(", "))
}

/// Resource namespace must match the operator's own namespace. The
/// distilled contract is "resource must live in the operator namespace";
/// the webhook transport supplies its own namespace as `operator_namespace`.
fn validate_namespace(resource_namespace: &str, operator_namespace: &str, violations: &mut Vec<String>) {
    if resource_namespace != operator_namespace {
        violations.push(format!(
            "resource namespace '{resource_namespace}' must match the operator namespace '{operator_namespace}'"
        ));
    }
}

/// Validates a `NodeGroup` (Pool) spec against the bounds and syntax rules
/// in §6. Does not evaluate `managed=true` — the webhook validates all
/// Pools regardless of label, since the label itself is what opts a Pool
/// into mutation by the reconcilers.
pub fn validate_pool(namespace: &str, operator_namespace: &str, spec: &NodeGroupSpec) -> AdmissionVerdict {
    let mut violations = Vec::new();

    validate_namespace(namespace, operator_namespace, &mut violations);

    if spec.min_nodes > spec.max_nodes {
        violations.push(format!(
            "minNodes ({}) must be <= maxNodes ({})",
            spec.min_nodes, spec.max_nodes
        ));
    }

    if spec.offering_ids.is_empty() {
        violations.push("offeringIds must be non-empty".to_string());
    } else {
        let unique: HashSet<&String> = spec.offering_ids.iter().collect();
        if unique.len() != spec.offering_ids.len() {
            violations.push("offeringIds must not contain duplicates".to_string());
        }
        for offering in &spec.offering_ids {
            if offering.trim().is_empty() {
                violations.push("offeringIds must not contain empty strings".to_string());
            }
        }
    }

    if spec.datacenter_id.trim().is_empty() {
        violations.push("datacenterId must be non-empty".to_string());
    }

    if semver::Version::parse(spec.kubernetes_version.trim_start_matches('v')).is_err() {
        violations.push(format!(
            "kubernetesVersion '{}' is not a valid semver version",
            spec.kubernetes_version
        ));
    }

    for taint in &spec.taints {
        if taint.key.trim().is_empty() {
            violations.push("taint key must be non-empty".to_string());
        }
        if matches!(taint.effect, TaintEffect::PreferNoSchedule) && taint.value.as_deref() == Some("") {
            violations.push("taint value must not be an empty string when present".to_string());
        }
    }

    if let Some(policy) = &spec.scale_up_policy {
        validate_percentage("scaleUpPolicy.cpuThreshold", policy.cpu_threshold, &mut violations);
        validate_percentage("scaleUpPolicy.memoryThreshold", policy.memory_threshold, &mut violations);
    }
    if let Some(policy) = &spec.scale_down_policy {
        validate_percentage("scaleDownPolicy.cpuThreshold", policy.cpu_threshold, &mut violations);
        validate_percentage("scaleDownPolicy.memoryThreshold", policy.memory_threshold, &mut violations);
    }

    if violations.is_empty() {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::deny(violations)
    }
}

fn validate_percentage(field: &str, value: Option<u32>, violations: &mut Vec<String>) {
    if let Some(v) = value {
        if v > 100 {
            violations.push(format!("{field} must be between 0 and 100, got {v}"));
        }
    }
}

/// Validates a `VPSieNode` (Instance) spec.
pub fn validate_instance(namespace: &str, operator_namespace: &str, spec: &VPSieNodeSpec) -> AdmissionVerdict {
    let mut violations = Vec::new();

    validate_namespace(namespace, operator_namespace, &mut violations);

    if spec.pool_name.trim().is_empty() {
        violations.push("poolName must be non-empty".to_string());
    }
    if spec.datacenter_id.trim().is_empty() {
        violations.push("datacenterId must be non-empty".to_string());
    }
    if spec.instance_type.trim().is_empty() {
        violations.push("instanceType (offering id) must be non-empty".to_string());
    }

    if semver::Version::parse(spec.kubernetes_version.trim_start_matches('v')).is_err() {
        violations.push(format!(
            "kubernetesVersion '{}' is not a valid semver version",
            spec.kubernetes_version
        ));
    }

    if violations.is_empty() {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::deny(violations)
    }
}

/// Validates a DELETE request against a live Kubernetes Node: only Nodes
/// carrying `managed=true` may be deleted by the operator's service
/// account, per §6. Deletes of unmanaged nodes are denied; everything
/// else is allowed.
pub fn validate_node_deletion(node: &Node) -> AdmissionVerdict {
    let is_managed = node
        .metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(managed::LABEL_KEY))
        .is_some_and(|v| v == managed::LABEL_VALUE);

    if is_managed {
        AdmissionVerdict::allow()
    } else {
        AdmissionVerdict::deny(vec![format!(
            "node '{}' does not carry {}={} and may not be deleted by this operator",
            node.metadata.name.as_deref().unwrap_or("<unknown>"),
            managed::LABEL_KEY,
            managed::LABEL_VALUE,
        )])
    }
}
