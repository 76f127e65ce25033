//! Pod-scheduling simulation primitives shared by the Resource Analyzer (C7,
//! pod→pool matching) and Scale-Down Safety (C9, per-pod schedulability
//! simulation against remaining nodes).
//!
//! These functions reproduce Kubernetes' own toleration/taint, node-selector,
//! node-affinity, and pod-anti-affinity semantics closely enough to decide
//! "would this pod still be schedulable" without talking to the scheduler.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelector, NodeSelectorTerm, Pod, PodAffinityTerm, PodAntiAffinity, Toleration,
};

use crate::crd::{PoolTaint, TaintEffect};

/// A single taint, either from a live Kubernetes Node or a Pool spec.
#[derive(Debug, Clone)]
pub struct Taint {
    pub key: String,
    pub value: Option<String>,
    pub effect: String,
}

impl From<&PoolTaint> for Taint {
    fn from(t: &PoolTaint) -> Self {
        Taint {
            key: t.key.clone(),
            value: t.value.clone(),
            effect: match t.effect {
                TaintEffect::NoSchedule => "NoSchedule".to_string(),
                TaintEffect::PreferNoSchedule => "PreferNoSchedule".to_string(),
                TaintEffect::NoExecute => "NoExecute".to_string(),
            },
        }
    }
}

/// Does `toleration` tolerate `taint`? Mirrors Kubernetes semantics exactly:
/// an empty key with `Operator=Exists` tolerates everything; an empty
/// effect tolerates all effects; `PreferNoSchedule` is a soft signal and is
/// ignored for hard scheduling checks (callers filter it out beforehand).
pub fn toleration_tolerates(toleration: &Toleration, taint: &Taint) -> bool {
    if let Some(effect) = &toleration.effect {
        if !effect.is_empty() && effect != &taint.effect {
            return false;
        }
    }

    let operator = toleration.operator.as_deref().unwrap_or("Equal");

    match toleration.key.as_deref() {
        None | Some("") => operator == "Exists",
        Some(key) if key != taint.key => false,
        Some(_) => match operator {
            "Exists" => true,
            "Equal" => toleration.value.as_deref().unwrap_or("") == taint.value.as_deref().unwrap_or(""),
            _ => false,
        },
    }
}

/// Hard-check taints (`NoSchedule`/`NoExecute`) only — `PreferNoSchedule` is
/// advisory and never blocks scheduling.
fn hard_taints(taints: &[Taint]) -> impl Iterator<Item = &Taint> {
    taints.iter().filter(|t| t.effect != "PreferNoSchedule")
}

/// Would `tolerations` let a pod run on a node carrying `taints`?
pub fn tolerates_all(tolerations: &[Toleration], taints: &[Taint]) -> bool {
    hard_taints(taints).all(|taint| tolerations.iter().any(|tol| toleration_tolerates(tol, taint)))
}

/// Does a pod's `nodeSelector` match `node_labels`? An empty selector
/// matches any node.
pub fn node_selector_matches(selector: &BTreeMap<String, String>, node_labels: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| node_labels.get(k) == Some(v))
}

fn selector_term_matches(term: &NodeSelectorTerm, node_labels: &BTreeMap<String, String>) -> bool {
    let expr_match = term.match_expressions.as_ref().is_none_or(|exprs| {
        exprs.iter().all(|e| match e.operator.as_str() {
            "In" => node_labels
                .get(&e.key)
                .is_some_and(|v| e.values.as_ref().is_some_and(|vals| vals.contains(v))),
            "NotIn" => !node_labels
                .get(&e.key)
                .is_some_and(|v| e.values.as_ref().is_some_and(|vals| vals.contains(v))),
            "Exists" => node_labels.contains_key(&e.key),
            "DoesNotExist" => !node_labels.contains_key(&e.key),
            _ => false,
        })
    });
    let field_match = term.match_fields.as_ref().is_none_or(|f| f.is_empty());
    expr_match && field_match
}

fn node_selector_required_matches(selector: &NodeSelector, node_labels: &BTreeMap<String, String>) -> bool {
    selector.node_selector_terms.iter().any(|term| selector_term_matches(term, node_labels))
}

/// Checks only `requiredDuringSchedulingIgnoredDuringExecution` node
/// affinity, per the spec's "must reproduce... exactly" note; preferred
/// terms are advisory and never block scheduling.
pub fn node_affinity_satisfied(affinity: Option<&NodeAffinity>, node_labels: &BTreeMap<String, String>) -> bool {
    match affinity.and_then(|a| a.required_during_scheduling_ignored_during_execution.as_ref()) {
        None => true,
        Some(selector) => node_selector_required_matches(selector, node_labels),
    }
}

/// Minimal view of a node already hosting pods, for anti-affinity checks.
#[derive(Debug, Clone, Default)]
pub struct NodeWithPods {
    pub labels: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
    pub pod_labels: Vec<BTreeMap<String, String>>,
}

fn pod_affinity_term_violated(term: &PodAffinityTerm, candidate: &NodeWithPods) -> bool {
    let topology_matches = candidate.labels.contains_key(&term.topology_key);
    if !topology_matches {
        return false;
    }
    let Some(selector) = &term.label_selector else { return false };
    let match_labels = selector.match_labels.clone().unwrap_or_default();

    candidate.pod_labels.iter().any(|labels| match_labels.iter().all(|(k, v)| labels.get(k) == Some(v)))
}

/// Would scheduling this pod onto `candidate` violate any
/// `requiredDuringSchedulingIgnoredDuringExecution` pod anti-affinity term?
/// Preferred terms are ignored, matching the hard-check-only contract.
pub fn violates_pod_anti_affinity(anti_affinity: Option<&PodAntiAffinity>, candidate: &NodeWithPods) -> bool {
    let Some(aa) = anti_affinity else { return false };
    let Some(terms) = &aa.required_during_scheduling_ignored_during_execution else { return false };
    terms.iter().any(|term| pod_affinity_term_violated(term, candidate))
}

/// Full schedulability check for `pod` against `candidate`, in the spec's
/// cheapest-first order: tolerations -> nodeSelector -> nodeAffinity ->
/// podAntiAffinity. Returns `Err(reason)` naming the first failing
/// constraint.
pub fn pod_fits_node(pod: &Pod, candidate: &NodeWithPods) -> Result<(), &'static str> {
    let spec = pod.spec.as_ref();
    let tolerations = spec.and_then(|s| s.tolerations.clone()).unwrap_or_default();
    if !tolerates_all(&tolerations, &candidate.taints) {
        return Err("tolerations");
    }

    let node_selector = spec.and_then(|s| s.node_selector.clone()).unwrap_or_default();
    let node_selector: BTreeMap<String, String> = node_selector.into_iter().collect();
    if !node_selector_matches(&node_selector, &candidate.labels) {
        return Err("nodeSelector");
    }

    let affinity = spec.and_then(|s| s.affinity.as_ref());
    if !node_affinity_satisfied(affinity.and_then(|a| a.node_affinity.as_ref()), &candidate.labels) {
        return Err("nodeAffinity");
    }

    if violates_pod_anti_affinity(affinity.and_then(|a| a.pod_anti_affinity.as_ref()), candidate) {
        return Err("podAntiAffinity");
    }

    Ok(())
}
