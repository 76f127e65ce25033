//! C7 — Resource Analyzer.
//!
//! Given a batch of scheduling-failure events (as the Pods that produced
//! them) and the set of managed Pools, computes pod→pool matches, an
//! aggregate resource deficit per Pool, a cost-weighted match score, the
//! number of nodes needed, and the cheapest offering that covers the
//! deficit.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

use crate::crd::NodeGroup;
use crate::provider::K8sOffer;
use crate::scheduling::{self, Taint};

const MAX_PODS_PER_NODE: i64 = 110;
const REFERENCE_MONTHLY_PRICE: f64 = 50.0;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    pub cpu_millis: i64,
    pub memory_bytes: i64,
}

impl ResourceRequest {
    fn max(self, other: ResourceRequest) -> ResourceRequest {
        ResourceRequest { cpu_millis: self.cpu_millis.max(other.cpu_millis), memory_bytes: self.memory_bytes.max(other.memory_bytes) }
    }

    fn add(self, other: ResourceRequest) -> ResourceRequest {
        ResourceRequest { cpu_millis: self.cpu_millis + other.cpu_millis, memory_bytes: self.memory_bytes + other.memory_bytes }
    }
}

/// Parses a Kubernetes CPU quantity (`"500m"`, `"2"`) into millicores.
pub fn parse_cpu_millis(q: &Quantity) -> i64 {
    let s = q.0.trim();
    if let Some(milli) = s.strip_suffix('m') {
        milli.parse::<i64>().unwrap_or(0)
    } else {
        (s.parse::<f64>().unwrap_or(0.0) * 1000.0).round() as i64
    }
}

/// Parses a Kubernetes memory quantity (`"512Mi"`, `"2Gi"`, `"1000000"`) into bytes.
pub fn parse_memory_bytes(q: &Quantity) -> i64 {
    let s = q.0.trim();
    const UNITS: &[(&str, i64)] =
        &[("Ki", 1024), ("Mi", 1024 * 1024), ("Gi", 1024 * 1024 * 1024), ("Ti", 1024i64.pow(4)), ("K", 1000), ("M", 1_000_000), ("G", 1_000_000_000), ("T", 1_000_000_000_000)];

    for (suffix, factor) in UNITS {
        if let Some(num) = s.strip_suffix(suffix) {
            return (num.parse::<f64>().unwrap_or(0.0) * *factor as f64).round() as i64;
        }
    }
    s.parse::<i64>().unwrap_or(0)
}

fn container_request(resources: &Option<k8s_openapi::api::core::v1::ResourceRequirements>) -> ResourceRequest {
    let Some(res) = resources else { return ResourceRequest::default() };
    let Some(requests) = &res.requests else { return ResourceRequest::default() };
    ResourceRequest {
        cpu_millis: requests.get("cpu").map(parse_cpu_millis).unwrap_or(0),
        memory_bytes: requests.get("memory").map(parse_memory_bytes).unwrap_or(0),
    }
}

/// `sum(container.requests)` combined with `max(initContainer.requests)`,
/// since init containers run sequentially and never overlap each other or
/// the main containers.
pub fn pod_resource_request(pod: &Pod) -> ResourceRequest {
    let Some(spec) = &pod.spec else { return ResourceRequest::default() };

    let containers_total = spec.containers.iter().fold(ResourceRequest::default(), |acc, c| acc.add(container_request(&c.resources)));

    let init_max = spec
        .init_containers
        .as_ref()
        .map(|cs| cs.iter().fold(ResourceRequest::default(), |acc, c| acc.max(container_request(&c.resources))))
        .unwrap_or_default();

    containers_total.max(init_max)
}

/// The node-selector / taint-toleration symmetry rule: a pod with no
/// selector matches only Pools with no labels (prevents accidental
/// placement on specialised pools); a pod with a selector must have every
/// key map to an identical value on the Pool, and must tolerate every Pool
/// taint.
pub fn pod_matches_pool(pod: &Pod, pool: &NodeGroup) -> bool {
    let selector: BTreeMap<String, String> = pod.spec.as_ref().and_then(|s| s.node_selector.clone()).unwrap_or_default().into_iter().collect();

    let labels_match = if selector.is_empty() { pool.spec.labels.is_empty() } else { selector.iter().all(|(k, v)| pool.spec.labels.get(k) == Some(v)) };
    if !labels_match {
        return false;
    }

    let tolerations = pod.spec.as_ref().and_then(|s| s.tolerations.clone()).unwrap_or_default();
    let taints: Vec<Taint> = pool.spec.taints.iter().map(Taint::from).collect();
    scheduling::tolerates_all(&tolerations, &taints)
}

#[derive(Debug, Clone)]
pub struct PoolMatch {
    pub pool_name: String,
    pub pod_count: usize,
    pub deficit: ResourceRequest,
    pub nodes_needed: u32,
    pub selected_offering: Option<K8sOffer>,
    pub score: f64,
}

fn cost_score(monthly_price: f64) -> f64 {
    if monthly_price <= 0.0 {
        return 500.0;
    }
    (500.0 * REFERENCE_MONTHLY_PRICE / monthly_price).clamp(10.0, 500.0)
}

/// `preferredInstanceType` if it is in the pool's offerings, else the
/// cheapest offering that covers `per_node_need` on both axes, else the
/// first offering.
pub fn select_instance_type<'a>(pool: &NodeGroup, per_node_need: ResourceRequest, offerings: &'a [K8sOffer]) -> Option<&'a K8sOffer> {
    if let Some(preferred) = &pool.spec.preferred_instance_type {
        if let Some(offer) = offerings.iter().find(|o| &o.offering_id == preferred) {
            return Some(offer);
        }
    }

    let mut viable: Vec<&K8sOffer> =
        offerings.iter().filter(|o| o.cpu_cores as i64 * 1000 >= per_node_need.cpu_millis && o.memory_mb as i64 * 1024 * 1024 >= per_node_need.memory_bytes).collect();
    viable.sort_by(|a, b| a.monthly_price.partial_cmp(&b.monthly_price).unwrap_or(std::cmp::Ordering::Equal));

    viable.into_iter().next().or_else(|| offerings.first())
}

/// Deduplicates `pods` by `(namespace, name)`, matches each against every
/// managed Pool in `pools`, aggregates the deficit, scores matching Pools,
/// and returns them sorted descending by score (ties broken by name).
pub fn analyze(pods: &[Pod], pools: &[NodeGroup], catalog: &[K8sOffer]) -> Vec<PoolMatch> {
    let mut seen = std::collections::HashSet::new();
    let deduped: Vec<&Pod> = pods
        .iter()
        .filter(|p| {
            let key = (p.metadata.namespace.clone().unwrap_or_default(), p.metadata.name.clone().unwrap_or_default());
            seen.insert(key)
        })
        .collect();

    let mut matches = Vec::new();

    for pool in pools {
        let matched_pods: Vec<&Pod> = deduped.iter().filter(|p| pod_matches_pool(p, pool)).copied().collect();
        if matched_pods.is_empty() {
            continue;
        }

        let total = matched_pods.iter().fold(ResourceRequest::default(), |acc, p| acc.add(pod_resource_request(p)));
        let max_single = matched_pods.iter().fold(ResourceRequest::default(), |acc, p| acc.max(pod_resource_request(p)));

        let offerings: Vec<K8sOffer> = catalog.iter().filter(|o| pool.spec.offering_ids.contains(&o.offering_id)).cloned().collect();
        let selected = select_instance_type(pool, max_single, &offerings).cloned();

        let per_node_cpu = selected.as_ref().map(|o| o.cpu_cores as i64 * 1000).unwrap_or(1000);
        let per_node_mem = selected.as_ref().map(|o| o.memory_mb as i64 * 1024 * 1024).unwrap_or(1024 * 1024 * 1024);

        let nodes_needed = [
            div_ceil(total.cpu_millis, per_node_cpu.max(1)),
            div_ceil(total.memory_bytes, per_node_mem.max(1)),
            div_ceil(matched_pods.len() as i64, MAX_PODS_PER_NODE),
        ]
        .into_iter()
        .max()
        .unwrap_or(0)
        .max(1) as u32;

        let desired = pool.status.as_ref().map(|s| s.desired_nodes as i64).unwrap_or(0);
        let max_nodes = pool.spec.max_nodes as i64;
        let headroom = (max_nodes - desired).max(0);
        let cost = selected.as_ref().map(|o| cost_score(o.monthly_price)).unwrap_or(cost_score(REFERENCE_MONTHLY_PRICE));

        let score = 100.0 * matched_pods.len() as f64
            + 50.0 * headroom as f64
            + if desired < max_nodes { 200.0 } else { 0.0 }
            + if pool.spec.preferred_instance_type.is_some() { 100.0 } else { 0.0 }
            + cost;

        matches.push(PoolMatch {
            pool_name: pool.metadata.name.clone().unwrap_or_default(),
            pod_count: matched_pods.len(),
            deficit: total,
            nodes_needed,
            selected_offering: selected,
            score,
        });
    }

    matches.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal).then_with(|| a.pool_name.cmp(&b.pool_name)));
    matches
}

fn div_ceil(n: i64, d: i64) -> i64 {
    if n <= 0 { 0 } else { (n + d - 1) / d }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeGroupSpec;
    use k8s_openapi::api::core::v1::{Container, PodSpec, ResourceRequirements, Toleration};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn quantity(v: &str) -> Quantity {
        Quantity(v.to_string())
    }

    fn pod_with(cpu: &str, mem: &str, selector: Option<(&str, &str)>, tolerations: Vec<Toleration>) -> Pod {
        let mut requests = BTreeMap::new();
        requests.insert("cpu".to_string(), quantity(cpu));
        requests.insert("memory".to_string(), quantity(mem));

        Pod {
            metadata: ObjectMeta { name: Some("p".to_string()), namespace: Some("default".to_string()), ..Default::default() },
            spec: Some(PodSpec {
                containers: vec![Container { name: "c".to_string(), resources: Some(ResourceRequirements { requests: Some(requests), ..Default::default() }), ..Default::default() }],
                node_selector: selector.map(|(k, v)| BTreeMap::from([(k.to_string(), v.to_string())]).into_iter().collect()),
                tolerations: if tolerations.is_empty() { None } else { Some(tolerations) },
                ..Default::default()
            }),
            status: None,
        }
    }

    fn pool(name: &str, offering_ids: Vec<&str>, labels: BTreeMap<String, String>) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta { name: Some(name.to_string()), ..Default::default() },
            spec: NodeGroupSpec {
                max_nodes: 5,
                offering_ids: offering_ids.into_iter().map(String::from).collect(),
                labels,
                ..Default::default()
            },
            status: None,
        }
    }

    #[test]
    fn parses_cpu_millicores_and_cores() {
        assert_eq!(parse_cpu_millis(&quantity("500m")), 500);
        assert_eq!(parse_cpu_millis(&quantity("2")), 2000);
    }

    #[test]
    fn parses_memory_units() {
        assert_eq!(parse_memory_bytes(&quantity("1Ki")), 1024);
        assert_eq!(parse_memory_bytes(&quantity("2Mi")), 2 * 1024 * 1024);
        assert_eq!(parse_memory_bytes(&quantity("1000")), 1000);
    }

    #[test]
    fn pod_with_no_selector_only_matches_labelless_pool() {
        let pod = pod_with("100m", "128Mi", None, vec![]);
        let plain_pool = pool("p1", vec!["small"], BTreeMap::new());
        let labeled_pool = pool("p2", vec!["small"], BTreeMap::from([("zone".to_string(), "a".to_string())]));
        assert!(pod_matches_pool(&pod, &plain_pool));
        assert!(!pod_matches_pool(&pod, &labeled_pool));
    }

    #[test]
    fn pod_with_selector_requires_matching_label_and_toleration() {
        let tol = Toleration { key: Some("gpu".to_string()), operator: Some("Equal".to_string()), value: Some("true".to_string()), effect: Some("NoSchedule".to_string()), toleration_seconds: None };
        let pod = pod_with("100m", "128Mi", Some(("gpu", "true")), vec![tol]);
        let mut p = pool("gpu-pool", vec!["small"], BTreeMap::from([("gpu".to_string(), "true".to_string())]));
        p.spec.taints = vec![crate::crd::PoolTaint { key: "gpu".to_string(), value: Some("true".to_string()), effect: crate::crd::TaintEffect::NoSchedule }];
        assert!(pod_matches_pool(&pod, &p));
    }

    #[test]
    fn analyze_scores_pools_with_more_matching_pods_higher() {
        let offerings = vec![
            K8sOffer { offering_id: "small".to_string(), cpu_cores: 2, memory_mb: 4096, monthly_price: 20.0 },
        ];
        let pool_a = pool("a", vec!["small"], BTreeMap::new());
        let pods = vec![pod_with("100m", "128Mi", None, vec![]), pod_with("100m", "128Mi", None, vec![])];
        let matches = analyze(&pods, &[pool_a], &offerings);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].pod_count, 2);
        assert_eq!(matches[0].nodes_needed, 1);
    }

    #[test]
    fn analyze_deduplicates_by_namespace_and_name() {
        let offerings = vec![K8sOffer { offering_id: "small".to_string(), cpu_cores: 2, memory_mb: 4096, monthly_price: 20.0 }];
        let pool_a = pool("a", vec!["small"], BTreeMap::new());
        let pod = pod_with("100m", "128Mi", None, vec![]);
        let matches = analyze(&[pod.clone(), pod], &[pool_a], &offerings);
        assert_eq!(matches[0].pod_count, 1);
    }

    #[test]
    fn select_instance_type_prefers_preferred_when_present() {
        let offerings = vec![
            K8sOffer { offering_id: "small".to_string(), cpu_cores: 1, memory_mb: 1024, monthly_price: 10.0 },
            K8sOffer { offering_id: "big".to_string(), cpu_cores: 4, memory_mb: 8192, monthly_price: 80.0 },
        ];
        let mut p = pool("p", vec!["small", "big"], BTreeMap::new());
        p.spec.preferred_instance_type = Some("big".to_string());
        let chosen = select_instance_type(&p, ResourceRequest { cpu_millis: 100, memory_bytes: 1 }, &offerings);
        assert_eq!(chosen.unwrap().offering_id, "big");
    }

    #[test]
    fn select_instance_type_picks_cheapest_meeting_deficit() {
        let offerings = vec![
            K8sOffer { offering_id: "big".to_string(), cpu_cores: 4, memory_mb: 8192, monthly_price: 80.0 },
            K8sOffer { offering_id: "small".to_string(), cpu_cores: 2, memory_mb: 4096, monthly_price: 20.0 },
        ];
        let p = pool("p", vec!["small", "big"], BTreeMap::new());
        let chosen = select_instance_type(&p, ResourceRequest { cpu_millis: 500, memory_bytes: 1024 * 1024 }, &offerings);
        assert_eq!(chosen.unwrap().offering_id, "small");
    }

    #[test]
    fn cost_score_is_clamped_between_10_and_500() {
        assert_eq!(cost_score(1_000_000.0).max(10.0), cost_score(1_000_000.0));
        assert!(cost_score(1_000_000.0) >= 10.0);
        assert!(cost_score(0.001) <= 500.0);
    }
}
