use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Node, Pod, PodSpec, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

use vpsie_autoscaler::crd::{NodeGroupSpec, VPSieNodeSpec};

pub fn make_test_pool_spec(
    min_nodes: u32,
    max_nodes: u32,
    offering_ids: Vec<&str>,
    datacenter_id: &str,
) -> NodeGroupSpec {
    NodeGroupSpec {
        min_nodes,
        max_nodes,
        offering_ids: offering_ids.into_iter().map(String::from).collect(),
        datacenter_id: datacenter_id.to_string(),
        os_image_id: "ubuntu-22-04".to_string(),
        kubernetes_version: "v1.28.3".to_string(),
        ..Default::default()
    }
}

pub fn make_test_instance_spec(pool_name: &str, datacenter_id: &str, instance_type: &str) -> VPSieNodeSpec {
    VPSieNodeSpec {
        pool_name: pool_name.to_string(),
        datacenter_id: datacenter_id.to_string(),
        instance_type: instance_type.to_string(),
        os_image_id: "ubuntu-22-04".to_string(),
        kubernetes_version: "v1.28.3".to_string(),
        ..Default::default()
    }
}

pub fn make_test_node(name: &str, labels: BTreeMap<String, String>) -> Node {
    Node {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels),
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn make_test_pod(name: &str, namespace: &str, node_name: Option<&str>) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            node_name: node_name.map(String::from),
            ..Default::default()
        }),
        status: Some(PodStatus::default()),
    }
}
