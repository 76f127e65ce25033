//! C2 — Managed-Pool Filter.
//!
//! The single-source label contract every other component uses to scope
//! its operations. No component may act on a Pool that does not carry
//! `LABEL_KEY=LABEL_VALUE` — this is the multi-tenant opt-in safety net.

use std::collections::BTreeMap;

use kube::api::ListParams;

use crate::crd::NodeGroup;

pub const LABEL_KEY: &str = "vpsie.example.com/managed";
pub const LABEL_VALUE: &str = "true";

pub fn is_managed(pool: &NodeGroup) -> bool {
    pool.metadata
        .labels
        .as_ref()
        .and_then(|l| l.get(LABEL_KEY))
        .is_some_and(|v| v == LABEL_VALUE)
}

pub fn set_managed(labels: &mut BTreeMap<String, String>) {
    labels.insert(LABEL_KEY.to_string(), LABEL_VALUE.to_string());
}

/// A `ListParams` pre-scoped to managed Pools, for direct use in list calls.
pub fn managed_selector() -> ListParams {
    ListParams::default().labels(&format!("{LABEL_KEY}={LABEL_VALUE}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::NodeGroupSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn pool_with_labels(labels: Option<BTreeMap<String, String>>) -> NodeGroup {
        NodeGroup {
            metadata: ObjectMeta { labels, ..Default::default() },
            spec: NodeGroupSpec::default(),
            status: None,
        }
    }

    #[test]
    fn unlabeled_pool_is_not_managed() {
        assert!(!is_managed(&pool_with_labels(None)));
    }

    #[test]
    fn pool_with_wrong_value_is_not_managed() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_KEY.to_string(), "false".to_string());
        assert!(!is_managed(&pool_with_labels(Some(labels))));
    }

    #[test]
    fn pool_with_managed_label_is_managed() {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_KEY.to_string(), "true".to_string());
        assert!(is_managed(&pool_with_labels(Some(labels))));
    }

    #[test]
    fn set_managed_inserts_correct_pair() {
        let mut labels = BTreeMap::new();
        set_managed(&mut labels);
        assert_eq!(labels.get(LABEL_KEY), Some(&"true".to_string()));
    }

    #[test]
    fn managed_selector_contains_label_key() {
        let params = managed_selector();
        assert_eq!(params.label_selector.as_deref(), Some("vpsie.example.com/managed=true"));
    }
}
