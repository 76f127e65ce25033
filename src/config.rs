//! Runtime configuration assembled from CLI flags, with environment
//! overrides for the pieces that operators usually template per cluster
//! (credential secret location, dynamic-pool defaults).

use std::time::Duration;

use crate::cli::{OperatorArgs, WebhookServeArgs};

/// Defaults applied when the scale-up pipeline (C5) creates a brand new
/// managed pool for pods that fit no existing one.
#[derive(Debug, Clone)]
pub struct OperatorDefaults {
    pub datacenter_id: String,
    pub offering_ids: Vec<String>,
    pub cluster_id: String,
    pub kubernetes_version: String,
    pub os_image_id: String,
    pub kube_size_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub kubeconfig: Option<String>,
    pub metrics_addr: String,
    pub leader_election_enabled: bool,
    pub lease_name: String,
    pub lease_namespace: String,
    pub sync_period: Duration,
    pub credentials_secret_name: String,
    pub credentials_secret_namespace: String,
    pub defaults: OperatorDefaults,
    pub development_mode: bool,
}

impl Config {
    pub fn from_cli(args: &OperatorArgs) -> Self {
        let kubeconfig = std::env::var("VPSIE_KUBECONFIG")
            .ok()
            .or_else(|| args.kubeconfig.clone());

        let credentials_secret_name = std::env::var("VPSIE_CREDENTIALS_SECRET_NAME")
            .unwrap_or_else(|_| args.credentials_secret_name.clone());
        let credentials_secret_namespace = std::env::var("VPSIE_CREDENTIALS_SECRET_NAMESPACE")
            .unwrap_or_else(|_| args.credentials_secret_namespace.clone());

        Self {
            kubeconfig,
            metrics_addr: args.metrics_addr.clone(),
            leader_election_enabled: !args.no_leader_election,
            lease_name: args.lease_name.clone(),
            lease_namespace: args.lease_namespace.clone(),
            sync_period: Duration::from_secs(args.sync_period_seconds),
            credentials_secret_name,
            credentials_secret_namespace,
            defaults: OperatorDefaults {
                datacenter_id: args.default_datacenter_id.clone(),
                offering_ids: args.default_offering_ids.clone(),
                cluster_id: args.default_cluster_id.clone(),
                kubernetes_version: args.default_kubernetes_version.clone(),
                os_image_id: args.default_os_image_id.clone(),
                kube_size_id: args.default_kube_size_id.clone(),
            },
            development_mode: args.development_mode,
        }
    }
}

/// Bind address + TLS material paths for the admission webhook transport.
#[derive(Debug, Clone)]
pub struct WebhookConfig {
    pub addr: String,
    pub tls_cert: String,
    pub tls_key: String,
    pub operator_namespace: String,
}

impl WebhookConfig {
    pub fn from_cli(args: &WebhookServeArgs) -> Self {
        Self {
            addr: args.addr.clone(),
            tls_cert: args.tls_cert.clone(),
            tls_key: args.tls_key.clone(),
            operator_namespace: args.operator_namespace.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::OperatorArgs;

    fn base_args() -> OperatorArgs {
        OperatorArgs {
            kubeconfig: None,
            metrics_addr: "0.0.0.0:9090".to_string(),
            no_leader_election: false,
            lease_name: "vpsie-autoscaler-leader".to_string(),
            lease_namespace: "default".to_string(),
            sync_period_seconds: 30,
            credentials_secret_name: "vpsie-credentials".to_string(),
            credentials_secret_namespace: "default".to_string(),
            default_datacenter_id: "dc1".to_string(),
            default_offering_ids: vec!["small".to_string()],
            default_cluster_id: "cluster1".to_string(),
            default_kubernetes_version: "v1.28.3".to_string(),
            default_os_image_id: "ubuntu-22.04".to_string(),
            default_kube_size_id: None,
            development_mode: false,
            log_level: "info".to_string(),
            log_format: "console".to_string(),
        }
    }

    #[test]
    fn leader_election_enabled_by_default() {
        let cfg = Config::from_cli(&base_args());
        assert!(cfg.leader_election_enabled);
    }

    #[test]
    fn no_leader_election_flag_disables_election() {
        let mut args = base_args();
        args.no_leader_election = true;
        let cfg = Config::from_cli(&args);
        assert!(!cfg.leader_election_enabled);
    }

    #[test]
    fn sync_period_converts_seconds_to_duration() {
        let cfg = Config::from_cli(&base_args());
        assert_eq!(cfg.sync_period, Duration::from_secs(30));
    }
}
