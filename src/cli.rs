use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "vpsie-autoscaler")]
#[command(about = "Cluster-autoscaler operator for the provider VM fleet")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Display application version
    Version,

    /// Check cluster connectivity and permissions
    Check,

    /// Run the operator reconcile loop (leader election, controllers, tickers)
    Operator(OperatorArgs),

    /// Manage the admission webhook
    Webhook {
        #[command(subcommand)]
        action: WebhookAction,
    },

    /// Manage the NodeGroup / VPSieNode CRDs
    Crd {
        #[command(subcommand)]
        action: CrdAction,
    },

    /// Scale-down safety tooling
    ScaleDown {
        #[command(subcommand)]
        action: ScaleDownAction,
    },
}

#[derive(Args, Clone, Debug)]
pub struct OperatorArgs {
    /// Path to a kubeconfig file. Empty uses in-cluster config.
    #[arg(long)]
    pub kubeconfig: Option<String>,

    #[arg(long, default_value = "0.0.0.0:9090")]
    pub metrics_addr: String,

    /// Disable leader election (always act as leader). Useful for local dev.
    #[arg(long)]
    pub no_leader_election: bool,

    #[arg(long, default_value = "vpsie-autoscaler-leader")]
    pub lease_name: String,

    #[arg(long, default_value = "default")]
    pub lease_namespace: String,

    #[arg(long, default_value_t = 30)]
    pub sync_period_seconds: u64,

    #[arg(long, default_value = "vpsie-credentials")]
    pub credentials_secret_name: String,

    #[arg(long, default_value = "default")]
    pub credentials_secret_namespace: String,

    /// Default datacenter id used when dynamically creating a new pool.
    #[arg(long, default_value = "")]
    pub default_datacenter_id: String,

    /// Default offering ids used when dynamically creating a new pool.
    #[arg(long = "default-offering-id")]
    pub default_offering_ids: Vec<String>,

    #[arg(long, default_value = "")]
    pub default_cluster_id: String,

    #[arg(long, default_value = "")]
    pub default_kubernetes_version: String,

    #[arg(long, default_value = "")]
    pub default_os_image_id: String,

    #[arg(long)]
    pub default_kube_size_id: Option<String>,

    /// Skip leader election and run with reduced timeouts, for local iteration.
    #[arg(long)]
    pub development_mode: bool,

    #[arg(long, default_value = "info")]
    pub log_level: String,

    #[arg(long, default_value = "console", value_parser = ["json", "console"])]
    pub log_format: String,
}

#[derive(Subcommand)]
pub enum WebhookAction {
    /// Start the admission webhook HTTPS server
    Serve(WebhookServeArgs),
    /// Generate self-signed TLS certificates for development
    CertGenerate {
        #[arg(long, default_value = "vpsie-autoscaler-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long, default_value = ".")]
        output_dir: String,
        /// Additional IP SANs (e.g. --ip-san 192.168.1.26)
        #[arg(long = "ip-san")]
        ip_sans: Vec<String>,
    },
    /// Print the ValidatingWebhookConfiguration YAML
    InstallConfig {
        #[arg(long, default_value = "vpsie-autoscaler-webhook")]
        service_name: String,
        #[arg(long, default_value = "default")]
        namespace: String,
        #[arg(long)]
        ca_bundle_path: String,
    },
}

#[derive(Args, Clone, Debug)]
pub struct WebhookServeArgs {
    #[arg(long, default_value = "0.0.0.0:8443")]
    pub addr: String,
    #[arg(long, default_value = "tls.crt")]
    pub tls_cert: String,
    #[arg(long, default_value = "tls.key")]
    pub tls_key: String,
    /// Namespace Pools and Instances must live in to be admitted.
    #[arg(long, default_value = "default")]
    pub operator_namespace: String,
}

#[derive(Subcommand)]
pub enum CrdAction {
    /// Print the CRD YAML to stdout
    Generate,
    /// Install the CRDs into the connected cluster
    Install,
}

#[derive(Subcommand)]
pub enum ScaleDownAction {
    /// Offline report of which Instances in a Pool are currently safe to
    /// remove, without mutating anything.
    Simulate {
        /// Namespace the Pool lives in.
        #[arg(long, default_value = "default")]
        namespace: String,
        /// NodeGroup name to simulate scale-down for.
        pool_name: String,
    },
}
