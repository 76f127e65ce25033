use std::net::SocketAddr;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use kube::Client;
use prometheus::{Encoder, Histogram, IntCounterVec, Registry, TextEncoder};
use tokio::sync::broadcast;
use tracing::info;

use k8s_openapi::api::core::v1::Node;
use vpsie_autoscaler::admission::{self, AdmissionVerdict};
use vpsie_autoscaler::crd::{NodeGroupSpec, VPSieNodeSpec};

/* ============================= PROMETHEUS ============================= */

static WEBHOOK_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

static WEBHOOK_REQUESTS: LazyLock<IntCounterVec> = LazyLock::new(|| {
    let c = IntCounterVec::new(
        prometheus::Opts::new("webhook_requests_total", "Total admission webhook requests"),
        &["route", "allowed"],
    )
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(c.clone())).expect("metric not yet registered");
    c
});

static WEBHOOK_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    let h = Histogram::with_opts(prometheus::HistogramOpts::new(
        "webhook_request_duration_seconds",
        "Duration of admission webhook request processing in seconds",
    ))
    .expect("metric definition is valid");
    WEBHOOK_REGISTRY.register(Box::new(h.clone())).expect("metric not yet registered");
    h
});

const BODY_LIMIT_BYTES: usize = 128 * 1024;

/* ============================= STATE ============================= */

#[derive(Clone)]
pub(crate) struct WebhookState {
    pub(crate) client: Client,
    pub(crate) operator_namespace: String,
}

/* ============================= ENTRY: SERVE ============================= */

pub async fn serve(addr_str: &str, tls_cert: &str, tls_key: &str, operator_namespace: &str) -> Result<()> {
    println!("Starting admission webhook server...\n");
    info!("webhook_starting");

    let client = Client::try_default().await.context("Failed to connect to Kubernetes cluster")?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  TLS ......................... ");
    validate_tls_files(tls_cert, tls_key)?;
    println!("loaded ({tls_cert}, {tls_key})");

    let addr: SocketAddr = addr_str.parse().context("Invalid address format")?;

    println!("  HTTPS server ................ https://{addr}");
    println!();
    println!("  Available endpoints:");
    println!("    POST /validate/pools ...... Pool admission review");
    println!("    POST /validate/instances .. Instance admission review");
    println!("    POST /validate/node-deletion Node-deletion admission review");
    println!("    GET  /healthz ............. Liveness probe");
    println!("    GET  /readyz .............. Readiness probe");
    println!("    GET  /metrics ............. Prometheus metrics");
    println!();
    println!("Admission webhook running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let state = WebhookState { client, operator_namespace: operator_namespace.to_string() };

    let tls_cert = tls_cert.to_string();
    let tls_key = tls_key.to_string();

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let http_shutdown = shutdown_tx.subscribe();

    let http_handle =
        tokio::spawn(async move { start_https_server(state, http_shutdown, addr, &tls_cert, &tls_key).await });

    tokio::signal::ctrl_c().await?;
    info!("shutdown_signal_received");
    println!("\n{}", "=".repeat(70));
    println!("Shutdown signal received. Stopping webhook server...");
    println!("{}", "=".repeat(70));

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;

    info!("webhook_stopped");
    println!("Webhook server stopped.");
    Ok(())
}

/* ============================= TLS ============================= */

fn validate_tls_files(cert_path: &str, key_path: &str) -> Result<()> {
    if !std::path::Path::new(cert_path).exists() {
        anyhow::bail!("TLS certificate file not found: {}", cert_path);
    }
    if !std::path::Path::new(key_path).exists() {
        anyhow::bail!("TLS key file not found: {}", key_path);
    }
    Ok(())
}

/* ============================= HTTPS SERVER ============================= */

pub(crate) fn build_webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route("/validate/pools", post(validate_pools_handler))
        .route("/validate/instances", post(validate_instances_handler))
        .route("/validate/node-deletion", post(validate_node_deletion_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route("/readyz", get(|| async { (StatusCode::OK, "READY") }))
        .route("/metrics", get(webhook_metrics_handler))
        .with_state(state)
}

async fn start_https_server(
    state: WebhookState,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
    tls_cert: &str,
    tls_key: &str,
) -> Result<()> {
    let app = build_webhook_router(state);

    let rustls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(tls_cert, tls_key)
        .await
        .context("Failed to load TLS configuration")?;

    info!(addr = %addr, "https_server_started");

    let handle = axum_server::Handle::new();
    let shutdown_handle = handle.clone();

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        shutdown_handle.graceful_shutdown(Some(std::time::Duration::from_secs(5)));
    });

    axum_server::bind_rustls(addr, rustls_config)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}

async fn webhook_metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = WEBHOOK_REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

/* ============================= ADMISSION HANDLERS ============================= */

/// Parses a raw `AdmissionReview` JSON body, rejecting it outright if it
/// exceeds the body limit. Any other parse failure fails open per §4.11.
fn parse_review(body: &str) -> Option<serde_json::Value> {
    if body.len() > BODY_LIMIT_BYTES {
        return None;
    }
    serde_json::from_str(body).ok()
}

async fn validate_pools_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let Some(review) = parse_review(&body) else {
        return fail_open("pools", "");
    };
    let uid = extract_uid(&review);
    let namespace = extract_namespace(&review);

    let spec: NodeGroupSpec = match serde_json::from_value(review["request"]["object"]["spec"].clone()) {
        Ok(s) => s,
        Err(e) => {
            info!(error = %e, "failed_to_parse_pool_spec");
            return fail_open("pools", &uid);
        }
    };

    let verdict = admission::validate_pool(&namespace, &state.operator_namespace, &spec);
    record_and_respond("pools", &uid, verdict)
}

async fn validate_instances_handler(State(state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let Some(review) = parse_review(&body) else {
        return fail_open("instances", "");
    };
    let uid = extract_uid(&review);
    let namespace = extract_namespace(&review);

    let spec: VPSieNodeSpec = match serde_json::from_value(review["request"]["object"]["spec"].clone()) {
        Ok(s) => s,
        Err(e) => {
            info!(error = %e, "failed_to_parse_instance_spec");
            return fail_open("instances", &uid);
        }
    };

    let verdict = admission::validate_instance(&namespace, &state.operator_namespace, &spec);
    record_and_respond("instances", &uid, verdict)
}

async fn validate_node_deletion_handler(State(_state): State<WebhookState>, body: String) -> impl IntoResponse {
    let _timer = WEBHOOK_DURATION.start_timer();

    let Some(review) = parse_review(&body) else {
        return fail_open("node-deletion", "");
    };
    let uid = extract_uid(&review);

    let node: Node = match serde_json::from_value(review["request"]["oldObject"].clone()) {
        Ok(n) => n,
        Err(e) => {
            info!(error = %e, "failed_to_parse_node");
            return fail_open("node-deletion", &uid);
        }
    };

    let verdict = admission::validate_node_deletion(&node);
    record_and_respond("node-deletion", &uid, verdict)
}

fn extract_uid(review: &serde_json::Value) -> String {
    review["request"]["uid"].as_str().unwrap_or("").to_string()
}

fn extract_namespace(review: &serde_json::Value) -> String {
    review["request"]["namespace"].as_str().unwrap_or("default").to_string()
}

fn fail_open(route: &str, uid: &str) -> (StatusCode, String) {
    WEBHOOK_REQUESTS.with_label_values(&[route, "true"]).inc();
    (StatusCode::OK, build_admission_response(uid, true, None))
}

fn record_and_respond(route: &str, uid: &str, verdict: AdmissionVerdict) -> (StatusCode, String) {
    let allowed_str = if verdict.allowed { "true" } else { "false" };
    WEBHOOK_REQUESTS.with_label_values(&[route, allowed_str]).inc();

    if !verdict.allowed {
        info!(route, violations = ?verdict.violations, "admission_denied");
    }

    (StatusCode::OK, build_admission_response(uid, verdict.allowed, verdict.message.as_deref()))
}

fn build_admission_response(uid: &str, allowed: bool, message: Option<&str>) -> String {
    let mut response = serde_json::json!({
        "apiVersion": "admission.k8s.io/v1",
        "kind": "AdmissionReview",
        "response": {
            "uid": uid,
            "allowed": allowed
        }
    });

    if let Some(msg) = message {
        response["response"]["status"] = serde_json::json!({ "message": msg });
    }

    response.to_string()
}

/* ============================= CERT GENERATION ============================= */

pub fn generate_certs(service_name: &str, namespace: &str, output_dir: &str, ip_sans: &[String]) -> Result<()> {
    println!("Generating self-signed TLS certificates...\n");

    let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs(service_name, namespace, ip_sans)?;

    let output_path = std::path::Path::new(output_dir);
    if !output_path.exists() {
        std::fs::create_dir_all(output_path).context("Failed to create output directory")?;
    }

    let ca_path = output_path.join("ca.crt");
    let cert_path = output_path.join("tls.crt");
    let key_path = output_path.join("tls.key");

    std::fs::write(&ca_path, &ca_pem).context("Failed to write ca.crt")?;
    std::fs::write(&cert_path, &cert_pem).context("Failed to write tls.crt")?;
    std::fs::write(&key_path, &key_pem).context("Failed to write tls.key")?;

    println!("  CA certificate .............. {}", ca_path.display());
    println!("  Server certificate .......... {}", cert_path.display());
    println!("  Server key .................. {}", key_path.display());
    println!();
    println!("  Service name ................ {service_name}");
    println!("  Namespace ................... {namespace}");
    println!("  SANs:");
    println!("    - {service_name}.{namespace}.svc");
    println!("    - {service_name}.{namespace}.svc.cluster.local");
    for ip in ip_sans {
        println!("    - {ip} (IP)");
    }
    println!();
    println!("TLS certificates generated successfully.");

    Ok(())
}

pub fn generate_self_signed_certs(
    service_name: &str,
    namespace: &str,
    ip_sans: &[String],
) -> Result<(String, String, String)> {
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, SanType};
    use std::net::IpAddr;

    let mut ca_params = CertificateParams::default();
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "vpsie-autoscaler-webhook-ca");
    ca_dn.push(DnType::OrganizationName, "vpsie-autoscaler");
    ca_params.distinguished_name = ca_dn;

    let ca_key = KeyPair::generate().context("Failed to generate CA key pair")?;
    let ca_cert = ca_params.self_signed(&ca_key).context("Failed to self-sign CA certificate")?;

    let mut server_params = CertificateParams::default();
    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, format!("{service_name}.{namespace}.svc"));
    server_params.distinguished_name = server_dn;

    let mut sans = vec![
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc").try_into().context("Invalid DNS name for SAN")?,
        ),
        SanType::DnsName(
            format!("{service_name}.{namespace}.svc.cluster.local")
                .try_into()
                .context("Invalid DNS name for SAN")?,
        ),
    ];

    for ip_str in ip_sans {
        let ip: IpAddr = ip_str.parse().context(format!("Invalid IP address for SAN: {ip_str}"))?;
        sans.push(SanType::IpAddress(ip));
    }

    server_params.subject_alt_names = sans;

    let server_key = KeyPair::generate().context("Failed to generate server key pair")?;
    let server_cert =
        server_params.signed_by(&server_key, &ca_cert, &ca_key).context("Failed to sign server certificate")?;

    Ok((ca_cert.pem(), server_cert.pem(), server_key.serialize_pem()))
}

/* ============================= INSTALL CONFIG ============================= */

pub fn install_config(service_name: &str, namespace: &str, ca_bundle_path: &str) -> Result<()> {
    use base64::Engine;

    let ca_bytes = std::fs::read(ca_bundle_path).context("Failed to read CA bundle file")?;
    let ca_b64 = base64::engine::general_purpose::STANDARD.encode(&ca_bytes);

    let yaml = format!(
        r#"apiVersion: admissionregistration.k8s.io/v1
kind: ValidatingWebhookConfiguration
metadata:
  name: {service_name}
webhooks:
  - name: validate-pools.vpsie.example.com
    rules:
      - apiGroups: ["vpsie.example.com"]
        resources: ["nodegroups"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate/pools
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: None
    admissionReviewVersions: ["v1"]
  - name: validate-instances.vpsie.example.com
    rules:
      - apiGroups: ["vpsie.example.com"]
        resources: ["vpsienodes"]
        apiVersions: ["v1alpha1"]
        operations: ["CREATE", "UPDATE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate/instances
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: None
    admissionReviewVersions: ["v1"]
  - name: validate-node-deletion.vpsie.example.com
    rules:
      - apiGroups: [""]
        resources: ["nodes"]
        apiVersions: ["v1"]
        operations: ["DELETE"]
    clientConfig:
      service:
        name: {service_name}
        namespace: {namespace}
        path: /validate/node-deletion
      caBundle: {ca_b64}
    failurePolicy: Ignore
    sideEffects: None
    admissionReviewVersions: ["v1"]
"#
    );

    println!("{yaml}");
    Ok(())
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_admission_response_allowed() {
        let resp = build_admission_response("test-uid-123", true, None);
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["uid"], "test-uid-123");
        assert_eq!(v["response"]["allowed"], true);
        assert!(v["response"]["status"].is_null());
    }

    #[test]
    fn test_build_admission_response_denied() {
        let resp = build_admission_response("test-uid-456", false, Some("minNodes must be <= maxNodes"));
        let v: serde_json::Value = serde_json::from_str(&resp).unwrap();
        assert_eq!(v["response"]["allowed"], false);
        assert_eq!(v["response"]["status"]["message"], "minNodes must be <= maxNodes");
    }

    #[test]
    fn test_parse_review_rejects_oversized_body() {
        let huge = "x".repeat(BODY_LIMIT_BYTES + 1);
        assert!(parse_review(&huge).is_none());
    }

    #[test]
    fn test_parse_review_accepts_small_valid_json() {
        assert!(parse_review(r#"{"request":{"uid":"abc"}}"#).is_some());
    }

    #[test]
    fn test_generate_self_signed_certs() {
        let (ca_pem, cert_pem, key_pem) = generate_self_signed_certs("my-webhook", "production", &[]).unwrap();
        assert!(ca_pem.contains("BEGIN CERTIFICATE"));
        assert!(cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(key_pem.contains("BEGIN PRIVATE KEY"));
        assert_ne!(ca_pem, cert_pem);
    }

    #[test]
    fn test_generate_certs_writes_files() {
        let temp_dir = std::env::temp_dir().join("vpsie-autoscaler-test-certgen");
        let _ = std::fs::remove_dir_all(&temp_dir);
        let _ = std::fs::create_dir_all(&temp_dir);

        let result = generate_certs("test-svc", "test-ns", temp_dir.to_str().unwrap(), &[]);
        assert!(result.is_ok());
        assert!(temp_dir.join("ca.crt").exists());
        assert!(temp_dir.join("tls.crt").exists());
        assert!(temp_dir.join("tls.key").exists());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_install_config_output() {
        let temp_dir = std::env::temp_dir().join("vpsie-autoscaler-test-webhook");
        let _ = std::fs::create_dir_all(&temp_dir);
        let ca_path = temp_dir.join("test-ca.crt");
        std::fs::write(&ca_path, "FAKE-CA-CERT").unwrap();

        let result = install_config("test-webhook", "test-ns", ca_path.to_str().unwrap());
        assert!(result.is_ok());

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_validate_tls_files_missing_cert() {
        let result = validate_tls_files("/nonexistent/cert.pem", "/nonexistent/key.pem");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("certificate file not found"));
    }

    #[test]
    fn test_validate_tls_files_missing_key() {
        let temp_dir = std::env::temp_dir().join("vpsie-autoscaler-test-tls-validate");
        let _ = std::fs::create_dir_all(&temp_dir);
        let cert_path = temp_dir.join("cert.pem");
        std::fs::write(&cert_path, "CERT").unwrap();

        let result = validate_tls_files(cert_path.to_str().unwrap(), "/nonexistent/key.pem");
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("key file not found"));

        let _ = std::fs::remove_dir_all(&temp_dir);
    }

    #[test]
    fn test_webhook_duration_metric_registered() {
        LazyLock::force(&WEBHOOK_DURATION);
        let families = WEBHOOK_REGISTRY.gather();
        let names: Vec<&str> = families.iter().map(|f| f.get_name()).collect();
        assert!(names.contains(&"webhook_request_duration_seconds"));
    }
}
