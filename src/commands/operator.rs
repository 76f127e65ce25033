use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::Router;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use futures::StreamExt;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::{Event, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use k8s_openapi::chrono::{self, Utc};
use k8s_openapi::ByteString;
use kube::api::{Api, ListParams, ObjectMeta, Patch, PatchParams, PostParams};
use kube::runtime::controller::Controller;
use kube::runtime::{watcher, WatchStreamExt};
use kube::{Client, ResourceExt};
use prometheus::{Encoder, TextEncoder};
use tokio::signal;
use tokio::sync::{broadcast, Mutex};
use tokio::time::interval;
use tracing::{info, warn};

use vpsie_autoscaler::cli::OperatorArgs;
use vpsie_autoscaler::config::{self, Config};
use vpsie_autoscaler::crd::{InstancePhase, NodeGroup, VPSieNode};
use vpsie_autoscaler::event_watcher::{self, CooldownMap, EventBuffer, SchedulingEvent};
use vpsie_autoscaler::instance_controller::{self, InstanceContext};
use vpsie_autoscaler::managed;
use vpsie_autoscaler::metrics;
use vpsie_autoscaler::pool_controller::{self, PoolContext};
use vpsie_autoscaler::pool_creator::{self, PoolTemplate};
use vpsie_autoscaler::provider::{Credentials, ProviderClient, VmApi};
use vpsie_autoscaler::rebalancer::{self, MigrationCandidate, MigrationExecutor, MigrationStrategy};
use vpsie_autoscaler::resource_analyzer;

const LEASE_DURATION_SECONDS: i32 = 15;
const LEASE_RENEW_INTERVAL: Duration = Duration::from_secs(5);
const HOLDER_IDENTITY_ENV: &str = "HOSTNAME";
const PROVIDER_RATE_LIMIT_PER_SEC: u32 = 10;
const EVENT_WATCHER_TICK: Duration = Duration::from_secs(5);
const SCALE_DOWN_TICK: Duration = Duration::from_secs(60);
const REBALANCE_TICK: Duration = Duration::from_secs(300);
const REBALANCE_BATCH_SIZE: usize = 1;
const REBALANCE_BATCH_DELAY: Duration = Duration::from_secs(30);

struct ReadinessState {
    pools_ready: bool,
    instances_ready: bool,
}

pub async fn run(args: OperatorArgs) -> Result<()> {
    let config = Config::from_cli(&args);

    println!("Starting vpsie-autoscaler operator...\n");
    info!("operator_starting");

    let client = build_client(&config).await?;

    print!("  Cluster connection .......... ");
    match client.apiserver_version().await {
        Ok(v) => println!("OK (v{}.{})", v.major, v.minor),
        Err(e) => {
            println!("FAIL");
            anyhow::bail!("Cannot reach cluster: {}. Is the cluster running?", e);
        }
    }

    print!("  Provider credentials ......... ");
    let credentials = load_credentials(&client, &config).await?;
    println!("OK (base_url={})", credentials.base_url);

    let provider = Arc::new(ProviderClient::new(credentials, PROVIDER_RATE_LIMIT_PER_SEC));

    metrics::init();

    let holder_identity =
        std::env::var(HOLDER_IDENTITY_ENV).unwrap_or_else(|_| "vpsie-autoscaler".to_string());

    print!("  Leader election .............. ");
    if config.leader_election_enabled {
        if !acquire_leader(&client, &config, &holder_identity).await? {
            println!("waiting (another instance holds the lease)");
            info!("not_leader_waiting");
            loop {
                tokio::time::sleep(Duration::from_secs(10)).await;
            }
        }
        println!("acquired ({})", holder_identity);
    } else {
        println!("disabled (development mode)");
    }

    let addr: SocketAddr = config
        .metrics_addr
        .parse()
        .context("invalid --metrics-addr")?;

    println!("  Metrics server ............... http://{addr}");
    println!("  Sync period ................... {}s", config.sync_period.as_secs());
    println!();
    println!("Operator running. Press Ctrl+C to stop.\n");
    println!("{}", "=".repeat(70));

    let readiness = Arc::new(Mutex::new(ReadinessState {
        pools_ready: false,
        instances_ready: false,
    }));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    if config.leader_election_enabled {
        let lease_client = client.clone();
        let lease_config = config.clone();
        let lease_identity = holder_identity.clone();
        let mut lease_shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            renew_lease_loop(lease_client, lease_config, lease_identity, &mut lease_shutdown).await
        });
    }

    let http_state = readiness.clone();
    let http_shutdown = shutdown_tx.subscribe();
    let http_handle =
        tokio::spawn(async move { start_http_server(http_state, http_shutdown, addr).await });

    let pool_ctx = Arc::new(PoolContext { client: client.clone() });
    let instance_ctx = Arc::new(InstanceContext { client: client.clone(), provider: provider.clone() });

    let pools: Api<NodeGroup> = Api::all(client.clone());
    let instances: Api<VPSieNode> = Api::all(client.clone());

    let pool_readiness = readiness.clone();
    let pool_controller = Controller::new(pools, managed::managed_selector())
        .run(pool_controller::reconcile, pool_controller::error_policy, pool_ctx)
        .for_each(move |result| {
            let readiness = pool_readiness.clone();
            async move {
                {
                    let mut r = readiness.lock().await;
                    r.pools_ready = true;
                }
                if let Err(e) = result {
                    warn!(error = %e, "pool_reconcile_dispatch_error");
                }
            }
        });

    let instance_readiness = readiness.clone();
    let instance_controller = Controller::new(instances, ListParams::default())
        .run(instance_controller::reconcile, instance_controller::error_policy, instance_ctx)
        .for_each(move |result| {
            let readiness = instance_readiness.clone();
            async move {
                {
                    let mut r = readiness.lock().await;
                    r.instances_ready = true;
                }
                if let Err(e) = result {
                    warn!(error = %e, "instance_reconcile_dispatch_error");
                }
            }
        });

    let scale_down_shutdown = shutdown_tx.subscribe();
    let scale_down_handle =
        tokio::spawn(periodic_tick("scale_down", SCALE_DOWN_TICK, scale_down_shutdown));

    let operator_namespace = config.credentials_secret_namespace.clone();
    let provider_dyn: Arc<dyn VmApi> = provider.clone();

    let credentials_shutdown = shutdown_tx.subscribe();
    let credentials_handle = tokio::spawn(watch_credentials_secret(
        client.clone(),
        config.clone(),
        provider.clone(),
        credentials_shutdown,
    ));

    let event_state = Arc::new(EventPipelineState::new());

    let event_informer_shutdown = shutdown_tx.subscribe();
    let event_informer_handle =
        tokio::spawn(watch_scheduling_events(client.clone(), event_state.clone(), event_informer_shutdown));

    let event_tick_shutdown = shutdown_tx.subscribe();
    let event_tick_handle = tokio::spawn(event_watcher_tick(
        client.clone(),
        provider_dyn.clone(),
        config.defaults.clone(),
        operator_namespace.clone(),
        event_state.clone(),
        event_tick_shutdown,
    ));

    let rebalance_shutdown = shutdown_tx.subscribe();
    let rebalance_handle = tokio::spawn(rebalance_tick(
        client.clone(),
        provider_dyn.clone(),
        config.defaults.clone(),
        operator_namespace.clone(),
        rebalance_shutdown,
    ));

    tokio::select! {
        _ = pool_controller => {
            warn!("pool_controller_stream_ended");
        }
        _ = instance_controller => {
            warn!("instance_controller_stream_ended");
        }
        _ = signal::ctrl_c() => {
            info!("shutdown_signal_received");
            println!("\n{}", "=".repeat(70));
            println!("Shutdown signal received. Stopping operator...");
            println!("{}", "=".repeat(70));
        }
    }

    let _ = shutdown_tx.send(());
    let _ = http_handle.await?;
    let _ = scale_down_handle.await;
    let _ = credentials_handle.await;
    let _ = event_informer_handle.await;
    let _ = event_tick_handle.await;
    let _ = rebalance_handle.await;

    info!("operator_stopped");
    println!("Operator stopped.");
    Ok(())
}

async fn build_client(config: &Config) -> Result<Client> {
    match &config.kubeconfig {
        Some(path) => {
            let kubeconfig = kube::config::Kubeconfig::read_from(path)
                .with_context(|| format!("failed to read kubeconfig at {path}"))?;
            let options = kube::config::KubeConfigOptions::default();
            let client_config =
                kube::Config::from_custom_kubeconfig(kubeconfig, &options).await?;
            Ok(Client::try_from(client_config)?)
        }
        None => Ok(Client::try_default().await.context("failed to load in-cluster or default kubeconfig")?),
    }
}

/// Reads `client id` / `client secret` / `base url` keys out of the
/// operator-namespace credentials Secret named in [`Config`].
async fn load_credentials(client: &Client, config: &Config) -> Result<Credentials> {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.credentials_secret_namespace);
    let secret = secrets
        .get(&config.credentials_secret_name)
        .await
        .with_context(|| {
            format!(
                "failed to read credentials secret {}/{}",
                config.credentials_secret_namespace, config.credentials_secret_name
            )
        })?;

    credentials_from_secret(&secret)
}

fn credentials_from_secret(secret: &Secret) -> Result<Credentials> {
    let data = secret.data.clone().unwrap_or_default();
    let read_key = |key: &str| -> Result<String> {
        data.get(key)
            .map(|ByteString(bytes)| String::from_utf8_lossy(bytes).into_owned())
            .with_context(|| format!("credentials secret missing key {key}"))
    };

    Ok(Credentials {
        client_id: read_key("client_id")?,
        client_secret: read_key("client_secret")?,
        base_url: read_key("base_url")?,
    })
}

/// Watches the credentials Secret and, on change, rotates the live
/// provider client's credentials and touches every managed Pool so its
/// next reconcile retries with the new ones.
async fn watch_credentials_secret(client: Client, config: Config, provider: Arc<ProviderClient>, mut shutdown: broadcast::Receiver<()>) {
    let secrets: Api<Secret> = Api::namespaced(client.clone(), &config.credentials_secret_namespace);
    let watch_config = watcher::Config::default().fields(&format!("metadata.name={}", config.credentials_secret_name));
    let mut stream = watcher(secrets, watch_config).applied_objects().boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(secret)) => match credentials_from_secret(&secret) {
                        Ok(creds) => {
                            provider.set_credentials(creds).await;
                            if let Err(e) = touch_managed_pools(&client).await {
                                warn!(error = %e, "credentials_rotation_pool_touch_failed");
                            }
                            info!("credentials_secret_rotated");
                        }
                        Err(e) => warn!(error = %e, "credentials_secret_invalid_on_update"),
                    },
                    Some(Err(e)) => warn!(error = %e, "credentials_secret_watch_error"),
                    None => return,
                }
            }
        }
    }
}

/// Bumps an annotation on every managed Pool so its watch fires and it
/// reconciles immediately, rather than waiting out its normal requeue.
async fn touch_managed_pools(client: &Client) -> kube::Result<()> {
    let pools: Api<NodeGroup> = Api::all(client.clone());
    let now = Utc::now().to_rfc3339();

    for pool in pools.list(&managed::managed_selector()).await?.items {
        let name = pool.name_any();
        let namespace = pool.namespace().unwrap_or_default();
        let namespaced: Api<NodeGroup> = Api::namespaced(client.clone(), &namespace);
        let patch = serde_json::json!({ "metadata": { "annotations": { "vpsie.example.com/credentials-rotated-at": now } } });
        if let Err(e) = namespaced.patch(&name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await {
            warn!(pool = %name, error = %e, "credentials_rotation_pool_patch_failed");
        }
    }
    Ok(())
}

/* ============================= LEADER ELECTION ============================= */

async fn acquire_leader(client: &Client, config: &Config, identity: &str) -> Result<bool> {
    let leases: Api<Lease> = Api::namespaced(client.clone(), &config.lease_namespace);
    let now = MicroTime(Utc::now());

    let lease = Lease {
        metadata: ObjectMeta {
            name: Some(config.lease_name.clone()),
            ..Default::default()
        },
        spec: Some(LeaseSpec {
            holder_identity: Some(identity.to_string()),
            lease_duration_seconds: Some(LEASE_DURATION_SECONDS),
            acquire_time: Some(now.clone()),
            renew_time: Some(now),
            ..Default::default()
        }),
    };

    match leases.create(&Default::default(), &lease).await {
        Ok(_) => return Ok(true),
        Err(kube::Error::Api(err)) if err.code == 409 => {
            info!("lease_exists_checking_expiry");
        }
        Err(e) => return Err(e.into()),
    }

    let existing = leases.get(&config.lease_name).await?;

    let can_take = match &existing.spec {
        Some(spec) => {
            let is_ours = spec.holder_identity.as_deref() == Some(identity);
            let is_expired = spec.renew_time.as_ref().is_none_or(|t| {
                let duration_secs = spec.lease_duration_seconds.unwrap_or(LEASE_DURATION_SECONDS) as i64;
                Utc::now().signed_duration_since(t.0) > chrono::Duration::seconds(duration_secs)
            });
            is_ours || is_expired
        }
        None => true,
    };

    if !can_take {
        return Ok(false);
    }

    info!("lease_takeover");
    let now = MicroTime(Utc::now());
    let patch = serde_json::json!({
        "spec": {
            "holderIdentity": identity,
            "leaseDurationSeconds": LEASE_DURATION_SECONDS,
            "acquireTime": now,
            "renewTime": now
        }
    });

    match leases
        .patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(true),
        Err(_) => Ok(false),
    }
}

async fn renew_lease_loop(
    client: Client,
    config: Config,
    identity: String,
    shutdown: &mut broadcast::Receiver<()>,
) {
    let leases: Api<Lease> = Api::namespaced(client, &config.lease_namespace);
    let mut ticker = interval(LEASE_RENEW_INTERVAL);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("lease_renewal_stopped");
                return;
            }
            _ = ticker.tick() => {
                let now = MicroTime(Utc::now());
                let patch = serde_json::json!({
                    "spec": { "renewTime": now, "holderIdentity": identity }
                });
                if let Err(e) = leases
                    .patch(&config.lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    warn!(error = %e, "lease_renewal_failed");
                }
            }
        }
    }
}

/* ============================= TICKERS ============================= */

/// Placeholder tick loop for the scale-down-safety pass, which runs its real
/// logic inside the Pool reconciler today (see `pool_controller::converge`);
/// this ticker exists so operators can see liveness of the periodic pass in
/// logs and so a future split into a standalone cluster-wide sweep has a home.
async fn periodic_tick(name: &'static str, period: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(period);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                info!(tick = name, "periodic_tick");
            }
        }
    }
}

/* ============================= EVENT WATCHER ============================= */

/// Shared state between the Events informer (producer) and the event-watcher
/// tick (consumer): the event_watcher buffer plus its per-Pool cooldown map.
struct EventPipelineState {
    buffer: Mutex<EventBuffer>,
    cooldown: Mutex<CooldownMap>,
}

impl EventPipelineState {
    fn new() -> Self {
        Self { buffer: Mutex::new(EventBuffer::new()), cooldown: Mutex::new(CooldownMap::new()) }
    }
}

/// Watches cluster-wide `FailedScheduling` Events and classifies each into
/// the shared buffer; `event_watcher_tick` drains it on its own cadence.
async fn watch_scheduling_events(client: Client, state: Arc<EventPipelineState>, mut shutdown: broadcast::Receiver<()>) {
    let events: Api<Event> = Api::all(client);
    let watch_config = watcher::Config::default().fields("reason=FailedScheduling");
    let mut stream = watcher(events, watch_config).applied_objects().boxed();

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            next = stream.next() => {
                match next {
                    Some(Ok(event)) => {
                        let Some(pod_name) = event.involved_object.name.clone() else { continue };
                        let pod_namespace = event.involved_object.namespace.clone().unwrap_or_default();
                        let raw_message = event.message.clone().unwrap_or_default();
                        let ts = event.last_timestamp.as_ref().map(|t| t.0).unwrap_or_else(Utc::now);
                        let kind = event_watcher::classify_message(&raw_message);

                        let mut buffer = state.buffer.lock().await;
                        let dropped = buffer.push(SchedulingEvent { pod_namespace, pod_name, ts, kind, raw_message });
                        if dropped {
                            metrics::SCHEDULING_EVENTS_DROPPED_TOTAL.inc();
                        }
                        metrics::SCHEDULING_EVENTS_BUFFERED.set(buffer.len() as i64);
                    }
                    Some(Err(e)) => warn!(error = %e, "scheduling_event_watch_error"),
                    None => return,
                }
            }
        }
    }
}

async fn event_watcher_tick(
    client: Client,
    provider: Arc<dyn VmApi>,
    defaults: config::OperatorDefaults,
    operator_namespace: String,
    state: Arc<EventPipelineState>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval(EVENT_WATCHER_TICK);
    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let drained = {
                    let mut buffer = state.buffer.lock().await;
                    let stable = buffer.drain_stable(Utc::now(), event_watcher::DEFAULT_STABILIZATION);
                    metrics::SCHEDULING_EVENTS_BUFFERED.set(buffer.len() as i64);
                    stable
                };
                if let Err(e) = dispatch_scheduling_events(&client, provider.as_ref(), &defaults, &operator_namespace, drained, &state.cooldown).await {
                    warn!(error = %e, "event_watcher_dispatch_failed");
                }
            }
        }
    }
}

/// Resolves a batch of stable `FailedScheduling` events to the still-pending
/// Pods that produced them, matches those against the managed Pool fleet
/// (C7), and either bumps the best-scoring Pool's desired node count or, if
/// nothing matches, synthesises a brand new Pool for the pod (C8).
async fn dispatch_scheduling_events(
    client: &Client,
    provider: &dyn VmApi,
    defaults: &config::OperatorDefaults,
    operator_namespace: &str,
    drained: Vec<SchedulingEvent>,
    cooldown: &Mutex<CooldownMap>,
) -> Result<()> {
    if drained.is_empty() {
        return Ok(());
    }

    let mut pending_pods = Vec::new();
    for event in &drained {
        if event.pod_namespace.is_empty() {
            continue;
        }
        let pods: Api<Pod> = Api::namespaced(client.clone(), &event.pod_namespace);
        if let Ok(pod) = pods.get(&event.pod_name).await {
            pending_pods.push(pod);
        }
    }
    if pending_pods.is_empty() {
        return Ok(());
    }

    let pools_api: Api<NodeGroup> = Api::all(client.clone());
    let pools = pools_api.list(&managed::managed_selector()).await?;
    let catalog = provider.list_k8s_offers(&defaults.datacenter_id).await.unwrap_or_default();
    let matches = resource_analyzer::analyze(&pending_pods, &pools.items, &catalog);
    let now = Utc::now();

    if let Some(best) = matches.first() {
        let mut cooldown = cooldown.lock().await;
        if cooldown.is_cooling_down(&best.pool_name, now, event_watcher::DEFAULT_STABILIZATION) {
            info!(pool = %best.pool_name, "scale_up_signal_suppressed_by_event_cooldown");
            return Ok(());
        }

        let pool_api: Api<NodeGroup> = Api::namespaced(client.clone(), operator_namespace);
        if let Ok(pool) = pool_api.get(&best.pool_name).await {
            let mut status = pool.status.clone().unwrap_or_default();
            let bumped = (status.desired_nodes + best.nodes_needed).min(pool.spec.max_nodes);
            if bumped > status.desired_nodes {
                status.desired_nodes = bumped;
                let patch = serde_json::json!({ "status": status });
                pool_api.patch_status(&best.pool_name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch)).await?;
                cooldown.mark_triggered(&best.pool_name, now);
                info!(pool = %best.pool_name, desired = bumped, "resource_analyzer_bumped_desired_nodes");
            }
        }
        return Ok(());
    }

    let Some(pod) = pending_pods.first() else { return Ok(()) };
    let node_groups = provider.list_k8s_node_groups(&defaults.cluster_id).await.unwrap_or_default();
    let template = PoolTemplate {
        datacenter_id: defaults.datacenter_id.clone(),
        cluster_id: defaults.cluster_id.clone(),
        kubernetes_version: defaults.kubernetes_version.clone(),
        os_image_id: defaults.os_image_id.clone(),
        max_nodes_default: 5,
    };

    let entropy = now.timestamp_nanos_opt().unwrap_or_default() as u64;
    match pool_creator::create_pool_for_pod(pod, &template, &catalog, &node_groups, entropy) {
        Ok(mut pool) => {
            pool.metadata.namespace = Some(operator_namespace.to_string());
            let name = pool.metadata.name.clone().unwrap_or_default();
            let create_api: Api<NodeGroup> = Api::namespaced(client.clone(), operator_namespace);
            create_api.create(&PostParams::default(), &pool).await?;
            metrics::DYNAMIC_POOLS_CREATED_TOTAL.inc();
            info!(pool = %name, "dynamic_pool_created");
        }
        Err(e) => warn!(error = %e, "pool_creator_found_no_viable_pool"),
    }

    Ok(())
}

/* ============================= REBALANCER ============================= */

/// Drives provisioning and draining for a [`rebalancer::MigrationPlan`] by
/// patching the usual CRD fields, so the existing Pool/Instance reconcilers
/// do the actual provider calls exactly as they would for any other
/// scale-up or scale-down.
struct OperatorMigrationExecutor {
    client: Client,
    operator_namespace: String,
}

#[async_trait]
impl MigrationExecutor for OperatorMigrationExecutor {
    async fn provision_replacement(&self, candidate: &MigrationCandidate) -> Result<(), String> {
        let api: Api<NodeGroup> = Api::namespaced(self.client.clone(), &self.operator_namespace);
        let pool = api.get(&candidate.target_pool).await.map_err(|e| e.to_string())?;
        let mut status = pool.status.clone().unwrap_or_default();
        let bumped = (status.desired_nodes + 1).min(pool.spec.max_nodes);
        if bumped == status.desired_nodes {
            return Ok(());
        }
        status.desired_nodes = bumped;
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&candidate.target_pool, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    async fn drain_and_terminate(&self, candidate: &MigrationCandidate) -> Result<(), String> {
        let api: Api<VPSieNode> = Api::namespaced(self.client.clone(), &self.operator_namespace);
        let patch = serde_json::json!({ "spec": { "drainRequested": true } });
        api.patch(&candidate.instance_name, &PatchParams::apply("vpsie-autoscaler"), &Patch::Merge(&patch))
            .await
            .map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Finds Ready Instances sitting on a pricier offering than the cheapest one
/// their Pool is configured to also accept, skipping same-offering no-ops.
async fn build_migration_candidates(client: &Client, provider: &dyn VmApi, defaults: &config::OperatorDefaults) -> kube::Result<Vec<MigrationCandidate>> {
    let pools_api: Api<NodeGroup> = Api::all(client.clone());
    let pools = pools_api.list(&managed::managed_selector()).await?;
    let catalog = provider.list_k8s_offers(&defaults.datacenter_id).await.unwrap_or_default();
    let instances_api: Api<VPSieNode> = Api::all(client.clone());
    let instances = instances_api.list(&ListParams::default()).await?;

    let mut candidates = Vec::new();
    for pool in &pools.items {
        let pool_name = pool.name_any();
        let cheapest = pool
            .spec
            .offering_ids
            .iter()
            .filter_map(|id| catalog.iter().find(|o| &o.offering_id == id))
            .min_by(|a, b| a.monthly_price.partial_cmp(&b.monthly_price).unwrap_or(std::cmp::Ordering::Equal));
        let Some(cheapest) = cheapest else { continue };

        for instance in instances.items.iter().filter(|i| i.spec.pool_name == pool_name && i.status.as_ref().map(|s| s.phase) == Some(InstancePhase::Ready)) {
            if instance.spec.instance_type == cheapest.offering_id {
                continue;
            }
            let Some(current) = catalog.iter().find(|o| o.offering_id == instance.spec.instance_type) else { continue };
            if cheapest.cpu_cores >= current.cpu_cores && cheapest.memory_mb >= current.memory_mb && cheapest.monthly_price < current.monthly_price {
                candidates.push(MigrationCandidate {
                    instance_name: instance.name_any(),
                    current_pool: pool_name.clone(),
                    current_offering: instance.spec.instance_type.clone(),
                    target_pool: pool_name.clone(),
                    target_offering: cheapest.offering_id.clone(),
                });
            }
        }
    }

    Ok(candidates)
}

async fn rebalance_tick(client: Client, provider: Arc<dyn VmApi>, defaults: config::OperatorDefaults, operator_namespace: String, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(REBALANCE_TICK);
    let executor = OperatorMigrationExecutor { client: client.clone(), operator_namespace };

    loop {
        tokio::select! {
            _ = shutdown.recv() => return,
            _ = ticker.tick() => {
                let candidates = match build_migration_candidates(&client, provider.as_ref(), &defaults).await {
                    Ok(c) => c,
                    Err(e) => {
                        warn!(error = %e, "rebalance_candidate_listing_failed");
                        continue;
                    }
                };
                if candidates.is_empty() {
                    continue;
                }

                let plan = rebalancer::build_plan(candidates, MigrationStrategy::Rolling, REBALANCE_BATCH_SIZE, REBALANCE_BATCH_DELAY);
                let outcome = rebalancer::execute_plan(&plan, &executor).await;
                metrics::MIGRATION_PLAN_BATCHES_TOTAL.inc();
                if outcome.halted_early {
                    metrics::MIGRATION_PLAN_FAILURES_TOTAL.inc();
                    warn!(failed = ?outcome.failed, "rebalance_plan_halted");
                } else {
                    info!(migrated = outcome.completed.len(), "rebalance_plan_completed");
                }
            }
        }
    }
}

/* ============================= HTTP SERVER ============================= */

fn build_router(state: Arc<Mutex<ReadinessState>>) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/healthz", get(|| async { (StatusCode::OK, "OK") }))
        .route(
            "/readyz",
            get({
                let state = state.clone();
                move || ready_handler(state.clone())
            }),
        )
}

async fn start_http_server(
    state: Arc<Mutex<ReadinessState>>,
    mut shutdown: broadcast::Receiver<()>,
    addr: SocketAddr,
) -> Result<()> {
    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind metrics server on {addr}"))?;

    info!(addr = %addr, "http_server_started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await?;

    Ok(())
}

async fn ready_handler(state: Arc<Mutex<ReadinessState>>) -> impl IntoResponse {
    let state = state.lock().await;
    if state.pools_ready && state.instances_ready {
        (StatusCode::OK, "READY")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT READY")
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = metrics::REGISTRY.gather();
    let mut buffer = Vec::new();

    match encoder.encode(&metric_families, &mut buffer) {
        Ok(_) => match String::from_utf8(buffer) {
            Ok(body) => (StatusCode::OK, body),
            Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
        },
        Err(_) => (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding error".to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(pools_ready: bool, instances_ready: bool) -> Arc<Mutex<ReadinessState>> {
        Arc::new(Mutex::new(ReadinessState { pools_ready, instances_ready }))
    }

    #[tokio::test]
    async fn healthz_always_ok() {
        let app = build_router(test_state(false, false));
        let req = Request::builder().uri("/healthz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_requires_both_controllers_ready() {
        let app = build_router(test_state(true, false));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_ok_once_both_ready() {
        let app = build_router(test_state(true, true));
        let req = Request::builder().uri("/readyz").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"READY");
    }

    #[tokio::test]
    async fn metrics_route_returns_ok() {
        let app = build_router(test_state(false, false));
        let req = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }
}
