//! LocalPV Provisioner
//!
//! Runs either side of the provisioning protocol:
//!
//! - `controller`: the orchestrator, its orphan sweep and the controller
//!   service. With `--standalone` the records live in memory and simulated
//!   agents converge them in-process.
//! - `agent`: the per-host reconcilers and node reporter.
//! - `crds`: prints the CustomResourceDefinition manifests.
//!
//! Both long-running modes serve `/healthz`, `/livez`, `/readyz` and
//! `/metrics`.

use clap::{Args as ClapArgs, Parser, Subcommand};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Response, StatusCode};
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localpv_provisioner::controlplane::{CapacityRange, CreateVolumeRequest, TopologyRequirement};
use localpv_provisioner::crd::{all_crds, LocalBackup, LocalRestore, LocalSnapshot, LocalVolume, StorageNode, NODE_ID_LABEL};
use localpv_provisioner::{
    Agent, AgentConfig, AgentStores, ControllerService, Error, KubeStore, LockRegistry, MemoryStore, Metrics,
    Orchestrator, OrchestratorConfig, Result, SimulatedEngine, Stores,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// LocalPV Provisioner - host-local volume provisioning
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Health server bind address
    #[arg(long, global = true, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, global = true, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, global = true, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the provisioning control plane
    Controller(ControllerArgs),
    /// Run the agent of one host
    Agent(AgentArgs),
    /// Print the CRD manifests as YAML
    Crds,
}

#[derive(ClapArgs, Debug)]
struct ControllerArgs {
    /// Namespace holding the intent records
    #[arg(long, env = "NAMESPACE", default_value = "openebs")]
    namespace: String,

    /// Status poll interval in milliseconds
    #[arg(long, env = "POLL_INTERVAL_MS", default_value = "1000")]
    poll_interval_ms: u64,

    /// Deadline of bounded waits in seconds
    #[arg(long, env = "WAIT_TIMEOUT", default_value = "120")]
    wait_timeout_secs: u64,

    /// Age in seconds after which unclaimed Pending records are collected
    #[arg(long, env = "ORPHAN_TTL", default_value = "600")]
    orphan_ttl_secs: u64,

    /// Run without Kubernetes, with in-memory records and simulated hosts
    #[arg(long, env = "STANDALONE")]
    standalone: bool,

    /// Simulated hosts in standalone mode
    #[arg(long, env = "SIM_NODES", value_delimiter = ',', default_value = "node-a,node-b")]
    sim_nodes: Vec<String>,

    /// Pool created on every simulated host
    #[arg(long, env = "SIM_POOL", default_value = "zfspv-pool")]
    sim_pool: String,

    /// Size of the simulated pool in bytes
    #[arg(long, env = "SIM_POOL_BYTES", default_value = "107374182400")]
    sim_pool_bytes: u64,

    /// Provision and delete one volume on startup
    #[arg(long, env = "SMOKE_TEST")]
    smoke_test: bool,
}

#[derive(ClapArgs, Debug)]
struct AgentArgs {
    /// Id of this host
    #[arg(long, env = "NODE_ID")]
    node_id: String,

    /// Namespace holding the intent records
    #[arg(long, env = "NAMESPACE", default_value = "openebs")]
    namespace: String,

    /// Topology label published for this host (key=value, repeatable)
    #[arg(long = "label", value_parser = parse_key_val)]
    labels: Vec<(String, String)>,

    /// Pool of the simulated engine (name=bytes, repeatable)
    #[arg(long = "pool", value_parser = parse_pool)]
    pools: Vec<(String, u64)>,

    /// Reconcile workers per record kind
    #[arg(long, env = "WORKERS", default_value = "4")]
    workers: usize,

    /// Full relist interval in seconds
    #[arg(long, env = "RESYNC_INTERVAL", default_value = "60")]
    resync_secs: u64,

    /// Pool report interval in seconds
    #[arg(long, env = "REPORT_INTERVAL", default_value = "60")]
    report_secs: u64,
}

fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {}", s))?;
    Ok((key.to_string(), value.to_string()))
}

fn parse_pool(s: &str) -> std::result::Result<(String, u64), String> {
    let (name, size) = parse_key_val(s)?;
    let size = size
        .parse()
        .map_err(|e| format!("invalid pool size {}: {}", size, e))?;
    Ok((name, size))
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if let Command::Crds = args.command {
        return print_crds();
    }

    init_logging(&args);

    info!("Starting LocalPV Provisioner");
    info!("  Version: {}", localpv_provisioner::VERSION);
    info!("  Health: {}", args.health_addr);
    info!("  Metrics: {}", args.metrics_addr);

    let metrics = Metrics::new()?;
    let ready = Arc::new(AtomicBool::new(false));
    let cancel = CancellationToken::new();

    // Shutdown on Ctrl-C
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Shutdown signal received");
                    cancel.cancel();
                }
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        });
    }

    let health_addr = parse_addr(&args.health_addr, "health")?;
    let health_ready = ready.clone();
    let health_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(health_addr, health_ready, health_cancel).await {
            error!("Health server error: {}", e);
        }
    });

    let metrics_addr = parse_addr(&args.metrics_addr, "metrics")?;
    let server_metrics = metrics.clone();
    let metrics_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(metrics_addr, server_metrics, metrics_cancel).await {
            error!("Metrics server error: {}", e);
        }
    });

    match args.command {
        Command::Controller(controller) => run_controller(controller, metrics, ready, cancel).await?,
        Command::Agent(agent) => run_agent(agent, metrics, ready, cancel).await?,
        Command::Crds => {}
    }

    info!("Shutdown complete");
    Ok(())
}

fn parse_addr(addr: &str, server: &str) -> Result<SocketAddr> {
    addr.parse()
        .map_err(|e| Error::Configuration(format!("Invalid {} server address {}: {}", server, addr, e)))
}

fn print_crds() -> Result<()> {
    let docs = all_crds()
        .iter()
        .map(serde_yaml::to_string)
        .collect::<std::result::Result<Vec<_>, _>>()?;
    println!("{}", docs.join("---\n"));
    Ok(())
}

// =============================================================================
// Controller
// =============================================================================

async fn run_controller(
    args: ControllerArgs,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = OrchestratorConfig {
        namespace: args.namespace.clone(),
        poll_interval: Duration::from_millis(args.poll_interval_ms),
        wait_timeout: Duration::from_secs(args.wait_timeout_secs),
        orphan_pending_ttl: Duration::from_secs(args.orphan_ttl_secs),
        ..Default::default()
    };
    info!("  Namespace: {}", config.namespace);
    info!("  Standalone mode: {}", args.standalone);

    let mut agents = Vec::new();
    let stores = if args.standalone {
        let namespace = args.namespace.as_str();
        let agent_stores = AgentStores {
            volumes: Arc::new(MemoryStore::<LocalVolume>::new(namespace)),
            snapshots: Arc::new(MemoryStore::<LocalSnapshot>::new(namespace)),
            backups: Arc::new(MemoryStore::<LocalBackup>::new(namespace)),
            restores: Arc::new(MemoryStore::<LocalRestore>::new(namespace)),
            nodes: Arc::new(MemoryStore::<StorageNode>::new(namespace)),
        };

        for node in &args.sim_nodes {
            let engine = SimulatedEngine::new(node.as_str()).with_pool(&args.sim_pool, args.sim_pool_bytes);
            let agent = Agent::new(
                AgentConfig {
                    node_id: node.clone(),
                    report_interval: Duration::from_secs(5),
                    ..Default::default()
                },
                agent_stores.clone(),
                Arc::new(engine),
                Some(metrics.clone()),
            );
            let cancel = cancel.clone();
            agents.push(tokio::spawn(async move { agent.run(cancel).await }));
        }
        info!("Simulated hosts started: {}", args.sim_nodes.join(", "));

        Stores {
            volumes: agent_stores.volumes,
            snapshots: agent_stores.snapshots,
            nodes: agent_stores.nodes,
        }
    } else {
        let client = kube::Client::try_default().await?;
        let namespace = args.namespace.as_str();
        Stores {
            volumes: Arc::new(KubeStore::<LocalVolume>::new(client.clone(), namespace)),
            snapshots: Arc::new(KubeStore::<LocalSnapshot>::new(client.clone(), namespace)),
            nodes: Arc::new(KubeStore::<StorageNode>::new(client, namespace)),
        }
    };

    let orchestrator = Orchestrator::new(config, stores, LockRegistry::new());
    let service = ControllerService::new(orchestrator.clone(), metrics.clone());
    let collector = tokio::spawn(orchestrator.clone().run_orphan_collector(cancel.clone()));
    info!("Orchestrator initialized");

    if args.smoke_test {
        if let Err(e) = smoke_test(&service, &args.sim_pool, &args.sim_nodes).await {
            warn!("Smoke test failed: {}", e);
        }
    }

    ready.store(true, Ordering::Release);
    cancel.cancelled().await;
    ready.store(false, Ordering::Release);

    orchestrator.shutdown().await;
    let _ = collector.await;
    futures::future::join_all(agents).await;
    Ok(())
}

/// Provision and delete one small volume through the controller service
async fn smoke_test(service: &ControllerService, pool: &str, hosts: &[String]) -> Result<()> {
    // Give the hosts a moment to publish their pools
    tokio::time::sleep(Duration::from_secs(1)).await;

    let name = format!("smoke-{}", chrono::Utc::now().timestamp());
    let mut parameters = HashMap::new();
    parameters.insert("poolname".to_string(), pool.to_string());

    let created = service
        .create_volume(CreateVolumeRequest {
            name: name.clone(),
            capacity_range: CapacityRange::required(1),
            accessibility: TopologyRequirement {
                requisite: hosts
                    .iter()
                    .map(|host| BTreeMap::from([(NODE_ID_LABEL.to_string(), host.clone())]))
                    .collect(),
                preferred: Vec::new(),
            },
            parameters,
            ..Default::default()
        })
        .await?;
    info!(
        "Smoke test volume {} provisioned: {} bytes on {:?}",
        created.volume_id, created.capacity_bytes, created.accessible_topology
    );

    service.delete_volume(&name).await?;
    info!("Smoke test volume {} deleted", name);
    Ok(())
}

// =============================================================================
// Agent
// =============================================================================

async fn run_agent(
    args: AgentArgs,
    metrics: Arc<Metrics>,
    ready: Arc<AtomicBool>,
    cancel: CancellationToken,
) -> Result<()> {
    if args.node_id.is_empty() {
        return Err(Error::Configuration("node id is required".into()));
    }
    info!("  Node: {}", args.node_id);
    info!("  Namespace: {}", args.namespace);

    let client = kube::Client::try_default().await?;
    let namespace = args.namespace.as_str();
    let stores = AgentStores {
        volumes: Arc::new(KubeStore::<LocalVolume>::new(client.clone(), namespace)),
        snapshots: Arc::new(KubeStore::<LocalSnapshot>::new(client.clone(), namespace)),
        backups: Arc::new(KubeStore::<LocalBackup>::new(client.clone(), namespace)),
        restores: Arc::new(KubeStore::<LocalRestore>::new(client.clone(), namespace)),
        nodes: Arc::new(KubeStore::<StorageNode>::new(client, namespace)),
    };

    let engine = SimulatedEngine::new(args.node_id.as_str());
    for (name, size) in &args.pools {
        engine.add_pool(name, *size);
    }

    let config = AgentConfig {
        node_id: args.node_id.clone(),
        labels: args.labels.into_iter().collect::<BTreeMap<_, _>>(),
        workers: args.workers,
        resync_interval: Duration::from_secs(args.resync_secs),
        report_interval: Duration::from_secs(args.report_secs),
        ..Default::default()
    };

    let agent = Agent::new(config, stores, Arc::new(engine), Some(metrics));
    ready.store(true, Ordering::Release);
    agent.run(cancel).await;
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info"] {
        if let Ok(directive) = directive.parse() {
            filter = filter.add_directive(directive);
        }
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: StatusCode, body: impl Into<Body>) -> Response<Body> {
    let mut response = Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: SocketAddr, ready: Arc<AtomicBool>, cancel: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let ready = ready.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let ready = ready.load(Ordering::Acquire);
                async move {
                    let response = match req.uri().path() {
                        "/healthz" | "/livez" => respond(StatusCode::OK, "ok"),
                        "/readyz" if ready => respond(StatusCode::OK, "ok"),
                        "/readyz" => respond(StatusCode::SERVICE_UNAVAILABLE, "not ready"),
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Health server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: SocketAddr, metrics: Arc<Metrics>, cancel: CancellationToken) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Request, Server};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => match metrics.encode() {
                            Ok(buffer) => {
                                let mut response = respond(StatusCode::OK, buffer);
                                response
                                    .headers_mut()
                                    .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
                                response
                            }
                            Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                        },
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    info!("Metrics server listening on {}", addr);
    Server::try_bind(&addr)
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?
        .serve(make_svc)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
