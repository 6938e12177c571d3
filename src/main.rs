//! DBaaS Control Plane
//!
//! Serves the control plane REST API, a health endpoint and a Prometheus
//! metrics endpoint. Declared resources are projected either to Kubernetes
//! or, with `--orchestrator memory`, to an in-process stand-in.

use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use dbaas_control_plane::{
    ApiMetrics, ApiServer, ApiServerConfig, ApplyQueue, ApplyQueueConfig, ClusterOrchestratorRef,
    ControlPlane, ControlPlaneConfig, ControlPlaneDeps, Error, InMemoryOrchestrator,
    InMemoryOrchestratorConfig, InMemorySecretStore, KubeOrchestrator, KubeOrchestratorConfig,
    PmmPrechecker, PrecheckConfig, Result, ScopeResolver,
};

// =============================================================================
// CLI Arguments
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum OrchestratorMode {
    /// Project to the Kubernetes API server
    Kubernetes,
    /// Keep projections in process
    Memory,
}

/// DBaaS Control Plane - database clusters, backups and monitoring
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// REST API bind address
    #[arg(long, env = "API_ADDR", default_value = "0.0.0.0:8080")]
    api_addr: String,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:9090")]
    metrics_addr: String,

    /// Orchestrator the declared resources are projected to
    #[arg(long, env = "ORCHESTRATOR", value_enum, default_value = "kubernetes")]
    orchestrator: OrchestratorMode,

    /// Managed namespaces; any valid namespace is accepted when none are given
    #[arg(long = "namespace", env = "NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Namespace of legacy cluster registrations that name none
    #[arg(long, env = "DEFAULT_NAMESPACE")]
    default_namespace: Option<String>,

    /// Timeout of the PMM API key round-trip in seconds
    #[arg(long, env = "PRECHECK_TIMEOUT", default_value = "10")]
    precheck_timeout_secs: u64,

    /// Simulated reconcile delay of the in-memory orchestrator in milliseconds
    #[arg(long, env = "SIMULATE_RECONCILE_MS")]
    simulate_reconcile_ms: Option<u64>,

    /// YAML configuration file
    #[arg(long, env = "CONFIG_FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    info!("Starting DBaaS Control Plane");
    info!("  Version: {}", dbaas_control_plane::VERSION);
    info!("  REST API: {}", args.api_addr);
    info!("  Orchestrator: {:?}", args.orchestrator);

    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path)?,
        None => ControlPlaneConfig::default(),
    }
    .with_namespaces(args.namespaces.clone());
    if let Some(namespace) = &args.default_namespace {
        config.default_namespace = namespace.clone();
    }
    config.validate()?;

    let shutdown = CancellationToken::new();
    let metrics = Arc::new(ApiMetrics::new()?);

    let resolver = build_resolver(&args, &config).await?;
    let (queue, queue_task) =
        ApplyQueue::start(ApplyQueueConfig::default(), metrics.clone(), shutdown.clone());

    let precheck_timeout = config
        .precheck_timeout_secs
        .unwrap_or(args.precheck_timeout_secs);
    let prechecker = PmmPrechecker::new(PrecheckConfig {
        timeout: Duration::from_secs(precheck_timeout),
        ..Default::default()
    })?;

    let control_plane = Arc::new(ControlPlane::new(ControlPlaneDeps {
        resolver,
        secrets: Arc::new(InMemorySecretStore::new()),
        prechecker: Arc::new(prechecker),
        queue,
        metrics: metrics.clone(),
    }));
    let evictor = control_plane.spawn_background(shutdown.clone());

    if args.orchestrator == OrchestratorMode::Kubernetes {
        control_plane.hydrate().await?;
    }

    // Start health server
    let health_addr = args.health_addr.clone();
    let health_orchestrator = control_plane.resolver().default_orchestrator().clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr, health_orchestrator).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    let served_metrics = metrics.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, served_metrics).await {
            error!("Metrics server error: {}", e);
        }
    });

    let api_config = ApiServerConfig {
        rest_addr: args
            .api_addr
            .parse()
            .map_err(|e| Error::Configuration(format!("Invalid REST API address: {}", e)))?,
    };
    let api_server = Arc::new(ApiServer::new(api_config, control_plane.clone()));

    let signalled = api_server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received");
            signalled.shutdown();
        }
    });

    api_server.run().await?;

    shutdown.cancel();
    let _ = tokio::join!(queue_task, evictor);
    info!("Control plane shutdown complete");
    Ok(())
}

/// Default orchestrator plus one per legacy cluster registration
async fn build_resolver(args: &Args, config: &ControlPlaneConfig) -> Result<ScopeResolver> {
    let default: ClusterOrchestratorRef = match args.orchestrator {
        OrchestratorMode::Kubernetes => {
            Arc::new(KubeOrchestrator::try_default(KubeOrchestratorConfig::default()).await?)
        }
        OrchestratorMode::Memory => Arc::new(memory_orchestrator(args)),
    };

    let mut resolver = ScopeResolver::new(default.clone(), config.namespaces.clone());
    for entry in &config.clusters {
        let orchestrator: ClusterOrchestratorRef = match (args.orchestrator, &entry.kubeconfig) {
            (OrchestratorMode::Kubernetes, Some(path)) => Arc::new(
                KubeOrchestrator::from_kubeconfig(path, KubeOrchestratorConfig::default())
                    .await?,
            ),
            (OrchestratorMode::Kubernetes, None) => default.clone(),
            (OrchestratorMode::Memory, _) => Arc::new(memory_orchestrator(args)),
        };
        let registration = config.registration(entry);
        info!(
            "Registered cluster {} ({}) in namespace {}",
            registration.id, registration.name, registration.namespace
        );
        resolver = resolver.with_cluster(registration, orchestrator);
    }
    Ok(resolver)
}

fn memory_orchestrator(args: &Args) -> InMemoryOrchestrator {
    InMemoryOrchestrator::with_config(InMemoryOrchestratorConfig {
        simulate_reconcile: args.simulate_reconcile_ms.map(Duration::from_millis),
        ..Default::default()
    })
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
    for directive in ["hyper=warn", "kube=info", "tower=warn", "tower_http=info", "axum=info"] {
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

async fn run_health_server(addr: &str, orchestrator: ClusterOrchestratorRef) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let orchestrator = orchestrator.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let orchestrator = orchestrator.clone();
                async move {
                    let (status, body) = match req.uri().path() {
                        "/healthz" | "/livez" => (StatusCode::OK, "ok"),
                        "/readyz" => match orchestrator.health_check().await {
                            Ok(true) => (StatusCode::OK, "ok"),
                            _ => (StatusCode::SERVICE_UNAVAILABLE, "orchestrator unavailable"),
                        },
                        _ => (StatusCode::NOT_FOUND, "not found"),
                    };
                    let mut response = Response::new(Body::from(body));
                    *response.status_mut() = status;
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid health server address: {}", e)))?;

    info!("Health server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Health server error: {}", e)))?;

    Ok(())
}

// =============================================================================
// Metrics Server
// =============================================================================

async fn run_metrics_server(addr: &str, metrics: Arc<ApiMetrics>) -> Result<()> {
    use hyper::header::{HeaderValue, CONTENT_TYPE};
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Response, Server, StatusCode};

    let make_svc = make_service_fn(move |_conn| {
        let metrics = metrics.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let metrics = metrics.clone();
                async move {
                    let mut response = match (req.uri().path(), metrics.render()) {
                        ("/metrics", Ok((content_type, buffer))) => {
                            let mut response = Response::new(Body::from(buffer));
                            if let Ok(value) = HeaderValue::from_str(&content_type) {
                                response.headers_mut().insert(CONTENT_TYPE, value);
                            }
                            response
                        }
                        ("/metrics", Err(e)) => {
                            let mut response = Response::new(Body::from(e.to_string()));
                            *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                            response
                        }
                        _ => {
                            let mut response = Response::new(Body::from("not found"));
                            *response.status_mut() = StatusCode::NOT_FOUND;
                            response
                        }
                    };
                    response
                        .headers_mut()
                        .entry("cache-control")
                        .or_insert(HeaderValue::from_static("no-cache"));
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Internal(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
