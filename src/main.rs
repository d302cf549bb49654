//! HostPath Provisioner Operator
//!
//! Deploys and keeps converged a hostpath volume provisioner, its CSI
//! driver, RBAC, storage pools and optional security and monitoring
//! objects, all driven by a single `HostPathProvisioner` resource.

use clap::Parser;
use kube::{Client, CustomResourceExt};
use prometheus::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use hostpath_provisioner_operator::controller::{self, ControllerConfig, CONTROLLER_NAME};
use hostpath_provisioner_operator::{
    Error, HostPathProvisioner, ImageConfig, KubeEventRecorder, PrometheusReadyGauge, Result,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// HostPath Provisioner Operator - keeps the hostpath provisioner deployed and healthy
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Namespace the provisioner workloads are installed into
    #[arg(long, env = "INSTALLER_NAMESPACE", default_value = "hostpath-provisioner")]
    namespace: String,

    /// Version stamped into the CR status; defaults to the binary version
    #[arg(long, env = "OPERATOR_VERSION")]
    operator_version: Option<String>,

    /// Poll interval while waiting for storage pool cleanup, in milliseconds
    #[arg(long, env = "CLEANUP_POLL_INTERVAL_MS", default_value = "1000")]
    cleanup_poll_interval_ms: u64,

    /// Namespace of the cluster monitoring stack
    #[arg(long, env = "MONITORING_NAMESPACE", default_value = "openshift-monitoring")]
    monitoring_namespace: String,

    /// Log verbosity handed to the provisioner containers
    #[arg(long, env = "VERBOSITY", default_value = "1")]
    verbosity: String,

    /// Legacy provisioner image
    #[arg(long, env = "PROVISIONER_IMAGE")]
    provisioner_image: Option<String>,

    /// CSI plugin image
    #[arg(long, env = "CSI_PROVISIONER_IMAGE")]
    csi_provisioner_image: Option<String>,

    /// external-provisioner sidecar image
    #[arg(long, env = "EXTERNAL_PROVISIONER_IMAGE")]
    external_provisioner_image: Option<String>,

    /// node-driver-registrar sidecar image
    #[arg(long, env = "NODE_DRIVER_REG_IMAGE")]
    node_driver_registrar_image: Option<String>,

    /// livenessprobe sidecar image
    #[arg(long, env = "LIVENESS_PROBE_IMAGE")]
    liveness_probe_image: Option<String>,

    /// external-snapshotter sidecar image
    #[arg(long, env = "SNAPSHOTTER_IMAGE")]
    snapshotter_image: Option<String>,

    /// Health server bind address
    #[arg(long, env = "HEALTH_ADDR", default_value = "0.0.0.0:8081")]
    health_addr: String,

    /// Metrics server bind address
    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8080")]
    metrics_addr: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    /// Print the HostPathProvisioner CRD as YAML and exit
    #[arg(long)]
    print_crd: bool,
}

impl Args {
    fn controller_config(&self) -> ControllerConfig {
        let defaults = ImageConfig::default();
        let pick = |value: &Option<String>, default: String| value.clone().unwrap_or(default);
        ControllerConfig {
            namespace: self.namespace.clone(),
            operator_version: self
                .operator_version
                .clone()
                .unwrap_or_else(|| hostpath_provisioner_operator::VERSION.to_string()),
            cleanup_poll_interval: Duration::from_millis(self.cleanup_poll_interval_ms),
            monitoring_namespace: self.monitoring_namespace.clone(),
            verbosity: self.verbosity.clone(),
            images: ImageConfig {
                provisioner: pick(&self.provisioner_image, defaults.provisioner),
                csi_provisioner: pick(&self.csi_provisioner_image, defaults.csi_provisioner),
                external_provisioner: pick(&self.external_provisioner_image, defaults.external_provisioner),
                node_driver_registrar: pick(&self.node_driver_registrar_image, defaults.node_driver_registrar),
                liveness_probe: pick(&self.liveness_probe_image, defaults.liveness_probe),
                snapshotter: pick(&self.snapshotter_image, defaults.snapshotter),
            },
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    if args.print_crd {
        print!("{}", serde_yaml::to_string(&HostPathProvisioner::crd())?);
        return Ok(());
    }

    init_logging(&args)?;

    let config = args.controller_config();
    info!("Starting HostPath Provisioner Operator");
    info!("  Version: {}", config.operator_version);
    info!("  Namespace: {}", config.namespace);
    info!("  Cleanup poll interval: {:?}", config.cleanup_poll_interval);

    let registry = Registry::new();
    let gauge = Arc::new(PrometheusReadyGauge::new(&registry)?);

    // Start health server
    let health_addr = args.health_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_health_server(&health_addr).await {
            error!("Health server error: {}", e);
        }
    });

    // Start metrics server
    let metrics_addr = args.metrics_addr.clone();
    tokio::spawn(async move {
        if let Err(e) = run_metrics_server(&metrics_addr, registry).await {
            error!("Metrics server error: {}", e);
        }
    });

    let client = Client::try_default().await?;
    let events = Arc::new(KubeEventRecorder::new(client.clone(), CONTROLLER_NAME));

    controller::run(client, events, gauge, config).await?;

    info!("Operator shutdown complete");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) -> Result<()> {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    for directive in ["hyper=warn", "kube=info", "tower=warn"] {
        filter = filter.add_directive(
            directive
                .parse()
                .map_err(|e| Error::Configuration(format!("Invalid log directive {}: {}", directive, e)))?,
        );
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
    Ok(())
}

// =============================================================================
// Health Server
// =============================================================================

fn respond(status: hyper::StatusCode, body: impl Into<hyper::Body>) -> hyper::Response<hyper::Body> {
    let mut response = hyper::Response::new(body.into());
    *response.status_mut() = status;
    response
}

async fn run_health_server(addr: &str) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{Body, Request, Server, StatusCode};

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, std::convert::Infallible>(service_fn(|req: Request<Body>| async move {
            let response = match req.uri().path() {
                "/healthz" | "/livez" | "/readyz" => respond(StatusCode::OK, "ok"),
                _ => respond(StatusCode::NOT_FOUND, "not found"),
            };
            Ok::<_, std::convert::Infallible>(response)
        }))
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid health server address: {}", e)))?;

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

async fn run_metrics_server(addr: &str, registry: Registry) -> Result<()> {
    use hyper::service::{make_service_fn, service_fn};
    use hyper::{header, Body, Request, Server, StatusCode};
    use prometheus::{Encoder, TextEncoder};

    let make_svc = make_service_fn(move |_conn| {
        let registry = registry.clone();
        async move {
            Ok::<_, std::convert::Infallible>(service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                async move {
                    let response = match req.uri().path() {
                        "/metrics" => {
                            let encoder = TextEncoder::new();
                            let mut buffer = Vec::new();
                            match encoder.encode(&registry.gather(), &mut buffer) {
                                Ok(()) => {
                                    let mut response = respond(StatusCode::OK, buffer);
                                    if let Ok(value) = header::HeaderValue::from_str(encoder.format_type()) {
                                        response.headers_mut().insert(header::CONTENT_TYPE, value);
                                    }
                                    response
                                }
                                Err(e) => respond(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
                            }
                        }
                        _ => respond(StatusCode::NOT_FOUND, "not found"),
                    };
                    Ok::<_, std::convert::Infallible>(response)
                }
            }))
        }
    });

    let addr: SocketAddr = addr
        .parse()
        .map_err(|e| Error::Configuration(format!("Invalid metrics server address: {}", e)))?;

    info!("Metrics server listening on {}", addr);
    Server::bind(&addr)
        .serve(make_svc)
        .await
        .map_err(|e| Error::Internal(format!("Metrics server error: {}", e)))?;

    Ok(())
}
