//! jsonnet-controller - reconciles cluster state declared as Jsonnet

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use jsonnet_controller::controller::{self, Context, LeaderElector, ReconcilerOptions};
use jsonnet_controller::crd::Konfiguration;
use jsonnet_controller::events::{ExternalEventSink, KubeEventPublisher};
use jsonnet_controller::{metrics, server};

/// Kubernetes controller reconciling cluster state declared as Jsonnet
#[derive(Parser, Debug)]
#[command(name = "jsonnet-controller", version, about, long_about = None)]
struct Cli {
    /// Generate the Konfiguration CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// The port to bind the web server to
    #[arg(long, default_value_t = jsonnet_controller::DEFAULT_WEB_PORT)]
    web_bind_port: u16,

    /// The path to certificates and keys to use for the webserver. A
    /// self-signed certificate will be generated if not provided.
    #[arg(long)]
    tls_cert_dir: Option<PathBuf>,

    /// The address the metric endpoint binds to
    #[arg(long, default_value = ":8080")]
    metrics_bind_address: String,

    /// The address the probe endpoint binds to
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Enable leader election for the controller manager. Enabling this
    /// will ensure there is only one active controller manager.
    #[arg(long)]
    leader_elect: bool,

    /// The address for an external events receiver
    #[arg(long)]
    events_addr: Option<String>,

    /// Watch for Konfigurations in all namespaces, if set to false it will
    /// only watch the runtime namespace
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    watch_all_namespaces: bool,

    /// Maximum number of times to retry fetching a source artifact
    #[arg(long, default_value_t = jsonnet_controller::DEFAULT_HTTP_RETRY_MAX)]
    http_retry_max: usize,

    /// Number of reconciliations to allow to run at a time
    #[arg(long, default_value_t = jsonnet_controller::DEFAULT_MAX_CONCURRENT_RECONCILES)]
    max_concurrent_reconciles: usize,

    /// The interval at which failing dependencies are reevaluated
    #[arg(long, default_value = "30s", value_parser = humantime::parse_duration)]
    dependency_requeue_interval: Duration,

    /// The directory to cache jsonnet assets
    #[arg(long = "jsonnet-cache", default_value = "/cache")]
    jsonnet_cache: PathBuf,

    /// The timeout for dry-run requests
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    dry_run_timeout: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // The TLS stack needs a process-wide crypto provider before any client
    // or server is built
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        anyhow::bail!("failed to install crypto provider: {e:?}");
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Konfiguration::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {e}"))?;
        println!("{crd}");
        return Ok(());
    }

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create Kubernetes client: {e}"))?;

    // The controller installs its own CRD on startup so the served schema
    // always matches the binary
    ensure_crd_installed(&client).await?;

    // Metrics and probe endpoints
    let metrics_handle = metrics::init_metrics();
    let metrics_addr = parse_bind_address(&cli.metrics_bind_address)?;
    tokio::spawn(async move {
        if let Err(e) = server::serve_plain(metrics_addr, server::metrics_router(metrics_handle)).await
        {
            tracing::error!(error = %e, "Metrics server error");
        }
    });
    let probe_addr = parse_bind_address(&cli.health_probe_bind_address)?;
    tokio::spawn(async move {
        if let Err(e) = server::serve_plain(probe_addr, server::probe_router()).await {
            tracing::error!(error = %e, "Probe server error");
        }
    });

    // The TLS dry-run endpoint
    let tls = server::tls_config(cli.tls_cert_dir.as_deref())
        .await
        .map_err(|e| anyhow::anyhow!("failed to configure TLS: {e}"))?;
    let dry_run_state = Arc::new(server::DryRunState {
        client: client.clone(),
        cache_dir: cli.jsonnet_cache.clone(),
        http_retry_max: cli.http_retry_max,
        timeout: cli.dry_run_timeout,
    });
    let web_addr = SocketAddr::from(([0, 0, 0, 0], cli.web_bind_port));
    let dry_run_router = server::dry_run_router(dry_run_state);
    tokio::spawn(async move {
        if let Err(e) = server::serve_tls(web_addr, dry_run_router, tls).await {
            tracing::error!(error = %e, "Web server error");
        }
    });

    let external_events = match &cli.events_addr {
        Some(addr) => Some(Arc::new(ExternalEventSink::new(addr))),
        None => None,
    };

    let ctx = Arc::new(Context {
        client: client.clone(),
        events: Arc::new(KubeEventPublisher::new(client.clone())),
        external_events,
        source_index: Default::default(),
        opts: ReconcilerOptions {
            http_retry_max: cli.http_retry_max,
            max_concurrent_reconciles: cli.max_concurrent_reconciles,
            dependency_requeue_interval: cli.dependency_requeue_interval,
            jsonnet_cache_dir: cli.jsonnet_cache.clone(),
            dry_run_timeout: cli.dry_run_timeout,
        },
    });

    let watch_namespace = if cli.watch_all_namespaces {
        None
    } else {
        std::env::var("POD_NAMESPACE").ok()
    };

    if cli.leader_elect {
        let namespace =
            std::env::var("POD_NAMESPACE").unwrap_or_else(|_| "default".to_string());
        let identity = std::env::var("POD_NAME")
            .or_else(|_| std::env::var("HOSTNAME"))
            .unwrap_or_else(|_| format!("jsonnet-controller-{}", std::process::id()));
        let elector = Arc::new(LeaderElector::new(client.clone(), &namespace, &identity));
        let mut guard = elector.acquire().await?;

        tokio::select! {
            result = controller::run(ctx, watch_namespace) => result?,
            _ = guard.lost() => {
                anyhow::bail!("leadership lost, exiting for a clean restart");
            }
        }
    } else {
        controller::run(ctx, watch_namespace).await?;
    }

    Ok(())
}

/// Install or update the Konfiguration CRD with server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(jsonnet_controller::SERVER_SIDE_APPLY_OWNER).force();

    tracing::info!("Installing Konfiguration CRD...");
    crds.patch(
        "konfigurations.jsonnet.io",
        &params,
        &Patch::Apply(&Konfiguration::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install Konfiguration CRD: {e}"))?;

    Ok(())
}

/// Parse a bind address, accepting the `:8080` short form
fn parse_bind_address(addr: &str) -> anyhow::Result<SocketAddr> {
    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };
    full.parse()
        .map_err(|e| anyhow::anyhow!("invalid bind address {addr:?}: {e}"))
}
