use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use butler_api::{ConnectionSettings, HttpClientFactory};
use butler_core::Timing;
use butler_kubehub::{KubePlatform, RouteCapability};
use butler_notify::{Dispatcher, HttpProviderFactory, RecorderAudit};
use butler_ops::KubeRestarter;
use butler_reconcile::{Context, Settings};
use clap::Parser;
use tracing::info;

mod controller;

const CONTROLLER_NAME: &str = "butler";

#[derive(Parser, Debug)]
#[command(name = "butlerd", version, about = "Butler: reconcile loop for cluster-hosted Jenkins masters")]
struct Cli {
    /// Namespace to watch (default: all namespaces)
    #[arg(long = "ns", env = "BUTLER_NAMESPACE")]
    namespace: Option<String>,

    /// How long a master pod may stay pending before platform events are consulted
    #[arg(long, env = "BUTLER_STARTING_TIMEOUT_SECS", default_value_t = 120)]
    starting_timeout_secs: u64,

    /// Requeue delay while the master is not ready
    #[arg(long, env = "BUTLER_READINESS_BACKOFF_SECS", default_value_t = 5)]
    readiness_backoff_secs: u64,

    /// Requeue delay after a failed cycle
    #[arg(long, env = "BUTLER_ERROR_BACKOFF_SECS", default_value_t = 5)]
    error_backoff_secs: u64,

    /// Periodic resync of converged instances; 0 waits for changes only
    #[arg(long, env = "BUTLER_RESYNC_SECS", default_value_t = 0)]
    resync_secs: u64,

    /// Cluster DNS domain used for in-cluster service URLs
    #[arg(long, env = "BUTLER_CLUSTER_DOMAIN", default_value = "cluster.local")]
    cluster_domain: String,

    /// Management API host override (e.g. localhost behind a port-forward)
    #[arg(long, env = "BUTLER_JENKINS_API_HOST")]
    jenkins_api_host: Option<String>,

    /// Management API port override
    #[arg(long, env = "BUTLER_JENKINS_API_PORT")]
    jenkins_api_port: Option<u16>,

    /// Management API request timeout
    #[arg(long, env = "BUTLER_JENKINS_API_TIMEOUT_SECS", default_value_t = 30)]
    jenkins_api_timeout_secs: u64,
}

fn init_tracing() {
    let env = std::env::var("BUTLER_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("BUTLER_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid BUTLER_METRICS_ADDR; expected host:port");
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = kube::Client::try_default().await?;
    let platform = Arc::new(KubePlatform::new(client.clone()));

    let (notifier, rx) = butler_notify::channel();
    let dispatcher = Dispatcher::new(Arc::new(RecorderAudit::new(client.clone(), CONTROLLER_NAME)), Arc::new(HttpProviderFactory::new(platform.clone())));
    tokio::spawn(dispatcher.listen(rx));

    let connection = ConnectionSettings {
        cluster_domain: cli.cluster_domain.clone(),
        host: cli.jenkins_api_host.clone(),
        port: cli.jenkins_api_port,
        timeout: Duration::from_secs(cli.jenkins_api_timeout_secs),
    };
    let ctx = Context {
        platform: platform.clone(),
        clients: Arc::new(HttpClientFactory::new(platform.clone(), connection)),
        restarter: Arc::new(KubeRestarter::new(platform.clone())),
        notifier,
        routes: Arc::new(RouteCapability::new()),
        settings: Settings {
            timing: Timing {
                starting_timeout: Duration::from_secs(cli.starting_timeout_secs),
                readiness_backoff: Duration::from_secs(cli.readiness_backoff_secs),
            },
            cluster_domain: cli.cluster_domain.clone(),
        },
    };
    let state = controller::State {
        ctx,
        error_backoff: Duration::from_secs(cli.error_backoff_secs),
        resync: (cli.resync_secs > 0).then(|| Duration::from_secs(cli.resync_secs)),
    };

    info!(ns = ?cli.namespace, "starting controller");
    controller::run(client, cli.namespace.as_deref(), state).await;
    info!("controller stopped");
    Ok(())
}
