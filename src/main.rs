//! cert-manager DNS-01 webhook
//!
//! Serves the solver API cert-manager calls for DNS-01 challenges. Runs
//! in-cluster with the pod's service account.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use dns01_webhook::server::{self, AppState};
use dns01_webhook::solver::{EnvPolicy, Solver, SolverSettings};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// API group the webhook is registered under
    #[arg(long, env = "GROUP_NAME")]
    group_name: String,

    /// Namespace holding secrets referenced by ClusterIssuers
    #[arg(long, env = "CERT_MANAGER_NAMESPACE")]
    cluster_resource_namespace: String,

    #[arg(long, env = "LISTEN_ADDR", default_value = "0.0.0.0:8443")]
    listen: SocketAddr,

    /// `strict` refuses to overwrite set variables, `restore` overwrites and restores
    #[arg(long, env = "ENV_POLICY", default_value_t = EnvPolicy::Strict)]
    env_policy: EnvPolicy,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = FmtSubscriber::builder().with_env_filter(filter);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Flip `tx` on the first SIGTERM or SIGINT
async fn shutdown_signal(tx: watch::Sender<bool>) -> Result<()> {
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        res = tokio::signal::ctrl_c() => {
            res.context("Failed to listen for SIGINT")?;
            info!("Received SIGINT");
        }
    }

    let _ = tx.send(true);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!(
        group = %cli.group_name,
        listen = %cli.listen,
        env_policy = %cli.env_policy,
        "Starting DNS-01 webhook"
    );

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = tokio::spawn(shutdown_signal(shutdown_tx));

    let settings = SolverSettings::new(cli.cluster_resource_namespace).with_env_policy(cli.env_policy);
    let solver = Solver::initialize(client, settings, shutdown_rx.clone())
        .await
        .context("Failed to initialize solver")?;

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;

    let state = AppState {
        solver: Arc::new(solver),
        group_name: cli.group_name,
    };
    server::serve(listener, state, shutdown_rx)
        .await
        .context("Webhook server failed")?;

    signals.abort();
    info!("Webhook stopped");
    Ok(())
}
