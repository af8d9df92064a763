//! klaxon entrypoint: wire the API client, the trigger inventory, the
//! controllers and the webhook endpoint together, then run until signalled.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use tokio_util::sync::CancellationToken;
use tracing::info;

use klaxon_controllers::ControllerSet;
use klaxon_inventory::Inventory;
use klaxon_webhook::{GitHubWebhook, WebhookState, GITHUB_SECRET_KEY_NAME};

#[derive(Parser, Debug)]
#[command(
    name = "klaxon",
    version,
    about = "Build-trigger broker: watches trigger rules and fires BuildRuns"
)]
struct Cli {
    /// Path to a kubeconfig file (default: in-cluster config, then $KUBECONFIG)
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Kubeconfig context to use instead of the current one
    #[arg(long)]
    context: Option<String>,

    /// Restrict watches to a single namespace (default: cluster wide)
    #[arg(long)]
    namespace: Option<String>,

    /// Address the webhook endpoint listens on
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen_addr: SocketAddr,

    /// Key inside each trigger secret holding the webhook signing token
    #[arg(long, default_value = GITHUB_SECRET_KEY_NAME)]
    secret_key_name: String,
}

fn init_tracing() {
    let env = std::env::var("KLAXON_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("KLAXON_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(err) => tracing::warn!(error = %err, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid KLAXON_METRICS_ADDR; expected host:port");
        }
    }
}

async fn build_client(cli: &Cli) -> Result<Client> {
    let config = match (&cli.kubeconfig, &cli.context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).context("reading kubeconfig")?;
            let options = KubeConfigOptions {
                context: cli.context.clone(),
                ..KubeConfigOptions::default()
            };
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .context("loading kubeconfig")?
        }
        (None, Some(_)) => {
            let options = KubeConfigOptions {
                context: cli.context.clone(),
                ..KubeConfigOptions::default()
            };
            Config::from_kubeconfig(&options).await.context("loading kubeconfig context")?
        }
        (None, None) => Config::infer().await.context("inferring cluster configuration")?,
    };
    Client::try_from(config).context("building the API client")
}

async fn shutdown_on_signal(token: CancellationToken) {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
    token.cancel();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = build_client(&cli).await?;
    let inventory = Arc::new(Inventory::new());
    let token = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(token.clone()));

    let controllers = ControllerSet::new(
        client.clone(),
        cli.namespace.as_deref(),
        Arc::clone(&inventory),
        &token,
    );
    controllers.start(&token).await?;

    let processors = tokio::spawn(controllers.run(token.clone()));

    let state = WebhookState::new(
        inventory,
        client,
        Arc::new(GitHubWebhook::new()),
        cli.secret_key_name.clone(),
    );
    klaxon_webhook::serve(cli.listen_addr, state, token.clone())
        .await
        .context("serving the webhook endpoint")?;

    processors.await.context("joining controller loops")??;
    info!("shutdown complete");
    Ok(())
}
