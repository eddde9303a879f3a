//! MPI Operator - Kubernetes controller for distributed MPI training jobs

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{ConfigMap, Pod, Service};
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use mpi_operator::api::start_api_server;
use mpi_operator::controller::{error_policy, reconcile, Context};
use mpi_operator::crd::MpiJob;
use mpi_operator::webhook::{start_webhook_server, Validator};
use mpi_operator::{DEFAULT_API_PORT, DEFAULT_WEBHOOK_PORT};

/// MPI Operator - runs distributed MPI training jobs on Kubernetes
#[derive(Parser, Debug)]
#[command(name = "mpi-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the MpiJob CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the MpiJob CRD, starts the validating webhook and the
    /// management API, then reconciles MpiJobs until signalled.
    Controller(ControllerArgs),
}

#[derive(Args, Debug, Default)]
struct ControllerArgs {
    /// Port for the validating webhook
    #[arg(long, env = "WEBHOOK_PORT", default_value_t = DEFAULT_WEBHOOK_PORT)]
    webhook_port: u16,

    /// Port for the management API
    #[arg(long, env = "API_PORT", default_value_t = DEFAULT_API_PORT)]
    api_port: u16,

    /// TLS certificate for the webhook (PEM)
    #[arg(long, env = "WEBHOOK_TLS_CERT")]
    webhook_tls_cert: Option<PathBuf>,

    /// TLS private key for the webhook (PEM)
    #[arg(long, env = "WEBHOOK_TLS_KEY")]
    webhook_tls_key: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&MpiJob::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::default()).await,
    }
}

/// Ensure the MpiJob CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply, so
/// the CRD version always matches the operator version.
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(mpi_operator::CONTROLLER_NAME).force();

    tracing::info!("Installing MpiJob CRD...");
    crds.patch("mpijobs.training.dev", &params, &Patch::Apply(&MpiJob::crd()))
        .await
        .map_err(|e| anyhow::anyhow!("Failed to install MpiJob CRD: {}", e))?;

    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default().await?;
    ensure_crd_installed(&client).await?;

    let webhook_addr: SocketAddr = ([0, 0, 0, 0], args.webhook_port).into();
    let webhook_tls = match (args.webhook_tls_cert, args.webhook_tls_key) {
        (Some(cert), Some(key)) => Some((cert, key)),
        (None, None) => None,
        _ => anyhow::bail!("--webhook-tls-cert and --webhook-tls-key must be set together"),
    };
    let validator = Validator::from_client(client.clone());
    tokio::spawn(async move {
        if let Err(e) = start_webhook_server(webhook_addr, webhook_tls, validator).await {
            tracing::error!(error = %e, "webhook server exited");
            std::process::exit(1);
        }
    });

    let api_addr: SocketAddr = ([0, 0, 0, 0], args.api_port).into();
    let api_client = client.clone();
    tokio::spawn(async move {
        if let Err(e) = start_api_server(api_addr, api_client).await {
            tracing::error!(error = %e, "management API exited");
            std::process::exit(1);
        }
    });

    let jobs: Api<MpiJob> = Api::all(client.clone());
    let pods: Api<Pod> = Api::all(client.clone());
    let services: Api<Service> = Api::all(client.clone());
    let config_maps: Api<ConfigMap> = Api::all(client.clone());
    let ctx = Arc::new(Context::from_client(client));

    tracing::info!("MpiJob controller");
    Controller::new(jobs, WatcherConfig::default())
        .owns(pods, WatcherConfig::default())
        .owns(services, WatcherConfig::default())
        .owns(config_maps, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(obj) => {
                    tracing::debug!(?obj, "Job reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Job reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("controller shut down");
    Ok(())
}
