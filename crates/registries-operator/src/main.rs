//! Registries operator - distributes registry CA certificates to every node

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use kube::{Api, Client, CustomResourceExt};

use registries_common::crd::Registry;
use registries_common::kube_utils::create_client;
use registries_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use registries_common::{DEFAULT_JOB_IMAGE, DEFAULT_JOB_NAMESPACE, OPERATOR_NAME};
use registries_controller::ControllerConfig;

mod controller_runner;

/// Registries - installs the CA of each `Registry` into the docker and podman
/// trust stores of every node
#[derive(Parser, Debug)]
#[command(name = "registries-operator", version, about, long_about = None)]
struct Cli {
    /// Generate the CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster config is used when absent
    #[arg(long, env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Namespace for removal jobs and for certificate references without one
    #[arg(
        long,
        env = "REGISTRIES_JOB_NAMESPACE",
        default_value = DEFAULT_JOB_NAMESPACE,
        global = true
    )]
    job_namespace: String,

    /// Image running the certificate install/remove commands
    #[arg(
        long,
        env = "REGISTRIES_JOB_IMAGE",
        default_value = DEFAULT_JOB_IMAGE,
        global = true
    )]
    job_image: String,

    /// Log output format (text or json)
    #[arg(long, env = "REGISTRIES_LOG_FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches Registry resources and keeps every node's trust stores in
    /// line with the certificate each one references.
    Controller,

    /// Print the operator version and exit
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!(
            "CRITICAL: Failed to install aws-lc-rs crypto provider: {:?}. \
             The operator cannot talk to the API server without a working TLS implementation.",
            e
        );
        std::process::exit(1);
    }

    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&Registry::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Version) => {
            println!("{} {}", OPERATOR_NAME, env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Controller) | None => run_controller(cli).await,
    }
}

/// Ensure the Registry CRD is installed
///
/// The operator installs its own CRD on startup using server-side apply so
/// the schema always matches the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(OPERATOR_NAME).force();

    tracing::info!("Installing Registry CRD...");
    crds.patch(
        "registries.kubic.opensuse.org",
        &params,
        &Patch::Apply(&Registry::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install Registry CRD: {}", e))?;

    Ok(())
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        log_format: cli.log_format,
        ..Default::default()
    })?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting registries operator");

    let client = create_client(cli.kubeconfig.as_deref()).await?;
    ensure_crds_installed(&client).await?;

    let config = ControllerConfig {
        job_namespace: cli.job_namespace,
        job_image: cli.job_image,
    };
    tracing::info!(
        job_namespace = %config.job_namespace,
        job_image = %config.job_image,
        "Starting controllers:"
    );

    controller_runner::run(client, config).await;

    tracing::info!("Registries operator shutting down");
    Ok(())
}
