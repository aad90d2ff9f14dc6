//! eno controller - synthesizer pod lifecycle and reconstitution

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use eno_common::crd::{Composition, ResourceSlice, Synthesizer};
use eno_common::telemetry::init_telemetry;
use eno_common::FIELD_MANAGER;
use eno_operator::config::TelemetryArgs;
use eno_operator::{build_reconstitution_controllers, build_synthesis_controllers, ControllerArgs};

/// eno - runs synthesizers and reconstitutes their output
#[derive(Parser, Debug)]
#[command(name = "eno-controller", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    controller: ControllerArgs,

    #[command(flatten)]
    telemetry: TelemetryArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    Controller,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in all_crds() {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    let telemetry = cli.telemetry.telemetry_config(&cli.controller.pod_namespace);
    let _telemetry = init_telemetry(&telemetry)
        .map_err(|e| anyhow::anyhow!("Failed to initialize telemetry: {}", e))?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.controller).await,
    }
}

fn all_crds() -> [CustomResourceDefinition; 3] {
    [Composition::crd(), Synthesizer::crd(), ResourceSlice::crd()]
}

/// Install or update the eno CRDs using server-side apply
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD...");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }

    tracing::info!("All eno CRDs installed/updated");
    Ok(())
}

async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    if args.install_crds {
        ensure_crds_installed(&client).await?;
    }

    let config = args.synthesis_config();
    tracing::info!(
        pod_namespace = %config.pod_namespace,
        executor_image = %config.executor_image,
        "Starting eno controllers"
    );

    let mut controllers = build_synthesis_controllers(client.clone(), config);
    controllers.extend(build_reconstitution_controllers(client));

    // Any controller returning means a shutdown signal was received
    let _ = futures::future::select_all(controllers).await;

    tracing::info!("eno controller shutting down");
    Ok(())
}
