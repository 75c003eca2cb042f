//! langop operator - runs language agents, models and tools on Kubernetes

use std::sync::Arc;

use clap::{Parser, Subcommand};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, CustomResourceExt};

use langop_common::crd::{LanguageAgent, LanguageCluster, LanguageModel, LanguagePersona, LanguageTool};
use langop_common::telemetry::{init_telemetry, TelemetryConfig};
use langop_common::FIELD_MANAGER;
use langop_operator::config::OperatorConfig;
use langop_operator::controller_runner::build_controllers;
use langop_operator::Context;

/// langop - Kubernetes operator for language agents
#[derive(Parser, Debug)]
#[command(name = "langop", version, about, long_about = None)]
struct Cli {
    /// Generate CRD manifests and exit
    #[arg(long)]
    crd: bool,

    /// Human-readable logs instead of JSON
    #[arg(long, env = "LANGOP_TEXT_LOGS")]
    text_logs: bool,

    #[command(flatten)]
    config: OperatorConfig,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Installs the langop CRDs, then watches every langop kind and keeps
    /// their children in sync until a shutdown signal arrives.
    Controller,
}

fn all_crds() -> Vec<CustomResourceDefinition> {
    vec![
        LanguageAgent::crd(),
        LanguageModel::crd(),
        LanguageTool::crd(),
        LanguagePersona::crd(),
        LanguageCluster::crd(),
    ]
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

    init_telemetry(TelemetryConfig {
        json: !cli.text_logs,
        ..Default::default()
    })?;

    match cli.command {
        Some(Commands::Controller) | None => run_controller(cli.config).await,
    }
}

/// Ensure all langop CRDs are installed
///
/// The operator installs its own CRDs on startup using server-side apply,
/// so the CRD versions always match the operator version.
async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for crd in all_crds() {
        let name = crd.metadata.name.clone().unwrap_or_default();
        tracing::info!(crd = %name, "Installing CRD");
        crds.patch(&name, &params, &Patch::Apply(&crd))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to install {} CRD: {}", name, e))?;
    }
    Ok(())
}

async fn run_controller(config: OperatorConfig) -> anyhow::Result<()> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;

    ensure_crds_installed(&client).await?;

    tracing::info!(
        system_namespace = %config.system_namespace,
        resync_secs = config.resync_secs,
        "Starting langop controllers"
    );
    let ctx = Arc::new(Context::builder(client.clone()).config(config).build());
    let controllers = build_controllers(client, ctx);

    futures::future::join_all(controllers).await;
    tracing::info!("Controllers stopped, shutting down");
    Ok(())
}
