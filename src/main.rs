//! meshprobe - service mesh authorization propagation checks

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context as _};
use clap::{Args, Parser, Subcommand};
use tracing::info;

use meshprobe::config::{ConfigOverrides, HarnessConfig};
use meshprobe::context::ScenarioContext;
use meshprobe::environment::kube::KubeEnvironment;
use meshprobe::probe::kubectl::KubectlTransport;
use meshprobe::registry::{run_all, Registry, Selection, POD_CLIENT_SERVER_SUITE};
use meshprobe::telemetry::{init_telemetry, TelemetryConfig};

/// meshprobe - checks that mesh policy changes reach the data plane
#[derive(Parser, Debug)]
#[command(name = "meshprobe", version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the available scenarios
    List,

    /// Run scenarios against the current cluster
    ///
    /// The mesh must already be installed. Scenario namespaces are created
    /// and, unless disabled in the config file, deleted afterwards.
    Run(RunArgs),
}

/// Run mode arguments
#[derive(Args, Debug)]
struct RunArgs {
    /// Scenario to run (repeatable); all selected scenarios run when omitted
    #[arg(long = "scenario", short = 's')]
    scenarios: Vec<String>,

    /// Only run scenarios of this tier
    #[arg(long)]
    tier: Option<u8>,

    /// Only run scenarios of this bucket
    #[arg(long)]
    bucket: Option<u8>,

    /// Harness config file (YAML or JSON)
    #[arg(long, short = 'c', env = "MESHPROBE_CONFIG")]
    config: Option<PathBuf>,

    /// Kubeconfig for both the API client and kubectl exec
    #[arg(long, env = "MESHPROBE_KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Mesh name used for namespace enrollment
    #[arg(long, env = "MESHPROBE_MESH_NAME")]
    mesh_name: Option<String>,

    /// Registry hosting the TCP echo server image
    #[arg(long, env = "MESHPROBE_REGISTRY")]
    registry: Option<String>,

    /// Tag of the TCP echo server image
    #[arg(long, env = "MESHPROBE_IMAGE_TAG")]
    image_tag: Option<String>,

    /// Emit JSON logs
    #[arg(long)]
    json_logs: bool,

    /// Write the suite report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
}

fn list() {
    let registry = Registry::builtin();
    for d in registry.scenarios() {
        println!(
            "{:32} tier={} bucket={}  {}",
            d.name, d.tier, d.bucket, d.description
        );
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    init_telemetry(TelemetryConfig {
        json: args.json_logs,
        ..Default::default()
    })?;

    let mut config = match &args.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };
    config.apply_overrides(ConfigOverrides {
        mesh_name: args.mesh_name,
        registry: args.registry,
        image_tag: args.image_tag,
    });
    config.validate()?;

    let registry = Registry::builtin();
    let selected = registry.select(&Selection {
        names: args.scenarios,
        tier: args.tier,
        bucket: args.bucket,
    })?;
    if selected.is_empty() {
        return Err(anyhow!("no scenarios match the selection"));
    }

    let environment = KubeEnvironment::connect(args.kubeconfig.as_deref(), &config.mesh_name)
        .await
        .context("failed to connect to the cluster")?;
    let transport =
        KubectlTransport::new(args.kubeconfig.clone()).with_timeout(config.exec_timeout());
    let ctx = ScenarioContext::new(Arc::new(environment), Arc::new(transport), config);

    info!(count = selected.len(), "running scenarios");
    let report = run_all(&ctx, POD_CLIENT_SERVER_SUITE, &selected).await;

    if let Some(path) = &args.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report to {}", path.display()))?;
        info!(path = %path.display(), "report written");
    }

    report.finish().map_err(|e| anyhow!(e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::List => {
            list();
            Ok(())
        }
        Commands::Run(args) => run(args).await,
    }
}
