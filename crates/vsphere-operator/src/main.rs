//! vSphere machine controller - reconciles Machines against vCenter

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use futures::StreamExt;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Api, Client, Config, CustomResourceExt};

use machine_api_common::crd::{IPAddress, IPAddressClaim, Infrastructure, Machine};
use machine_api_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use machine_api_common::FeatureGates;
use vsphere_machine::{error_policy, reconcile, Context};

/// Machine controller for vSphere
#[derive(Parser, Debug)]
#[command(name = "machine-controller-manager", version, about, long_about = None)]
struct Cli {
    /// Print the CRD manifests this controller consumes and exit
    #[arg(long)]
    crd: bool,

    /// Path to a kubeconfig; in-cluster or default config when unset
    #[arg(long)]
    kubeconfig: Option<PathBuf>,

    /// Only watch Machines in this namespace
    #[arg(long, env = "WATCH_NAMESPACE")]
    namespace: Option<String>,

    /// Feature gates, e.g. `VSphereStaticIPs=true,VSphereMultiDisk=false`
    #[arg(long, env = "FEATURE_GATES", default_value = "")]
    feature_gates: FeatureGates,

    /// Seconds between reconciles of a provisioned Machine
    #[arg(long, default_value = "600")]
    resync_period_secs: u64,

    /// Skip TLS verification when talking to vCenter
    #[arg(long, env = "VCENTER_INSECURE")]
    vcenter_insecure: bool,

    /// Log record encoding
    #[arg(long, value_enum, default_value = "json")]
    log_format: Format,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Format {
    Json,
    Text,
}

impl From<Format> for LogFormat {
    fn from(format: Format) -> Self {
        match format {
            Format::Json => LogFormat::Json,
            Format::Text => LogFormat::Text,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        for crd in [
            Machine::crd(),
            IPAddressClaim::crd(),
            IPAddress::crd(),
            Infrastructure::crd(),
        ] {
            let yaml = serde_yaml::to_string(&crd)
                .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
            println!("---\n{yaml}");
        }
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.log_format.into(),
        ..Default::default()
    })?;

    run_controller(cli).await
}

async fn kube_client(kubeconfig: Option<&PathBuf>) -> anyhow::Result<Client> {
    let Some(path) = kubeconfig else {
        return Client::try_default()
            .await
            .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e));
    };
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| anyhow::anyhow!("Failed to read kubeconfig {:?}: {}", path, e))?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load kubeconfig {:?}: {}", path, e))?;
    Client::try_from(config).map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))
}

async fn run_controller(cli: Cli) -> anyhow::Result<()> {
    let client = kube_client(cli.kubeconfig.as_ref()).await?;

    let machines: Api<Machine> = match &cli.namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(
        Context::builder(client)
            .feature_gates(cli.feature_gates)
            .resync_period(Duration::from_secs(cli.resync_period_secs))
            .insecure(cli.vcenter_insecure)
            .build(),
    );

    tracing::info!(
        namespace = cli.namespace.as_deref().unwrap_or("<all>"),
        resync_period_secs = cli.resync_period_secs,
        "starting machine controller"
    );

    Controller::new(machines, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    tracing::debug!(?action, "Machine reconciliation completed");
                }
                Err(e) => {
                    tracing::error!(error = ?e, "Machine reconciliation error");
                }
            }
        })
        .await;

    tracing::info!("machine controller shut down");
    Ok(())
}
