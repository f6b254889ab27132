use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use installer_apply::{Appliers, Install, ProcessRunner, Uninstall};
use installer_core::{plan_line, reverse_walk, walk, Action, Component, DryRun, Manifest, Progress, Settings, WalkError};
use installer_kubehub::KubeCluster;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod progress;

use progress::TermProgress;

#[derive(Parser, Debug)]
#[command(name = "epinio-installer", version, about = "Install and remove Epinio and its dependencies")]
struct Cli {
    /// Installation manifest
    #[arg(short = 'm', long = "manifest", env = "EPINIO_MANIFEST", global = true, default_value = "epinio-install.yml")]
    manifest: PathBuf,

    /// Kubeconfig file(s); defaults to the in-cluster or default config
    #[arg(short = 'c', long = "kubeconfig", env = "KUBECONFIG", global = true)]
    kubeconfig: Option<PathBuf>,

    /// Multiply every readiness timeout, for slow clusters
    #[arg(long = "timeout-multiplier", env = "EPINIO_TIMEOUT_MULTIPLIER", global = true, default_value_t = 1)]
    timeout_multiplier: u32,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output {
    Human,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install every component, dependencies first
    Install {
        /// Walk the manifest without touching the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Remove every component, dependents first
    Uninstall {
        /// Walk the manifest without touching the cluster
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Validate the manifest and print the planned order
    Plan {
        #[arg(short = 'o', long = "output", value_enum, default_value_t = Output::Human)]
        output: Output,
    },
    /// Print the installer version
    Version,
}

fn init_tracing() {
    let env = std::env::var("EPINIO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EPINIO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid EPINIO_METRICS_ADDR; expected host:port");
        }
    }
}

/// Both binaries must be resolvable before anything touches the cluster.
fn check_dependencies(settings: &Settings) -> Result<()> {
    for (bin, var) in [(&settings.helm_bin, "EPINIO_HELM_BIN"), (&settings.kubectl_bin, "EPINIO_KUBECTL_BIN")] {
        let path = which::which(bin).with_context(|| format!("'{}' not found in PATH; install it or set {}", bin, var))?;
        info!(bin = %bin, path = %path.display(), "found dependency");
    }
    Ok(())
}

fn load_plan(path: &Path) -> Result<Vec<Component>> {
    let manifest = Manifest::load(path)?;
    let plan = manifest.validate().with_context(|| format!("invalid manifest {}", path.display()))?;
    info!(manifest = %path.display(), plan = %plan_line(&plan), "planned order");
    Ok(plan)
}

/// Cancel the walk on the first Ctrl-C.
fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            warn!("Ctrl-C received; stopping after in-flight components");
            trigger.cancel();
        }
    });
    cancel
}

async fn build_action(
    cli: &Cli,
    settings: &Settings,
    progress: Arc<dyn Progress>,
    install: bool,
    dry_run: bool,
) -> Result<Arc<dyn Action>> {
    let verb = if install { "install" } else { "uninstall" };
    if dry_run {
        let action: Arc<dyn Action> = Arc::new(DryRun::new(verb, progress));
        return Ok(action);
    }
    check_dependencies(settings)?;
    let cluster = Arc::new(KubeCluster::connect(cli.kubeconfig.as_deref(), settings.poll_interval).await?);
    let appliers = Arc::new(Appliers::new(Arc::new(ProcessRunner), cluster, settings));
    let action: Arc<dyn Action> =
        if install { Arc::new(Install::new(appliers, progress)) } else { Arc::new(Uninstall::new(appliers, progress)) };
    Ok(action)
}

async fn run_walk(cli: &Cli, install: bool, dry_run: bool) -> Result<()> {
    let settings = Settings::from_env().with_timeout_multiplier(cli.timeout_multiplier);
    let plan = load_plan(&cli.manifest)?;
    let progress: Arc<dyn Progress> = Arc::new(TermProgress::default());
    let action = build_action(cli, &settings, progress.clone(), install, dry_run).await?;

    let cancel = cancel_on_ctrl_c();
    let t0 = Instant::now();
    let result = if install { walk(&cancel, &plan, action).await } else { reverse_walk(&cancel, &plan, action).await };
    match result {
        Ok(report) => {
            let verb = if install { "installed" } else { "removed" };
            progress.success(&format!("{} {} components in {:.1}s", verb, report.completed.len(), t0.elapsed().as_secs_f64()));
            Ok(())
        }
        Err(e) => {
            if !e.completed().is_empty() {
                progress.note(&format!("completed before stopping: {}", e.completed().join(", ")));
            }
            if let WalkError::Failed { component, .. } = &e {
                error!(component = %component, "walk aborted");
            }
            Err(e.into())
        }
    }
}

fn print_plan(path: &Path, output: Output) -> Result<()> {
    let plan = load_plan(path)?;
    match output {
        Output::Human => {
            for (i, c) in plan.iter().enumerate() {
                if c.needs.is_empty() {
                    println!("{:>2}. {} ({:?})", i + 1, c.id, c.kind);
                } else {
                    println!("{:>2}. {} ({:?}) needs {}", i + 1, c.id, c.kind, c.needs.join(", "));
                }
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(&plan)?),
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<()> {
    match &cli.command {
        Commands::Install { dry_run } => run_walk(&cli, true, *dry_run).await,
        Commands::Uninstall { dry_run } => run_walk(&cli, false, *dry_run).await,
        Commands::Plan { output } => print_plan(&cli.manifest, *output),
        Commands::Version => {
            println!("{} {}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}
