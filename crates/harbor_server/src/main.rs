use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;

use harbor_cluster::{
    BackendDirectory, ClusterEventLog, FalsePrimaryVerifier, LocalControlPlane, MonitorExit,
    PgAdminConnector, RecoveryOrchestrator, RecoveryRequestState, ReplicationLagMonitor,
    SupervisorEvent,
};
use harbor_common::config::{ConfigSource, HarborConfig, TomlFileSource};
use harbor_common::signal::{WorkerRequest, WorkerSignal};
use harbor_common::NodeId;

const EVENT_LOG_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "harbor", about = "Failover and online recovery control plane")]
struct Cli {
    /// Config file path.
    #[arg(short, long, default_value = "harbor.toml")]
    config: String,

    /// Prometheus metrics listen address (disabled when omitted).
    #[arg(long)]
    metrics_addr: Option<String>,

    /// Print the default configuration as TOML and exit.
    #[arg(long)]
    print_default_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the replication lag monitor until SIGINT/SIGTERM.
    Monitor,
    /// Bring a down backend back into the cluster.
    Recover {
        /// Backend node id (0-based, in config order).
        node_id: usize,
    },
    /// Decode a log position ("segment/offset") into its comparable value.
    Lsn { text: String },
}

/// Shared process state both workers are wired to.
struct ControlPlane {
    directory: Arc<BackendDirectory>,
    events: Arc<ClusterEventLog>,
    control: Arc<LocalControlPlane>,
}

impl ControlPlane {
    fn new(config: &HarborConfig) -> Self {
        let directory = Arc::new(BackendDirectory::from_config(
            &config.backends,
            config.cluster.primary_node,
        ));
        let events = ClusterEventLog::new(EVENT_LOG_CAPACITY);
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(log_supervisor_events(rx));
        let control = Arc::new(
            LocalControlPlane::new(directory.clone(), RecoveryRequestState::new(), events.clone())
                .with_supervisor(tx),
        );
        Self {
            directory,
            events,
            control,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        let default_config = HarborConfig::default();
        let toml_str = toml::to_string_pretty(&default_config)
            .unwrap_or_else(|e| format!("# failed to serialize default config: {}", e));
        println!("{}", toml_str);
        return Ok(());
    }

    harbor_observability::init_tracing();

    let command = cli.command.unwrap_or(Command::Monitor);
    if let Command::Lsn { text } = &command {
        let value = harbor_cluster::decode_lsn(text)?;
        println!("{}", value);
        return Ok(());
    }

    if let Some(addr) = &cli.metrics_addr {
        harbor_observability::init_metrics(addr)
            .map_err(|e| anyhow::anyhow!("failed to start metrics exporter on {}: {}", addr, e))?;
    }

    let source: Arc<dyn ConfigSource> = Arc::new(TomlFileSource::new(&cli.config));
    let config = source
        .load()
        .with_context(|| format!("loading {}", cli.config))?;
    tracing::info!(
        backends = config.backends.len(),
        primary = ?config.cluster.primary_node,
        mode = ?config.cluster.mode,
        "configuration loaded"
    );

    match command {
        Command::Monitor => run_monitor(config, source).await,
        Command::Recover { node_id } => run_recovery(config, NodeId(node_id)).await,
        Command::Lsn { .. } => Ok(()),
    }
}

/// Supervise the lag monitor: restart it on SIGUSR1, stop on SIGINT/SIGTERM.
async fn run_monitor(config: HarborConfig, source: Arc<dyn ConfigSource>) -> Result<()> {
    let mut plane = ControlPlane::new(&config);
    let signal = WorkerSignal::new();
    spawn_signal_forwarder(signal.clone())?;

    let mut config = config;
    loop {
        let mut monitor = ReplicationLagMonitor::new(
            config.clone(),
            source.clone(),
            plane.directory.clone(),
            plane.control.clone(),
            Arc::new(PgAdminConnector::default()),
            Arc::new(FalsePrimaryVerifier),
        );
        match monitor.run(signal.clone()).await {
            MonitorExit::Shutdown => break,
            MonitorExit::Restart => {
                signal.clear_restart();
                match source.load() {
                    Ok(fresh) => {
                        // The directory is sized from the backend list.
                        if config.backends_changed(&fresh) {
                            tracing::info!(
                                backends = fresh.backends.len(),
                                "backend list changed, rebuilding backend directory"
                            );
                            plane = ControlPlane::new(&fresh);
                        }
                        config = fresh;
                    }
                    Err(e) => tracing::warn!(error = %e, "keeping previous configuration"),
                }
                tracing::info!("starting a fresh replication lag monitor");
            }
        }
    }

    tracing::info!(events = plane.events.len(), "harbor stopped");
    Ok(())
}

async fn run_recovery(config: HarborConfig, node: NodeId) -> Result<()> {
    let plane = ControlPlane::new(&config);
    let orchestrator = RecoveryOrchestrator::new(
        config.recovery.clone(),
        plane.directory.clone(),
        plane.control.clone(),
        Arc::new(PgAdminConnector::default()),
        plane.events.clone(),
    );

    orchestrator
        .recover_node(node)
        .await
        .with_context(|| format!("recovery of node {} failed", node))?;
    println!("node {} recovered", node);
    Ok(())
}

async fn log_supervisor_events(mut rx: mpsc::UnboundedReceiver<SupervisorEvent>) {
    while let Some(event) = rx.recv().await {
        tracing::info!(?event, "supervisor notification");
    }
}

/// Map process signals onto worker requests.
fn spawn_signal_forwarder(signal: WorkerSignal) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal as unix_signal, SignalKind};

        let mut sighup = unix_signal(SignalKind::hangup()).context("registering SIGHUP")?;
        let mut sigusr1 =
            unix_signal(SignalKind::user_defined1()).context("registering SIGUSR1")?;
        let mut sigterm = unix_signal(SignalKind::terminate()).context("registering SIGTERM")?;

        tokio::spawn(async move {
            loop {
                let (request, name) = tokio::select! {
                    _ = sighup.recv() => (WorkerRequest::Reload, "SIGHUP"),
                    _ = sigusr1.recv() => (WorkerRequest::Restart, "SIGUSR1"),
                    _ = sigterm.recv() => (WorkerRequest::Shutdown, "SIGTERM"),
                    _ = tokio::signal::ctrl_c() => (WorkerRequest::Shutdown, "SIGINT"),
                };
                tracing::info!(signal = name, request = ?request, "signal received");
                signal.request(request);
                if request == WorkerRequest::Shutdown {
                    break;
                }
            }
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("SIGINT (Ctrl+C) received");
                signal.request(WorkerRequest::Shutdown);
            }
        });
    }
    Ok(())
}
