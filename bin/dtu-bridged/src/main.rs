//! ---
//! dtu_section: "01-core-functionality"
//! dtu_subsection: "binary"
//! dtu_type: "source"
//! dtu_scope: "code"
//! dtu_description: "Binary entrypoint for the bridge daemon."
//! dtu_version: "v0.1.0"
//! dtu_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use dtu_common::config::{AppConfig, TransportKind};
use dtu_common::logging::init_tracing;
use dtu_core::{BridgeController, BridgeRuntime, MaintenanceJob, MemoryStateStore};
use dtu_metrics::{new_registry, spawn_http_server, BridgeMetrics, MetricsServer};
use dtu_net::{source_from_config, HttpControlRelay, RestApiBuilder, RestApiHandle};
use dtu_rt::{spawn_daily, DailySchedule, TaskSet};
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

const EVENT_QUEUE: usize = 256;

#[derive(Debug, Parser)]
#[command(author, version, about = "OpenDTU telemetry bridge daemon", long_about = None)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, value_enum, help = "Override the configured transport")]
    transport: Option<CliTransport>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliTransport {
    Websocket,
    Mqtt,
    HttpPoll,
}

impl From<CliTransport> for TransportKind {
    fn from(value: CliTransport) -> Self {
        match value {
            CliTransport::Websocket => TransportKind::Websocket,
            CliTransport::Mqtt => TransportKind::Mqtt,
            CliTransport::HttpPoll => TransportKind::HttpPoll,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Run the bridge")]
    Run,
    #[command(about = "Validate the configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/bridge.toml"));
    candidates.push(PathBuf::from("/etc/dtu-bridge/bridge.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    if let Some(transport) = cli.transport {
        config.transport.kind = transport.into();
        config.validate()?;
    }

    match cli.command.unwrap_or(Commands::Run) {
        Commands::CheckConfig => {
            let rendered = serde_json::to_string_pretty(&config)
                .context("failed to render configuration")?;
            println!("# {}\n{}", loaded.source.display(), rendered);
            Ok(())
        }
        Commands::Run => {
            init_tracing("dtu-bridged", &config.logging)?;
            info!(
                config_path = %loaded.source.display(),
                elapsed_ms = load_started.elapsed().as_millis() as u64,
                transport = ?config.transport.kind,
                "configuration loaded"
            );
            run_daemon(config).await
        }
    }
}

async fn run_daemon(config: AppConfig) -> Result<()> {
    let registry = new_registry();
    let metrics = BridgeMetrics::new(registry.clone())?;

    let metrics_server: Option<MetricsServer> = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let (store, writes) = MemoryStateStore::new();
    let store = Arc::new(store);
    let relay = HttpControlRelay::new(&config.device, &config.transport)
        .context("failed to build control relay")?;
    let controller = BridgeController::new(&config.bridge, store.clone())
        .with_relay(Arc::new(relay))
        .with_metrics(metrics);

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (job_tx, job_rx) = mpsc::channel(4);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let source = source_from_config(&config)?;
    info!(transport = source.name(), "starting telemetry transport");

    let mut tasks = TaskSet::default();
    tasks.spawn("transport", source.run(event_tx, shutdown_rx.clone()));

    let runtime = BridgeRuntime::new(controller, event_rx, writes, job_rx, shutdown_rx.clone());
    tasks.spawn("controller", async move {
        let controller = runtime.run().await?;
        info!(objects = controller.cache().len(), "controller stopped");
        Ok(())
    });

    if config.maintenance.enabled {
        let schedule = DailySchedule::new()
            .with_job(config.maintenance.day_end, MaintenanceJob::DayEnd)
            .with_job(config.maintenance.post_midnight, MaintenanceJob::PostMidnight);
        let scheduler = spawn_daily(schedule, job_tx, shutdown_rx.clone());
        tasks.spawn("maintenance", async move { Ok(scheduler.await?) });
    } else {
        info!("daily yield maintenance disabled by configuration");
        drop(job_tx);
    }

    let mut api_server: Option<RestApiHandle> = None;
    if config.api.enabled {
        match RestApiBuilder::new(config.api.listen, store.clone())
            .with_metrics_registry(registry.clone())
            .spawn()
            .await
        {
            Ok(server) => {
                info!(address = %server.local_addr(), "state api listening");
                api_server = Some(server);
            }
            Err(err) => warn!(error = %err, "failed to start state api"),
        }
    } else {
        info!("state api disabled by configuration");
    }

    info!(tasks = tasks.len(), "bridge running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");

    if shutdown_tx.send(true).is_err() {
        warn!("no task listening for shutdown");
    }

    let failures = tasks.join().await;
    if failures > 0 {
        error!(failures, "background tasks ended with errors");
    } else {
        info!("background tasks stopped");
    }

    if let Some(server) = api_server {
        match server.shutdown().await {
            Ok(()) => info!("state api stopped"),
            Err(err) => warn!(error = %err, "state api shutdown failed"),
        }
    }

    if let Some(server) = metrics_server {
        match server.shutdown().await {
            Ok(()) => info!("metrics exporter stopped"),
            Err(err) => warn!(error = %err, "metrics exporter shutdown failed"),
        }
    }

    Ok(())
}
