use std::{path::PathBuf, sync::Arc, time::Duration};

use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use discovery::{Endpoint, StaticResolver};
use monitor_core::{
    compute_progress, load_config, Collaborators, ConnectionOrchestrator, MonitorEvent,
    ServerConfig, TomlConfigStore,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    sync::broadcast::error::RecvError,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
struct Args {
    #[arg(long, default_value = "monitor.toml")]
    config: PathBuf,
    /// `name=host:port`; advertises the agent server and adds it to the desired set.
    #[arg(long = "server", value_parser = parse_service)]
    servers: Vec<Service>,
    #[arg(long, default_value_t = 1000)]
    refresh_ms: u64,
}

#[derive(Debug, Clone)]
struct Service {
    name: String,
    endpoint: Endpoint,
}

fn parse_service(raw: &str) -> Result<Service, String> {
    let (name, endpoint) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected name=host:port, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing server name in '{raw}'"));
    }
    let endpoint = endpoint.parse::<Endpoint>().map_err(|err| err.to_string())?;
    Ok(Service {
        name: name.to_string(),
        endpoint,
    })
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let mut config = load_config(Some(args.config.as_path()))
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    let resolver = Arc::new(StaticResolver::new());
    for service in &args.servers {
        resolver.advertise(service.name.clone(), service.endpoint.clone());
        if !config.servers.iter().any(|server| server.name == service.name) {
            config.servers.push(ServerConfig::plain(service.name.clone()));
        }
    }
    if config.servers.is_empty() {
        warn!("monitor: no servers configured, pass --server name=host:port");
    }

    let orchestrator = ConnectionOrchestrator::start(
        config.clone(),
        Collaborators::new(resolver)
            .with_config_store(Arc::new(TomlConfigStore::new(args.config.clone()))),
    );
    let mut events = orchestrator.subscribe_events();
    orchestrator.reinit(config.server_names());
    let rescans = config
        .rescan_interval()
        .map(|every| orchestrator.spawn_periodic_discovery(every));

    let mut ticker = tokio::time::interval(Duration::from_millis(args.refresh_ms.max(50)));
    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    info!("monitor: commands are stop, previews, rescan, status, quit");
    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            _ = ticker.tick() => report_progress(&orchestrator).await,
            event = events.recv() => match event {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "monitor: event stream lagged"),
                Err(RecvError::Closed) => break,
            },
            line = stdin.next_line(), if stdin_open => match line {
                Ok(Some(line)) => {
                    if !run_command(&orchestrator, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => stdin_open = false,
                Err(err) => {
                    warn!(error = %err, "monitor: failed to read stdin");
                    stdin_open = false;
                }
            },
        }
    }

    info!("monitor: shutting down");
    if let Some(rescans) = rescans {
        rescans.abort();
    }
    orchestrator.shutdown().await;
    Ok(())
}

/// Returns false when the user asked to quit.
async fn run_command(orchestrator: &ConnectionOrchestrator, command: &str) -> bool {
    match command {
        "" => {}
        "stop" => orchestrator.emergency_stop_all(),
        "previews" => orchestrator.enable_all_previews(),
        "rescan" => orchestrator.discovery_updated(),
        "status" => match orchestrator.status().await {
            Ok(status) => info!(
                desired = ?status.desired,
                connected = ?status.connected,
                pending = ?status.pending_disconnect,
                reinits = status.reinits,
                "monitor: status"
            ),
            Err(err) => warn!(error = %err, "monitor: status unavailable"),
        },
        "quit" | "exit" => return false,
        other => warn!(command = other, "monitor: unknown command"),
    }
    true
}

async fn report_progress(orchestrator: &ConnectionOrchestrator) {
    let table = orchestrator.store().snapshot().await;
    if table.is_empty() {
        return;
    }
    let progress = compute_progress(&table, Utc::now());
    info!(
        status = ?progress.status,
        elapsed_s = progress.elapsed_seconds,
        total_s = progress.total_seconds,
        images = %format!("{}/{}", progress.images_taken, progress.total_images),
        filter = progress.current_filter.as_deref().unwrap_or("-"),
        start = %progress.imager_start.format("%H:%M:%S"),
        finish = %progress.imager_finish.format("%H:%M:%S"),
        meridian_in_s = ?progress.meridian.map(|offset| offset.from_now),
        limit_in_s = ?progress.hour_angle_limit.map(|offset| offset.from_now),
        "monitor: sequence"
    );
}

fn log_event(event: &MonitorEvent) {
    match event {
        MonitorEvent::ServerReady { server } => info!(server = %server, "monitor: server ready"),
        MonitorEvent::ServerLost {
            server,
            expected,
            reason,
        } => info!(server = %server, expected, reason = %reason, "monitor: server lost"),
        MonitorEvent::StoreReinitialised { servers } => {
            info!(servers = ?servers, "monitor: property store reinitialised")
        }
        MonitorEvent::PreviewImage { device, url } => {
            info!(device = %device, url = %url, "monitor: new preview image")
        }
    }
}
