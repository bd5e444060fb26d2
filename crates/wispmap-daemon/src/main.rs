//! Wispmap daemon - Main entry point
//!
//! Runs the discovery engine and streams inventory changes to the log.
//! The topology/dashboard frontend attaches through the same subscribe
//! and snapshot surface this binary consumes.

mod config;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use wispmap_core::{Device, DeviceRegistry, EventKind, OuiDb};
use wispmap_discovery::Discovery;

#[derive(Parser, Debug)]
#[command(name = "wispmap")]
#[command(about = "LAN device discovery and monitoring for mixed-vendor WISP networks")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "wispmap.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Listen for this many seconds, print the inventory, and exit
    #[arg(long)]
    listen_for: Option<u64>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(true)
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Wispmap v{}", env!("CARGO_PKG_VERSION"));

    let config = config::load_config(&args.config)?;

    let oui = match &config.oui.path {
        Some(path) => Arc::new(OuiDb::with_file(path)?),
        None => Arc::new(OuiDb::builtin()),
    };
    info!(entries = oui.len(), "OUI table loaded");

    let registry = Arc::new(DeviceRegistry::new(oui, config.to_registry_config()));
    let discovery = Discovery::start(config.to_discovery_config(), registry.clone()).await?;

    for warning in discovery.warnings() {
        warn!("{warning}");
    }
    for (protocol, addr) in discovery.listener_addrs() {
        info!(protocol = %protocol, addr = %addr, "Listening");
    }

    let mut events = discovery.subscribe();
    let summary_secs = config.daemon.summary_interval_secs;
    let mut summary = tokio::time::interval(Duration::from_secs(summary_secs.max(1)));
    summary.tick().await; // skip the immediate first tick

    let deadline = args
        .listen_for
        .map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, shutting down");
                break;
            }
            _ = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            } => {
                break;
            }
            _ = summary.tick(), if summary_secs > 0 => {
                log_summary(&registry);
            }
            event = events.recv() => {
                match event {
                    Ok(event) => log_event(&registry, event.mac, &event.kind),
                    Err(RecvError::Lagged(missed)) => {
                        warn!(missed, "Event stream lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }
    }

    discovery.stop().await;

    let devices = registry.snapshot();
    println!("Discovered {} devices:", devices.len());
    for device in &devices {
        print_device(device);
    }

    Ok(())
}

fn log_event(registry: &Arc<DeviceRegistry>, mac: wispmap_core::MacAddr, kind: &EventKind) {
    match kind {
        EventKind::Discovered => {
            if let Some(device) = registry.get(&mac) {
                info!(
                    mac = %mac,
                    vendor = %device.vendor,
                    name = %device.display_name(),
                    ip = ?device.ip(),
                    "Device discovered"
                );
            }
        }
        EventKind::StateChanged { from, to } => {
            info!(mac = %mac, from = %from, to = %to, "Device state changed");
        }
        // Field merges and latency samples are too chatty for info level
        EventKind::Updated | EventKind::LatencyRecorded => {}
        EventKind::Removed => {
            info!(mac = %mac, "Device removed");
        }
    }
}

fn log_summary(registry: &Arc<DeviceRegistry>) {
    let devices = registry.snapshot();
    let online = devices
        .iter()
        .filter(|d| d.state == wispmap_core::DeviceState::Online)
        .count();
    info!(
        devices = devices.len(),
        online,
        "Inventory summary"
    );
}

fn print_device(device: &Device) {
    let ip = device
        .ip()
        .map(|ip| ip.to_string())
        .unwrap_or_else(|| "-".to_string());
    let rtt = device
        .latency
        .average_rtt()
        .map(|rtt| format!("{:.1} ms", rtt.as_secs_f64() * 1000.0))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "  {} [{}] {} {} ({}) state={} rtt={}",
        device.id,
        device.vendor,
        device.display_name(),
        ip,
        device.model().unwrap_or("-"),
        device.state,
        rtt
    );
    for link in &device.links {
        println!("    link -> {} via {}", link.neighbor, link.via);
    }
}
