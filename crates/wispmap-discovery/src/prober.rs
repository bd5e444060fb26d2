//! ICMP latency prober
//!
//! Every tick, each registry device with a known IP gets an echo request
//! with an independent timeout, so one silent host never stalls the rest of
//! the cycle. Results feed the registry's reachability state machine; the
//! same tick also runs the freshness sweep so devices that stop announcing
//! go stale even when they were never probeable.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio::time::{interval, timeout};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use wispmap_core::{DeviceRegistry, LatencySample, MacAddr};

/// Prober tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProberConfig {
    /// Seconds between probe rounds
    pub interval_secs: u64,
    /// Per-host echo timeout in milliseconds
    pub timeout_ms: u64,
    /// Seconds without any observation before an online device goes stale
    pub freshness_window_secs: u64,
}

impl Default for ProberConfig {
    fn default() -> Self {
        Self {
            interval_secs: 2,
            timeout_ms: 1000,
            freshness_window_secs: 60,
        }
    }
}

/// The probe scheduler loop. Runs until cancelled.
pub(crate) async fn run(
    config: ProberConfig,
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
) {
    let mut tick = interval(Duration::from_secs(config.interval_secs.max(1)));
    let per_host_timeout = Duration::from_millis(config.timeout_ms.max(1));
    let freshness = Duration::from_secs(config.freshness_window_secs);

    info!(
        interval_secs = config.interval_secs,
        timeout_ms = config.timeout_ms,
        "Latency prober started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!("Latency prober cancelled");
                break;
            }
            _ = tick.tick() => {
                registry.expire(freshness);
                probe_round(&registry, per_host_timeout).await;
            }
        }
    }
}

/// Probe every device with a known IP concurrently and record outcomes as
/// they complete. Devices without an IP are skipped; they stay discoverable
/// through protocol re-announcement.
async fn probe_round(registry: &Arc<DeviceRegistry>, per_host_timeout: Duration) {
    let targets: Vec<(MacAddr, IpAddr)> = registry
        .snapshot()
        .into_iter()
        .filter_map(|d| d.ip().map(|ip| (d.id, ip)))
        .collect();
    if targets.is_empty() {
        return;
    }
    trace!(targets = targets.len(), "Probe round");

    let mut tasks = JoinSet::new();
    for (mac, ip) in targets {
        tasks.spawn(async move {
            let sample = probe_host(ip, per_host_timeout).await;
            (mac, sample)
        });
    }
    while let Some(result) = tasks.join_next().await {
        match result {
            Ok((mac, sample)) => registry.record_latency(mac, sample),
            Err(e) => warn!(error = %e, "Probe task failed"),
        }
    }
}

/// One echo request with a bounded wait. A timeout is a normal signal for
/// the state machine, not an error; so is an unreachable-network failure.
async fn probe_host(ip: IpAddr, per_host_timeout: Duration) -> LatencySample {
    let payload = [0u8; 56];
    match timeout(per_host_timeout, surge_ping::ping(ip, &payload)).await {
        Ok(Ok((_packet, rtt))) => LatencySample::Rtt(rtt),
        Ok(Err(e)) => {
            trace!(ip = %ip, error = %e, "Echo failed");
            LatencySample::Timeout
        }
        Err(_) => LatencySample::Timeout,
    }
}
