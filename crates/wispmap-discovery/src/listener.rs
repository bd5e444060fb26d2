//! UDP listeners for vendor discovery broadcasts
//!
//! One listener task per protocol. A listener owns its socket for its whole
//! life: the receive loop exits only on cancellation or when the intake
//! channel closes, and the socket is released when the task returns. A bad
//! frame never takes the loop down.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use wispmap_core::Observation;
use wispmap_proto::{mndp, ubnt};

use crate::DiscoveryError;

/// Datagrams smaller than any valid frame header are dropped unparsed.
const MIN_DATAGRAM: usize = 4;

/// Fallback timer period when active probing is disabled; the probe branch
/// is never polled in that case.
const IDLE_PROBE_SECS: u64 = 86_400;

/// Which wire protocol a listener speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListenerProtocol {
    /// Ubiquiti discovery on UDP 10001
    Ubnt,
    /// Mikrotik Neighbor Discovery on UDP 5678 (also carries Mimosa)
    Mndp,
}

impl fmt::Display for ListenerProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ubnt => f.write_str("ubnt"),
            Self::Mndp => f.write_str("mndp"),
        }
    }
}

/// Per-listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub protocol: ListenerProtocol,
    /// Local bind address
    pub bind: IpAddr,
    pub port: u16,
    /// Receive buffer size in bytes
    pub buffer_size: usize,
    /// Send a discover query broadcast this often; `None` is passive.
    /// Only UBNT supports active probing.
    pub probe_interval_secs: Option<u64>,
}

impl ListenerConfig {
    pub fn ubnt() -> Self {
        Self {
            protocol: ListenerProtocol::Ubnt,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: ubnt::UBNT_PORT,
            buffer_size: 2048,
            probe_interval_secs: Some(10),
        }
    }

    pub fn mndp() -> Self {
        Self {
            protocol: ListenerProtocol::Mndp,
            bind: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: mndp::MNDP_PORT,
            buffer_size: 2048,
            probe_interval_secs: None,
        }
    }

    fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

/// Acquire the listener's socket. Separated from the receive loop so the
/// orchestrator sees bind failures synchronously at startup.
pub(crate) async fn bind_socket(config: &ListenerConfig) -> Result<UdpSocket, DiscoveryError> {
    let addr = config.bind_addr();
    let socket = UdpSocket::bind(addr).await.map_err(|source| DiscoveryError::Bind {
        protocol: config.protocol,
        addr,
        source,
    })?;
    if let Err(e) = socket.set_broadcast(true) {
        warn!(protocol = %config.protocol, error = %e, "Could not enable broadcast");
    }
    Ok(socket)
}

/// The receive loop. Runs until cancelled or until the intake channel
/// closes; the socket is dropped on every exit path.
pub(crate) async fn run(
    config: ListenerConfig,
    socket: UdpSocket,
    intake: mpsc::Sender<Observation>,
    cancel: CancellationToken,
) {
    let probe_every = config
        .probe_interval_secs
        .filter(|secs| *secs > 0 && config.protocol == ListenerProtocol::Ubnt);
    let mut probe_timer = interval(Duration::from_secs(probe_every.unwrap_or(IDLE_PROBE_SECS)));
    let mut buf = vec![0u8; config.buffer_size.max(MIN_DATAGRAM)];

    info!(
        protocol = %config.protocol,
        port = config.port,
        active = probe_every.is_some(),
        "Listener started"
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                debug!(protocol = %config.protocol, "Listener cancelled");
                break;
            }
            _ = probe_timer.tick(), if probe_every.is_some() => {
                let target = SocketAddr::new(IpAddr::V4(Ipv4Addr::BROADCAST), config.port);
                match socket.send_to(&ubnt::PROBE_FRAME, target).await {
                    Ok(_) => trace!(protocol = %config.protocol, "Sent discover broadcast"),
                    Err(e) => debug!(protocol = %config.protocol, error = %e, "Discover broadcast failed"),
                }
            }
            received = socket.recv_from(&mut buf) => {
                match received {
                    Ok((len, peer)) => {
                        if !handle_datagram(&config, &buf[..len], peer, &intake).await {
                            break;
                        }
                    }
                    Err(e) => {
                        // Transient receive errors (e.g. truncation) do not
                        // terminate the listener
                        warn!(protocol = %config.protocol, error = %e, "Receive error");
                    }
                }
            }
        }
    }
}

/// Decode one datagram and push the observation. Returns false only when
/// the intake channel is gone and the loop should stop.
async fn handle_datagram(
    config: &ListenerConfig,
    data: &[u8],
    peer: SocketAddr,
    intake: &mpsc::Sender<Observation>,
) -> bool {
    if data.len() < MIN_DATAGRAM {
        trace!(protocol = %config.protocol, len = data.len(), from = %peer, "Runt datagram dropped");
        return true;
    }
    if config.protocol == ListenerProtocol::Ubnt && ubnt::is_probe(data) {
        // Our own discover query echoed off the broadcast address
        return true;
    }

    let decoded = match config.protocol {
        ListenerProtocol::Ubnt => ubnt::decode(data),
        ListenerProtocol::Mndp => mndp::decode(data),
    };

    match decoded {
        Ok(mut obs) => {
            // Protocols that omit the address still came from somewhere
            if obs.ip.is_none() {
                obs.ip = Some(peer.ip());
            }
            trace!(
                protocol = %obs.protocol,
                mac = %obs.mac,
                from = %peer,
                "Observation decoded"
            );
            intake.send(obs).await.is_ok()
        }
        Err(e) => {
            debug!(
                protocol = %config.protocol,
                from = %peer,
                error = %e,
                "Malformed frame dropped"
            );
            true
        }
    }
}
