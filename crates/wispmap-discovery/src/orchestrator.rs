//! Discovery orchestrator
//!
//! Owns the lifecycle of every listener, the SNMP poller, and the latency
//! prober. Observations from all sources flow through one intake channel
//! into a single drain task, so registry ingestion is strictly serialized
//! in arrival order. A listener that cannot bind its socket becomes a
//! startup warning; the rest of the engine runs without it.

use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use wispmap_core::{Device, DeviceEvent, DeviceRegistry, Observation};

use crate::listener::{self, ListenerConfig, ListenerProtocol};
use crate::prober::{self, ProberConfig};
use crate::snmp_poll::{self, SnmpConfig};
use crate::DiscoveryError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryConfig {
    pub listeners: Vec<ListenerConfig>,
    pub probe: ProberConfig,
    pub snmp: SnmpConfig,
    /// Intake channel depth between listeners and the registry drain
    pub intake_capacity: usize,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            listeners: vec![ListenerConfig::ubnt(), ListenerConfig::mndp()],
            probe: ProberConfig::default(),
            snmp: SnmpConfig::default(),
            intake_capacity: 256,
        }
    }
}

/// A running discovery engine. [`stop`](Self::stop) cancels every worker
/// and waits for their sockets to be released before returning.
pub struct Discovery {
    registry: Arc<DeviceRegistry>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
    warnings: Vec<String>,
    listener_addrs: Vec<(ListenerProtocol, SocketAddr)>,
}

impl Discovery {
    /// Launch everything the configuration enables.
    ///
    /// Per-listener bind failures are collected into [`warnings`](Self::warnings)
    /// and do not stop the other protocols; the only fatal case is a
    /// configuration whose every intake source failed to start.
    pub async fn start(
        config: DiscoveryConfig,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self, DiscoveryError> {
        let cancel = CancellationToken::new();
        let (intake_tx, intake_rx) = mpsc::channel::<Observation>(config.intake_capacity.max(1));
        let mut tasks = Vec::new();
        let mut warnings = Vec::new();
        let mut listener_addrs = Vec::new();
        let mut sources = 0usize;

        // The single consumer: ends on its own once every producer is gone.
        tasks.push(tokio::spawn(drain(intake_rx, registry.clone())));

        for listener_config in &config.listeners {
            match listener::bind_socket(listener_config).await {
                Ok(socket) => {
                    if let Ok(addr) = socket.local_addr() {
                        listener_addrs.push((listener_config.protocol, addr));
                    }
                    tasks.push(tokio::spawn(listener::run(
                        listener_config.clone(),
                        socket,
                        intake_tx.clone(),
                        cancel.child_token(),
                    )));
                    sources += 1;
                }
                Err(e) => {
                    warn!(error = %e, "Listener disabled");
                    warnings.push(e.to_string());
                }
            }
        }

        if config.snmp.enabled {
            tasks.push(tokio::spawn(snmp_poll::run(
                config.snmp.clone(),
                registry.clone(),
                intake_tx.clone(),
                cancel.child_token(),
            )));
            sources += 1;
        }

        // Only the workers hold intake senders now; the drain task exits
        // once they all stop.
        drop(intake_tx);

        if sources == 0 && !config.listeners.is_empty() {
            cancel.cancel();
            for task in tasks {
                let _ = task.await;
            }
            return Err(DiscoveryError::NothingStarted);
        }

        tasks.push(tokio::spawn(prober::run(
            config.probe.clone(),
            registry.clone(),
            cancel.child_token(),
        )));

        info!(
            listeners = listener_addrs.len(),
            snmp = config.snmp.enabled,
            warnings = warnings.len(),
            "Discovery started"
        );

        Ok(Self {
            registry,
            cancel,
            tasks,
            warnings,
            listener_addrs,
        })
    }

    /// Startup problems that did not stop the engine (e.g. one protocol's
    /// socket was taken).
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The local socket addresses the listeners actually bound.
    pub fn listener_addrs(&self) -> &[(ListenerProtocol, SocketAddr)] {
        &self.listener_addrs
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    /// Subscribe to device change events; the boundary the UI consumes.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.registry.subscribe()
    }

    /// An immutable copy of the current device set.
    pub fn snapshot(&self) -> Vec<Device> {
        self.registry.snapshot()
    }

    /// Cancel every worker and wait for clean shutdown. Consumes the
    /// engine; sockets are guaranteed released when this returns.
    pub async fn stop(mut self) {
        debug!("Stopping discovery");
        self.cancel.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        info!("Discovery stopped");
    }
}

/// Apply observations strictly in arrival order.
async fn drain(mut intake: mpsc::Receiver<Observation>, registry: Arc<DeviceRegistry>) {
    while let Some(obs) = intake.recv().await {
        registry.ingest(obs);
    }
    debug!("Intake drained");
}
