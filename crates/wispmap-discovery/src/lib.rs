//! Wispmap Discovery - Protocol listeners, latency probing, and lifecycle
//!
//! This crate runs the concurrent side of the engine:
//! - UDP listeners for UBNT and MNDP/Mimosa discovery broadcasts
//! - An SNMP poller that enriches known devices
//! - An ICMP latency prober driving the reachability state machine
//! - The orchestrator that owns all of their lifecycles

pub mod listener;
pub mod orchestrator;
pub mod prober;
pub mod snmp_poll;

use std::net::SocketAddr;
use thiserror::Error;

pub use listener::{ListenerConfig, ListenerProtocol};
pub use orchestrator::{Discovery, DiscoveryConfig};
pub use prober::ProberConfig;
pub use snmp_poll::SnmpConfig;

#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// A listener could not acquire its socket; fatal to that listener
    /// only, the orchestrator reports it as a warning.
    #[error("failed to bind {protocol} listener on {addr}: {source}")]
    Bind {
        protocol: ListenerProtocol,
        addr: SocketAddr,
        source: std::io::Error,
    },
    /// Every configured intake source failed to start.
    #[error("no discovery source could be started")]
    NothingStarted,
}
