//! Configuration loading and validation

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use tracing::info;

use wispmap_core::{MergePolicy, Protocol, RegistryConfig};
use wispmap_discovery::{DiscoveryConfig, ListenerConfig, ProberConfig, SnmpConfig};

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub listeners: ListenersConfig,
    #[serde(default)]
    pub probe: ProbeConfig,
    #[serde(default)]
    pub snmp: SnmpSection,
    #[serde(default)]
    pub registry: RegistrySection,
    #[serde(default)]
    pub oui: OuiConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log an inventory summary this often; 0 disables it
    #[serde(default = "default_summary_interval")]
    pub summary_interval_secs: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            summary_interval_secs: default_summary_interval(),
        }
    }
}

fn default_summary_interval() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenersConfig {
    /// Local address the listeners bind
    #[serde(default = "default_bind")]
    pub bind: IpAddr,
    #[serde(default = "default_true")]
    pub ubnt: bool,
    #[serde(default = "default_ubnt_port")]
    pub ubnt_port: u16,
    /// Discover-query broadcast interval; 0 disables active probing
    #[serde(default = "default_ubnt_probe_interval")]
    pub ubnt_probe_interval_secs: u64,
    #[serde(default = "default_true")]
    pub mndp: bool,
    #[serde(default = "default_mndp_port")]
    pub mndp_port: u16,
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,
}

impl Default for ListenersConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            ubnt: true,
            ubnt_port: default_ubnt_port(),
            ubnt_probe_interval_secs: default_ubnt_probe_interval(),
            mndp: true,
            mndp_port: default_mndp_port(),
            buffer_size: default_buffer_size(),
        }
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_true() -> bool {
    true
}

fn default_ubnt_port() -> u16 {
    10001
}

fn default_ubnt_probe_interval() -> u64 {
    10
}

fn default_mndp_port() -> u16 {
    5678
}

fn default_buffer_size() -> usize {
    2048
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProbeConfig {
    #[serde(default = "default_probe_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_freshness_window")]
    pub freshness_window_secs: u64,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_probe_interval(),
            timeout_ms: default_probe_timeout(),
            freshness_window_secs: default_freshness_window(),
        }
    }
}

fn default_probe_interval() -> u64 {
    2
}

fn default_probe_timeout() -> u64 {
    1000
}

fn default_freshness_window() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnmpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_community")]
    pub community: String,
    #[serde(default = "default_snmp_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_probe_timeout")]
    pub timeout_ms: u64,
    #[serde(default = "default_snmp_port")]
    pub port: u16,
}

impl Default for SnmpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            community: default_community(),
            interval_secs: default_snmp_interval(),
            timeout_ms: default_probe_timeout(),
            port: default_snmp_port(),
        }
    }
}

fn default_community() -> String {
    "public".to_string()
}

fn default_snmp_interval() -> u64 {
    30
}

fn default_snmp_port() -> u16 {
    161
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySection {
    /// Latency samples kept per device
    #[serde(default = "default_latency_window")]
    pub latency_window: usize,
    /// Consecutive probe misses before a device is marked offline
    #[serde(default = "default_offline_threshold")]
    pub offline_threshold: u32,
    /// Field-merge precedence, richest source first
    #[serde(default = "default_precedence")]
    pub precedence: Vec<Protocol>,
}

impl Default for RegistrySection {
    fn default() -> Self {
        Self {
            latency_window: default_latency_window(),
            offline_threshold: default_offline_threshold(),
            precedence: default_precedence(),
        }
    }
}

fn default_latency_window() -> usize {
    20
}

fn default_offline_threshold() -> u32 {
    3
}

fn default_precedence() -> Vec<Protocol> {
    vec![
        Protocol::Ubnt,
        Protocol::Mndp,
        Protocol::Mimosa,
        Protocol::Snmp,
        Protocol::Icmp,
    ]
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OuiConfig {
    /// Optional JSON overlay with extra prefix-to-vendor entries
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl Config {
    pub fn to_discovery_config(&self) -> DiscoveryConfig {
        let mut listeners = Vec::new();
        if self.listeners.ubnt {
            let mut ubnt = ListenerConfig::ubnt();
            ubnt.bind = self.listeners.bind;
            ubnt.port = self.listeners.ubnt_port;
            ubnt.buffer_size = self.listeners.buffer_size;
            ubnt.probe_interval_secs = match self.listeners.ubnt_probe_interval_secs {
                0 => None,
                secs => Some(secs),
            };
            listeners.push(ubnt);
        }
        if self.listeners.mndp {
            let mut mndp = ListenerConfig::mndp();
            mndp.bind = self.listeners.bind;
            mndp.port = self.listeners.mndp_port;
            mndp.buffer_size = self.listeners.buffer_size;
            listeners.push(mndp);
        }

        DiscoveryConfig {
            listeners,
            probe: ProberConfig {
                interval_secs: self.probe.interval_secs,
                timeout_ms: self.probe.timeout_ms,
                freshness_window_secs: self.probe.freshness_window_secs,
            },
            snmp: SnmpConfig {
                enabled: self.snmp.enabled,
                community: self.snmp.community.clone(),
                interval_secs: self.snmp.interval_secs,
                timeout_ms: self.snmp.timeout_ms,
                port: self.snmp.port,
            },
            ..DiscoveryConfig::default()
        }
    }

    pub fn to_registry_config(&self) -> RegistryConfig {
        RegistryConfig {
            policy: MergePolicy::new(self.registry.precedence.clone()),
            latency_window: self.registry.latency_window,
            offline_threshold: self.registry.offline_threshold,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    } else {
        info!(
            path = %path.display(),
            "Configuration file not found, using defaults"
        );
        Ok(Config::default())
    }
}
