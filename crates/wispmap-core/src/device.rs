//! Device types for tracking discovered network equipment

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A 6-byte MAC address, the canonical device identifier.
///
/// Stable across IP changes; parses the common `:`/`-`/bare-hex notations
/// and displays as `AA:BB:CC:DD:EE:FF`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddr([u8; 6]);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid MAC address: {0:?}")]
pub struct MacParseError(pub String);

impl MacAddr {
    pub fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The organizationally-unique prefix (first three bytes).
    pub fn oui(&self) -> [u8; 3] {
        [self.0[0], self.0[1], self.0[2]]
    }

    /// Parse from a raw byte slice; requires at least 6 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        let octets: [u8; 6] = bytes.get(..6)?.try_into().ok()?;
        Some(Self(octets))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            o[0], o[1], o[2], o[3], o[4], o[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = MacParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let hex: String = s
            .chars()
            .filter(|c| !matches!(c, ':' | '-' | '.'))
            .collect();
        if hex.len() != 12 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(MacParseError(s.to_string()));
        }
        let mut octets = [0u8; 6];
        for (i, octet) in octets.iter_mut().enumerate() {
            *octet = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
                .map_err(|_| MacParseError(s.to_string()))?;
        }
        Ok(Self(octets))
    }
}

impl From<MacAddr> for String {
    fn from(mac: MacAddr) -> Self {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddr {
    type Error = MacParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// Source protocol of an observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// Ubiquiti discovery (UDP 10001)
    Ubnt,
    /// Mikrotik Neighbor Discovery (UDP 5678)
    Mndp,
    /// Mimosa gear announcing over the MNDP-compatible channel
    Mimosa,
    /// Active SNMP system-group polling
    Snmp,
    /// ICMP echo probing only
    Icmp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ubnt => "ubnt",
            Self::Mndp => "mndp",
            Self::Mimosa => "mimosa",
            Self::Snmp => "snmp",
            Self::Icmp => "icmp",
        };
        f.write_str(name)
    }
}

/// A local interface descriptor reported inside a discovery frame.
///
/// Ordered as reported; used by the registry to infer topology edges when
/// an entry references another known device.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InterfaceReport {
    pub name: Option<String>,
    pub mac: Option<MacAddr>,
    pub ip: Option<IpAddr>,
}

/// One decoded discovery frame or poll result.
///
/// Ephemeral: produced by a codec or poller, consumed by
/// [`DeviceRegistry::ingest`](crate::registry::DeviceRegistry::ingest).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub protocol: Protocol,
    pub mac: MacAddr,
    pub ip: Option<IpAddr>,
    pub hostname: Option<String>,
    pub model: Option<String>,
    pub firmware: Option<String>,
    pub uptime_secs: Option<u64>,
    pub essid: Option<String>,
    pub software_id: Option<String>,
    pub interface_count: Option<u32>,
    pub observed_at: DateTime<Utc>,
    pub interfaces: Vec<InterfaceReport>,
}

impl Observation {
    pub fn new(protocol: Protocol, mac: MacAddr) -> Self {
        Self {
            protocol,
            mac,
            ip: None,
            hostname: None,
            model: None,
            firmware: None,
            uptime_secs: None,
            essid: None,
            software_id: None,
            interface_count: None,
            observed_at: Utc::now(),
            interfaces: Vec::new(),
        }
    }
}

/// A merged field value together with the protocol that supplied it.
///
/// The source is what makes the precedence merge deterministic: a
/// lower-precedence protocol fills gaps but never overwrites a value a
/// higher-precedence protocol reported.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attr<T> {
    pub value: T,
    pub source: Protocol,
}

impl<T> Attr<T> {
    pub fn new(value: T, source: Protocol) -> Self {
        Self { value, source }
    }
}

/// Reachability state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Observed or probed successfully within the freshness window
    Online,
    /// Freshness window expired or first probe miss, pending confirmation
    Stale,
    /// Consecutive probe misses exceeded the threshold
    Offline,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Online => "online",
            Self::Stale => "stale",
            Self::Offline => "offline",
        };
        f.write_str(name)
    }
}

/// Outcome of a single latency probe.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum LatencySample {
    Rtt(Duration),
    Timeout,
}

/// Bounded ring of recent probe results, oldest evicted on insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyHistory {
    samples: VecDeque<LatencySample>,
    capacity: usize,
}

impl LatencyHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&mut self, sample: LatencySample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn iter(&self) -> impl Iterator<Item = &LatencySample> {
        self.samples.iter()
    }

    /// Most recent successful round-trip time, if the newest samples hold one.
    pub fn last_rtt(&self) -> Option<Duration> {
        match self.samples.back()? {
            LatencySample::Rtt(rtt) => Some(*rtt),
            LatencySample::Timeout => None,
        }
    }

    /// Mean of the successful samples in the window.
    pub fn average_rtt(&self) -> Option<Duration> {
        let rtts: Vec<Duration> = self
            .samples
            .iter()
            .filter_map(|s| match s {
                LatencySample::Rtt(rtt) => Some(*rtt),
                LatencySample::Timeout => None,
            })
            .collect();
        if rtts.is_empty() {
            return None;
        }
        let total: Duration = rtts.iter().sum();
        Some(total / rtts.len() as u32)
    }

    /// Mean absolute deviation from the average, for trend display.
    pub fn jitter(&self) -> Option<Duration> {
        let avg = self.average_rtt()?;
        let rtts: Vec<Duration> = self
            .samples
            .iter()
            .filter_map(|s| match s {
                LatencySample::Rtt(rtt) => Some(*rtt),
                LatencySample::Timeout => None,
            })
            .collect();
        let total: Duration = rtts
            .iter()
            .map(|rtt| {
                if *rtt > avg {
                    *rtt - avg
                } else {
                    avg - *rtt
                }
            })
            .sum();
        Some(total / rtts.len() as u32)
    }

    /// Fraction of samples in the window that were timeouts.
    pub fn loss_ratio(&self) -> f64 {
        if self.samples.is_empty() {
            return 0.0;
        }
        let lost = self
            .samples
            .iter()
            .filter(|s| matches!(s, LatencySample::Timeout))
            .count();
        lost as f64 / self.samples.len() as f64
    }
}

/// A topology edge: this device references `neighbor` via a local interface.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Link {
    pub neighbor: MacAddr,
    pub via: String,
}

/// A discovered device in the registry.
///
/// Created on the first observation for an unseen MAC, mutated on every
/// subsequent observation or probe, never deleted by the engine itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    /// Canonical identifier (MAC address)
    pub id: MacAddr,
    /// Vendor resolved from the OUI prefix at creation, "Unknown" on miss
    pub vendor: String,
    pub ip: Option<Attr<IpAddr>>,
    pub hostname: Option<Attr<String>>,
    pub model: Option<Attr<String>>,
    pub firmware: Option<Attr<String>>,
    pub uptime_secs: Option<Attr<u64>>,
    pub essid: Option<Attr<String>>,
    pub software_id: Option<Attr<String>>,
    pub interface_count: Option<Attr<u32>>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub state: DeviceState,
    /// Probe misses since the last successful reply
    pub consecutive_misses: u32,
    pub latency: LatencyHistory,
    /// Latest raw interface descriptors, as reported
    pub interfaces: Vec<InterfaceReport>,
    /// Inferred topology edges
    pub links: BTreeSet<Link>,
}

impl Device {
    pub fn new(id: MacAddr, vendor: String, seen_at: DateTime<Utc>, latency_window: usize) -> Self {
        Self {
            id,
            vendor,
            ip: None,
            hostname: None,
            model: None,
            firmware: None,
            uptime_secs: None,
            essid: None,
            software_id: None,
            interface_count: None,
            first_seen: seen_at,
            last_seen: seen_at,
            state: DeviceState::Online,
            consecutive_misses: 0,
            latency: LatencyHistory::new(latency_window),
            interfaces: Vec::new(),
            links: BTreeSet::new(),
        }
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.ip.as_ref().map(|a| a.value)
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_ref().map(|a| a.value.as_str())
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_ref().map(|a| a.value.as_str())
    }

    pub fn firmware(&self) -> Option<&str> {
        self.firmware.as_ref().map(|a| a.value.as_str())
    }

    /// Hostname if known, otherwise the MAC address.
    pub fn display_name(&self) -> String {
        self.hostname()
            .map(str::to_string)
            .unwrap_or_else(|| self.id.to_string())
    }

    /// Whether the last observation is older than the freshness window.
    pub fn is_stale(&self, window: Duration) -> bool {
        match (Utc::now() - self.last_seen).to_std() {
            Ok(elapsed) => elapsed > window,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mac_parse_formats() {
        let expected = MacAddr::new([0x00, 0x0C, 0x42, 0xAA, 0xBB, 0xCC]);
        assert_eq!("00:0C:42:AA:BB:CC".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("00-0c-42-aa-bb-cc".parse::<MacAddr>().unwrap(), expected);
        assert_eq!("000c42aabbcc".parse::<MacAddr>().unwrap(), expected);
        assert!("00:0C:42".parse::<MacAddr>().is_err());
        assert!("zz:0C:42:AA:BB:CC".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_mac_display_roundtrip() {
        let mac = MacAddr::new([0xDC, 0x9F, 0xDB, 0x01, 0x02, 0x03]);
        assert_eq!(mac.to_string(), "DC:9F:DB:01:02:03");
        assert_eq!(mac.to_string().parse::<MacAddr>().unwrap(), mac);
    }

    #[test]
    fn test_mac_oui_prefix() {
        let mac = MacAddr::new([0x00, 0x15, 0x6D, 0x11, 0x22, 0x33]);
        assert_eq!(mac.oui(), [0x00, 0x15, 0x6D]);
    }

    #[test]
    fn test_latency_history_eviction() {
        let mut history = LatencyHistory::new(3);
        for ms in [1, 2, 3, 4, 5] {
            history.push(LatencySample::Rtt(Duration::from_millis(ms)));
        }
        assert_eq!(history.len(), 3);
        // Oldest-first eviction: 1 and 2 are gone
        let remaining: Vec<_> = history.iter().copied().collect();
        assert_eq!(
            remaining,
            vec![
                LatencySample::Rtt(Duration::from_millis(3)),
                LatencySample::Rtt(Duration::from_millis(4)),
                LatencySample::Rtt(Duration::from_millis(5)),
            ]
        );
    }

    #[test]
    fn test_latency_stats() {
        let mut history = LatencyHistory::new(10);
        history.push(LatencySample::Rtt(Duration::from_millis(10)));
        history.push(LatencySample::Rtt(Duration::from_millis(30)));
        history.push(LatencySample::Timeout);
        assert_eq!(history.average_rtt(), Some(Duration::from_millis(20)));
        assert_eq!(history.last_rtt(), None);
        assert!((history.loss_ratio() - 1.0 / 3.0).abs() < 1e-9);
        // |10-20| + |30-20| over 2 samples = 10ms
        assert_eq!(history.jitter(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_empty_history() {
        let history = LatencyHistory::new(5);
        assert!(history.is_empty());
        assert_eq!(history.average_rtt(), None);
        assert_eq!(history.loss_ratio(), 0.0);
    }
}
