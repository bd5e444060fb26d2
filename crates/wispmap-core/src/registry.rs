//! Device registry: the merge authority for all discovery sources
//!
//! Listeners and pollers feed [`Observation`]s in, the prober feeds latency
//! samples in, and subscribers get a stream of [`DeviceEvent`]s out. All
//! mutation happens under one lock so concurrent sources never interleave
//! on the same device; critical sections are short and never held across
//! an await point.

use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, trace};

use crate::device::{
    Attr, Device, DeviceState, LatencySample, Link, MacAddr, Observation, Protocol,
};
use crate::oui::OuiDb;

const EVENT_CHANNEL_SIZE: usize = 256;

/// Ordered protocol precedence for field merging.
///
/// Earlier protocols carry richer truth: a field reported by a protocol
/// later in the order never overwrites one reported earlier, it only fills
/// gaps. The order is policy, not a constant; deployments can reorder it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergePolicy {
    order: Vec<Protocol>,
}

impl Default for MergePolicy {
    fn default() -> Self {
        Self::new(vec![
            Protocol::Ubnt,
            Protocol::Mndp,
            Protocol::Mimosa,
            Protocol::Snmp,
            Protocol::Icmp,
        ])
    }
}

impl MergePolicy {
    /// Build a policy from an ordered list. Duplicates are ignored and any
    /// protocol missing from the list is appended at the end, so every
    /// protocol always has a rank.
    pub fn new(order: Vec<Protocol>) -> Self {
        let mut seen = Vec::with_capacity(5);
        for p in order {
            if !seen.contains(&p) {
                seen.push(p);
            }
        }
        for p in [
            Protocol::Ubnt,
            Protocol::Mndp,
            Protocol::Mimosa,
            Protocol::Snmp,
            Protocol::Icmp,
        ] {
            if !seen.contains(&p) {
                seen.push(p);
            }
        }
        Self { order: seen }
    }

    fn rank(&self, protocol: Protocol) -> usize {
        self.order
            .iter()
            .position(|p| *p == protocol)
            .unwrap_or(self.order.len())
    }

    /// Whether `incoming` may replace a value supplied by `current`.
    fn replaces(&self, incoming: Protocol, current: Protocol) -> bool {
        self.rank(incoming) <= self.rank(current)
    }
}

/// Registry tuning knobs.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub policy: MergePolicy,
    /// Latency ring capacity per device
    pub latency_window: usize,
    /// Consecutive probe misses before a device goes offline
    pub offline_threshold: u32,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            policy: MergePolicy::default(),
            latency_window: 20,
            offline_threshold: 3,
        }
    }
}

/// What changed about a device.
#[derive(Debug, Clone, PartialEq)]
pub enum EventKind {
    /// First observation for this MAC
    Discovered,
    /// Merged fields or topology links changed
    Updated,
    StateChanged {
        from: DeviceState,
        to: DeviceState,
    },
    LatencyRecorded,
    /// Explicitly removed
    Removed,
}

/// A change notification delivered to subscribers in emission order.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceEvent {
    pub mac: MacAddr,
    pub kind: EventKind,
}

/// The central device store.
pub struct DeviceRegistry {
    devices: Mutex<HashMap<MacAddr, Device>>,
    events: broadcast::Sender<DeviceEvent>,
    oui: Arc<OuiDb>,
    config: RegistryConfig,
}

impl DeviceRegistry {
    pub fn new(oui: Arc<OuiDb>, config: RegistryConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);
        Self {
            devices: Mutex::new(HashMap::new()),
            events,
            oui,
            config,
        }
    }

    /// Subscribe to change events. Dropping the receiver unsubscribes; a
    /// receiver that falls behind loses the oldest events.
    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    /// Merge an observation into the device set, creating the device on
    /// first sight of its MAC.
    pub fn ingest(&self, obs: Observation) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");

        let mac = obs.mac;
        let mut created = false;
        let mut changed = false;
        {
            // Keyed entry under the lock: a second device for the same MAC
            // is unrepresentable, duplicates always merge.
            let device = devices.entry(mac).or_insert_with(|| {
                created = true;
                let vendor = self.oui.resolve(&mac).to_string();
                Device::new(mac, vendor, obs.observed_at, self.config.latency_window)
            });
            changed |= merge_observation(device, &obs, &self.config.policy);

            if obs.observed_at > device.last_seen {
                device.last_seen = obs.observed_at;
            }
            if device.consecutive_misses != 0 {
                device.consecutive_misses = 0;
            }
            if device.state != DeviceState::Online {
                let from = device.state;
                device.state = DeviceState::Online;
                let _ = self.events.send(DeviceEvent {
                    mac,
                    kind: EventKind::StateChanged {
                        from,
                        to: DeviceState::Online,
                    },
                });
            }
            if !obs.interfaces.is_empty() && device.interfaces != obs.interfaces {
                device.interfaces = obs.interfaces.clone();
                changed = true;
            }
        }

        // A new device or new interface list can complete edges anywhere in
        // the graph, so links are recomputed for the whole set.
        let link_changes = recompute_links(&mut devices);
        drop(devices);

        if created {
            info!(mac = %mac, protocol = %obs.protocol, "New device discovered");
            let _ = self.events.send(DeviceEvent {
                mac,
                kind: EventKind::Discovered,
            });
        } else {
            trace!(mac = %mac, protocol = %obs.protocol, changed, "Observation merged");
            let _ = self.events.send(DeviceEvent {
                mac,
                kind: EventKind::Updated,
            });
        }
        for other in link_changes {
            if other != mac {
                let _ = self.events.send(DeviceEvent {
                    mac: other,
                    kind: EventKind::Updated,
                });
            }
        }
    }

    /// Record a probe outcome and drive the reachability state machine.
    ///
    /// One miss moves an online device to stale; `offline_threshold`
    /// consecutive misses mark it offline; any reply restores online and
    /// resets the counter. Unknown MACs are ignored (the device may have
    /// been removed between snapshot and probe completion).
    pub fn record_latency(&self, mac: MacAddr, sample: LatencySample) {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        let Some(device) = devices.get_mut(&mac) else {
            trace!(mac = %mac, "Latency sample for unknown device dropped");
            return;
        };

        device.latency.push(sample);
        let from = device.state;
        match sample {
            LatencySample::Rtt(rtt) => {
                device.consecutive_misses = 0;
                device.state = DeviceState::Online;
                device.last_seen = chrono::Utc::now();
                trace!(mac = %mac, rtt_ms = rtt.as_millis() as u64, "Probe reply");
            }
            LatencySample::Timeout => {
                device.consecutive_misses = device.consecutive_misses.saturating_add(1);
                device.state = if device.consecutive_misses >= self.config.offline_threshold {
                    DeviceState::Offline
                } else {
                    DeviceState::Stale
                };
                debug!(
                    mac = %mac,
                    misses = device.consecutive_misses,
                    state = %device.state,
                    "Probe timeout"
                );
            }
        }
        let to = device.state;
        drop(devices);

        let _ = self.events.send(DeviceEvent {
            mac,
            kind: EventKind::LatencyRecorded,
        });
        if from != to {
            if to == DeviceState::Offline {
                info!(mac = %mac, "Device went offline");
            }
            let _ = self.events.send(DeviceEvent {
                mac,
                kind: EventKind::StateChanged { from, to },
            });
        }
    }

    /// Move online devices not observed within the freshness window to
    /// stale, pending probe confirmation.
    pub fn expire(&self, window: Duration) {
        let mut expired = Vec::new();
        {
            let mut devices = self.devices.lock().expect("registry lock poisoned");
            for device in devices.values_mut() {
                if device.state == DeviceState::Online && device.is_stale(window) {
                    device.state = DeviceState::Stale;
                    expired.push(device.id);
                }
            }
        }
        for mac in expired {
            debug!(mac = %mac, "Freshness window expired");
            let _ = self.events.send(DeviceEvent {
                mac,
                kind: EventKind::StateChanged {
                    from: DeviceState::Online,
                    to: DeviceState::Stale,
                },
            });
        }
    }

    /// An immutable copy of the device set, ordered by MAC.
    pub fn snapshot(&self) -> Vec<Device> {
        let devices = self.devices.lock().expect("registry lock poisoned");
        let mut list: Vec<Device> = devices.values().cloned().collect();
        list.sort_by_key(|d| d.id);
        list
    }

    pub fn get(&self, mac: &MacAddr) -> Option<Device> {
        self.devices
            .lock()
            .expect("registry lock poisoned")
            .get(mac)
            .cloned()
    }

    /// Explicit manual removal; the engine never deletes devices itself.
    /// Also detaches topology links pointing at the removed device.
    pub fn remove(&self, mac: &MacAddr) -> bool {
        let mut devices = self.devices.lock().expect("registry lock poisoned");
        if devices.remove(mac).is_none() {
            return false;
        }
        for device in devices.values_mut() {
            device.links.retain(|l| l.neighbor != *mac);
        }
        drop(devices);

        info!(mac = %mac, "Device removed from registry");
        let _ = self.events.send(DeviceEvent {
            mac: *mac,
            kind: EventKind::Removed,
        });
        true
    }

    pub fn len(&self) -> usize {
        self.devices.lock().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Per-field precedence merge. Returns whether anything changed.
fn merge_observation(device: &mut Device, obs: &Observation, policy: &MergePolicy) -> bool {
    let src = obs.protocol;
    let mut changed = false;
    changed |= merge_field(&mut device.ip, obs.ip, src, policy);
    changed |= merge_field(&mut device.hostname, obs.hostname.clone(), src, policy);
    changed |= merge_field(&mut device.model, obs.model.clone(), src, policy);
    changed |= merge_field(&mut device.firmware, obs.firmware.clone(), src, policy);
    changed |= merge_field(&mut device.uptime_secs, obs.uptime_secs, src, policy);
    changed |= merge_field(&mut device.essid, obs.essid.clone(), src, policy);
    changed |= merge_field(&mut device.software_id, obs.software_id.clone(), src, policy);
    changed |= merge_field(&mut device.interface_count, obs.interface_count, src, policy);
    changed
}

fn merge_field<T: PartialEq>(
    slot: &mut Option<Attr<T>>,
    incoming: Option<T>,
    source: Protocol,
    policy: &MergePolicy,
) -> bool {
    let Some(value) = incoming else {
        return false;
    };
    match slot {
        Some(current) if !policy.replaces(source, current.source) => false,
        Some(current) if current.value == value && current.source == source => false,
        _ => {
            *slot = Some(Attr::new(value, source));
            true
        }
    }
}

/// Rebuild every device's link set from its latest interface reports.
/// Returns the MACs whose links changed.
fn recompute_links(devices: &mut HashMap<MacAddr, Device>) -> Vec<MacAddr> {
    let ip_index: HashMap<IpAddr, MacAddr> = devices
        .values()
        .filter_map(|d| d.ip().map(|ip| (ip, d.id)))
        .collect();

    let mut updates: Vec<(MacAddr, BTreeSet<Link>)> = Vec::new();
    for device in devices.values() {
        let mut links = BTreeSet::new();
        for (idx, report) in device.interfaces.iter().enumerate() {
            let via = report
                .name
                .clone()
                .unwrap_or_else(|| format!("if{idx}"));
            if let Some(mac) = report.mac {
                if mac != device.id && devices.contains_key(&mac) {
                    links.insert(Link { neighbor: mac, via });
                    continue;
                }
            }
            if let Some(ip) = report.ip {
                if let Some(&neighbor) = ip_index.get(&ip) {
                    if neighbor != device.id {
                        links.insert(Link { neighbor, via });
                    }
                }
            }
        }
        if links != device.links {
            updates.push((device.id, links));
        }
    }

    let mut changed = Vec::with_capacity(updates.len());
    for (mac, links) in updates {
        if let Some(device) = devices.get_mut(&mac) {
            device.links = links;
            changed.push(mac);
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::InterfaceReport;
    use std::net::Ipv4Addr;

    fn registry() -> DeviceRegistry {
        DeviceRegistry::new(Arc::new(OuiDb::builtin()), RegistryConfig::default())
    }

    fn mac(s: &str) -> MacAddr {
        s.parse().unwrap()
    }

    fn obs(protocol: Protocol, mac: MacAddr) -> Observation {
        Observation::new(protocol, mac)
    }

    #[test]
    fn test_mndp_scenario_resolves_mikrotik() {
        let reg = registry();
        let mut o = obs(Protocol::Mndp, mac("00:0C:42:AA:BB:CC"));
        o.hostname = Some("core-switch-1".to_string());
        o.ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        reg.ingest(o);

        assert_eq!(reg.len(), 1);
        let device = reg.get(&mac("00:0C:42:AA:BB:CC")).unwrap();
        assert_eq!(device.vendor, "Mikrotik");
        assert_eq!(device.hostname(), Some("core-switch-1"));
        assert_eq!(device.ip(), Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1))));
        assert_eq!(device.state, DeviceState::Online);
    }

    #[test]
    fn test_creation_is_idempotent() {
        let reg = registry();
        let m = mac("DC:9F:DB:00:00:01");
        for _ in 0..5 {
            reg.ingest(obs(Protocol::Ubnt, m));
        }
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_lower_precedence_fills_gaps_but_never_overwrites() {
        let reg = registry();
        let m = mac("00:0C:42:00:00:01");

        let mut mndp = obs(Protocol::Mndp, m);
        mndp.model = Some("RB3011".to_string());
        reg.ingest(mndp);

        let mut snmp = obs(Protocol::Snmp, m);
        snmp.hostname = Some("sw01".to_string());
        snmp.model = Some("generic sysDescr".to_string());
        reg.ingest(snmp);

        let device = reg.get(&m).unwrap();
        // MNDP outranks SNMP for model; SNMP supplied a field MNDP did not
        assert_eq!(device.model(), Some("RB3011"));
        assert_eq!(device.hostname(), Some("sw01"));
        assert_eq!(device.hostname.as_ref().unwrap().source, Protocol::Snmp);
    }

    #[test]
    fn test_merge_is_order_independent() {
        let m = mac("DC:9F:DB:00:00:02");

        let mut ubnt = obs(Protocol::Ubnt, m);
        ubnt.model = Some("LiteBeam".to_string());
        let mut mndp = obs(Protocol::Mndp, m);
        mndp.model = Some("RB3011".to_string());
        mndp.hostname = Some("rb".to_string());
        let mut snmp = obs(Protocol::Snmp, m);
        snmp.hostname = Some("sw01".to_string());
        snmp.firmware = Some("6.48".to_string());

        let observations = [ubnt, mndp, snmp];
        let orders: &[[usize; 3]] = &[
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];

        let mut outcomes = Vec::new();
        for order in orders {
            let reg = registry();
            for &i in order {
                reg.ingest(observations[i].clone());
            }
            let device = reg.get(&m).unwrap();
            outcomes.push((
                device.model().map(str::to_string),
                device.hostname().map(str::to_string),
                device.firmware().map(str::to_string),
            ));
        }

        for outcome in &outcomes {
            assert_eq!(outcome.0.as_deref(), Some("LiteBeam"));
            assert_eq!(outcome.1.as_deref(), Some("rb"));
            assert_eq!(outcome.2.as_deref(), Some("6.48"));
        }
    }

    #[test]
    fn test_same_protocol_updates_take_latest() {
        let reg = registry();
        let m = mac("00:0C:42:00:00:02");

        let mut first = obs(Protocol::Mndp, m);
        first.hostname = Some("old-name".to_string());
        reg.ingest(first);

        let mut second = obs(Protocol::Mndp, m);
        second.hostname = Some("new-name".to_string());
        reg.ingest(second);

        assert_eq!(reg.get(&m).unwrap().hostname(), Some("new-name"));
    }

    #[test]
    fn test_state_machine_miss_miss_miss_then_hit() {
        let reg = registry();
        let m = mac("00:0C:42:00:00:03");
        reg.ingest(obs(Protocol::Mndp, m));
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Online);

        reg.record_latency(m, LatencySample::Timeout);
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Stale);

        reg.record_latency(m, LatencySample::Timeout);
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Stale);

        reg.record_latency(m, LatencySample::Timeout);
        let device = reg.get(&m).unwrap();
        assert_eq!(device.state, DeviceState::Offline);
        assert_eq!(device.consecutive_misses, 3);

        reg.record_latency(m, LatencySample::Rtt(Duration::from_millis(4)));
        let device = reg.get(&m).unwrap();
        assert_eq!(device.state, DeviceState::Online);
        assert_eq!(device.consecutive_misses, 0);
    }

    #[test]
    fn test_latency_ring_stays_bounded() {
        let config = RegistryConfig {
            latency_window: 4,
            ..RegistryConfig::default()
        };
        let reg = DeviceRegistry::new(Arc::new(OuiDb::builtin()), config);
        let m = mac("00:0C:42:00:00:04");
        reg.ingest(obs(Protocol::Mndp, m));

        for ms in 0..50u64 {
            reg.record_latency(m, LatencySample::Rtt(Duration::from_millis(ms)));
        }
        let device = reg.get(&m).unwrap();
        assert_eq!(device.latency.len(), 4);
        assert_eq!(device.latency.last_rtt(), Some(Duration::from_millis(49)));
    }

    #[test]
    fn test_latency_for_unknown_mac_is_ignored() {
        let reg = registry();
        reg.record_latency(mac("00:00:00:00:00:99"), LatencySample::Timeout);
        assert!(reg.is_empty());
    }

    #[test]
    fn test_reannouncement_restores_online() {
        let reg = registry();
        let m = mac("00:0C:42:00:00:05");
        reg.ingest(obs(Protocol::Mndp, m));
        for _ in 0..3 {
            reg.record_latency(m, LatencySample::Timeout);
        }
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Offline);

        reg.ingest(obs(Protocol::Mndp, m));
        let device = reg.get(&m).unwrap();
        assert_eq!(device.state, DeviceState::Online);
        assert_eq!(device.consecutive_misses, 0);
    }

    #[test]
    fn test_expire_moves_online_to_stale() {
        let reg = registry();
        let m = mac("00:0C:42:00:00:06");
        let mut o = obs(Protocol::Mndp, m);
        o.observed_at = chrono::Utc::now() - chrono::Duration::seconds(120);
        reg.ingest(o);

        reg.expire(Duration::from_secs(60));
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Stale);

        // Offline devices are not touched by the freshness sweep
        for _ in 0..3 {
            reg.record_latency(m, LatencySample::Timeout);
        }
        reg.expire(Duration::from_secs(60));
        assert_eq!(reg.get(&m).unwrap().state, DeviceState::Offline);
    }

    #[test]
    fn test_links_inferred_from_interface_reports() {
        let reg = registry();
        let switch = mac("00:0C:42:00:00:10");
        let ap = mac("DC:9F:DB:00:00:11");
        let ap_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2));

        let mut ap_obs = obs(Protocol::Ubnt, ap);
        ap_obs.ip = Some(ap_ip);
        reg.ingest(ap_obs);

        let mut switch_obs = obs(Protocol::Mndp, switch);
        switch_obs.ip = Some(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        switch_obs.interfaces = vec![InterfaceReport {
            name: Some("ether2".to_string()),
            mac: Some(ap),
            ip: None,
        }];
        reg.ingest(switch_obs);

        let device = reg.get(&switch).unwrap();
        assert_eq!(device.links.len(), 1);
        let link = device.links.iter().next().unwrap();
        assert_eq!(link.neighbor, ap);
        assert_eq!(link.via, "ether2");
    }

    #[test]
    fn test_links_complete_when_neighbor_appears_later() {
        let reg = registry();
        let switch = mac("00:0C:42:00:00:12");
        let ap = mac("DC:9F:DB:00:00:13");
        let ap_ip = IpAddr::V4(Ipv4Addr::new(10, 0, 1, 2));

        // Switch references the AP's IP before the AP is known
        let mut switch_obs = obs(Protocol::Mndp, switch);
        switch_obs.interfaces = vec![InterfaceReport {
            name: Some("wlan1".to_string()),
            mac: None,
            ip: Some(ap_ip),
        }];
        reg.ingest(switch_obs);
        assert!(reg.get(&switch).unwrap().links.is_empty());

        let mut ap_obs = obs(Protocol::Ubnt, ap);
        ap_obs.ip = Some(ap_ip);
        reg.ingest(ap_obs);

        let device = reg.get(&switch).unwrap();
        assert_eq!(device.links.len(), 1);
        assert_eq!(device.links.iter().next().unwrap().neighbor, ap);
    }

    #[test]
    fn test_remove_detaches_reverse_links() {
        let reg = registry();
        let a = mac("00:0C:42:00:00:14");
        let b = mac("DC:9F:DB:00:00:15");

        reg.ingest(obs(Protocol::Ubnt, b));
        let mut a_obs = obs(Protocol::Mndp, a);
        a_obs.interfaces = vec![InterfaceReport {
            name: Some("ether1".to_string()),
            mac: Some(b),
            ip: None,
        }];
        reg.ingest(a_obs);
        assert_eq!(reg.get(&a).unwrap().links.len(), 1);

        assert!(reg.remove(&b));
        assert!(!reg.remove(&b));
        assert!(reg.get(&a).unwrap().links.is_empty());
        assert_eq!(reg.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered_and_detached() {
        let reg = registry();
        reg.ingest(obs(Protocol::Mndp, mac("CC:2D:E0:00:00:02")));
        reg.ingest(obs(Protocol::Mndp, mac("00:0C:42:00:00:01")));

        let snapshot = reg.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert!(snapshot[0].id < snapshot[1].id);

        // Mutating the registry does not affect the copy
        reg.remove(&snapshot[0].id);
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn test_event_sequence() {
        let reg = registry();
        let mut events = reg.subscribe();
        let m = mac("00:0C:42:00:00:20");

        reg.ingest(obs(Protocol::Mndp, m));
        reg.record_latency(m, LatencySample::Timeout);

        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent {
                mac: m,
                kind: EventKind::Discovered
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent {
                mac: m,
                kind: EventKind::LatencyRecorded
            }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            DeviceEvent {
                mac: m,
                kind: EventKind::StateChanged {
                    from: DeviceState::Online,
                    to: DeviceState::Stale
                }
            }
        );
    }
}
