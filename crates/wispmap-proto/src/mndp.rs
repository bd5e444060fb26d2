//! MNDP (Mikrotik Neighbor Discovery Protocol) codec
//!
//! RouterOS devices broadcast on UDP 5678: a 4-byte header (flags and
//! sequence number) followed by TLV entries with 2-byte little-endian type
//! and length fields. Mimosa radios announce over the same channel; the
//! platform/board strings identify them, and those observations are tagged
//! [`Protocol::Mimosa`] so they keep their own precedence slot.

use std::net::{IpAddr, Ipv4Addr};

use wispmap_core::{InterfaceReport, MacAddr, Observation, Protocol};

use crate::FrameError;

/// UDP port MNDP announcements arrive on.
pub const MNDP_PORT: u16 = 5678;

const TLV_MAC: u16 = 0x0001;
const TLV_IDENTITY: u16 = 0x0005;
const TLV_VERSION: u16 = 0x0007;
const TLV_PLATFORM: u16 = 0x0008;
const TLV_UPTIME: u16 = 0x000A;
const TLV_SOFTWARE_ID: u16 = 0x000B;
const TLV_BOARD: u16 = 0x000E;
const TLV_INTERFACE: u16 = 0x0011;
const TLV_IPV4: u16 = 0x0014;

const HEADER_LEN: usize = 4;

/// Decode one neighbor announcement.
pub fn decode(buf: &[u8]) -> Result<Observation, FrameError> {
    if buf.len() < HEADER_LEN {
        return Err(FrameError::TooShort(buf.len()));
    }

    let mut mac: Option<MacAddr> = None;
    let mut ip: Option<IpAddr> = None;
    let mut identity = None;
    let mut version = None;
    let mut platform: Option<String> = None;
    let mut board: Option<String> = None;
    let mut software_id = None;
    let mut uptime_secs = None;
    let mut interface_names: Vec<String> = Vec::new();

    let mut offset = HEADER_LEN;
    while offset + 4 <= buf.len() {
        let tag = u16::from_le_bytes([buf[offset], buf[offset + 1]]);
        let len = u16::from_le_bytes([buf[offset + 2], buf[offset + 3]]) as usize;
        let value_start = offset + 4;
        if value_start + len > buf.len() {
            return Err(FrameError::Truncated {
                tag,
                len,
                offset,
                remaining: buf.len() - value_start,
            });
        }
        let value = &buf[value_start..value_start + len];

        match tag {
            TLV_MAC => {
                if let Some(parsed) = MacAddr::from_bytes(value) {
                    mac.get_or_insert(parsed);
                }
            }
            TLV_IDENTITY => identity = Some(decode_string(value)),
            TLV_VERSION => version = Some(decode_string(value)),
            TLV_PLATFORM => platform = Some(decode_string(value)),
            TLV_BOARD => board = Some(decode_string(value)),
            TLV_SOFTWARE_ID => software_id = Some(decode_string(value)),
            TLV_INTERFACE => interface_names.push(decode_string(value)),
            TLV_UPTIME => {
                if value.len() >= 4 {
                    uptime_secs = Some(u64::from(u32::from_le_bytes([
                        value[0], value[1], value[2], value[3],
                    ])));
                }
            }
            TLV_IPV4 => {
                if value.len() >= 4 {
                    ip = Some(IpAddr::V4(Ipv4Addr::new(
                        value[0], value[1], value[2], value[3],
                    )));
                }
            }
            _ => {}
        }
        offset = value_start + len;
    }

    let mac = mac.ok_or(FrameError::MissingMac)?;
    let protocol = if is_mimosa(platform.as_deref(), board.as_deref()) {
        Protocol::Mimosa
    } else {
        Protocol::Mndp
    };

    let mut obs = Observation::new(protocol, mac);
    obs.ip = ip;
    obs.hostname = identity;
    obs.firmware = version;
    // Board name is the concrete hardware; platform is the OS family
    obs.model = board.or(platform);
    obs.software_id = software_id;
    obs.uptime_secs = uptime_secs;
    obs.interfaces = interface_names
        .into_iter()
        .map(|name| InterfaceReport {
            name: Some(name),
            mac: Some(mac),
            ip,
        })
        .collect();
    Ok(obs)
}

/// Encode an observation as an announcement frame (header zeroed).
pub fn encode(obs: &Observation) -> Vec<u8> {
    let mut out = vec![0u8; HEADER_LEN];

    push_tag(&mut out, TLV_MAC, &obs.mac.octets());
    if let Some(hostname) = &obs.hostname {
        push_tag(&mut out, TLV_IDENTITY, hostname.as_bytes());
    }
    if let Some(firmware) = &obs.firmware {
        push_tag(&mut out, TLV_VERSION, firmware.as_bytes());
    }
    if let Some(model) = &obs.model {
        push_tag(&mut out, TLV_BOARD, model.as_bytes());
    }
    if let Some(uptime) = obs.uptime_secs {
        push_tag(&mut out, TLV_UPTIME, &(uptime as u32).to_le_bytes());
    }
    if let Some(software_id) = &obs.software_id {
        push_tag(&mut out, TLV_SOFTWARE_ID, software_id.as_bytes());
    }
    for report in &obs.interfaces {
        if let Some(name) = &report.name {
            push_tag(&mut out, TLV_INTERFACE, name.as_bytes());
        }
    }
    if let Some(IpAddr::V4(ip)) = obs.ip {
        push_tag(&mut out, TLV_IPV4, &ip.octets());
    }
    out
}

fn push_tag(out: &mut Vec<u8>, tag: u16, value: &[u8]) {
    out.extend_from_slice(&tag.to_le_bytes());
    out.extend_from_slice(&(value.len() as u16).to_le_bytes());
    out.extend_from_slice(value);
}

fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .to_string()
}

fn is_mimosa(platform: Option<&str>, board: Option<&str>) -> bool {
    let combined = format!(
        "{} {}",
        platform.unwrap_or_default(),
        board.unwrap_or_default()
    )
    .to_lowercase();
    combined.contains("mimosa")
}
