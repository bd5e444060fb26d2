//! Ubiquiti discovery protocol codec
//!
//! Ubiquiti devices answer on UDP 10001 with a 4-byte header (version,
//! command, big-endian payload length) followed by TLV entries: 1-byte tag,
//! 2-byte big-endian length, value. Unknown tags are skipped so newer
//! firmware fields pass through harmlessly.

use std::net::{IpAddr, Ipv4Addr};

use wispmap_core::{InterfaceReport, MacAddr, Observation, Protocol};

use crate::FrameError;

/// UDP port Ubiquiti discovery uses.
pub const UBNT_PORT: u16 = 10001;

/// The magic query broadcast that solicits discovery responses.
pub const PROBE_FRAME: [u8; 4] = [0x01, 0x00, 0x00, 0x00];

const TLV_MAC: u8 = 0x01;
const TLV_IP_INFO: u8 = 0x02;
const TLV_FIRMWARE: u8 = 0x03;
const TLV_HOSTNAME: u8 = 0x0B;
const TLV_MODEL_SHORT: u8 = 0x0C;
const TLV_ESSID: u8 = 0x0D;
const TLV_UPTIME: u8 = 0x0E;
const TLV_MODEL_FULL: u8 = 0x14;

const HEADER_LEN: usize = 4;
const MIN_FRAME: usize = 6;

/// Whether a datagram is our own probe query echoed back off the broadcast.
pub fn is_probe(buf: &[u8]) -> bool {
    buf == PROBE_FRAME
}

/// Decode one discovery response frame.
pub fn decode(buf: &[u8]) -> Result<Observation, FrameError> {
    if buf.len() < MIN_FRAME {
        return Err(FrameError::TooShort(buf.len()));
    }
    // Version 1 responses and the v2 variant share the TLV body; the
    // declared payload length in bytes 2..4 is ignored in favor of the
    // actual datagram boundary.
    if !matches!(buf[0], 0x01 | 0x02) || buf[1] != 0x00 {
        return Err(FrameError::BadSignature);
    }

    let mut mac: Option<MacAddr> = None;
    let mut ip: Option<IpAddr> = None;
    let mut hostname = None;
    let mut model = None;
    let mut model_is_full = false;
    let mut firmware = None;
    let mut essid = None;
    let mut uptime_secs = None;
    let mut interfaces = Vec::new();

    let mut offset = HEADER_LEN;
    while offset + 3 <= buf.len() {
        let tag = buf[offset];
        let len = u16::from_be_bytes([buf[offset + 1], buf[offset + 2]]) as usize;
        let value_start = offset + 3;
        if value_start + len > buf.len() {
            return Err(FrameError::Truncated {
                tag: u16::from(tag),
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
            TLV_IP_INFO => {
                // 6 bytes MAC + 4 bytes IPv4, one entry per reporting interface
                if value.len() >= 10 {
                    let if_mac = MacAddr::from_bytes(&value[..6]);
                    let if_ip = IpAddr::V4(Ipv4Addr::new(
                        value[6], value[7], value[8], value[9],
                    ));
                    if let Some(parsed) = if_mac {
                        mac.get_or_insert(parsed);
                    }
                    ip.get_or_insert(if_ip);
                    interfaces.push(InterfaceReport {
                        name: None,
                        mac: if_mac,
                        ip: Some(if_ip),
                    });
                }
            }
            TLV_FIRMWARE => firmware = Some(decode_string(value)),
            TLV_HOSTNAME => hostname = Some(decode_string(value)),
            TLV_MODEL_SHORT => {
                if !model_is_full {
                    model = Some(decode_string(value));
                }
            }
            TLV_MODEL_FULL => {
                model = Some(decode_string(value));
                model_is_full = true;
            }
            TLV_ESSID => essid = Some(decode_string(value)),
            TLV_UPTIME => {
                if value.len() >= 4 {
                    uptime_secs = Some(u64::from(u32::from_be_bytes([
                        value[0], value[1], value[2], value[3],
                    ])));
                }
            }
            _ => {}
        }
        offset = value_start + len;
    }

    let mac = mac.ok_or(FrameError::MissingMac)?;
    let mut obs = Observation::new(Protocol::Ubnt, mac);
    obs.ip = ip;
    obs.hostname = hostname;
    obs.model = model;
    obs.firmware = firmware;
    obs.essid = essid;
    obs.uptime_secs = uptime_secs;
    obs.interfaces = interfaces;
    Ok(obs)
}

/// Encode an observation back into the response frame format. Used by the
/// round-trip tests and to synthesize announcement frames.
pub fn encode(obs: &Observation) -> Vec<u8> {
    let mut out = vec![0x01, 0x00, 0x00, 0x00];

    push_tag(&mut out, TLV_MAC, &obs.mac.octets());

    let mut wrote_ip_info = false;
    for report in &obs.interfaces {
        if let (Some(mac), Some(IpAddr::V4(ip))) = (report.mac, report.ip) {
            let mut value = Vec::with_capacity(10);
            value.extend_from_slice(&mac.octets());
            value.extend_from_slice(&ip.octets());
            push_tag(&mut out, TLV_IP_INFO, &value);
            wrote_ip_info = true;
        }
    }
    if !wrote_ip_info {
        if let Some(IpAddr::V4(ip)) = obs.ip {
            let mut value = Vec::with_capacity(10);
            value.extend_from_slice(&obs.mac.octets());
            value.extend_from_slice(&ip.octets());
            push_tag(&mut out, TLV_IP_INFO, &value);
        }
    }

    if let Some(firmware) = &obs.firmware {
        push_tag(&mut out, TLV_FIRMWARE, firmware.as_bytes());
    }
    if let Some(hostname) = &obs.hostname {
        push_tag(&mut out, TLV_HOSTNAME, hostname.as_bytes());
    }
    if let Some(essid) = &obs.essid {
        push_tag(&mut out, TLV_ESSID, essid.as_bytes());
    }
    if let Some(uptime) = obs.uptime_secs {
        push_tag(&mut out, TLV_UPTIME, &(uptime as u32).to_be_bytes());
    }
    if let Some(model) = &obs.model {
        push_tag(&mut out, TLV_MODEL_FULL, model.as_bytes());
    }

    let payload_len = (out.len() - HEADER_LEN) as u16;
    out[2..4].copy_from_slice(&payload_len.to_be_bytes());
    out
}

fn push_tag(out: &mut Vec<u8>, tag: u8, value: &[u8]) {
    out.push(tag);
    out.extend_from_slice(&(value.len() as u16).to_be_bytes());
    out.extend_from_slice(value);
}

fn decode_string(value: &[u8]) -> String {
    String::from_utf8_lossy(value)
        .trim_end_matches('\0')
        .to_string()
}
