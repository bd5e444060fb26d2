//! Minimal SNMP v2c client codec
//!
//! Just enough BER to issue a GetRequest for the basic system group and
//! decode the GetResponse varbinds. The engine polls four OIDs: sysDescr,
//! sysUpTime, sysName, and ifNumber. Anything beyond GET/RESPONSE is out
//! of scope.

use std::net::IpAddr;

use wispmap_core::{MacAddr, Observation, Protocol};

use crate::FrameError;

/// UDP port SNMP agents listen on.
pub const SNMP_PORT: u16 = 161;

pub const OID_SYS_DESCR: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 1, 0];
pub const OID_SYS_UPTIME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 3, 0];
pub const OID_SYS_NAME: &[u32] = &[1, 3, 6, 1, 2, 1, 1, 5, 0];
pub const OID_IF_NUMBER: &[u32] = &[1, 3, 6, 1, 2, 1, 2, 1, 0];

/// The fixed OID set one poll queries.
pub const POLL_OIDS: &[&[u32]] = &[OID_SYS_DESCR, OID_SYS_UPTIME, OID_SYS_NAME, OID_IF_NUMBER];

const TAG_INTEGER: u8 = 0x02;
const TAG_OCTET_STRING: u8 = 0x04;
const TAG_NULL: u8 = 0x05;
const TAG_OID: u8 = 0x06;
const TAG_SEQUENCE: u8 = 0x30;
const TAG_COUNTER32: u8 = 0x41;
const TAG_GAUGE32: u8 = 0x42;
const TAG_TIMETICKS: u8 = 0x43;
const TAG_GET_REQUEST: u8 = 0xA0;
const TAG_GET_RESPONSE: u8 = 0xA2;

const VERSION_2C: i64 = 1;

/// One decoded variable binding.
#[derive(Debug, Clone, PartialEq)]
pub struct VarBind {
    pub oid: Vec<u32>,
    pub value: SnmpValue,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SnmpValue {
    Integer(i64),
    OctetString(Vec<u8>),
    TimeTicks(u32),
    Counter(u32),
    Oid(Vec<u32>),
    Null,
    /// A tag this codec does not interpret (noSuchObject and friends)
    Unsupported(u8),
}

impl SnmpValue {
    fn as_str(&self) -> Option<String> {
        match self {
            Self::OctetString(bytes) => Some(
                String::from_utf8_lossy(bytes)
                    .trim_end_matches('\0')
                    .to_string(),
            ),
            _ => None,
        }
    }
}

/// Encode a GetRequest PDU for the given OIDs.
pub fn encode_get_request(community: &str, request_id: i32, oids: &[&[u32]]) -> Vec<u8> {
    let mut varbinds = Vec::new();
    for oid in oids {
        let mut inner = Vec::new();
        push_tlv(&mut inner, TAG_OID, &encode_oid(oid));
        push_tlv(&mut inner, TAG_NULL, &[]);
        push_tlv(&mut varbinds, TAG_SEQUENCE, &inner);
    }

    let mut pdu = Vec::new();
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(i64::from(request_id)));
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(0)); // error-status
    push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(0)); // error-index
    push_tlv(&mut pdu, TAG_SEQUENCE, &varbinds);

    let mut message = Vec::new();
    push_tlv(&mut message, TAG_INTEGER, &encode_integer(VERSION_2C));
    push_tlv(&mut message, TAG_OCTET_STRING, community.as_bytes());
    push_tlv(&mut message, TAG_GET_REQUEST, &pdu);

    let mut out = Vec::with_capacity(message.len() + 4);
    push_tlv(&mut out, TAG_SEQUENCE, &message);
    out
}

/// Decode a GetResponse, checking the echoed request id and error status.
pub fn decode_response(buf: &[u8], sent_request_id: i32) -> Result<Vec<VarBind>, FrameError> {
    let mut outer = Reader::new(buf);
    let mut message = Reader::new(outer.read_expected(TAG_SEQUENCE)?);

    let version = message.read_integer()?;
    if version != VERSION_2C {
        return Err(FrameError::Ber("unexpected SNMP version"));
    }
    let _community = message.read_expected(TAG_OCTET_STRING)?;

    let mut pdu = Reader::new(message.read_expected(TAG_GET_RESPONSE)?);
    let request_id = pdu.read_integer()?;
    if request_id != i64::from(sent_request_id) {
        return Err(FrameError::RequestIdMismatch {
            sent: sent_request_id,
            got: request_id as i32,
        });
    }
    let error_status = pdu.read_integer()?;
    let error_index = pdu.read_integer()?;
    if error_status != 0 {
        return Err(FrameError::ErrorStatus {
            status: error_status,
            index: error_index,
        });
    }

    let mut varbind_list = Reader::new(pdu.read_expected(TAG_SEQUENCE)?);
    let mut binds = Vec::new();
    while !varbind_list.is_empty() {
        let mut varbind = Reader::new(varbind_list.read_expected(TAG_SEQUENCE)?);
        let oid = decode_oid(varbind.read_expected(TAG_OID)?)?;
        let (tag, content) = varbind.read_tlv()?;
        let value = match tag {
            TAG_INTEGER => SnmpValue::Integer(decode_integer(content)?),
            TAG_OCTET_STRING => SnmpValue::OctetString(content.to_vec()),
            TAG_NULL => SnmpValue::Null,
            TAG_OID => SnmpValue::Oid(decode_oid(content)?),
            TAG_TIMETICKS => SnmpValue::TimeTicks(decode_integer(content)? as u32),
            TAG_COUNTER32 | TAG_GAUGE32 => SnmpValue::Counter(decode_integer(content)? as u32),
            other => SnmpValue::Unsupported(other),
        };
        binds.push(VarBind { oid, value });
    }
    Ok(binds)
}

/// Shape a poll result into the common observation type. The MAC comes from
/// the registry entry being polled; a GetResponse does not carry one.
pub fn observation_from_varbinds(mac: MacAddr, ip: IpAddr, binds: &[VarBind]) -> Observation {
    let mut obs = Observation::new(Protocol::Snmp, mac);
    obs.ip = Some(ip);
    for bind in binds {
        if bind.oid == OID_SYS_NAME {
            obs.hostname = bind.value.as_str().filter(|s| !s.is_empty());
        } else if bind.oid == OID_SYS_DESCR {
            obs.model = bind.value.as_str().filter(|s| !s.is_empty());
        } else if bind.oid == OID_SYS_UPTIME {
            if let SnmpValue::TimeTicks(ticks) = &bind.value {
                // TimeTicks are hundredths of a second
                obs.uptime_secs = Some(u64::from(*ticks) / 100);
            }
        } else if bind.oid == OID_IF_NUMBER {
            if let SnmpValue::Integer(n) = &bind.value {
                if *n >= 0 {
                    obs.interface_count = Some(*n as u32);
                }
            }
        }
    }
    obs
}

// ── BER primitives ──────────────────────────────────────────────────

fn push_tlv(out: &mut Vec<u8>, tag: u8, content: &[u8]) {
    out.push(tag);
    push_len(out, content.len());
    out.extend_from_slice(content);
}

fn push_len(out: &mut Vec<u8>, len: usize) {
    if len < 0x80 {
        out.push(len as u8);
    } else {
        let bytes = len.to_be_bytes();
        let skip = bytes.iter().take_while(|b| **b == 0).count();
        let significant = &bytes[skip..];
        out.push(0x80 | significant.len() as u8);
        out.extend_from_slice(significant);
    }
}

fn encode_integer(value: i64) -> Vec<u8> {
    let bytes = value.to_be_bytes();
    let mut start = 0;
    // Strip redundant leading bytes while keeping the sign bit intact
    while start < 7
        && ((bytes[start] == 0x00 && bytes[start + 1] & 0x80 == 0)
            || (bytes[start] == 0xFF && bytes[start + 1] & 0x80 != 0))
    {
        start += 1;
    }
    bytes[start..].to_vec()
}

fn decode_integer(content: &[u8]) -> Result<i64, FrameError> {
    if content.is_empty() || content.len() > 8 {
        return Err(FrameError::Ber("bad integer length"));
    }
    let mut value: i64 = if content[0] & 0x80 != 0 { -1 } else { 0 };
    for byte in content {
        value = (value << 8) | i64::from(*byte);
    }
    Ok(value)
}

fn encode_oid(oid: &[u32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(oid.len() + 1);
    if oid.len() >= 2 {
        out.push((oid[0] * 40 + oid[1]) as u8);
        for component in &oid[2..] {
            push_base128(&mut out, *component);
        }
    }
    out
}

fn decode_oid(content: &[u8]) -> Result<Vec<u32>, FrameError> {
    if content.is_empty() {
        return Err(FrameError::Ber("empty OID"));
    }
    let mut oid = vec![u32::from(content[0]) / 40, u32::from(content[0]) % 40];
    let mut component: u32 = 0;
    for byte in &content[1..] {
        component = (component << 7) | u32::from(byte & 0x7F);
        if byte & 0x80 == 0 {
            oid.push(component);
            component = 0;
        }
    }
    Ok(oid)
}

fn push_base128(out: &mut Vec<u8>, value: u32) {
    let mut chunks = [0u8; 5];
    let mut n = 0;
    let mut v = value;
    loop {
        chunks[n] = (v & 0x7F) as u8;
        n += 1;
        v >>= 7;
        if v == 0 {
            break;
        }
    }
    for i in (0..n).rev() {
        let continuation = if i == 0 { 0 } else { 0x80 };
        out.push(chunks[i] | continuation);
    }
}

/// Cursor over a BER buffer.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    fn read_tlv(&mut self) -> Result<(u8, &'a [u8]), FrameError> {
        let tag = *self
            .buf
            .get(self.pos)
            .ok_or(FrameError::Ber("unexpected end of buffer"))?;
        self.pos += 1;
        let len = self.read_len()?;
        let start = self.pos;
        let end = start
            .checked_add(len)
            .ok_or(FrameError::Ber("length overflow"))?;
        if end > self.buf.len() {
            return Err(FrameError::Ber("content runs past end of buffer"));
        }
        self.pos = end;
        Ok((tag, &self.buf[start..end]))
    }

    fn read_expected(&mut self, expected: u8) -> Result<&'a [u8], FrameError> {
        let (tag, content) = self.read_tlv()?;
        if tag != expected {
            return Err(FrameError::Ber("unexpected tag"));
        }
        Ok(content)
    }

    fn read_integer(&mut self) -> Result<i64, FrameError> {
        decode_integer(self.read_expected(TAG_INTEGER)?)
    }

    fn read_len(&mut self) -> Result<usize, FrameError> {
        let first = *self
            .buf
            .get(self.pos)
            .ok_or(FrameError::Ber("unexpected end of buffer"))?;
        self.pos += 1;
        if first & 0x80 == 0 {
            return Ok(first as usize);
        }
        let count = (first & 0x7F) as usize;
        if count == 0 || count > 4 {
            return Err(FrameError::Ber("unsupported length form"));
        }
        let mut len: usize = 0;
        for _ in 0..count {
            let byte = *self
                .buf
                .get(self.pos)
                .ok_or(FrameError::Ber("unexpected end of buffer"))?;
            self.pos += 1;
            len = (len << 8) | byte as usize;
        }
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a GetResponse the way an agent would, using the same BER
    /// primitives the encoder uses.
    fn encode_get_response(
        community: &str,
        request_id: i32,
        error_status: i64,
        binds: &[(&[u32], &SnmpValue)],
    ) -> Vec<u8> {
        let mut varbinds = Vec::new();
        for (oid, value) in binds {
            let mut inner = Vec::new();
            push_tlv(&mut inner, TAG_OID, &encode_oid(oid));
            match value {
                SnmpValue::Integer(v) => push_tlv(&mut inner, TAG_INTEGER, &encode_integer(*v)),
                SnmpValue::OctetString(bytes) => push_tlv(&mut inner, TAG_OCTET_STRING, bytes),
                SnmpValue::TimeTicks(v) => {
                    push_tlv(&mut inner, TAG_TIMETICKS, &encode_integer(i64::from(*v)))
                }
                SnmpValue::Counter(v) => {
                    push_tlv(&mut inner, TAG_COUNTER32, &encode_integer(i64::from(*v)))
                }
                SnmpValue::Oid(oid) => push_tlv(&mut inner, TAG_OID, &encode_oid(oid)),
                SnmpValue::Null => push_tlv(&mut inner, TAG_NULL, &[]),
                SnmpValue::Unsupported(tag) => push_tlv(&mut inner, *tag, &[]),
            }
            push_tlv(&mut varbinds, TAG_SEQUENCE, &inner);
        }

        let mut pdu = Vec::new();
        push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(i64::from(request_id)));
        push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(error_status));
        push_tlv(&mut pdu, TAG_INTEGER, &encode_integer(0));
        push_tlv(&mut pdu, TAG_SEQUENCE, &varbinds);

        let mut message = Vec::new();
        push_tlv(&mut message, TAG_INTEGER, &encode_integer(VERSION_2C));
        push_tlv(&mut message, TAG_OCTET_STRING, community.as_bytes());
        push_tlv(&mut message, TAG_GET_RESPONSE, &pdu);

        let mut out = Vec::new();
        push_tlv(&mut out, TAG_SEQUENCE, &message);
        out
    }

    #[test]
    fn test_get_request_golden_bytes() {
        let frame = encode_get_request("public", 1, &[OID_SYS_NAME]);
        let expected: Vec<u8> = vec![
            0x30, 0x26, // message SEQUENCE
            0x02, 0x01, 0x01, // version v2c
            0x04, 0x06, b'p', b'u', b'b', b'l', b'i', b'c', // community
            0xA0, 0x19, // GetRequest PDU
            0x02, 0x01, 0x01, // request-id 1
            0x02, 0x01, 0x00, // error-status
            0x02, 0x01, 0x00, // error-index
            0x30, 0x0E, // varbind list
            0x30, 0x0C, // varbind
            0x06, 0x08, 0x2B, 0x06, 0x01, 0x02, 0x01, 0x01, 0x05, 0x00, // sysName.0
            0x05, 0x00, // NULL
        ];
        assert_eq!(frame, expected);
    }

    #[test]
    fn test_response_roundtrip() {
        let descr = SnmpValue::OctetString(b"RouterOS RB3011UiAS".to_vec());
        let uptime = SnmpValue::TimeTicks(360_000); // one hour
        let name = SnmpValue::OctetString(b"sw01".to_vec());
        let if_number = SnmpValue::Integer(11);
        let frame = encode_get_response(
            "public",
            42,
            0,
            &[
                (OID_SYS_DESCR, &descr),
                (OID_SYS_UPTIME, &uptime),
                (OID_SYS_NAME, &name),
                (OID_IF_NUMBER, &if_number),
            ],
        );

        let binds = decode_response(&frame, 42).unwrap();
        assert_eq!(binds.len(), 4);
        assert_eq!(binds[0].oid, OID_SYS_DESCR);
        assert_eq!(binds[0].value, descr);
        assert_eq!(binds[3].value, if_number);
    }

    #[test]
    fn test_request_id_mismatch_rejected() {
        let frame = encode_get_response("public", 7, 0, &[]);
        assert!(matches!(
            decode_response(&frame, 8),
            Err(FrameError::RequestIdMismatch { sent: 8, got: 7 })
        ));
    }

    #[test]
    fn test_error_status_rejected() {
        // noSuchName(2) on the second varbind
        let frame = encode_get_response("public", 5, 2, &[]);
        assert!(matches!(
            decode_response(&frame, 5),
            Err(FrameError::ErrorStatus { status: 2, .. })
        ));
    }

    #[test]
    fn test_garbage_rejected() {
        assert!(decode_response(&[0xFF, 0x00, 0x01], 1).is_err());
        assert!(decode_response(&[], 1).is_err());
        // Truncated mid-message
        let frame = encode_get_response("public", 1, 0, &[]);
        assert!(decode_response(&frame[..frame.len() - 2], 1).is_err());
    }

    #[test]
    fn test_observation_mapping() {
        let mac: MacAddr = "00:0C:42:00:00:01".parse().unwrap();
        let ip: IpAddr = "10.0.0.5".parse().unwrap();
        let binds = vec![
            VarBind {
                oid: OID_SYS_NAME.to_vec(),
                value: SnmpValue::OctetString(b"sw01".to_vec()),
            },
            VarBind {
                oid: OID_SYS_DESCR.to_vec(),
                value: SnmpValue::OctetString(b"RouterOS RB3011UiAS".to_vec()),
            },
            VarBind {
                oid: OID_SYS_UPTIME.to_vec(),
                value: SnmpValue::TimeTicks(8_640_000),
            },
            VarBind {
                oid: OID_IF_NUMBER.to_vec(),
                value: SnmpValue::Integer(11),
            },
        ];

        let obs = observation_from_varbinds(mac, ip, &binds);
        assert_eq!(obs.protocol, Protocol::Snmp);
        assert_eq!(obs.mac, mac);
        assert_eq!(obs.ip, Some(ip));
        assert_eq!(obs.hostname.as_deref(), Some("sw01"));
        assert_eq!(obs.model.as_deref(), Some("RouterOS RB3011UiAS"));
        assert_eq!(obs.uptime_secs, Some(86400));
        assert_eq!(obs.interface_count, Some(11));
    }

    #[test]
    fn test_integer_encoding_edges() {
        assert_eq!(encode_integer(0), vec![0x00]);
        assert_eq!(encode_integer(1), vec![0x01]);
        assert_eq!(encode_integer(127), vec![0x7F]);
        assert_eq!(encode_integer(128), vec![0x00, 0x80]);
        assert_eq!(encode_integer(-1), vec![0xFF]);
        assert_eq!(decode_integer(&[0x00, 0x80]).unwrap(), 128);
        assert_eq!(decode_integer(&[0xFF]).unwrap(), -1);
    }

    #[test]
    fn test_oid_roundtrip() {
        for oid in POLL_OIDS {
            assert_eq!(decode_oid(&encode_oid(oid)).unwrap(), *oid);
        }
        // Multi-byte base128 component
        let oid = &[1u32, 3, 6, 1, 4, 1, 14988, 1];
        assert_eq!(decode_oid(&encode_oid(oid)).unwrap(), oid);
    }
}
