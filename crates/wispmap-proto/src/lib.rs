//! Wispmap Proto - Binary codecs for vendor discovery protocols
//!
//! Each codec is a pure transform from a raw datagram payload to an
//! [`Observation`](wispmap_core::Observation):
//! - UBNT: Ubiquiti discovery TLV frames (UDP 10001), decode and encode
//! - MNDP: Mikrotik Neighbor Discovery TLV frames (UDP 5678), also carries
//!   Mimosa announcements
//! - SNMP: v2c GetRequest/GetResponse BER for the basic system OID group
//!
//! Codecs never perform I/O; malformed input yields a [`FrameError`] the
//! caller logs and drops without leaving its receive loop.

pub mod mndp;
pub mod snmp;
pub mod ubnt;

use thiserror::Error;

/// Frame-level parse failure. Recoverable by design: the owning listener
/// drops the frame and keeps receiving.
#[derive(Error, Debug)]
pub enum FrameError {
    #[error("frame too short: {0} bytes")]
    TooShort(usize),
    #[error("bad frame signature")]
    BadSignature,
    #[error("tag {tag:#04x} length {len} at offset {offset} exceeds remaining {remaining} bytes")]
    Truncated {
        tag: u16,
        len: usize,
        offset: usize,
        remaining: usize,
    },
    #[error("no MAC address tag present")]
    MissingMac,
    #[error("BER structure error: {0}")]
    Ber(&'static str),
    #[error("request id mismatch: sent {sent}, got {got}")]
    RequestIdMismatch { sent: i32, got: i32 },
    #[error("SNMP error-status {status} at index {index}")]
    ErrorStatus { status: i64, index: i64 },
}
