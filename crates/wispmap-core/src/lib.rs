//! Wispmap Core - Device model, OUI vendor resolution, and the merge registry
//!
//! This crate provides the foundational types for the wispmap engine:
//! - Device and observation types keyed by MAC address
//! - OUI prefix lookup for vendor identification
//! - The device registry that merges per-protocol observations into a
//!   canonical inventory and emits change events

pub mod device;
pub mod oui;
pub mod registry;

pub use device::{
    Attr, Device, DeviceState, InterfaceReport, LatencyHistory, LatencySample, Link, MacAddr,
    MacParseError, Observation, Protocol,
};
pub use oui::{OuiDb, OuiError};
pub use registry::{DeviceEvent, DeviceRegistry, EventKind, MergePolicy, RegistryConfig};
