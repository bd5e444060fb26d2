//! OUI (Organizationally Unique Identifier) vendor lookup
//!
//! Maps the 3-byte MAC prefix to a vendor name. Loaded once at startup and
//! immutable afterwards, so it is safe to share behind an `Arc` across all
//! listeners without locking.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::device::MacAddr;

#[derive(Error, Debug)]
pub enum OuiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse OUI table: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid OUI prefix: {0:?}")]
    BadPrefix(String),
}

/// Vendors the built-in table covers: the equipment commonly found in
/// mixed-vendor WISP deployments.
const BUILTIN: &[(&str, &str)] = &[
    // Ubiquiti Networks
    ("00:15:6D", "Ubiquiti"),
    ("00:27:22", "Ubiquiti"),
    ("04:18:D6", "Ubiquiti"),
    ("18:E8:29", "Ubiquiti"),
    ("24:5A:4C", "Ubiquiti"),
    ("24:A4:3C", "Ubiquiti"),
    ("44:D9:E7", "Ubiquiti"),
    ("68:72:51", "Ubiquiti"),
    ("70:A7:41", "Ubiquiti"),
    ("74:83:C2", "Ubiquiti"),
    ("78:8A:20", "Ubiquiti"),
    ("80:2A:A8", "Ubiquiti"),
    ("9C:05:D6", "Ubiquiti"),
    ("AC:8B:A9", "Ubiquiti"),
    ("B4:FB:E4", "Ubiquiti"),
    ("D0:21:F9", "Ubiquiti"),
    ("DC:9F:DB", "Ubiquiti"),
    ("E0:63:DA", "Ubiquiti"),
    ("E2:63:DA", "Ubiquiti"),
    ("F0:9F:C2", "Ubiquiti"),
    ("FC:EC:DA", "Ubiquiti"),
    // Mikrotik
    ("00:0C:42", "Mikrotik"),
    ("08:55:31", "Mikrotik"),
    ("18:FD:74", "Mikrotik"),
    ("2C:C8:1B", "Mikrotik"),
    ("48:8F:5A", "Mikrotik"),
    ("4C:5E:0C", "Mikrotik"),
    ("64:D1:54", "Mikrotik"),
    ("6C:3B:6B", "Mikrotik"),
    ("74:4D:28", "Mikrotik"),
    ("B8:69:F4", "Mikrotik"),
    ("C4:AD:34", "Mikrotik"),
    ("CC:2D:E0", "Mikrotik"),
    ("D4:01:C3", "Mikrotik"),
    ("D4:CA:6D", "Mikrotik"),
    ("DC:2C:6E", "Mikrotik"),
    ("E4:8D:8C", "Mikrotik"),
    // Mimosa Networks
    ("58:C1:7A", "Mimosa"),
    // Cambium Networks
    ("00:04:56", "Cambium"),
    // TP-Link
    ("00:1D:0F", "TP-Link"),
    ("00:23:CD", "TP-Link"),
    ("14:CC:20", "TP-Link"),
    ("30:B5:C2", "TP-Link"),
    ("50:C7:BF", "TP-Link"),
    ("54:C8:0F", "TP-Link"),
    ("60:E3:27", "TP-Link"),
    ("6C:5A:B0", "TP-Link"),
    ("90:F6:52", "TP-Link"),
    ("98:DA:C4", "TP-Link"),
    ("B0:BE:76", "TP-Link"),
    ("C0:25:E9", "TP-Link"),
    ("C4:E9:84", "TP-Link"),
    ("D8:07:B6", "TP-Link"),
    ("E8:DE:27", "TP-Link"),
    ("F4:F2:6D", "TP-Link"),
    // Cisco
    ("00:00:0C", "Cisco"),
    ("00:01:42", "Cisco"),
    ("00:01:43", "Cisco"),
    ("00:01:64", "Cisco"),
    ("00:02:3D", "Cisco"),
    ("00:02:4A", "Cisco"),
    ("00:02:4B", "Cisco"),
    ("00:02:7D", "Cisco"),
    ("00:02:7E", "Cisco"),
    ("00:03:31", "Cisco"),
    ("00:03:32", "Cisco"),
    // Huawei
    ("00:18:82", "Huawei"),
    ("00:1E:10", "Huawei"),
    ("00:25:9E", "Huawei"),
    ("00:25:68", "Huawei"),
    ("00:46:4B", "Huawei"),
    ("04:02:1F", "Huawei"),
    ("04:25:C5", "Huawei"),
    ("04:33:89", "Huawei"),
    ("04:F9:38", "Huawei"),
    // Netgear
    ("00:09:5B", "Netgear"),
    ("00:0F:B5", "Netgear"),
    ("00:14:6C", "Netgear"),
    ("00:18:4D", "Netgear"),
    ("00:1B:2F", "Netgear"),
    ("00:1E:2A", "Netgear"),
    ("00:1F:33", "Netgear"),
    ("00:22:3F", "Netgear"),
    ("00:24:B2", "Netgear"),
    // Aruba Networks
    ("00:0B:86", "Aruba"),
    ("00:1A:1E", "Aruba"),
    ("00:24:6C", "Aruba"),
    ("04:BD:88", "Aruba"),
    ("18:64:72", "Aruba"),
    ("20:4C:03", "Aruba"),
    ("24:DE:C6", "Aruba"),
    // Ruckus Wireless
    ("00:1F:41", "Ruckus"),
    ("00:22:7F", "Ruckus"),
    ("00:25:C4", "Ruckus"),
    ("58:B6:33", "Ruckus"),
    ("74:91:1A", "Ruckus"),
    ("84:18:3A", "Ruckus"),
    // Juniper
    ("00:05:85", "Juniper"),
    ("00:10:DB", "Juniper"),
    ("00:12:1E", "Juniper"),
    ("00:14:F6", "Juniper"),
    ("00:17:CB", "Juniper"),
    ("00:19:E2", "Juniper"),
    ("00:1D:B5", "Juniper"),
    // Dell
    ("00:06:5B", "Dell"),
    ("00:08:74", "Dell"),
    ("00:0B:DB", "Dell"),
    ("00:0D:56", "Dell"),
    ("00:0F:1F", "Dell"),
    ("00:11:43", "Dell"),
    ("00:12:3F", "Dell"),
    // ZTE
    ("00:15:EB", "ZTE"),
    ("00:19:C6", "ZTE"),
    ("00:1E:73", "ZTE"),
    ("00:22:93", "ZTE"),
    ("00:25:12", "ZTE"),
    ("00:26:ED", "ZTE"),
];

const UNKNOWN_VENDOR: &str = "Unknown";

/// Immutable OUI prefix to vendor name table.
#[derive(Debug, Clone)]
pub struct OuiDb {
    vendors: HashMap<[u8; 3], String>,
}

impl OuiDb {
    /// The built-in table alone.
    pub fn builtin() -> Self {
        let mut vendors = HashMap::with_capacity(BUILTIN.len());
        for (prefix, vendor) in BUILTIN {
            if let Some(key) = parse_prefix(prefix) {
                vendors.insert(key, (*vendor).to_string());
            }
        }
        Self { vendors }
    }

    /// Built-in table with a JSON overlay file merged on top.
    ///
    /// The file maps prefix strings to vendor names, e.g.
    /// `{"AA:BB:CC": "SomeVendor"}`; overlay entries win over builtins.
    pub fn with_file(path: &Path) -> Result<Self, OuiError> {
        let mut db = Self::builtin();
        let content = std::fs::read_to_string(path)?;
        let entries: HashMap<String, String> = serde_json::from_str(&content)?;
        let count = entries.len();
        for (prefix, vendor) in entries {
            let key = parse_prefix(&prefix).ok_or(OuiError::BadPrefix(prefix))?;
            db.vendors.insert(key, vendor);
        }
        info!(path = %path.display(), entries = count, "Loaded OUI overlay");
        Ok(db)
    }

    /// Resolve a MAC address to its vendor name. Never fails.
    pub fn resolve(&self, mac: &MacAddr) -> &str {
        self.vendors
            .get(&mac.oui())
            .map(String::as_str)
            .unwrap_or(UNKNOWN_VENDOR)
    }

    pub fn len(&self) -> usize {
        self.vendors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vendors.is_empty()
    }
}

impl Default for OuiDb {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Parse an `AA:BB:CC` (or `-`/bare) prefix string into its three bytes.
fn parse_prefix(s: &str) -> Option<[u8; 3]> {
    let hex: String = s
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.'))
        .collect();
    if hex.len() < 6 {
        return None;
    }
    let mut bytes = [0u8; 3];
    for (i, byte) in bytes.iter_mut().enumerate() {
        *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
    }
    Some(bytes)
}
