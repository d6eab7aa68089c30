//! Address Resolution Cache (ARC)
//!
//! IPv4 → MAC table shared by every worker. Entries are overwritten on each
//! resolution and never expire at this layer.

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::RwLock;

use crate::{read_lock, write_lock};

// ============================================================================
// MAC Address
// ============================================================================

/// Prefix of locally administered MACs synthesized for virtual hosts
pub const VIRTUAL_MAC_PREFIX: [u8; 4] = [0x02, 0x0A, 0x0C, 0x00];

/// 48-bit Ethernet address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    pub const BROADCAST: MacAddr = MacAddr([0xFF; 6]);
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// MAC used when answering ARP on behalf of a remote virtual host
    pub fn virtual_for(ip: Ipv4Addr) -> Self {
        let o = ip.octets();
        let p = VIRTUAL_MAC_PREFIX;
        MacAddr([p[0], p[1], p[2], p[3], o[2], o[3]])
    }

    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split(|c| c == ':' || c == '-').collect();
        if parts.len() != 6 {
            return Err(format!("invalid MAC address: {}", s));
        }
        let mut mac = [0u8; 6];
        for (b, p) in mac.iter_mut().zip(parts) {
            *b = u8::from_str_radix(p, 16).map_err(|_| format!("invalid MAC address: {}", s))?;
        }
        Ok(MacAddr(mac))
    }
}

// ============================================================================
// Cache
// ============================================================================

/// Thread-safe IPv4 → MAC table
#[derive(Debug, Default)]
pub struct AddressResolutionCache {
    entries: RwLock<HashMap<Ipv4Addr, MacAddr>>,
}

impl AddressResolutionCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or overwrite the mapping for `ip`
    ///
    /// Returns the previous MAC if it changed.
    pub fn insert(&self, ip: Ipv4Addr, mac: MacAddr) -> Option<MacAddr> {
        let mut entries = write_lock(&self.entries);
        match entries.insert(ip, mac) {
            Some(old) if old != mac => {
                log::debug!("ARC: {} moved from {} to {}", ip, old, mac);
                Some(old)
            }
            Some(_) => None,
            None => {
                log::trace!("ARC: learned {} -> {}", ip, mac);
                None
            }
        }
    }

    pub fn lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        read_lock(&self.entries).get(&ip).copied()
    }

    pub fn remove(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        write_lock(&self.entries).remove(&ip)
    }

    pub fn len(&self) -> usize {
        read_lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Preload entries, e.g. from the static ARP file
    pub fn load<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (Ipv4Addr, MacAddr)>,
    {
        let mut table = write_lock(&self.entries);
        let mut count = 0;
        for (ip, mac) in entries {
            table.insert(ip, mac);
            count += 1;
        }
        log::info!("ARC: loaded {} static entries", count);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_overwrites() {
        let arc = AddressResolutionCache::new();
        let ip = Ipv4Addr::new(10, 0, 0, 1);
        let a: MacAddr = "00:11:22:33:44:55".parse().unwrap();
        let b: MacAddr = "00:11:22:33:44:66".parse().unwrap();

        assert_eq!(arc.insert(ip, a), None);
        assert_eq!(arc.insert(ip, a), None);
        assert_eq!(arc.insert(ip, b), Some(a));
        assert_eq!(arc.lookup(ip), Some(b));
        assert_eq!(arc.len(), 1);
    }

    #[test]
    fn test_mac_parse_and_display() {
        let mac: MacAddr = "de-ad-be-ef-00-01".parse().unwrap();
        assert_eq!(mac.to_string(), "DE:AD:BE:EF:00:01");
        assert!("de:ad:be:ef:00".parse::<MacAddr>().is_err());
        assert!("zz:ad:be:ef:00:01".parse::<MacAddr>().is_err());
    }

    #[test]
    fn test_virtual_mac() {
        let mac = MacAddr::virtual_for(Ipv4Addr::new(10, 1, 2, 3));
        assert_eq!(mac.0, [0x02, 0x0A, 0x0C, 0x00, 2, 3]);
        assert!(!mac.is_multicast());
        assert!(MacAddr::BROADCAST.is_broadcast());
    }

    #[test]
    fn test_concurrent_inserts() {
        use std::sync::Arc;
        let arc = Arc::new(AddressResolutionCache::new());
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let arc = Arc::clone(&arc);
                std::thread::spawn(move || {
                    arc.insert(Ipv4Addr::new(10, 0, 0, i), MacAddr([0, 0, 0, 0, 0, i]));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(arc.len(), 8);
    }
}
