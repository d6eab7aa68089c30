//! Address range descriptors
//!
//! A descriptor names a block of IPv4:port space used by the Address
//! Mapping Table and by endpoint configuration entries.
//!
//! # Syntax
//!
//! ```text
//! 10.0.*.1-20:8000-8080     per-octet ranges, '*' = 0-255
//! 10.0.0.1-10.0.0.5:80-90   contiguous address range
//! 192.168.1.7               single address, any port
//! ```

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

// ============================================================================
// Errors
// ============================================================================

/// Error returned when a descriptor cannot be parsed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeParseError {
    pub descriptor: String,
    pub reason: &'static str,
}

impl fmt::Display for RangeParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid address range '{}': {}", self.descriptor, self.reason)
    }
}

impl std::error::Error for RangeParseError {}

// ============================================================================
// Descriptor
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum AddressSpan {
    /// Every octet matched independently against its own range
    Octets([(u8, u8); 4]),
    /// Inclusive range over the numeric value of the address
    Contiguous { low: u32, high: u32 },
}

/// Inclusive range of (IPv4 address, port) pairs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressRangeDescriptor {
    span: AddressSpan,
    ports: (u16, u16),
}

impl AddressRangeDescriptor {
    /// Parse a descriptor; see module docs for the accepted syntax
    pub fn parse(descriptor: &str) -> Result<Self, RangeParseError> {
        let err = |reason| RangeParseError {
            descriptor: descriptor.to_string(),
            reason,
        };

        let descriptor_trimmed = descriptor.trim();
        if descriptor_trimmed.is_empty() {
            return Err(err("empty descriptor"));
        }

        let (addr_part, port_part) = match descriptor_trimmed.split_once(':') {
            Some((a, p)) => (a, Some(p)),
            None => (descriptor_trimmed, None),
        };

        let ports = match port_part {
            None => (0, u16::MAX),
            Some(p) => parse_bounds::<u16>(p, u16::MAX).ok_or_else(|| err("bad port range"))?,
        };

        let span = if let Some((low, high)) = split_contiguous(addr_part) {
            let low = Ipv4Addr::from_str(low).map_err(|_| err("bad lower address"))?;
            let high = Ipv4Addr::from_str(high).map_err(|_| err("bad upper address"))?;
            let (low, high) = (u32::from(low), u32::from(high));
            if low > high {
                return Err(err("lower address above upper address"));
            }
            AddressSpan::Contiguous { low, high }
        } else {
            let parts: Vec<&str> = addr_part.split('.').collect();
            if parts.len() != 4 {
                return Err(err("expected four octets"));
            }
            let mut octets = [(0u8, 0u8); 4];
            for (slot, part) in octets.iter_mut().zip(parts) {
                *slot = parse_bounds::<u8>(part, u8::MAX).ok_or_else(|| err("bad octet range"))?;
            }
            AddressSpan::Octets(octets)
        };

        Ok(AddressRangeDescriptor { span, ports })
    }

    /// Descriptor matching exactly one address and one port
    pub fn single(ip: Ipv4Addr, port: u16) -> Self {
        let v = u32::from(ip);
        AddressRangeDescriptor {
            span: AddressSpan::Contiguous { low: v, high: v },
            ports: (port, port),
        }
    }

    /// Membership test
    pub fn contains(&self, ip: Ipv4Addr, port: u16) -> bool {
        if port < self.ports.0 || port > self.ports.1 {
            return false;
        }
        self.contains_address(ip)
    }

    /// Membership test ignoring the port range
    pub fn contains_address(&self, ip: Ipv4Addr) -> bool {
        match self.span {
            AddressSpan::Octets(octets) => ip
                .octets()
                .iter()
                .zip(octets.iter())
                .all(|(o, (lo, hi))| o >= lo && o <= hi),
            AddressSpan::Contiguous { low, high } => {
                let v = u32::from(ip);
                v >= low && v <= high
            }
        }
    }

    pub fn lowest_address(&self) -> Ipv4Addr {
        match self.span {
            AddressSpan::Octets(o) => Ipv4Addr::new(o[0].0, o[1].0, o[2].0, o[3].0),
            AddressSpan::Contiguous { low, .. } => Ipv4Addr::from(low),
        }
    }

    pub fn highest_address(&self) -> Ipv4Addr {
        match self.span {
            AddressSpan::Octets(o) => Ipv4Addr::new(o[0].1, o[1].1, o[2].1, o[3].1),
            AddressSpan::Contiguous { high, .. } => Ipv4Addr::from(high),
        }
    }

    pub fn port_range(&self) -> (u16, u16) {
        self.ports
    }
}

impl FromStr for AddressRangeDescriptor {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AddressRangeDescriptor::parse(s)
    }
}

impl fmt::Display for AddressRangeDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.span {
            AddressSpan::Octets(octets) => {
                for (i, (lo, hi)) in octets.iter().enumerate() {
                    if i > 0 {
                        write!(f, ".")?;
                    }
                    write_bounds(f, *lo as u32, *hi as u32, u8::MAX as u32)?;
                }
            }
            AddressSpan::Contiguous { low, high } if low == high => {
                write!(f, "{}", Ipv4Addr::from(low))?;
            }
            AddressSpan::Contiguous { low, high } => {
                write!(f, "{}-{}", Ipv4Addr::from(low), Ipv4Addr::from(high))?;
            }
        }
        write!(f, ":")?;
        write_bounds(f, self.ports.0 as u32, self.ports.1 as u32, u16::MAX as u32)
    }
}

// ============================================================================
// Parsing Helpers
// ============================================================================

/// Split "A.B.C.D-E.F.G.H" into its two addresses
fn split_contiguous(addr: &str) -> Option<(&str, &str)> {
    let (low, high) = addr.split_once('-')?;
    if low.matches('.').count() == 3 && high.matches('.').count() == 3 {
        Some((low, high))
    } else {
        None
    }
}

/// Parse "n", "n-m" or "*" into inclusive bounds
fn parse_bounds<T>(s: &str, max: T) -> Option<(T, T)>
where
    T: FromStr + PartialOrd + Copy + Default,
{
    let s = s.trim();
    if s == "*" {
        return Some((T::default(), max));
    }
    let (lo, hi) = match s.split_once('-') {
        Some((lo, hi)) => (lo.trim().parse().ok()?, hi.trim().parse().ok()?),
        None => {
            let v = s.parse().ok()?;
            (v, v)
        }
    };
    if lo > hi {
        return None;
    }
    Some((lo, hi))
}

fn write_bounds(f: &mut fmt::Formatter<'_>, lo: u32, hi: u32, max: u32) -> fmt::Result {
    if lo == 0 && hi == max {
        write!(f, "*")
    } else if lo == hi {
        write!(f, "{}", lo)
    } else {
        write!(f, "{}-{}", lo, hi)
    }
}

// ============================================================================
// Tests
// ============================================================================
