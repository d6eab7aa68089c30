//! Transport kinds, wire protocol identifiers and per-flow protocol settings
//!
//! A [`ProtocolSetting`] pairs the transport chosen for a flow with the
//! compression requested for it. Only the selection is modelled here; no
//! codec is implemented.

use std::fmt;

use serde::{Deserialize, Serialize};

// ============================================================================
// Connector Kind
// ============================================================================

/// Transport used to reach a remote NetProxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ConnectorKind {
    /// Reliable QUIC transport (streams and DATAGRAM frames)
    Quic,
    /// TCP stream, optionally encrypted
    Tcp,
    /// Unreliable UDP datagrams with batching
    Udp,
    /// Restricted relay through a local CSR relay daemon
    Csr,
}

impl ConnectorKind {
    pub const ALL: [ConnectorKind; 4] = [
        ConnectorKind::Quic,
        ConnectorKind::Tcp,
        ConnectorKind::Udp,
        ConnectorKind::Csr,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ConnectorKind::Quic => "QUIC",
            ConnectorKind::Tcp => "TCP",
            ConnectorKind::Udp => "UDP",
            ConnectorKind::Csr => "CSR",
        }
    }

    /// Parse a connector name as used in config files
    ///
    /// `mockets` is accepted as an alias of `quic`, `socket` of `tcp`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "quic" | "mockets" => Some(ConnectorKind::Quic),
            "tcp" | "socket" => Some(ConnectorKind::Tcp),
            "udp" => Some(ConnectorKind::Udp),
            "csr" => Some(ConnectorKind::Csr),
            _ => None,
        }
    }

    pub fn is_reliable(&self) -> bool {
        !matches!(self, ConnectorKind::Udp)
    }
}

impl fmt::Display for ConnectorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ============================================================================
// Wire Protocol Identifier
// ============================================================================

/// Delivery mode for transports that offer several
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportMode {
    ReliableSequenced = 0,
    ReliableUnsequenced = 1,
    UnreliableSequenced = 2,
    UnreliableUnsequenced = 3,
}

impl TransportMode {
    fn from_index(i: u8) -> Option<Self> {
        match i {
            0 => Some(TransportMode::ReliableSequenced),
            1 => Some(TransportMode::ReliableUnsequenced),
            2 => Some(TransportMode::UnreliableSequenced),
            3 => Some(TransportMode::UnreliableUnsequenced),
            _ => None,
        }
    }

    fn suffix(&self) -> &'static str {
        match self {
            TransportMode::ReliableSequenced => "RS",
            TransportMode::ReliableUnsequenced => "RU",
            TransportMode::UnreliableSequenced => "US",
            TransportMode::UnreliableUnsequenced => "UU",
        }
    }

    fn from_suffix(s: &str) -> Option<Self> {
        match s {
            "rs" => Some(TransportMode::ReliableSequenced),
            "ru" => Some(TransportMode::ReliableUnsequenced),
            "us" => Some(TransportMode::UnreliableSequenced),
            "uu" => Some(TransportMode::UnreliableUnsequenced),
            _ => None,
        }
    }

    pub fn is_reliable(&self) -> bool {
        matches!(
            self,
            TransportMode::ReliableSequenced | TransportMode::ReliableUnsequenced
        )
    }
}

const PROTO_TCP: u8 = 0xF0;
const PROTO_UDP: u8 = 0xF1;
const PROTO_QUIC_BASE: u8 = 0xF2;
const PROTO_QUIC_UNDEF: u8 = 0xF6;
const PROTO_CSR_BASE: u8 = 0xF7;
const PROTO_CSR_UNDEF: u8 = 0xFB;
const PROTO_UNDEF: u8 = 0xFF;

/// Protocol byte carried in every PWP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProxyProtocol {
    Tcp,
    Udp,
    Quic(Option<TransportMode>),
    Csr(Option<TransportMode>),
    Undefined,
}

impl ProxyProtocol {
    pub fn to_byte(self) -> u8 {
        match self {
            ProxyProtocol::Tcp => PROTO_TCP,
            ProxyProtocol::Udp => PROTO_UDP,
            ProxyProtocol::Quic(Some(m)) => PROTO_QUIC_BASE + m as u8,
            ProxyProtocol::Quic(None) => PROTO_QUIC_UNDEF,
            ProxyProtocol::Csr(Some(m)) => PROTO_CSR_BASE + m as u8,
            ProxyProtocol::Csr(None) => PROTO_CSR_UNDEF,
            ProxyProtocol::Undefined => PROTO_UNDEF,
        }
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        match b {
            PROTO_TCP => Some(ProxyProtocol::Tcp),
            PROTO_UDP => Some(ProxyProtocol::Udp),
            0xF2..=0xF5 => Some(ProxyProtocol::Quic(TransportMode::from_index(b - PROTO_QUIC_BASE))),
            PROTO_QUIC_UNDEF => Some(ProxyProtocol::Quic(None)),
            0xF7..=0xFA => Some(ProxyProtocol::Csr(TransportMode::from_index(b - PROTO_CSR_BASE))),
            PROTO_CSR_UNDEF => Some(ProxyProtocol::Csr(None)),
            PROTO_UNDEF => Some(ProxyProtocol::Undefined),
            _ => None,
        }
    }

    /// Parse a protocol name such as `tcp`, `udp`, `quicrs`, `mocketsuu`, `csr`
    pub fn from_name(name: &str) -> Option<Self> {
        let lower = name.trim().to_ascii_lowercase();
        match lower.as_str() {
            "tcp" | "socket" => return Some(ProxyProtocol::Tcp),
            "udp" => return Some(ProxyProtocol::Udp),
            _ => {}
        }
        for (prefix, quic) in [("quic", true), ("mockets", true), ("csr", false)] {
            if let Some(rest) = lower.strip_prefix(prefix) {
                let mode = if rest.is_empty() {
                    Some(TransportMode::ReliableSequenced)
                } else {
                    Some(TransportMode::from_suffix(rest)?)
                };
                return Some(if quic {
                    ProxyProtocol::Quic(mode)
                } else {
                    ProxyProtocol::Csr(mode)
                });
            }
        }
        None
    }

    pub fn connector_kind(&self) -> Option<ConnectorKind> {
        match self {
            ProxyProtocol::Tcp => Some(ConnectorKind::Tcp),
            ProxyProtocol::Udp => Some(ConnectorKind::Udp),
            ProxyProtocol::Quic(_) => Some(ConnectorKind::Quic),
            ProxyProtocol::Csr(_) => Some(ConnectorKind::Csr),
            ProxyProtocol::Undefined => None,
        }
    }

    /// Whether messages sent with this protocol are delivered reliably
    pub fn is_reliable(&self) -> bool {
        match self {
            ProxyProtocol::Tcp => true,
            ProxyProtocol::Udp | ProxyProtocol::Undefined => false,
            ProxyProtocol::Quic(m) | ProxyProtocol::Csr(m) => m.map_or(true, |m| m.is_reliable()),
        }
    }

    /// Default protocol for a connector kind
    pub fn default_for(kind: ConnectorKind) -> Self {
        match kind {
            ConnectorKind::Tcp => ProxyProtocol::Tcp,
            ConnectorKind::Udp => ProxyProtocol::Udp,
            ConnectorKind::Quic => ProxyProtocol::Quic(Some(TransportMode::ReliableSequenced)),
            ConnectorKind::Csr => ProxyProtocol::Csr(Some(TransportMode::ReliableSequenced)),
        }
    }
}

impl fmt::Display for ProxyProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProxyProtocol::Tcp => write!(f, "TCP"),
            ProxyProtocol::Udp => write!(f, "UDP"),
            ProxyProtocol::Quic(Some(m)) => write!(f, "QUIC{}", m.suffix()),
            ProxyProtocol::Quic(None) => write!(f, "QUIC"),
            ProxyProtocol::Csr(Some(m)) => write!(f, "CSR{}", m.suffix()),
            ProxyProtocol::Csr(None) => write!(f, "CSR"),
            ProxyProtocol::Undefined => write!(f, "UNDEFINED"),
        }
    }
}

// ============================================================================
// Compression
// ============================================================================

/// Compression level used when a config entry omits it
pub const DEFAULT_COMPRESSION_LEVEL: u8 = 6;

const COMPRESSION_TYPE_MASK: u8 = 0x70;
const COMPRESSION_LEVEL_MASK: u8 = 0x0F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CompressionAlgorithm {
    #[default]
    None,
    Zlib,
    Lzma,
}

impl CompressionAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Zlib => "zlib",
            CompressionAlgorithm::Lzma => "lzma",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "none" | "plain" => Some(CompressionAlgorithm::None),
            "zlib" => Some(CompressionAlgorithm::Zlib),
            "lzma" => Some(CompressionAlgorithm::Lzma),
            _ => None,
        }
    }
}

/// Algorithm and level requested for a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct CompressionSetting {
    pub algorithm: CompressionAlgorithm,
    pub level: u8,
}

impl CompressionSetting {
    pub const NONE: CompressionSetting = CompressionSetting {
        algorithm: CompressionAlgorithm::None,
        level: 0,
    };

    /// Build a setting, clamping the level to 0-9
    ///
    /// A real algorithm with level 0 degrades to no compression.
    pub fn new(algorithm: CompressionAlgorithm, level: u8) -> Self {
        let level = level.min(9);
        if algorithm == CompressionAlgorithm::None || level == 0 {
            return Self::NONE;
        }
        CompressionSetting { algorithm, level }
    }

    /// Parse `<alg>[:<level>]`; unknown algorithms fall back to none
    pub fn parse(entry: &str) -> Self {
        let (name, level) = match entry.split_once(':') {
            Some((n, l)) => {
                let level = l.trim().parse::<i64>().unwrap_or(DEFAULT_COMPRESSION_LEVEL as i64);
                (n, level.clamp(0, 9) as u8)
            }
            None => (entry, DEFAULT_COMPRESSION_LEVEL),
        };
        match CompressionAlgorithm::from_name(name) {
            Some(alg) => {
                if alg != CompressionAlgorithm::None && level == 0 {
                    log::warn!(
                        "compression level 0 with algorithm <{}>; no compression will be used",
                        alg.name()
                    );
                }
                Self::new(alg, level)
            }
            None => {
                log::warn!("invalid compression algorithm '{}'; no compression will be used", name);
                Self::NONE
            }
        }
    }

    /// Pack into the PWP compression byte
    pub fn to_byte(&self) -> u8 {
        let ty = match self.algorithm {
            CompressionAlgorithm::None => 0x00,
            CompressionAlgorithm::Zlib => 0x10,
            CompressionAlgorithm::Lzma => 0x20,
        };
        ty | (self.level & COMPRESSION_LEVEL_MASK)
    }

    pub fn from_byte(b: u8) -> Option<Self> {
        let algorithm = match b & COMPRESSION_TYPE_MASK {
            0x00 => CompressionAlgorithm::None,
            0x10 => CompressionAlgorithm::Zlib,
            0x20 => CompressionAlgorithm::Lzma,
            _ => return None,
        };
        let level = b & COMPRESSION_LEVEL_MASK;
        if level > 9 {
            return None;
        }
        Some(Self::new(algorithm, level))
    }
}

impl fmt::Display for CompressionSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.algorithm == CompressionAlgorithm::None {
            write!(f, "none")
        } else {
            write!(f, "{}:{}", self.algorithm.name(), self.level)
        }
    }
}

// ============================================================================
// Protocol Setting
// ============================================================================

/// Transport and compression selected for one IP protocol of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolSetting {
    pub protocol: ProxyProtocol,
    pub compression: CompressionSetting,
}

impl ProtocolSetting {
    pub fn new(protocol: ProxyProtocol) -> Self {
        ProtocolSetting {
            protocol,
            compression: CompressionSetting::NONE,
        }
    }

    pub fn default_tcp() -> Self {
        Self::new(ProxyProtocol::Tcp)
    }

    pub fn default_udp() -> Self {
        Self::new(ProxyProtocol::Udp)
    }

    pub fn default_icmp() -> Self {
        Self::new(ProxyProtocol::Udp)
    }

    pub fn connector_kind(&self) -> ConnectorKind {
        self.protocol.connector_kind().unwrap_or(ConnectorKind::Tcp)
    }
}
