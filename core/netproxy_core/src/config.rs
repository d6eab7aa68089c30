//! Configuration line parsers
//!
//! The daemon reads the config directory and feeds each line here. Every
//! parser returns `Ok(None)` for blank and `#` comment lines.
//!
//! | File                 | Line format                                        |
//! |----------------------|----------------------------------------------------|
//! | `endpoints.cfg`      | `src-range dst-range key=value;key=value...`       |
//! | `uniqueIDs.cfg`      | `remoteIP [uniqueId] [key=value ...] [settings]`   |
//! | `addressMapping.cfg` | `virtualRange remoteProxyId`                       |
//! | `staticARP.cfg`      | `ip mac`                                           |
//! | `netproxy.cfg`       | `Key=Value`                                        |

use std::collections::BTreeSet;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::str::FromStr;
use std::time::Duration;

use crate::address_range::AddressRangeDescriptor;
use crate::arc::MacAddr;
use crate::protocol::{CompressionSetting, ConnectorKind, ProtocolSetting, ProxyProtocol};
use crate::pwp::ProxyPorts;
use crate::registry::{Connectivity, RemoteProxyInfo};

// ============================================================================
// Errors
// ============================================================================

/// A rejected configuration line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigError {
    /// 1-based line number, 0 when unknown
    pub line: usize,
    pub reason: String,
}

impl ConfigError {
    pub fn new(reason: impl Into<String>) -> Self {
        ConfigError {
            line: 0,
            reason: reason.into(),
        }
    }

    pub fn at_line(mut self, line: usize) -> Self {
        self.line = line;
        self
    }
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "line {}: {}", self.line, self.reason)
        } else {
            write!(f, "{}", self.reason)
        }
    }
}

impl std::error::Error for ConfigError {}

/// Strip trailing comments and surrounding whitespace; `None` if nothing is left
fn content(line: &str) -> Option<&str> {
    let line = match line.find('#') {
        Some(i) => &line[..i],
        None => line,
    };
    let line = line.trim();
    (!line.is_empty()).then_some(line)
}

/// Parse a remote proxy id given as decimal or dotted quad
pub fn parse_proxy_id(s: &str) -> Result<u32, ConfigError> {
    let s = s.trim();
    let id = if s.contains('.') {
        u32::from(Ipv4Addr::from_str(s).map_err(|_| ConfigError::new(format!("bad proxy id '{}'", s)))?)
    } else {
        s.parse::<u32>()
            .map_err(|_| ConfigError::new(format!("bad proxy id '{}'", s)))?
    };
    if !crate::registry::is_valid_proxy_id(id) {
        return Err(ConfigError::new(format!("proxy id {} is reserved", id)));
    }
    Ok(id)
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "true" | "yes" | "on" | "1" => Some(true),
        "false" | "no" | "off" | "0" => Some(false),
        _ => None,
    }
}

// ============================================================================
// Endpoint Configuration
// ============================================================================

/// Protocol selection for traffic between two address ranges
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfigEntry {
    pub source: AddressRangeDescriptor,
    pub destination: AddressRangeDescriptor,
    pub icmp: ProtocolSetting,
    pub tcp: ProtocolSetting,
    pub udp: ProtocolSetting,
    /// Forward whole IP packets over this transport instead of per-flow messages
    pub tunnel: Option<ProxyProtocol>,
}

impl EndpointConfigEntry {
    pub fn parse_line(line: &str) -> Result<Option<Self>, ConfigError> {
        let Some(line) = content(line) else {
            return Ok(None);
        };
        let mut fields = line.split_whitespace();
        let (Some(src), Some(dst)) = (fields.next(), fields.next()) else {
            return Err(ConfigError::new("expected source and destination ranges"));
        };
        let source = AddressRangeDescriptor::parse(src).map_err(|e| ConfigError::new(e.to_string()))?;
        let destination = AddressRangeDescriptor::parse(dst).map_err(|e| ConfigError::new(e.to_string()))?;

        let mut entry = EndpointConfigEntry {
            source,
            destination,
            icmp: ProtocolSetting::default_icmp(),
            tcp: ProtocolSetting::default_tcp(),
            udp: ProtocolSetting::default_udp(),
            tunnel: None,
        };

        let options: String = fields.collect::<Vec<_>>().join("");
        for option in options.split(';').filter(|o| !o.is_empty()) {
            let Some((key, value)) = option.split_once('=') else {
                log::warn!("endpoint option '{}' is not key=value; ignored", option);
                continue;
            };
            let key = key.trim().to_ascii_lowercase();
            match key.as_str() {
                "icmp" | "tcp" | "udp" | "tunnel" => {
                    let protocol = ProxyProtocol::from_name(value)
                        .ok_or_else(|| ConfigError::new(format!("unknown protocol '{}'", value)))?;
                    match key.as_str() {
                        "icmp" => entry.icmp.protocol = protocol,
                        "tcp" => entry.tcp.protocol = protocol,
                        "udp" => entry.udp.protocol = protocol,
                        _ => entry.tunnel = Some(protocol),
                    }
                }
                "tcpcompression" => entry.tcp.compression = CompressionSetting::parse(value),
                "udpcompression" => entry.udp.compression = CompressionSetting::parse(value),
                _ => log::warn!("unknown endpoint option '{}'; ignored", key),
            }
        }

        Ok(Some(entry))
    }

    pub fn matches(&self, src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> bool {
        self.source.contains(src, src_port) && self.destination.contains(dst, dst_port)
    }
}

/// IP protocol a flow uses, for endpoint lookups
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowProtocol {
    Icmp,
    Tcp,
    Udp,
}

/// Ordered endpoint configuration; first match wins
#[derive(Debug, Clone, Default)]
pub struct EndpointTable {
    entries: Vec<EndpointConfigEntry>,
}

impl EndpointTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: EndpointConfigEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, src: Ipv4Addr, src_port: u16, dst: Ipv4Addr, dst_port: u16) -> Option<&EndpointConfigEntry> {
        self.entries.iter().find(|e| e.matches(src, src_port, dst, dst_port))
    }

    /// Protocol setting for a flow, falling back to the built-in defaults
    pub fn map_addr_to_protocol(
        &self,
        src: Ipv4Addr,
        src_port: u16,
        dst: Ipv4Addr,
        dst_port: u16,
        proto: FlowProtocol,
    ) -> ProtocolSetting {
        match (self.lookup(src, src_port, dst, dst_port), proto) {
            (Some(e), FlowProtocol::Icmp) => e.icmp,
            (Some(e), FlowProtocol::Tcp) => e.tcp,
            (Some(e), FlowProtocol::Udp) => e.udp,
            (None, FlowProtocol::Icmp) => ProtocolSetting::default_icmp(),
            (None, FlowProtocol::Tcp) => ProtocolSetting::default_tcp(),
            (None, FlowProtocol::Udp) => ProtocolSetting::default_udp(),
        }
    }

    /// Tunnel transport for packets between two addresses, if configured
    pub fn tunnel_protocol(&self, src: Ipv4Addr, dst: Ipv4Addr) -> Option<ProxyProtocol> {
        self.entries
            .iter()
            .find(|e| e.source.contains_address(src) && e.destination.contains_address(dst))
            .and_then(|e| e.tunnel)
    }
}

// ============================================================================
// Unique IDs
// ============================================================================

/// Parsed `uniqueIDs.cfg` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UniqueIdEntry {
    pub info: RemoteProxyInfo,
    /// Connectors to keep open automatically
    pub auto_connect: Vec<ConnectorKind>,
    pub reconnect_interval: Option<Duration>,
}

impl UniqueIdEntry {
    pub fn parse_line(line: &str) -> Result<Option<Self>, ConfigError> {
        let Some(line) = content(line) else {
            return Ok(None);
        };
        let mut fields = line.split_whitespace().peekable();
        let ip_field = fields
            .next()
            .ok_or_else(|| ConfigError::new("missing remote address"))?;
        let address = Ipv4Addr::from_str(ip_field)
            .map_err(|_| ConfigError::new(format!("bad remote address '{}'", ip_field)))?;

        // Optional id; defaults to the numeric value of the address
        let id = match fields.peek() {
            Some(f) if f.parse::<u32>().is_ok() || Ipv4Addr::from_str(f).is_ok() => {
                let id = parse_proxy_id(f)?;
                fields.next();
                id
            }
            _ => parse_proxy_id(ip_field)?,
        };

        let mut info = RemoteProxyInfo::new(id, address);
        let mut auto_connect = Vec::new();
        let mut reconnect_interval = None;
        let mut local_reachability = None;
        let mut remote_reachability = None;

        for field in fields {
            let Some((key, value)) = field.split_once('=') else {
                info.settings_file = Some(field.to_string());
                continue;
            };
            let key = key.to_ascii_lowercase();
            let bad = || ConfigError::new(format!("bad value '{}' for {}", value, key));
            match key.as_str() {
                "mocketsport" | "quicport" => info.ports.quic = value.parse().map_err(|_| bad())?,
                "tcpport" => info.ports.tcp = value.parse().map_err(|_| bad())?,
                "udpport" => info.ports.udp = value.parse().map_err(|_| bad())?,
                "autoconnect" => {
                    for name in value.split([';', ',']).filter(|n| !n.is_empty()) {
                        match ConnectorKind::from_name(name) {
                            Some(kind) if !auto_connect.contains(&kind) => auto_connect.push(kind),
                            Some(_) => {}
                            None => log::warn!("unknown autoconnect protocol '{}' for proxy {}", name, id),
                        }
                    }
                }
                "reconnectinterval" => {
                    reconnect_interval = Some(Duration::from_millis(value.parse().map_err(|_| bad())?))
                }
                "connectivity" => {
                    let c = Connectivity::from_name(value).unwrap_or_else(|| {
                        log::warn!(
                            "could not interpret connectivity '{}' for proxy {}; assuming bidirectional",
                            value,
                            id
                        );
                        Connectivity::Bidirectional
                    });
                    info.set_connectivity(c);
                }
                "localreachability" => local_reachability = Some(parse_bool(value).ok_or_else(bad)?),
                "remotereachability" => remote_reachability = Some(parse_bool(value).ok_or_else(bad)?),
                _ => log::warn!("unknown uniqueID option '{}' for proxy {}; ignored", key, id),
            }
        }

        if let Some(v) = local_reachability {
            info.local_reachable_from_remote = v;
        }
        if let Some(v) = remote_reachability {
            info.remote_reachable_from_local = v;
        }

        Ok(Some(UniqueIdEntry {
            info,
            auto_connect,
            reconnect_interval,
        }))
    }
}

// ============================================================================
// Address Mapping / Static ARP
// ============================================================================

pub fn parse_address_mapping_line(line: &str) -> Result<Option<(AddressRangeDescriptor, u32)>, ConfigError> {
    let Some(line) = content(line) else {
        return Ok(None);
    };
    let mut fields = line.split_whitespace();
    let (Some(range), Some(id), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(ConfigError::new("expected '<range> <remoteProxyId>'"));
    };
    let range = AddressRangeDescriptor::parse(range).map_err(|e| ConfigError::new(e.to_string()))?;
    Ok(Some((range, parse_proxy_id(id)?)))
}

pub fn parse_static_arp_line(line: &str) -> Result<Option<(Ipv4Addr, MacAddr)>, ConfigError> {
    let Some(line) = content(line) else {
        return Ok(None);
    };
    let mut fields = line.split_whitespace();
    let (Some(ip), Some(mac), None) = (fields.next(), fields.next(), fields.next()) else {
        return Err(ConfigError::new("expected '<ip> <mac>'"));
    };
    let ip = Ipv4Addr::from_str(ip).map_err(|_| ConfigError::new(format!("bad address '{}'", ip)))?;
    let mac = MacAddr::from_str(mac).map_err(ConfigError::new)?;
    Ok(Some((ip, mac)))
}

// ============================================================================
// Runtime Settings
// ============================================================================

/// Where broadcast/multicast UDP received locally is forwarded
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum BroadcastPolicy {
    /// Drop broadcast/multicast traffic
    #[default]
    None,
    /// Every remote proxy with an address mapping
    AllProxies,
    List(Vec<u32>),
}

/// Runtime tunables
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetProxySettings {
    /// Unique id of this NetProxy
    pub proxy_id: u32,
    /// Address of the internal (local network) interface
    pub internal_ip: Ipv4Addr,
    /// Address of the external interface, used in link messages
    pub external_ip: Ipv4Addr,
    pub ports: ProxyPorts,
    pub enabled_connectors: BTreeSet<ConnectorKind>,
    pub csr_relay: SocketAddr,
    pub mtu: usize,

    pub max_tcp_payload: usize,
    pub max_unacked_bytes: u32,
    pub tcp_window: u16,
    pub synchronize_handshake: bool,
    pub ignore_time_wait: bool,
    pub ignore_teardown_timing: bool,
    pub syn_sent_failure: Duration,
    pub dup_ack_interval: Duration,
    pub establishment_timeout: Duration,
    pub idle_reset: Duration,
    pub msl: Duration,

    pub udp_batch_timeout: Duration,
    pub udp_batch_threshold: usize,
    /// Bytes per second, 0 means unlimited
    pub udp_rate_limit: u64,
    pub udp_buffer_size: usize,

    pub auto_reconnect_interval: Duration,
    pub broadcast_policy: BroadcastPolicy,
    /// Capacity of every role channel
    pub queue_capacity: usize,
    /// Upper bound on concurrent virtual connections
    pub max_connections: usize,
}

pub const DEFAULT_QUIC_PORT: u16 = 8751;
pub const DEFAULT_TCP_PORT: u16 = 8751;
pub const DEFAULT_UDP_PORT: u16 = 8752;
pub const DEFAULT_CSR_RELAY: SocketAddr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 7878));

const MAX_UDP_BATCH_TIMEOUT_MS: u64 = 60_000;
const MAX_UDP_BUFFER: usize = 262_144;
const MAX_TCP_PAYLOAD: usize = 8192;

impl Default for NetProxySettings {
    fn default() -> Self {
        NetProxySettings {
            proxy_id: 1,
            internal_ip: Ipv4Addr::UNSPECIFIED,
            external_ip: Ipv4Addr::UNSPECIFIED,
            ports: ProxyPorts {
                quic: DEFAULT_QUIC_PORT,
                tcp: DEFAULT_TCP_PORT,
                udp: DEFAULT_UDP_PORT,
            },
            enabled_connectors: ConnectorKind::ALL.into_iter().collect(),
            csr_relay: DEFAULT_CSR_RELAY,
            mtu: 1500,
            max_tcp_payload: 1024,
            max_unacked_bytes: 536,
            tcp_window: 65535,
            synchronize_handshake: true,
            ignore_time_wait: false,
            ignore_teardown_timing: false,
            syn_sent_failure: Duration::from_millis(60_000),
            dup_ack_interval: Duration::from_millis(1_000),
            establishment_timeout: Duration::from_millis(30_000),
            idle_reset: Duration::from_millis(600_000),
            msl: Duration::from_millis(2_000),
            udp_batch_timeout: Duration::ZERO,
            udp_batch_threshold: 1024,
            udp_rate_limit: 0,
            udp_buffer_size: 16_384,
            auto_reconnect_interval: Duration::from_millis(30_000),
            broadcast_policy: BroadcastPolicy::None,
            queue_capacity: 4096,
            max_connections: 65_000,
        }
    }
}

impl NetProxySettings {
    /// Apply one `Key=Value` line; unknown keys are reported and skipped
    pub fn apply_line(&mut self, line: &str) -> Result<(), ConfigError> {
        let Some(line) = content(line) else {
            return Ok(());
        };
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| ConfigError::new(format!("expected Key=Value, got '{}'", line)))?;
        let (key, value) = (key.trim(), value.trim());
        let bad = || ConfigError::new(format!("bad value '{}' for {}", value, key));
        let ms = || value.parse::<u64>().map(Duration::from_millis).map_err(|_| bad());

        match key.to_ascii_lowercase().as_str() {
            "uniqueid" => self.proxy_id = parse_proxy_id(value)?,
            "internalip" => self.internal_ip = value.parse().map_err(|_| bad())?,
            "externalip" => self.external_ip = value.parse().map_err(|_| bad())?,
            "quicport" | "mocketsport" => self.ports.quic = value.parse().map_err(|_| bad())?,
            "tcpport" => self.ports.tcp = value.parse().map_err(|_| bad())?,
            "udpport" => self.ports.udp = value.parse().map_err(|_| bad())?,
            "csrrelay" => self.csr_relay = value.parse().map_err(|_| bad())?,
            "mtu" => self.mtu = value.parse().map_err(|_| bad())?,
            "enabledconnectors" => {
                let mut set = BTreeSet::new();
                for name in value.split(',').filter(|n| !n.trim().is_empty()) {
                    set.insert(ConnectorKind::from_name(name).ok_or_else(bad)?);
                }
                self.enabled_connectors = set;
            }
            "maxtcpdatapayload" => {
                self.max_tcp_payload = value.parse::<usize>().map_err(|_| bad())?.clamp(1, MAX_TCP_PAYLOAD)
            }
            "maxunackeddata" => self.max_unacked_bytes = value.parse().map_err(|_| bad())?,
            "tcpwindow" => self.tcp_window = value.parse().map_err(|_| bad())?,
            "synchronizehandshake" => self.synchronize_handshake = parse_bool(value).ok_or_else(bad)?,
            "ignoretimewait" => self.ignore_time_wait = parse_bool(value).ok_or_else(bad)?,
            "ignoreteardowntiming" => self.ignore_teardown_timing = parse_bool(value).ok_or_else(bad)?,
            "synsentfailuretimeout" => self.syn_sent_failure = ms()?,
            "dupackinterval" => self.dup_ack_interval = ms()?,
            "establishmenttimeout" => self.establishment_timeout = ms()?,
            "idletimeout" => self.idle_reset = ms()?,
            "msl" => self.msl = ms()?,
            "udpbatchingtimeout" => {
                self.udp_batch_timeout = ms()?.min(Duration::from_millis(MAX_UDP_BATCH_TIMEOUT_MS))
            }
            "udpbatchingthreshold" => self.udp_batch_threshold = value.parse().map_err(|_| bad())?,
            "udpthroughputlimit" => self.udp_rate_limit = value.parse().map_err(|_| bad())?,
            "udpbuffersize" => {
                self.udp_buffer_size = value.parse::<usize>().map_err(|_| bad())?.min(MAX_UDP_BUFFER)
            }
            "autoreconnectinterval" => self.auto_reconnect_interval = ms()?,
            "broadcastforwarding" => {
                self.broadcast_policy = match value.to_ascii_lowercase().as_str() {
                    "none" => BroadcastPolicy::None,
                    "all" => BroadcastPolicy::AllProxies,
                    list => BroadcastPolicy::List(
                        list.split(',')
                            .map(parse_proxy_id)
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                }
            }
            "queuecapacity" => self.queue_capacity = value.parse::<usize>().map_err(|_| bad())?.max(1),
            "maxconnections" => self.max_connections = value.parse::<usize>().map_err(|_| bad())?.max(1),
            other => log::warn!("unknown setting '{}'; ignored", other),
        }
        Ok(())
    }

    /// Build settings from `netproxy.cfg` contents
    pub fn from_lines<'a, I>(lines: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let mut settings = NetProxySettings::default();
        for (i, line) in lines.into_iter().enumerate() {
            settings.apply_line(line).map_err(|e| e.at_line(i + 1))?;
        }
        Ok(settings)
    }

    pub fn time_wait(&self) -> Duration {
        self.msl * 2
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CompressionAlgorithm, TransportMode};

    #[test]
    fn test_endpoint_line() {
        let e = EndpointConfigEntry::parse_line(
            "192.168.1.*:* 10.0.*.*:* icmp=udp;tcp=quicrs;udp=quicuu;tcpcompression=zlib:4;udpcompression=lzma:2",
        )
        .unwrap()
        .unwrap();
        assert_eq!(e.tcp.protocol, ProxyProtocol::Quic(Some(TransportMode::ReliableSequenced)));
        assert_eq!(e.udp.protocol, ProxyProtocol::Quic(Some(TransportMode::UnreliableUnsequenced)));
        assert_eq!(e.tcp.compression, CompressionSetting::new(CompressionAlgorithm::Zlib, 4));
        assert_eq!(e.udp.compression.algorithm, CompressionAlgorithm::Lzma);
        assert_eq!(e.tunnel, None);

        let t = EndpointConfigEntry::parse_line("10.0.0.1 10.1.0.1 tunnel=udp").unwrap().unwrap();
        assert_eq!(t.tunnel, Some(ProxyProtocol::Udp));
        assert_eq!(t.tcp, ProtocolSetting::default_tcp());

        assert!(EndpointConfigEntry::parse_line("  # comment").unwrap().is_none());
        assert!(EndpointConfigEntry::parse_line("10.0.0.1").is_err());
        assert!(EndpointConfigEntry::parse_line("10.0.0.1 10.0.0.2 tcp=sctp").is_err());
    }

    #[test]
    fn test_endpoint_table_defaults() {
        let mut table = EndpointTable::new();
        table.push(
            EndpointConfigEntry::parse_line("192.168.1.*:* 10.0.0.*:80 tcp=csr")
                .unwrap()
                .unwrap(),
        );
        let src = Ipv4Addr::new(192, 168, 1, 4);
        let dst = Ipv4Addr::new(10, 0, 0, 9);
        assert_eq!(
            table.map_addr_to_protocol(src, 4000, dst, 80, FlowProtocol::Tcp).protocol,
            ProxyProtocol::Csr(Some(TransportMode::ReliableSequenced))
        );
        assert_eq!(
            table.map_addr_to_protocol(src, 4000, dst, 81, FlowProtocol::Tcp),
            ProtocolSetting::default_tcp()
        );
        assert_eq!(
            table.map_addr_to_protocol(src, 0, dst, 0, FlowProtocol::Icmp).protocol,
            ProxyProtocol::Udp
        );
    }

    #[test]
    fn test_unique_id_line() {
        let e = UniqueIdEntry::parse_line(
            "172.16.0.2 42 quicport=9000 udpport=9001 autoconnect=quic;udp reconnectinterval=5000 connectivity=active",
        )
        .unwrap()
        .unwrap();
        assert_eq!(e.info.id, 42);
        assert_eq!(e.info.address, Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(e.info.ports.quic, 9000);
        assert_eq!(e.info.ports.tcp, DEFAULT_TCP_PORT);
        assert_eq!(e.info.ports.udp, 9001);
        assert_eq!(e.auto_connect, vec![ConnectorKind::Quic, ConnectorKind::Udp]);
        assert_eq!(e.reconnect_interval, Some(Duration::from_millis(5000)));
        assert!(e.info.remote_reachable_from_local);
        assert!(!e.info.local_reachable_from_remote);
    }

    #[test]
    fn test_unique_id_defaults_and_settings_file() {
        let e = UniqueIdEntry::parse_line("10.9.8.7 proxy-b.cfg").unwrap().unwrap();
        assert_eq!(e.info.id, u32::from(Ipv4Addr::new(10, 9, 8, 7)));
        assert_eq!(e.info.settings_file.as_deref(), Some("proxy-b.cfg"));
        assert_eq!(e.info.connectivity(), Some(Connectivity::Bidirectional));

        let e = UniqueIdEntry::parse_line("10.9.8.7 7 localreachability=false remotereachability=false")
            .unwrap()
            .unwrap();
        assert!(e.info.reachability_unspecified());
        assert!(UniqueIdEntry::parse_line("10.9.8.7 0").is_err());
        assert!(UniqueIdEntry::parse_line("not-an-ip 3").is_err());
    }

    #[test]
    fn test_mapping_and_arp_lines() {
        let (range, id) = parse_address_mapping_line("10.0.0.1-10.0.0.5:80-90 0.0.0.7").unwrap().unwrap();
        assert!(range.contains(Ipv4Addr::new(10, 0, 0, 2), 80));
        assert_eq!(id, 7);
        assert!(parse_address_mapping_line("10.0.0.1 4294967295").is_err());
        assert!(parse_address_mapping_line("").unwrap().is_none());

        let (ip, mac) = parse_static_arp_line("10.0.0.1 00:11:22:33:44:55").unwrap().unwrap();
        assert_eq!(ip, Ipv4Addr::new(10, 0, 0, 1));
        assert_eq!(mac, MacAddr([0, 0x11, 0x22, 0x33, 0x44, 0x55]));
        assert!(parse_static_arp_line("10.0.0.1").is_err());
    }

    #[test]
    fn test_settings_clamped() {
        let s = NetProxySettings::from_lines([
            "UDPBatchingTimeout=999999",
            "UDPBufferSize=10000000",
            "IgnoreTimeWait=true",
            "BroadcastForwarding=3,4",
            "# comment",
        ])
        .unwrap();
        assert_eq!(s.udp_batch_timeout, Duration::from_millis(60_000));
        assert_eq!(s.udp_buffer_size, 262_144);
        assert!(s.ignore_time_wait);
        assert_eq!(s.broadcast_policy, BroadcastPolicy::List(vec![3, 4]));
        assert_eq!(s.time_wait(), Duration::from_millis(4000));

        let err = NetProxySettings::from_lines(["MSL=abc"]).unwrap_err();
        assert_eq!(err.line, 1);
    }
}
