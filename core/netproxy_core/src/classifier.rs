//! Frame classification
//!
//! Turns a raw Ethernet frame into a borrowed, typed view: ARP, or IPv4
//! carrying TCP, UDP or ICMP. Anything else is reported as a
//! [`DispatchError`] for the caller to log and drop.

use std::fmt;
use std::net::Ipv4Addr;

use etherparse::{Ethernet2HeaderSlice, Ipv4HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};

use crate::arc::MacAddr;
use crate::connection_table::TableError;
use crate::packet::{
    ARP_PACKET_LEN, ETHERNET_HEADER_LEN, ETHERTYPE_ARP, ETHERTYPE_IPV4, ICMP_HEADER_LEN, IP_PROTO_ICMP,
    IP_PROTO_TCP, IP_PROTO_UDP,
};
use crate::pwp::PwpError;
use crate::registry::RouteError;
use crate::tcp::Segment;

// ============================================================================
// Errors
// ============================================================================

/// Why a frame or message was not handled
#[derive(Debug)]
pub enum DispatchError {
    /// Frame or packet failed to parse
    Malformed(String),
    UnsupportedEtherType(u16),
    UnsupportedProtocol(u8),
    /// IPv4 fragments are not reassembled
    Fragmented,
    /// Destination is not covered by any address mapping
    NotMapped(Ipv4Addr),
    Route(RouteError),
    Table(TableError),
    Pwp(PwpError),
    /// An egress queue is full or closed
    QueueUnavailable,
}

impl fmt::Display for DispatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DispatchError::Malformed(e) => write!(f, "malformed packet: {}", e),
            DispatchError::UnsupportedEtherType(t) => write!(f, "unsupported ethertype 0x{:04x}", t),
            DispatchError::UnsupportedProtocol(p) => write!(f, "unsupported IP protocol {}", p),
            DispatchError::Fragmented => write!(f, "fragmented IPv4 packet"),
            DispatchError::NotMapped(ip) => write!(f, "no remote proxy mapped for {}", ip),
            DispatchError::Route(e) => write!(f, "route error: {}", e),
            DispatchError::Table(e) => write!(f, "connection table: {}", e),
            DispatchError::Pwp(e) => write!(f, "wire protocol: {}", e),
            DispatchError::QueueUnavailable => write!(f, "egress queue unavailable"),
        }
    }
}

impl std::error::Error for DispatchError {}

impl From<RouteError> for DispatchError {
    fn from(e: RouteError) -> Self {
        DispatchError::Route(e)
    }
}

impl From<TableError> for DispatchError {
    fn from(e: TableError) -> Self {
        DispatchError::Table(e)
    }
}

impl From<PwpError> for DispatchError {
    fn from(e: PwpError) -> Self {
        DispatchError::Pwp(e)
    }
}

// ============================================================================
// Views
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: u16,
    pub sender_mac: MacAddr,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr,
    pub target_ip: Ipv4Addr,
}

#[derive(Debug, Clone, Copy)]
pub struct TcpView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub segment: Segment<'a>,
}

#[derive(Debug, Clone, Copy)]
pub struct UdpView<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    /// Header and data, trimmed to the UDP length field
    pub datagram: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub struct IcmpView<'a> {
    pub icmp_type: u8,
    pub code: u8,
    pub rest_of_header: u32,
    pub data: &'a [u8],
}

#[derive(Debug, Clone, Copy)]
pub enum Transport<'a> {
    Tcp(TcpView<'a>),
    Udp(UdpView<'a>),
    Icmp(IcmpView<'a>),
}

#[derive(Debug, Clone, Copy)]
pub struct Ipv4Packet<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub ttl: u8,
    pub ident: u16,
    /// The whole IP packet, trimmed to its total length
    pub bytes: &'a [u8],
    pub transport: Transport<'a>,
}

#[derive(Debug, Clone, Copy)]
pub enum Frame<'a> {
    Arp(ArpPacket),
    Ipv4(Ipv4Packet<'a>),
}

#[derive(Debug, Clone, Copy)]
pub struct ClassifiedFrame<'a> {
    pub dst_mac: MacAddr,
    pub src_mac: MacAddr,
    pub frame: Frame<'a>,
}

// ============================================================================
// Parsing
// ============================================================================

fn malformed<E: fmt::Debug>(e: E) -> DispatchError {
    DispatchError::Malformed(format!("{:?}", e))
}

/// Classify an Ethernet II frame
pub fn classify(raw: &[u8]) -> Result<ClassifiedFrame<'_>, DispatchError> {
    let eth = Ethernet2HeaderSlice::from_slice(raw).map_err(malformed)?;
    let body = &raw[ETHERNET_HEADER_LEN..];
    let frame = match eth.ether_type() {
        ETHERTYPE_ARP => Frame::Arp(parse_arp(body)?),
        ETHERTYPE_IPV4 => Frame::Ipv4(parse_ipv4(body)?),
        other => return Err(DispatchError::UnsupportedEtherType(other)),
    };
    Ok(ClassifiedFrame {
        dst_mac: MacAddr(eth.destination()),
        src_mac: MacAddr(eth.source()),
        frame,
    })
}

pub fn parse_arp(body: &[u8]) -> Result<ArpPacket, DispatchError> {
    if body.len() < ARP_PACKET_LEN {
        return Err(DispatchError::Malformed(format!("ARP packet of {} bytes", body.len())));
    }
    let htype = u16::from_be_bytes([body[0], body[1]]);
    let ptype = u16::from_be_bytes([body[2], body[3]]);
    if htype != 1 || ptype != ETHERTYPE_IPV4 || body[4] != 6 || body[5] != 4 {
        return Err(DispatchError::Malformed(format!(
            "ARP for hardware {} / protocol 0x{:04x}",
            htype, ptype
        )));
    }
    let mac = |at: usize| {
        let mut m = [0u8; 6];
        m.copy_from_slice(&body[at..at + 6]);
        MacAddr(m)
    };
    let ip = |at: usize| Ipv4Addr::new(body[at], body[at + 1], body[at + 2], body[at + 3]);
    Ok(ArpPacket {
        op: u16::from_be_bytes([body[6], body[7]]),
        sender_mac: mac(8),
        sender_ip: ip(14),
        target_mac: mac(18),
        target_ip: ip(24),
    })
}

/// Parse an IPv4 packet and its transport header
pub fn parse_ipv4(packet: &[u8]) -> Result<Ipv4Packet<'_>, DispatchError> {
    let ip = Ipv4HeaderSlice::from_slice(packet).map_err(malformed)?;
    let total_len = ip.total_len() as usize;
    let header_len = ip.ihl() as usize * 4;
    if total_len < header_len || total_len > packet.len() {
        return Err(DispatchError::Malformed(format!(
            "IPv4 total length {} with {} bytes available",
            total_len,
            packet.len()
        )));
    }
    if ip.more_fragments() || ip.fragments_offset() != 0 {
        return Err(DispatchError::Fragmented);
    }

    let bytes = &packet[..total_len];
    let body = &bytes[header_len..];
    let transport = match ip.protocol() {
        IP_PROTO_TCP => Transport::Tcp(parse_tcp(body)?),
        IP_PROTO_UDP => Transport::Udp(parse_udp(body)?),
        IP_PROTO_ICMP => Transport::Icmp(parse_icmp(body)?),
        other => return Err(DispatchError::UnsupportedProtocol(other)),
    };

    Ok(Ipv4Packet {
        src: ip.source_addr(),
        dst: ip.destination_addr(),
        ttl: ip.ttl(),
        ident: ip.identification(),
        bytes,
        transport,
    })
}

fn parse_tcp(body: &[u8]) -> Result<TcpView<'_>, DispatchError> {
    let tcp = TcpHeaderSlice::from_slice(body).map_err(malformed)?;
    let data_offset = tcp.data_offset() as usize * 4;
    Ok(TcpView {
        src_port: tcp.source_port(),
        dst_port: tcp.destination_port(),
        segment: Segment {
            seq: tcp.sequence_number(),
            ack: tcp.acknowledgment_number(),
            flags: tcp.slice()[13],
            window: tcp.window_size(),
            payload: &body[data_offset..],
        },
    })
}

fn parse_udp(body: &[u8]) -> Result<UdpView<'_>, DispatchError> {
    let udp = UdpHeaderSlice::from_slice(body).map_err(malformed)?;
    let len = udp.length() as usize;
    if len < 8 || len > body.len() {
        return Err(DispatchError::Malformed(format!(
            "UDP length {} with {} bytes available",
            len,
            body.len()
        )));
    }
    Ok(UdpView {
        src_port: udp.source_port(),
        dst_port: udp.destination_port(),
        datagram: &body[..len],
    })
}

fn parse_icmp(body: &[u8]) -> Result<IcmpView<'_>, DispatchError> {
    if body.len() < ICMP_HEADER_LEN {
        return Err(DispatchError::Malformed(format!("ICMP message of {} bytes", body.len())));
    }
    Ok(IcmpView {
        icmp_type: body[0],
        code: body[1],
        rest_of_header: u32::from_be_bytes([body[4], body[5], body[6], body[7]]),
        data: &body[ICMP_HEADER_LEN..],
    })
}

impl<'a> UdpView<'a> {
    pub fn payload(&self) -> &'a [u8] {
        &self.datagram[8..]
    }
}

impl Ipv4Packet<'_> {
    /// Destination port for TCP/UDP, 0 for ICMP
    pub fn dst_port(&self) -> u16 {
        match &self.transport {
            Transport::Tcp(t) => t.dst_port,
            Transport::Udp(u) => u.dst_port,
            Transport::Icmp(_) => 0,
        }
    }

    pub fn src_port(&self) -> u16 {
        match &self.transport {
            Transport::Tcp(t) => t.src_port,
            Transport::Udp(u) => u.src_port,
            Transport::Icmp(_) => 0,
        }
    }

    pub fn is_broadcast_or_multicast(&self) -> bool {
        self.dst.is_broadcast() || self.dst.is_multicast() || self.dst.octets()[3] == 255
    }
}
