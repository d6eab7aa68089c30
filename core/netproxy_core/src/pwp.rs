//! Proxy Wire Protocol (PWP)
//!
//! Messages exchanged between NetProxy instances. Every message starts with a
//! 10-byte common header followed by fixed per-variant fields and, for data
//! carriers, a payload whose length is declared in the fixed fields.
//!
//! ```text
//!  0        1          2               6               10
//! +--------+----------+---------------+---------------+------------------+---------+
//! | R|type | protocol |   source IP   | destination IP| variant fields   | payload |
//! +--------+----------+---------------+---------------+------------------+---------+
//!   R = 0x80 reachability flag, type = low nibble
//! ```
//!
//! All integers are big-endian. A frame is valid only if its length is
//! exactly `header_size(variant) + payload_len`; this is the integrity check
//! for frames arriving over UDP.

use std::fmt;
use std::net::Ipv4Addr;

use crate::protocol::{CompressionSetting, ProxyProtocol};

// ============================================================================
// Constants
// ============================================================================

/// Size of the header shared by every message
pub const COMMON_HEADER_LEN: usize = 10;

/// Largest payload a single message can declare
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

const TYPE_MASK: u8 = 0x0F;
const REACHABILITY_FLAG: u8 = 0x80;

const PORTS_LEN: usize = 6;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PwpError {
    /// Fewer bytes than the fixed part of the message requires
    Truncated { needed: usize, available: usize },
    /// Frame length differs from header + declared payload
    LengthMismatch { expected: usize, actual: usize },
    /// Unknown message type nibble or reserved bits set
    InvalidType(u8),
    /// Unknown protocol byte
    InvalidProtocol(u8),
    /// Compression byte with unknown algorithm or level > 9
    InvalidCompression(u8),
    /// Payload does not fit the 16-bit length field
    PayloadTooLarge(usize),
    /// Packed UDP datagrams inconsistent with the declared count
    InvalidDatagrams(&'static str),
}

impl fmt::Display for PwpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PwpError::Truncated { needed, available } => {
                write!(f, "truncated message: need {} bytes, have {}", needed, available)
            }
            PwpError::LengthMismatch { expected, actual } => {
                write!(f, "length mismatch: expected {} bytes, got {}", expected, actual)
            }
            PwpError::InvalidType(t) => write!(f, "invalid message type byte 0x{:02X}", t),
            PwpError::InvalidProtocol(p) => write!(f, "invalid protocol byte 0x{:02X}", p),
            PwpError::InvalidCompression(c) => write!(f, "invalid compression byte 0x{:02X}", c),
            PwpError::PayloadTooLarge(n) => write!(f, "payload too large: {} bytes", n),
            PwpError::InvalidDatagrams(why) => write!(f, "invalid packed datagrams: {}", why),
        }
    }
}

impl std::error::Error for PwpError {}

// ============================================================================
// Message Types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    InitializeConnection = 0,
    ConnectionInitialized = 1,
    IcmpMessage = 2,
    UdpUnicastData = 3,
    MultipleUdpDatagrams = 4,
    UdpBCastMCastData = 5,
    TcpOpenConnection = 6,
    TcpConnectionOpened = 7,
    TcpData = 8,
    TcpCloseConnection = 9,
    TcpResetConnection = 10,
    TunnelPacket = 11,
    ConnectionError = 12,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<Self> {
        use MessageType::*;
        Some(match v {
            0 => InitializeConnection,
            1 => ConnectionInitialized,
            2 => IcmpMessage,
            3 => UdpUnicastData,
            4 => MultipleUdpDatagrams,
            5 => UdpBCastMCastData,
            6 => TcpOpenConnection,
            7 => TcpConnectionOpened,
            8 => TcpData,
            9 => TcpCloseConnection,
            10 => TcpResetConnection,
            11 => TunnelPacket,
            12 => ConnectionError,
            _ => return None,
        })
    }

    /// Bytes before the payload: common header plus fixed fields
    pub fn header_size(&self) -> usize {
        use MessageType::*;
        COMMON_HEADER_LEN
            + match self {
                InitializeConnection | ConnectionInitialized => 4 + PORTS_LEN,
                IcmpMessage => 1 + 1 + 4 + 4 + PORTS_LEN + 1 + 2,
                UdpUnicastData => 4 + 1 + 1 + 2,
                MultipleUdpDatagrams => 4 + 1 + 1 + 2,
                UdpBCastMCastData => 4 + 1 + 2,
                TcpOpenConnection => 2 + 2 + 2 + 4 + PORTS_LEN + 1,
                TcpConnectionOpened => 2 + 2 + 4 + PORTS_LEN + 1,
                TcpData => 2 + 2 + 1 + 2,
                TcpCloseConnection | TcpResetConnection => 2 + 2,
                TunnelPacket => 2,
                ConnectionError => 4 + 4,
            }
    }

    /// Offset of the 16-bit payload length field, for variable-length variants
    fn payload_len_offset(&self) -> Option<usize> {
        use MessageType::*;
        match self {
            IcmpMessage | UdpUnicastData | MultipleUdpDatagrams | UdpBCastMCastData | TcpData
            | TunnelPacket => Some(self.header_size() - 2),
            _ => None,
        }
    }
}

// ============================================================================
// Message Model
// ============================================================================

/// Listening ports a NetProxy advertises, one per transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyPorts {
    pub quic: u16,
    pub tcp: u16,
    pub udp: u16,
}

/// A decoded PWP message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMessage {
    /// Protocol the sender used (or wants used) for this flow
    pub protocol: ProxyProtocol,
    /// Whether the sender is reachable from the receiver
    pub reachable: bool,
    pub source: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub body: MessageBody,
}

/// Variant-specific content of a message
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageBody {
    InitializeConnection {
        proxy_id: u32,
        ports: ProxyPorts,
    },
    ConnectionInitialized {
        proxy_id: u32,
        ports: ProxyPorts,
    },
    Icmp {
        icmp_type: u8,
        code: u8,
        rest_of_header: u32,
        proxy_id: u32,
        ports: ProxyPorts,
        ttl: u8,
        payload: Vec<u8>,
    },
    /// One UDP datagram (UDP header included in the payload)
    UdpUnicastData {
        proxy_id: u32,
        ttl: u8,
        compression: CompressionSetting,
        payload: Vec<u8>,
    },
    /// Several UDP datagrams packed with [`pack_datagrams`]
    MultipleUdpDatagrams {
        proxy_id: u32,
        count: u8,
        compression: CompressionSetting,
        payload: Vec<u8>,
    },
    UdpBCastMCastData {
        proxy_id: u32,
        compression: CompressionSetting,
        payload: Vec<u8>,
    },
    TcpOpenConnection {
        local_id: u16,
        local_port: u16,
        remote_port: u16,
        proxy_id: u32,
        ports: ProxyPorts,
        compression: CompressionSetting,
    },
    TcpConnectionOpened {
        local_id: u16,
        remote_id: u16,
        proxy_id: u32,
        ports: ProxyPorts,
        compression: CompressionSetting,
    },
    TcpData {
        local_id: u16,
        remote_id: u16,
        flags: u8,
        payload: Vec<u8>,
    },
    TcpCloseConnection {
        local_id: u16,
        remote_id: u16,
    },
    TcpResetConnection {
        local_id: u16,
        remote_id: u16,
    },
    /// An entire IP packet
    TunnelPacket {
        payload: Vec<u8>,
    },
    ConnectionError {
        local_proxy_id: u32,
        remote_proxy_id: u32,
    },
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::InitializeConnection { .. } => MessageType::InitializeConnection,
            MessageBody::ConnectionInitialized { .. } => MessageType::ConnectionInitialized,
            MessageBody::Icmp { .. } => MessageType::IcmpMessage,
            MessageBody::UdpUnicastData { .. } => MessageType::UdpUnicastData,
            MessageBody::MultipleUdpDatagrams { .. } => MessageType::MultipleUdpDatagrams,
            MessageBody::UdpBCastMCastData { .. } => MessageType::UdpBCastMCastData,
            MessageBody::TcpOpenConnection { .. } => MessageType::TcpOpenConnection,
            MessageBody::TcpConnectionOpened { .. } => MessageType::TcpConnectionOpened,
            MessageBody::TcpData { .. } => MessageType::TcpData,
            MessageBody::TcpCloseConnection { .. } => MessageType::TcpCloseConnection,
            MessageBody::TcpResetConnection { .. } => MessageType::TcpResetConnection,
            MessageBody::TunnelPacket { .. } => MessageType::TunnelPacket,
            MessageBody::ConnectionError { .. } => MessageType::ConnectionError,
        }
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            MessageBody::Icmp { payload, .. }
            | MessageBody::UdpUnicastData { payload, .. }
            | MessageBody::MultipleUdpDatagrams { payload, .. }
            | MessageBody::UdpBCastMCastData { payload, .. }
            | MessageBody::TcpData { payload, .. }
            | MessageBody::TunnelPacket { payload } => payload,
            _ => &[],
        }
    }

    /// Sender-side virtual circuit id for per-flow TCP messages
    pub fn circuit_id(&self) -> Option<u16> {
        match self {
            MessageBody::TcpOpenConnection { local_id, .. }
            | MessageBody::TcpConnectionOpened { local_id, .. }
            | MessageBody::TcpData { local_id, .. }
            | MessageBody::TcpCloseConnection { local_id, .. }
            | MessageBody::TcpResetConnection { local_id, .. } => Some(*local_id),
            _ => None,
        }
    }

    pub fn is_reset(&self) -> bool {
        matches!(self, MessageBody::TcpResetConnection { .. })
    }
}

impl ProxyMessage {
    pub fn new(protocol: ProxyProtocol, source: Ipv4Addr, destination: Ipv4Addr, body: MessageBody) -> Self {
        ProxyMessage {
            protocol,
            reachable: true,
            source,
            destination,
            body,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    /// Exact encoded size
    pub fn encoded_len(&self) -> usize {
        self.message_type().header_size() + self.body.payload().len()
    }
}

// ============================================================================
// Encoding
// ============================================================================

/// Encode a message into its wire form
pub fn encode(msg: &ProxyMessage) -> Result<Vec<u8>, PwpError> {
    let payload_len = msg.body.payload().len();
    if payload_len > MAX_PAYLOAD_LEN {
        return Err(PwpError::PayloadTooLarge(payload_len));
    }

    let mut w = Vec::with_capacity(msg.encoded_len());
    let ty = msg.message_type() as u8;
    w.push(if msg.reachable { ty | REACHABILITY_FLAG } else { ty });
    w.push(msg.protocol.to_byte());
    w.extend_from_slice(&msg.source.octets());
    w.extend_from_slice(&msg.destination.octets());

    match &msg.body {
        MessageBody::InitializeConnection { proxy_id, ports }
        | MessageBody::ConnectionInitialized { proxy_id, ports } => {
            put_u32(&mut w, *proxy_id);
            put_ports(&mut w, ports);
        }
        MessageBody::Icmp {
            icmp_type,
            code,
            rest_of_header,
            proxy_id,
            ports,
            ttl,
            payload,
        } => {
            w.push(*icmp_type);
            w.push(*code);
            put_u32(&mut w, *rest_of_header);
            put_u32(&mut w, *proxy_id);
            put_ports(&mut w, ports);
            w.push(*ttl);
            put_payload(&mut w, payload);
        }
        MessageBody::UdpUnicastData {
            proxy_id,
            ttl,
            compression,
            payload,
        } => {
            put_u32(&mut w, *proxy_id);
            w.push(*ttl);
            w.push(compression.to_byte());
            put_payload(&mut w, payload);
        }
        MessageBody::MultipleUdpDatagrams {
            proxy_id,
            count,
            compression,
            payload,
        } => {
            put_u32(&mut w, *proxy_id);
            w.push(*count);
            w.push(compression.to_byte());
            put_payload(&mut w, payload);
        }
        MessageBody::UdpBCastMCastData {
            proxy_id,
            compression,
            payload,
        } => {
            put_u32(&mut w, *proxy_id);
            w.push(compression.to_byte());
            put_payload(&mut w, payload);
        }
        MessageBody::TcpOpenConnection {
            local_id,
            local_port,
            remote_port,
            proxy_id,
            ports,
            compression,
        } => {
            put_u16(&mut w, *local_id);
            put_u16(&mut w, *local_port);
            put_u16(&mut w, *remote_port);
            put_u32(&mut w, *proxy_id);
            put_ports(&mut w, ports);
            w.push(compression.to_byte());
        }
        MessageBody::TcpConnectionOpened {
            local_id,
            remote_id,
            proxy_id,
            ports,
            compression,
        } => {
            put_u16(&mut w, *local_id);
            put_u16(&mut w, *remote_id);
            put_u32(&mut w, *proxy_id);
            put_ports(&mut w, ports);
            w.push(compression.to_byte());
        }
        MessageBody::TcpData {
            local_id,
            remote_id,
            flags,
            payload,
        } => {
            put_u16(&mut w, *local_id);
            put_u16(&mut w, *remote_id);
            w.push(*flags);
            put_payload(&mut w, payload);
        }
        MessageBody::TcpCloseConnection { local_id, remote_id }
        | MessageBody::TcpResetConnection { local_id, remote_id } => {
            put_u16(&mut w, *local_id);
            put_u16(&mut w, *remote_id);
        }
        MessageBody::TunnelPacket { payload } => {
            put_payload(&mut w, payload);
        }
        MessageBody::ConnectionError {
            local_proxy_id,
            remote_proxy_id,
        } => {
            put_u32(&mut w, *local_proxy_id);
            put_u32(&mut w, *remote_proxy_id);
        }
    }

    debug_assert_eq!(w.len(), msg.encoded_len());
    Ok(w)
}

fn put_u16(w: &mut Vec<u8>, v: u16) {
    w.extend_from_slice(&v.to_be_bytes());
}

fn put_u32(w: &mut Vec<u8>, v: u32) {
    w.extend_from_slice(&v.to_be_bytes());
}

fn put_ports(w: &mut Vec<u8>, p: &ProxyPorts) {
    put_u16(w, p.quic);
    put_u16(w, p.tcp);
    put_u16(w, p.udp);
}

fn put_payload(w: &mut Vec<u8>, payload: &[u8]) {
    put_u16(w, payload.len() as u16);
    w.extend_from_slice(payload);
}

// ============================================================================
// Decoding
// ============================================================================

/// Total length of the message at the start of `buf`
///
/// Returns `Ok(None)` when more bytes are needed to tell. Used to cut
/// messages out of a byte stream.
pub fn frame_length(buf: &[u8]) -> Result<Option<usize>, PwpError> {
    let Some(&first) = buf.first() else {
        return Ok(None);
    };
    let ty = parse_type(first)?;
    let header = ty.header_size();
    match ty.payload_len_offset() {
        None => Ok(Some(header)),
        Some(off) => {
            if buf.len() < off + 2 {
                return Ok(None);
            }
            let len = u16::from_be_bytes([buf[off], buf[off + 1]]) as usize;
            Ok(Some(header + len))
        }
    }
}

/// Decode exactly one message occupying all of `buf`
pub fn decode(buf: &[u8]) -> Result<ProxyMessage, PwpError> {
    let mut r = Reader::new(buf);
    let first = r.u8()?;
    let ty = parse_type(first)?;
    let reachable = first & REACHABILITY_FLAG != 0;

    if buf.len() < ty.header_size() {
        return Err(PwpError::Truncated {
            needed: ty.header_size(),
            available: buf.len(),
        });
    }

    let proto_byte = r.u8()?;
    let protocol = ProxyProtocol::from_byte(proto_byte).ok_or(PwpError::InvalidProtocol(proto_byte))?;
    let source = r.ipv4()?;
    let destination = r.ipv4()?;

    let body = match ty {
        MessageType::InitializeConnection => MessageBody::InitializeConnection {
            proxy_id: r.u32()?,
            ports: r.ports()?,
        },
        MessageType::ConnectionInitialized => MessageBody::ConnectionInitialized {
            proxy_id: r.u32()?,
            ports: r.ports()?,
        },
        MessageType::IcmpMessage => {
            let icmp_type = r.u8()?;
            let code = r.u8()?;
            let rest_of_header = r.u32()?;
            let proxy_id = r.u32()?;
            let ports = r.ports()?;
            let ttl = r.u8()?;
            MessageBody::Icmp {
                icmp_type,
                code,
                rest_of_header,
                proxy_id,
                ports,
                ttl,
                payload: r.payload()?,
            }
        }
        MessageType::UdpUnicastData => {
            let proxy_id = r.u32()?;
            let ttl = r.u8()?;
            let compression = r.compression()?;
            MessageBody::UdpUnicastData {
                proxy_id,
                ttl,
                compression,
                payload: r.payload()?,
            }
        }
        MessageType::MultipleUdpDatagrams => {
            let proxy_id = r.u32()?;
            let count = r.u8()?;
            let compression = r.compression()?;
            MessageBody::MultipleUdpDatagrams {
                proxy_id,
                count,
                compression,
                payload: r.payload()?,
            }
        }
        MessageType::UdpBCastMCastData => {
            let proxy_id = r.u32()?;
            let compression = r.compression()?;
            MessageBody::UdpBCastMCastData {
                proxy_id,
                compression,
                payload: r.payload()?,
            }
        }
        MessageType::TcpOpenConnection => MessageBody::TcpOpenConnection {
            local_id: r.u16()?,
            local_port: r.u16()?,
            remote_port: r.u16()?,
            proxy_id: r.u32()?,
            ports: r.ports()?,
            compression: r.compression()?,
        },
        MessageType::TcpConnectionOpened => MessageBody::TcpConnectionOpened {
            local_id: r.u16()?,
            remote_id: r.u16()?,
            proxy_id: r.u32()?,
            ports: r.ports()?,
            compression: r.compression()?,
        },
        MessageType::TcpData => {
            let local_id = r.u16()?;
            let remote_id = r.u16()?;
            let flags = r.u8()?;
            MessageBody::TcpData {
                local_id,
                remote_id,
                flags,
                payload: r.payload()?,
            }
        }
        MessageType::TcpCloseConnection => MessageBody::TcpCloseConnection {
            local_id: r.u16()?,
            remote_id: r.u16()?,
        },
        MessageType::TcpResetConnection => MessageBody::TcpResetConnection {
            local_id: r.u16()?,
            remote_id: r.u16()?,
        },
        MessageType::TunnelPacket => MessageBody::TunnelPacket { payload: r.payload()? },
        MessageType::ConnectionError => MessageBody::ConnectionError {
            local_proxy_id: r.u32()?,
            remote_proxy_id: r.u32()?,
        },
    };

    if r.pos != buf.len() {
        return Err(PwpError::LengthMismatch {
            expected: r.pos,
            actual: buf.len(),
        });
    }

    Ok(ProxyMessage {
        protocol,
        reachable,
        source,
        destination,
        body,
    })
}

fn parse_type(first: u8) -> Result<MessageType, PwpError> {
    if first & !(TYPE_MASK | REACHABILITY_FLAG) != 0 {
        return Err(PwpError::InvalidType(first));
    }
    MessageType::from_u8(first & TYPE_MASK).ok_or(PwpError::InvalidType(first))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], PwpError> {
        if self.pos + n > self.buf.len() {
            return Err(PwpError::Truncated {
                needed: self.pos + n,
                available: self.buf.len(),
            });
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8, PwpError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, PwpError> {
        let b = self.take(2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn u32(&mut self) -> Result<u32, PwpError> {
        let b = self.take(4)?;
        Ok(u32::from_be_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn ipv4(&mut self) -> Result<Ipv4Addr, PwpError> {
        let b = self.take(4)?;
        Ok(Ipv4Addr::new(b[0], b[1], b[2], b[3]))
    }

    fn ports(&mut self) -> Result<ProxyPorts, PwpError> {
        Ok(ProxyPorts {
            quic: self.u16()?,
            tcp: self.u16()?,
            udp: self.u16()?,
        })
    }

    fn compression(&mut self) -> Result<CompressionSetting, PwpError> {
        let b = self.u8()?;
        CompressionSetting::from_byte(b).ok_or(PwpError::InvalidCompression(b))
    }

    /// Read the 16-bit length and the payload; the payload must end the frame
    fn payload(&mut self) -> Result<Vec<u8>, PwpError> {
        let len = self.u16()? as usize;
        let expected = self.pos + len;
        if expected != self.buf.len() {
            return Err(PwpError::LengthMismatch {
                expected,
                actual: self.buf.len(),
            });
        }
        Ok(self.take(len)?.to_vec())
    }
}

// ============================================================================
// Packed UDP Datagrams
// ============================================================================

/// Pack `(ttl, udp_datagram)` pairs into a MultipleUDPDatagrams payload
///
/// Each datagram must include its UDP header; its length field delimits it.
pub fn pack_datagrams<'a, I>(datagrams: I) -> Vec<u8>
where
    I: IntoIterator<Item = (u8, &'a [u8])>,
{
    let mut out = Vec::new();
    for (ttl, dgram) in datagrams {
        out.push(ttl);
        out.extend_from_slice(dgram);
    }
    out
}

/// Inverse of [`pack_datagrams`]
pub fn unpack_datagrams(payload: &[u8], count: u8) -> Result<Vec<(u8, Vec<u8>)>, PwpError> {
    let mut out = Vec::with_capacity(count as usize);
    let mut pos = 0;
    while pos < payload.len() {
        if payload.len() < pos + 1 + 8 {
            return Err(PwpError::InvalidDatagrams("truncated UDP header"));
        }
        let ttl = payload[pos];
        let udp = &payload[pos + 1..];
        let udp_len = u16::from_be_bytes([udp[4], udp[5]]) as usize;
        if udp_len < 8 || udp_len > udp.len() {
            return Err(PwpError::InvalidDatagrams("bad UDP length"));
        }
        out.push((ttl, udp[..udp_len].to_vec()));
        pos += 1 + udp_len;
    }
    if out.len() != count as usize {
        return Err(PwpError::InvalidDatagrams("count mismatch"));
    }
    Ok(out)
}

// ============================================================================
// Tests
// ============================================================================
