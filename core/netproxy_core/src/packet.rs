//! Packet building helpers
//!
//! Synthesizes the Ethernet/ARP/IPv4/TCP/UDP/ICMP packets NetProxy writes
//! to local hosts. Headers are written by hand without options.

use std::net::Ipv4Addr;

use crate::arc::MacAddr;

// ============================================================================
// Constants
// ============================================================================

pub const ETHERNET_HEADER_LEN: usize = 14;
pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;
pub const ICMP_HEADER_LEN: usize = 8;
pub const ARP_PACKET_LEN: usize = 28;

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

pub const IP_PROTO_ICMP: u8 = 1;
pub const IP_PROTO_TCP: u8 = 6;
pub const IP_PROTO_UDP: u8 = 17;

pub const ARP_OP_REQUEST: u16 = 1;
pub const ARP_OP_REPLY: u16 = 2;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

/// TCP header flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
    pub const URG: u8 = 0x20;
}

// ============================================================================
// Checksums
// ============================================================================

/// Internet checksum (RFC 1071)
pub fn ip_checksum(data: &[u8]) -> u16 {
    fold(sum_words(data, 0))
}

/// TCP/UDP checksum including the IPv4 pseudo header
pub fn transport_checksum(src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, segment: &[u8]) -> u16 {
    let mut pseudo = [0u8; 12];
    pseudo[0..4].copy_from_slice(&src.octets());
    pseudo[4..8].copy_from_slice(&dst.octets());
    pseudo[9] = protocol;
    pseudo[10..12].copy_from_slice(&(segment.len() as u16).to_be_bytes());
    fold(sum_words(segment, sum_words(&pseudo, 0)))
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    for i in (0..data.len()).step_by(2) {
        let word = if i + 1 < data.len() {
            ((data[i] as u32) << 8) | (data[i + 1] as u32)
        } else {
            (data[i] as u32) << 8
        };
        sum = sum.wrapping_add(word);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !sum as u16
}

// ============================================================================
// Ethernet / ARP
// ============================================================================

/// Prepend an Ethernet II header
pub fn wrap_ethernet(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETHERNET_HEADER_LEN + payload.len());
    frame.extend_from_slice(&dst.0);
    frame.extend_from_slice(&src.0);
    frame.extend_from_slice(&ethertype.to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}

/// Build an Ethernet/IPv4 ARP packet body
pub fn build_arp(
    op: u16,
    sender_mac: MacAddr,
    sender_ip: Ipv4Addr,
    target_mac: MacAddr,
    target_ip: Ipv4Addr,
) -> [u8; ARP_PACKET_LEN] {
    let mut p = [0u8; ARP_PACKET_LEN];
    p[0..2].copy_from_slice(&1u16.to_be_bytes()); // Ethernet
    p[2..4].copy_from_slice(&ETHERTYPE_IPV4.to_be_bytes());
    p[4] = 6;
    p[5] = 4;
    p[6..8].copy_from_slice(&op.to_be_bytes());
    p[8..14].copy_from_slice(&sender_mac.0);
    p[14..18].copy_from_slice(&sender_ip.octets());
    p[18..24].copy_from_slice(&target_mac.0);
    p[24..28].copy_from_slice(&target_ip.octets());
    p
}

// ============================================================================
// IPv4
// ============================================================================

/// Build an IPv4 packet with a 20-byte header and valid header checksum
pub fn build_ipv4_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    protocol: u8,
    ttl: u8,
    ident: u16,
    payload: &[u8],
) -> Vec<u8> {
    let total_len = IPV4_HEADER_LEN + payload.len();
    let mut packet = vec![0u8; total_len];

    packet[0] = 0x45; // Version 4, IHL 5
    packet[1] = 0x00;
    packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    packet[4..6].copy_from_slice(&ident.to_be_bytes());
    packet[6..8].copy_from_slice(&[0x00, 0x00]);
    packet[8] = ttl;
    packet[9] = protocol;
    packet[12..16].copy_from_slice(&src.octets());
    packet[16..20].copy_from_slice(&dst.octets());

    let checksum = ip_checksum(&packet[0..IPV4_HEADER_LEN]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());

    packet[IPV4_HEADER_LEN..].copy_from_slice(payload);
    packet
}

/// Rewrite the TTL of an IPv4 packet in place and fix the header checksum
pub fn set_ipv4_ttl(packet: &mut [u8], ttl: u8) {
    if packet.len() < IPV4_HEADER_LEN {
        return;
    }
    let ihl = ((packet[0] & 0x0F) as usize) * 4;
    if ihl < IPV4_HEADER_LEN || packet.len() < ihl {
        return;
    }
    packet[8] = ttl;
    packet[10] = 0;
    packet[11] = 0;
    let checksum = ip_checksum(&packet[..ihl]);
    packet[10..12].copy_from_slice(&checksum.to_be_bytes());
}

// ============================================================================
// TCP
// ============================================================================

/// Fields of a TCP segment to synthesize toward a local host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSegmentSpec<'a> {
    pub src_ip: Ipv4Addr,
    pub src_port: u16,
    pub dst_ip: Ipv4Addr,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

/// Build a complete IPv4/TCP packet with both checksums
pub fn build_tcp_packet(spec: &TcpSegmentSpec<'_>, ttl: u8, ident: u16) -> Vec<u8> {
    let mut seg = vec![0u8; TCP_HEADER_LEN + spec.payload.len()];
    seg[0..2].copy_from_slice(&spec.src_port.to_be_bytes());
    seg[2..4].copy_from_slice(&spec.dst_port.to_be_bytes());
    seg[4..8].copy_from_slice(&spec.seq.to_be_bytes());
    seg[8..12].copy_from_slice(&spec.ack.to_be_bytes());
    seg[12] = ((TCP_HEADER_LEN / 4) as u8) << 4;
    seg[13] = spec.flags;
    seg[14..16].copy_from_slice(&spec.window.to_be_bytes());
    seg[TCP_HEADER_LEN..].copy_from_slice(spec.payload);

    let checksum = transport_checksum(spec.src_ip, spec.dst_ip, IP_PROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&checksum.to_be_bytes());

    build_ipv4_packet(spec.src_ip, spec.dst_ip, IP_PROTO_TCP, ttl, ident, &seg)
}

// ============================================================================
// UDP
// ============================================================================

/// Build a UDP datagram (header + payload) with checksum
pub fn build_udp_datagram(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut dgram = vec![0u8; udp_len];
    dgram[0..2].copy_from_slice(&src_port.to_be_bytes());
    dgram[2..4].copy_from_slice(&dst_port.to_be_bytes());
    dgram[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    dgram[UDP_HEADER_LEN..].copy_from_slice(payload);

    let mut checksum = transport_checksum(src_ip, dst_ip, IP_PROTO_UDP, &dgram);
    if checksum == 0 {
        checksum = 0xFFFF;
    }
    dgram[6..8].copy_from_slice(&checksum.to_be_bytes());
    dgram
}

/// Build a complete IPv4/UDP packet
pub fn build_udp_packet(
    src_ip: Ipv4Addr,
    src_port: u16,
    dst_ip: Ipv4Addr,
    dst_port: u16,
    ttl: u8,
    ident: u16,
    payload: &[u8],
) -> Vec<u8> {
    let dgram = build_udp_datagram(src_ip, src_port, dst_ip, dst_port, payload);
    build_ipv4_packet(src_ip, dst_ip, IP_PROTO_UDP, ttl, ident, &dgram)
}

// ============================================================================
// ICMP
// ============================================================================

/// Build a complete IPv4/ICMP packet
pub fn build_icmp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    ttl: u8,
    ident: u16,
    icmp_type: u8,
    code: u8,
    rest_of_header: u32,
    data: &[u8],
) -> Vec<u8> {
    let mut icmp = vec![0u8; ICMP_HEADER_LEN + data.len()];
    icmp[0] = icmp_type;
    icmp[1] = code;
    icmp[4..8].copy_from_slice(&rest_of_header.to_be_bytes());
    icmp[ICMP_HEADER_LEN..].copy_from_slice(data);
    let checksum = ip_checksum(&icmp);
    icmp[2..4].copy_from_slice(&checksum.to_be_bytes());

    build_ipv4_packet(src, dst, IP_PROTO_ICMP, ttl, ident, &icmp)
}

// ============================================================================
// Tests
// ============================================================================
