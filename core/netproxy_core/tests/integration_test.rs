//! Integration test for two NetProxy engines wired back to back
//!
//! Messages are pumped between the engines' remote queues the way the
//! daemon's connectors would carry them; frames for the local hosts are
//! read from the local queues.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Instant;

use netproxy_core::address_range::AddressRangeDescriptor;
use netproxy_core::classifier::{classify, Frame, Transport};
use netproxy_core::config::{EndpointTable, NetProxySettings};
use netproxy_core::packet::tcp_flags::{ACK, FIN, PSH, RST, SYN};
use netproxy_core::packet::{build_tcp_packet, build_udp_packet, wrap_ethernet, TcpSegmentSpec, ETHERTYPE_IPV4};
use netproxy_core::protocol::{ConnectorKind, ProtocolSetting};
use netproxy_core::pwp::MessageBody;
use netproxy_core::registry::RemoteProxyInfo;
use netproxy_core::tcp::{FlowKey, VirtualConnection};
use netproxy_core::{Engine, EngineQueues, InterfaceSide, MacAddr, MessageOrigin};

const MAC_A: MacAddr = MacAddr([0x02, 0, 0, 0, 0xA0, 0x01]);
const MAC_B: MacAddr = MacAddr([0x02, 0, 0, 0, 0xB0, 0x01]);
const CLIENT_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0xA0, 0x10]);
const SERVER_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0xB0, 0x10]);

fn client() -> Ipv4Addr {
    Ipv4Addr::new(192, 168, 1, 10)
}

fn server() -> Ipv4Addr {
    Ipv4Addr::new(10, 1, 0, 5)
}

struct Node {
    engine: Engine,
    queues: EngineQueues,
    address: Ipv4Addr,
    /// Peer id learned per link kind, as a connector would remember it
    peers: HashMap<ConnectorKind, u32>,
}

fn node(id: u32, address: Ipv4Addr, internal: Ipv4Addr, mac: MacAddr) -> Node {
    let settings = NetProxySettings {
        proxy_id: id,
        internal_ip: internal,
        external_ip: address,
        ..Default::default()
    };
    let (engine, queues) = Engine::new(settings, mac, EndpointTable::new());
    Node {
        engine,
        queues,
        address,
        peers: HashMap::new(),
    }
}

/// NetProxy 1 serves 192.168.1.0/24, NetProxy 2 serves 10.1.0.0/24
fn pair() -> (Node, Node) {
    let a = node(1, Ipv4Addr::new(172, 16, 0, 1), Ipv4Addr::new(192, 168, 1, 1), MAC_A);
    let b = node(2, Ipv4Addr::new(172, 16, 0, 2), Ipv4Addr::new(10, 1, 0, 1), MAC_B);

    a.engine
        .registry()
        .add_remote_proxy_info(RemoteProxyInfo::new(2, b.address));
    a.engine
        .registry()
        .add_address_mapping(AddressRangeDescriptor::parse("10.1.0.2-10.1.0.254").unwrap(), 2);
    a.engine.arc().insert(client(), CLIENT_MAC);

    b.engine
        .registry()
        .add_remote_proxy_info(RemoteProxyInfo::new(1, a.address));
    b.engine
        .registry()
        .add_address_mapping(AddressRangeDescriptor::parse("192.168.1.2-192.168.1.254").unwrap(), 1);
    b.engine.arc().insert(server(), SERVER_MAC);
    (a, b)
}

/// Carry queued messages from `from` to `to`; replies travel back on the same link
fn deliver(from: &mut Node, to: &mut Node) -> bool {
    let pending: Vec<_> = from.queues.remote.try_iter().collect();
    for egress in &pending {
        let origin = MessageOrigin {
            kind: egress.kind,
            proxy_id: to.peers.get(&egress.kind).copied(),
            address: Some(from.address),
        };
        let outcome = to.engine.on_proxy_message(origin, egress.message.clone()).unwrap();
        if let Some(peer) = outcome.peer {
            to.peers.insert(egress.kind, peer);
        }
        if let Some(reply) = outcome.reply {
            let origin = MessageOrigin {
                kind: egress.kind,
                proxy_id: from.peers.get(&egress.kind).copied(),
                address: Some(to.address),
            };
            let back = from.engine.on_proxy_message(origin, reply).unwrap();
            if let Some(peer) = back.peer {
                from.peers.insert(egress.kind, peer);
            }
        }
    }
    !pending.is_empty()
}

fn pump(a: &mut Node, b: &mut Node) {
    for _ in 0..32 {
        let moved_ab = deliver(a, b);
        let moved_ba = deliver(b, a);
        if !moved_ab && !moved_ba {
            return;
        }
    }
    panic!("message exchange did not settle");
}

#[allow(clippy::too_many_arguments)]
fn tcp_frame(
    src: (Ipv4Addr, u16),
    dst: (Ipv4Addr, u16),
    flags: u8,
    seq: u32,
    ack: u32,
    payload: &[u8],
    src_mac: MacAddr,
    dst_mac: MacAddr,
) -> Vec<u8> {
    let spec = TcpSegmentSpec {
        src_ip: src.0,
        src_port: src.1,
        dst_ip: dst.0,
        dst_port: dst.1,
        seq,
        ack,
        flags,
        window: 65535,
        payload,
    };
    wrap_ethernet(dst_mac, src_mac, ETHERTYPE_IPV4, &build_tcp_packet(&spec, 64, 1))
}

fn from_client(flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    tcp_frame((client(), 40000), (server(), 22), flags, seq, ack, payload, CLIENT_MAC, MAC_A)
}

fn from_server(flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
    tcp_frame((server(), 22), (client(), 40000), flags, seq, ack, payload, SERVER_MAC, MAC_B)
}

#[derive(Debug)]
struct Seg {
    flags: u8,
    seq: u32,
    ack: u32,
    payload: Vec<u8>,
}

/// Drain TCP segments written toward the node's local hosts
fn segments(node: &Node) -> Vec<Seg> {
    node.queues
        .local
        .try_iter()
        .filter_map(|f| match classify(&f.frame).ok()?.frame {
            Frame::Ipv4(ip) => match ip.transport {
                Transport::Tcp(t) => Some(Seg {
                    flags: t.segment.flags,
                    seq: t.segment.seq,
                    ack: t.segment.ack,
                    payload: t.segment.payload.to_vec(),
                }),
                _ => None,
            },
            _ => None,
        })
        .collect()
}

/// Three-way handshakes on both sides; returns the ISNs proxy A and proxy B chose
fn connect(a: &mut Node, b: &mut Node) -> (u32, u32) {
    a.engine
        .on_frame(&from_client(SYN, 1000, 0, &[]), InterfaceSide::Internal)
        .unwrap();
    pump(a, b);

    let syn = segments(b).into_iter().find(|s| s.flags == SYN).expect("SYN toward server");
    b.engine
        .on_frame(&from_server(SYN | ACK, 5000, syn.seq.wrapping_add(1), &[]), InterfaceSide::Internal)
        .unwrap();
    pump(a, b);

    let syn_ack = segments(a)
        .into_iter()
        .find(|s| s.flags == SYN | ACK)
        .expect("SYN-ACK toward client");
    assert_eq!(syn_ack.ack, 1001);
    a.engine
        .on_frame(&from_client(ACK, 1001, syn_ack.seq.wrapping_add(1), &[]), InterfaceSide::Internal)
        .unwrap();
    pump(a, b);
    (syn_ack.seq, syn.seq)
}

#[test]
fn test_tcp_flow_across_two_proxies() {
    let (mut a, mut b) = pair();
    let (isn_a, isn_b) = connect(&mut a, &mut b);
    assert_eq!(a.peers.get(&ConnectorKind::Tcp), Some(&2));
    assert_eq!(b.peers.get(&ConnectorKind::Tcp), Some(&1));

    let payload = vec![0x5A; 500];
    a.engine
        .on_frame(
            &from_client(ACK | PSH, 1001, isn_a.wrapping_add(1), &payload),
            InterfaceSide::Internal,
        )
        .unwrap();

    let data = a.queues.remote.try_recv().unwrap();
    match &data.message.body {
        MessageBody::TcpData { payload: p, .. } => assert_eq!(p.len(), 500),
        other => panic!("expected TCPData, got {:?}", other),
    }
    let origin = MessageOrigin {
        kind: data.kind,
        proxy_id: b.peers.get(&data.kind).copied(),
        address: Some(a.address),
    };
    b.engine.on_proxy_message(origin, data.message).unwrap();

    let delivered = segments(&b)
        .into_iter()
        .find(|s| !s.payload.is_empty())
        .expect("data toward server");
    assert_eq!(delivered.payload, payload);
    assert_eq!(delivered.seq, isn_b.wrapping_add(1));
    assert_eq!(delivered.ack, 5001);
}

#[test]
fn test_client_close_reaches_server() {
    let (mut a, mut b) = pair();
    let (isn_a, _) = connect(&mut a, &mut b);

    a.engine
        .on_frame(&from_client(FIN | ACK, 1001, isn_a.wrapping_add(1), &[]), InterfaceSide::Internal)
        .unwrap();
    pump(&mut a, &mut b);

    assert!(segments(&a).iter().any(|s| s.flags & ACK != 0 && s.ack == 1002));
    assert!(segments(&b).iter().any(|s| s.flags & FIN != 0));
}

#[test]
fn test_udp_datagram_across_two_proxies() {
    let (mut a, mut b) = pair();
    let packet = build_udp_packet(client(), 5353, server(), 53, 64, 7, b"lookup");
    let frame = wrap_ethernet(MAC_A, CLIENT_MAC, ETHERTYPE_IPV4, &packet);
    a.engine.on_frame(&frame, InterfaceSide::Internal).unwrap();
    pump(&mut a, &mut b);

    let udp: Vec<_> = b
        .queues
        .local
        .try_iter()
        .filter_map(|f| match classify(&f.frame).ok()?.frame {
            Frame::Ipv4(ip) => match ip.transport {
                Transport::Udp(u) => Some((ip.src, u.src_port, u.dst_port, u.payload().to_vec())),
                _ => None,
            },
            _ => None,
        })
        .collect();
    assert_eq!(udp, vec![(client(), 5353, 53, b"lookup".to_vec())]);
}

#[test]
fn test_retransmitted_syn_keeps_one_connection() {
    let (a, _b) = pair();
    a.engine
        .on_frame(&from_client(SYN, 1000, 0, &[]), InterfaceSide::Internal)
        .unwrap();
    a.engine
        .on_frame(&from_client(SYN, 1000, 0, &[]), InterfaceSide::Internal)
        .unwrap();
    assert_eq!(a.engine.connections().len(), 1);
    assert!(segments(&a).is_empty());

    let inits = a
        .queues
        .remote
        .try_iter()
        .filter(|e| matches!(e.message.body, MessageBody::InitializeConnection { .. }))
        .count();
    assert_eq!(inits, 1);
}

#[test]
fn test_syn_racing_connection_creation_is_not_reset() {
    let (a, _b) = pair();
    let flow = FlowKey {
        local_ip: client(),
        local_port: 40000,
        remote_ip: server(),
        remote_port: 22,
    };
    // Entry published by another ingress thread that has not run its SYN yet
    let (_, created) = a
        .engine
        .connections()
        .get_or_create(flow, 2, |id| {
            VirtualConnection::new(id, flow, 2, ProtocolSetting::default_tcp(), Instant::now())
        })
        .unwrap();
    assert!(created);

    a.engine
        .on_frame(&from_client(SYN, 1000, 0, &[]), InterfaceSide::Internal)
        .unwrap();
    assert_eq!(a.engine.connections().len(), 1);
    let resets: Vec<_> = segments(&a).into_iter().filter(|s| s.flags & RST != 0).collect();
    assert!(resets.is_empty(), "host was reset: {:?}", resets);
}
