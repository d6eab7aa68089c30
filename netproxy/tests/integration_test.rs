//! Integration test for the NetProxy daemon pieces
//!
//! Two engines with their full worker sets talk over real loopback
//! connectors; the proxied hosts are in-memory interfaces. Also covers the
//! config directory and the CSR connector against a scripted relay.

use std::fs;
use std::net::{Ipv4Addr, SocketAddr, TcpListener};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use netproxy::config::ConfigDir;
use netproxy::connector::csr::CsrConnector;
use netproxy::connector::tcp::TcpConnector;
use netproxy::connector::udp::UdpConnector;
use netproxy::connector::{Connector, LinkEvent};
use netproxy::manager::ConnectorManager;
use netproxy::workers::{Interfaces, Workers};
use netproxy_core::address_range::AddressRangeDescriptor;
use netproxy_core::classifier::{classify, Frame, Transport};
use netproxy_core::interface::{MemoryHost, MemoryInterface};
use netproxy_core::packet::tcp_flags::SYN;
use netproxy_core::packet::{build_tcp_packet, build_udp_packet, wrap_ethernet, TcpSegmentSpec, ETHERTYPE_IPV4};
use netproxy_core::protocol::ProxyProtocol;
use netproxy_core::pwp::{self, ProxyPorts};
use netproxy_core::registry::{ConnectorTarget, LinkState, RemoteProxyInfo};
use netproxy_core::relay::{read_message, write_message, RelayErrorCode, RelayMessage};
use netproxy_core::udp_batch::BatchConfig;
use netproxy_core::{ConnectorKind, Engine, EndpointTable, MacAddr, MessageBody, NetProxySettings, ProxyMessage};

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

fn any_port() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

// ============================================================================
// Two running proxies
// ============================================================================

struct Node {
    engine: Arc<Engine>,
    manager: Arc<ConnectorManager>,
    workers: Option<Workers>,
    host: MemoryHost,
}

impl Node {
    fn start(id: u32, internal: Ipv4Addr, mac: MacAddr, ports: ProxyPorts, connector: Arc<dyn Connector>) -> Node {
        Self::start_with(id, internal, mac, ports, connector, None)
    }

    fn start_with(
        id: u32,
        internal: Ipv4Addr,
        mac: MacAddr,
        ports: ProxyPorts,
        connector: Arc<dyn Connector>,
        udp: Option<Arc<UdpConnector>>,
    ) -> Node {
        let settings = NetProxySettings {
            proxy_id: id,
            internal_ip: internal,
            external_ip: Ipv4Addr::LOCALHOST,
            ports,
            ..Default::default()
        };
        let (engine, queues) = Engine::new(settings, mac, EndpointTable::new());
        let engine = Arc::new(engine);
        let (iface, host) = MemoryInterface::pair(mac, 1500);
        let manager = Arc::new(ConnectorManager::with_connectors(engine.clone(), vec![connector], udp));
        let workers = Workers::spawn(
            engine.clone(),
            queues,
            Interfaces {
                internal: Arc::new(iface),
                external: None,
            },
            manager.clone(),
            None,
        )
        .unwrap();
        Node {
            engine,
            manager,
            workers: Some(workers),
            host,
        }
    }

    fn knows(&self, id: u32, ports: ProxyPorts, range: &str) {
        let mut info = RemoteProxyInfo::new(id, Ipv4Addr::LOCALHOST);
        info.ports = ports;
        self.engine.registry().add_remote_proxy_info(info);
        self.engine
            .registry()
            .add_address_mapping(AddressRangeDescriptor::parse(range).unwrap(), id);
    }

    /// First frame written to the local hosts that `pick` accepts
    fn wait_frame<T>(&self, pick: impl Fn(&[u8]) -> Option<T>) -> T {
        let deadline = Instant::now() + Duration::from_secs(10);
        while Instant::now() < deadline {
            if let Ok(frame) = self.host.written.recv_timeout(Duration::from_millis(100)) {
                if let Some(found) = pick(&frame) {
                    return found;
                }
            }
        }
        panic!("expected frame never written");
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.engine.request_termination();
        if let Some(workers) = self.workers.take() {
            workers.join(&self.engine);
        }
        self.manager.shutdown();
    }
}

fn ports(tcp: u16, udp: u16) -> ProxyPorts {
    ProxyPorts { quic: 0, tcp, udp }
}

fn tcp_syn_from_client() -> Vec<u8> {
    let spec = TcpSegmentSpec {
        src_ip: client(),
        src_port: 40000,
        dst_ip: server(),
        dst_port: 22,
        seq: 1000,
        ack: 0,
        flags: SYN,
        window: 65535,
        payload: &[],
    };
    wrap_ethernet(MAC_A, CLIENT_MAC, ETHERTYPE_IPV4, &build_tcp_packet(&spec, 64, 1))
}

/// (source, destination port, flags) of a TCP frame
fn tcp_segment(frame: &[u8]) -> Option<(Ipv4Addr, u16, u8)> {
    match classify(frame).ok()?.frame {
        Frame::Ipv4(ip) => match ip.transport {
            Transport::Tcp(t) => Some((ip.src, t.dst_port, t.segment.flags)),
            _ => None,
        },
        _ => None,
    }
}

#[test]
fn test_tcp_flow_opens_across_tcp_link() {
    let tcp_a = Arc::new(TcpConnector::new(Some(any_port()), None, 256).unwrap());
    let tcp_b = Arc::new(TcpConnector::new(Some(any_port()), None, 256).unwrap());
    let port_a = tcp_a.local_addr().unwrap().port();
    let port_b = tcp_b.local_addr().unwrap().port();

    let a = Node::start(1, Ipv4Addr::new(192, 168, 1, 1), MAC_A, ports(port_a, 0), tcp_a);
    let b = Node::start(2, Ipv4Addr::new(10, 1, 0, 1), MAC_B, ports(port_b, 0), tcp_b);
    a.knows(2, ports(port_b, 0), "10.1.0.2-10.1.0.254");
    b.knows(1, ports(port_a, 0), "192.168.1.2-192.168.1.254");
    a.engine.arc().insert(client(), CLIENT_MAC);
    b.engine.arc().insert(server(), SERVER_MAC);

    a.host.inject.send(tcp_syn_from_client()).unwrap();

    // Proxy B opens the flow toward the server with its own SYN
    let (src, dst_port, flags) = b.wait_frame(tcp_segment);
    assert_eq!((src, dst_port, flags), (client(), 22, SYN));
    assert_eq!(a.engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Connected);
    assert_eq!(b.engine.registry().link_state(1, ConnectorKind::Tcp), LinkState::Connected);
    assert_eq!(b.engine.connections().len(), 1);
}

#[test]
fn test_udp_datagram_crosses_udp_link() {
    let udp_a = Arc::new(UdpConnector::bind(any_port(), BatchConfig::default()).unwrap());
    let udp_b = Arc::new(UdpConnector::bind(any_port(), BatchConfig::default()).unwrap());
    let port_a = udp_a.local_addr().unwrap().port();
    let port_b = udp_b.local_addr().unwrap().port();

    let a = Node::start_with(
        1,
        Ipv4Addr::new(192, 168, 1, 1),
        MAC_A,
        ports(0, port_a),
        udp_a.clone(),
        Some(udp_a),
    );
    let b = Node::start_with(
        2,
        Ipv4Addr::new(10, 1, 0, 1),
        MAC_B,
        ports(0, port_b),
        udp_b.clone(),
        Some(udp_b),
    );
    a.knows(2, ports(0, port_b), "10.1.0.2-10.1.0.254");
    b.knows(1, ports(0, port_a), "192.168.1.2-192.168.1.254");
    b.engine.arc().insert(server(), SERVER_MAC);

    let packet = build_udp_packet(client(), 5353, server(), 53, 64, 7, b"lookup");
    a.host
        .inject
        .send(wrap_ethernet(MAC_A, CLIENT_MAC, ETHERTYPE_IPV4, &packet))
        .unwrap();

    let delivered = b.wait_frame(|frame| match classify(frame).ok()?.frame {
        Frame::Ipv4(ip) => match ip.transport {
            Transport::Udp(u) => Some((ip.src, u.src_port, u.dst_port, u.payload().to_vec())),
            _ => None,
        },
        _ => None,
    });
    assert_eq!(delivered, (client(), 5353, 53, b"lookup".to_vec()));
}

// ============================================================================
// Config directory
// ============================================================================

struct TempDir(PathBuf);

impl TempDir {
    fn new(tag: &str) -> Self {
        let path = std::env::temp_dir().join(format!("netproxy-{}-{}", tag, std::process::id()));
        let _ = fs::remove_dir_all(&path);
        fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }

    fn write(&self, name: &str, text: &str) {
        fs::write(self.0.join(name), text).unwrap();
    }
}

impl Drop for TempDir {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.0);
    }
}

#[test]
fn test_config_directory_drives_routing() {
    let dir = TempDir::new("config");
    dir.write("netproxy.cfg", "# tuning\nUniqueID=1\nUDPBatchingTimeout=20\n");
    dir.write("endpoints.cfg", "192.168.1.*:* 10.1.0.*:* tcp=udp;udp=tcp\n");
    dir.write(
        "uniqueIDs.cfg",
        "127.0.0.1 2 tcpport=9100 udpport=9101 autoconnect=tcp\n127.0.0.2 3 connectivity=passive\n",
    );
    dir.write("addressMapping.cfg", "10.1.0.0-10.1.0.255 2\n10.2.0.0-10.2.0.255 0.0.0.3\n");
    dir.write("staticARP.cfg", "192.168.1.10 02:00:00:00:a0:10\n");

    let config = ConfigDir::load(&dir.0).unwrap();
    assert_eq!(config.settings.udp_batch_timeout, Duration::from_millis(20));
    assert_eq!(config.endpoints.len(), 1);

    let (engine, _queues) = Engine::new(config.settings.clone(), MAC_A, config.endpoints.clone());
    config.install(&engine);
    let registry = engine.registry();

    assert_eq!(registry.resolve_address(server()), Some(2));
    assert_eq!(registry.resolve_address(Ipv4Addr::new(10, 2, 0, 9)), Some(3));
    assert_eq!(
        registry.connector_for(2, ConnectorKind::Tcp).unwrap(),
        ConnectorTarget::Direct("127.0.0.1:9100".parse().unwrap())
    );
    assert!(registry.auto_connection(2, ConnectorKind::Tcp).is_some());
    assert!(registry.connector_for(3, ConnectorKind::Udp).is_err());
    assert_eq!(engine.arc().lookup(client()), Some(CLIENT_MAC));
}

// ============================================================================
// CSR connector against a scripted relay
// ============================================================================

fn init_message(proxy_id: u32) -> ProxyMessage {
    ProxyMessage::new(
        ProxyProtocol::default_for(ConnectorKind::Csr),
        Ipv4Addr::LOCALHOST,
        Ipv4Addr::LOCALHOST,
        MessageBody::InitializeConnection {
            proxy_id,
            ports: ProxyPorts::default(),
        },
    )
}

#[test]
fn test_csr_connector_through_relay() {
    let listener = TcpListener::bind(any_port()).unwrap();
    let relay_addr = listener.local_addr().unwrap();

    let relay = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let RelayMessage::Register { proxy_id } = read_message(&mut stream).unwrap() else {
            panic!("expected Register");
        };
        assert_eq!(proxy_id, 1);
        write_message(&mut stream, &RelayMessage::Registered { proxy_id }).unwrap();

        // Echo the handshake back as if proxy 2 answered
        let RelayMessage::Forward { to, payload } = read_message(&mut stream).unwrap() else {
            panic!("expected Forward");
        };
        assert_eq!(to, 2);
        assert!(matches!(
            pwp::decode(&payload).unwrap().body,
            MessageBody::InitializeConnection { proxy_id: 1, .. }
        ));
        let reply = pwp::encode(&init_message(2)).unwrap();
        write_message(&mut stream, &RelayMessage::Deliver { from: 2, payload: reply }).unwrap();

        // Proxy 2 leaves the relay
        write_message(
            &mut stream,
            &RelayMessage::Error {
                code: RelayErrorCode::UnknownPeer,
                proxy_id: 2,
            },
        )
        .unwrap();
        thread::sleep(Duration::from_millis(500));
    });

    let csr = CsrConnector::new(relay_addr, 1, 64);
    assert!(!csr.is_open(2));
    csr.open(2, ConnectorTarget::Relay { proxy_id: 2 }).unwrap();
    assert!(csr.is_registered());
    csr.send(2, &init_message(1)).unwrap();

    let Some(LinkEvent::Message { peer, address, message, .. }) = csr.receive(Duration::from_secs(5)) else {
        panic!("no relayed message");
    };
    assert_eq!(peer, Some(2));
    assert_eq!(address, None);
    assert!(matches!(message.body, MessageBody::InitializeConnection { proxy_id: 2, .. }));

    let Some(LinkEvent::Closed { peer, .. }) = csr.receive(Duration::from_secs(5)) else {
        panic!("unknown peer not reported");
    };
    assert_eq!(peer, Some(2));
    assert!(!csr.is_open(2));

    relay.join().unwrap();
}

#[test]
fn test_csr_open_fails_without_relay() {
    let unused = TcpListener::bind(any_port()).unwrap();
    let addr = unused.local_addr().unwrap();
    drop(unused);

    let csr = CsrConnector::new(addr, 1, 8);
    assert!(csr.open(2, ConnectorTarget::Relay { proxy_id: 2 }).is_err());
    assert!(csr
        .open(2, ConnectorTarget::Direct("127.0.0.1:1".parse().unwrap()))
        .is_err());
}
