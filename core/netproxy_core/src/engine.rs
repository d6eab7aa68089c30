//! NetProxy engine
//!
//! Owns the shared state (ARC, remote proxy registry, endpoint table,
//! connection table) and turns local frames into PWP messages and PWP
//! messages back into local frames. Workers in the daemon feed it and
//! drain its two egress queues.
//!
//! ```text
//!  internal iface ──► on_frame ──► classify ──┬─ ARP ──► ARC / ARP reply
//!                                             ├─ ICMP ─► IcmpMessage
//!                                             ├─ UDP ──► UdpUnicastData / UdpBCastMCastData
//!                                             └─ TCP ──► VirtualConnection ──► TCP* messages
//!                                                               │                  │
//!  remote links ──► on_proxy_message ───────────────────────────┘                  ▼
//!                         │                                               remote egress queue
//!                         └──► synthesized frames ──► local egress queue
//! ```

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::{Mutex, TryLockError};
use std::time::Instant;

use ring::rand::{SecureRandom, SystemRandom};

use crate::arc::{AddressResolutionCache, MacAddr};
use crate::classifier::{classify, parse_ipv4, ArpPacket, DispatchError, Frame, IcmpView, Ipv4Packet, TcpView, Transport, UdpView};
use crate::config::{BroadcastPolicy, EndpointTable, FlowProtocol, NetProxySettings};
use crate::connection_table::{ConnectionTable, SharedConnection};
use crate::lock;
use crate::packet::tcp_flags::{ACK, RST, SYN};
use crate::packet::{
    build_arp, build_icmp_packet, build_ipv4_packet, build_tcp_packet, wrap_ethernet, TcpSegmentSpec, ARP_OP_REPLY,
    ARP_OP_REQUEST, ETHERTYPE_ARP, ETHERTYPE_IPV4, ICMP_ECHO_REPLY, ICMP_ECHO_REQUEST, IP_PROTO_UDP,
};
use crate::protocol::{ConnectorKind, ProtocolSetting, ProxyProtocol};
use crate::pwp::{unpack_datagrams, MessageBody, ProxyMessage, ProxyPorts};
use crate::registry::{LinkState, RemoteProxyRegistry};
use crate::stats::{Stats, StatsSnapshot};
use crate::tcp::{
    reset_reply, FlowKey, HostSegment, RemoteRequest, TcpAction, TcpSettings, VirtualConnection, SYNTHESIZED_TCP_TTL,
};

/// TTL of packets the engine originates itself (ICMP echo replies)
const DEFAULT_TTL: u8 = 64;

// ============================================================================
// Queue Items
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InterfaceSide {
    /// Faces the hosts whose traffic is proxied
    Internal,
    External,
}

/// A frame for one of the local interfaces
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFrame {
    pub side: InterfaceSide,
    pub frame: Vec<u8>,
}

/// A message for a remote NetProxy over one connector kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEgress {
    pub proxy_id: u32,
    pub kind: ConnectorKind,
    pub message: ProxyMessage,
}

/// Consumer ends of the engine's egress queues
#[derive(Debug)]
pub struct EngineQueues {
    pub local: Receiver<LocalFrame>,
    pub remote: Receiver<RemoteEgress>,
}

/// The link a peer message arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageOrigin {
    pub kind: ConnectorKind,
    /// Peer id once the link handshake completed
    pub proxy_id: Option<u32>,
    /// Peer IP address, when the transport exposes one
    pub address: Option<Ipv4Addr>,
}

/// What the connector owning the link should do after a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InboundOutcome {
    /// Peer id learned from a link handshake
    pub peer: Option<u32>,
    /// Reply to write back on the same link
    pub reply: Option<ProxyMessage>,
    pub close_link: bool,
}

/// A link failure whose connection was locked elsewhere when it happened
#[derive(Debug, Clone, Copy)]
struct DeferredFailure {
    local_id: u16,
    proxy_id: u32,
    kind: Option<ConnectorKind>,
    at: Instant,
}

// ============================================================================
// Engine
// ============================================================================

pub struct Engine {
    settings: NetProxySettings,
    tcp: TcpSettings,
    mac: MacAddr,
    arc: AddressResolutionCache,
    registry: RemoteProxyRegistry,
    endpoints: EndpointTable,
    connections: ConnectionTable,
    stats: Stats,
    local_tx: SyncSender<LocalFrame>,
    remote_tx: SyncSender<RemoteEgress>,
    deferred_failures: Mutex<Vec<DeferredFailure>>,
    rng: SystemRandom,
    ip_ident: AtomicU16,
    running: AtomicBool,
    terminate: AtomicBool,
}

impl Engine {
    /// Create the engine and its bounded egress queues
    ///
    /// `mac` is the internal interface address used as the source of every
    /// synthesized frame and in ARP replies.
    pub fn new(settings: NetProxySettings, mac: MacAddr, endpoints: EndpointTable) -> (Engine, EngineQueues) {
        let capacity = settings.queue_capacity.max(1);
        let (local_tx, local) = mpsc::sync_channel(capacity);
        let (remote_tx, remote) = mpsc::sync_channel(capacity);
        let engine = Engine {
            tcp: TcpSettings::from(&settings),
            registry: RemoteProxyRegistry::new(settings.enabled_connectors.clone()),
            connections: ConnectionTable::new(settings.max_connections),
            settings,
            mac,
            arc: AddressResolutionCache::new(),
            endpoints,
            stats: Stats::new(),
            local_tx,
            remote_tx,
            deferred_failures: Mutex::new(Vec::new()),
            rng: SystemRandom::new(),
            ip_ident: AtomicU16::new(1),
            running: AtomicBool::new(true),
            terminate: AtomicBool::new(false),
        };
        (engine, EngineQueues { local, remote })
    }

    pub fn settings(&self) -> &NetProxySettings {
        &self.settings
    }

    pub fn tcp_settings(&self) -> &TcpSettings {
        &self.tcp
    }

    pub fn mac_address(&self) -> MacAddr {
        self.mac
    }

    pub fn arc(&self) -> &AddressResolutionCache {
        &self.arc
    }

    pub fn registry(&self) -> &RemoteProxyRegistry {
        &self.registry
    }

    pub fn endpoints(&self) -> &EndpointTable {
        &self.endpoints
    }

    pub fn connections(&self) -> &ConnectionTable {
        &self.connections
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn status(&self) -> StatsSnapshot {
        self.stats.snapshot(self.settings.proxy_id, self.connections.len())
    }

    // --- lifecycle -----------------------------------------------------------

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire) && !self.is_termination_requested()
    }

    pub fn request_termination(&self) {
        if !self.terminate.swap(true, Ordering::AcqRel) {
            log::info!("termination requested");
        }
    }

    pub fn is_termination_requested(&self) -> bool {
        self.terminate.load(Ordering::Acquire)
    }

    /// Called once every worker has been joined
    pub fn mark_stopped(&self) {
        self.running.store(false, Ordering::Release);
    }

    // ========================================================================
    // Local Frames
    // ========================================================================

    /// Handle one frame read from a local interface
    pub fn on_frame(&self, raw: &[u8], side: InterfaceSide) -> Result<(), DispatchError> {
        Stats::bump(&self.stats.frames_in);
        let result = self.dispatch_frame(raw, side);
        if result.is_err() {
            Stats::bump(&self.stats.frames_dropped);
        }
        result
    }

    fn dispatch_frame(&self, raw: &[u8], side: InterfaceSide) -> Result<(), DispatchError> {
        let classified = classify(raw)?;
        if classified.src_mac == self.mac {
            return Ok(());
        }
        match classified.frame {
            Frame::Arp(arp) => self.on_arp(&arp, side),
            Frame::Ipv4(ip) => {
                if !classified.src_mac.is_multicast() {
                    self.arc.insert(ip.src, classified.src_mac);
                }
                match side {
                    InterfaceSide::Internal => self.on_local_ipv4(&ip),
                    InterfaceSide::External => {
                        log::trace!("external frame {} -> {} observed", ip.src, ip.dst);
                        Ok(())
                    }
                }
            }
        }
    }

    fn on_arp(&self, arp: &ArpPacket, side: InterfaceSide) -> Result<(), DispatchError> {
        if !arp.sender_ip.is_unspecified() {
            self.arc.insert(arp.sender_ip, arp.sender_mac);
        }
        if side != InterfaceSide::Internal || arp.op != ARP_OP_REQUEST || arp.sender_ip == arp.target_ip {
            return Ok(());
        }
        if !self.registry.is_mapped_address(arp.target_ip) {
            return Ok(());
        }
        log::trace!("answering ARP request for {} from {}", arp.target_ip, arp.sender_ip);
        let body = build_arp(ARP_OP_REPLY, self.mac, arp.target_ip, arp.sender_mac, arp.sender_ip);
        self.emit_local(wrap_ethernet(arp.sender_mac, self.mac, ETHERTYPE_ARP, &body))
    }

    fn on_local_ipv4(&self, ip: &Ipv4Packet<'_>) -> Result<(), DispatchError> {
        if let Some(protocol) = self.endpoints.tunnel_protocol(ip.src, ip.dst) {
            if let Some(proxy) = self.registry.resolve_address(ip.dst) {
                let body = MessageBody::TunnelPacket {
                    payload: ip.bytes.to_vec(),
                };
                return self.send_to_proxy(proxy, protocol, ip.src, ip.dst, body);
            }
        }
        match &ip.transport {
            Transport::Icmp(icmp) => self.on_local_icmp(ip, icmp),
            Transport::Udp(udp) => self.on_local_udp(ip, udp),
            Transport::Tcp(tcp) => self.on_local_tcp(ip, tcp),
        }
    }

    fn on_local_icmp(&self, ip: &Ipv4Packet<'_>, icmp: &IcmpView<'_>) -> Result<(), DispatchError> {
        if ip.dst == self.settings.internal_ip {
            if icmp.icmp_type == ICMP_ECHO_REQUEST {
                let reply = build_icmp_packet(
                    ip.dst,
                    ip.src,
                    DEFAULT_TTL,
                    self.next_ident(),
                    ICMP_ECHO_REPLY,
                    0,
                    icmp.rest_of_header,
                    icmp.data,
                );
                return self.send_to_host(ip.src, reply);
            }
            return Ok(());
        }
        let proxy = self
            .registry
            .resolve_address(ip.dst)
            .ok_or(DispatchError::NotMapped(ip.dst))?;
        if ip.ttl <= 1 {
            log::trace!("ICMP {} -> {} dropped: TTL expired", ip.src, ip.dst);
            return Ok(());
        }
        let setting = self
            .endpoints
            .map_addr_to_protocol(ip.src, 0, ip.dst, 0, FlowProtocol::Icmp);
        let body = MessageBody::Icmp {
            icmp_type: icmp.icmp_type,
            code: icmp.code,
            rest_of_header: icmp.rest_of_header,
            proxy_id: self.settings.proxy_id,
            ports: self.settings.ports,
            ttl: ip.ttl - 1,
            payload: icmp.data.to_vec(),
        };
        self.send_to_proxy(proxy, setting.protocol, ip.src, ip.dst, body)
    }

    fn on_local_udp(&self, ip: &Ipv4Packet<'_>, udp: &UdpView<'_>) -> Result<(), DispatchError> {
        if ip.is_broadcast_or_multicast() {
            return self.forward_broadcast(ip, udp);
        }
        if ip.dst == self.settings.internal_ip {
            return Ok(());
        }
        let proxy = self
            .registry
            .resolve(ip.dst, udp.dst_port)
            .ok_or(DispatchError::NotMapped(ip.dst))?;
        let setting = self
            .endpoints
            .map_addr_to_protocol(ip.src, udp.src_port, ip.dst, udp.dst_port, FlowProtocol::Udp);
        let body = MessageBody::UdpUnicastData {
            proxy_id: self.settings.proxy_id,
            ttl: ip.ttl,
            compression: setting.compression,
            payload: udp.datagram.to_vec(),
        };
        self.send_to_proxy(proxy, setting.protocol, ip.src, ip.dst, body)
    }

    fn forward_broadcast(&self, ip: &Ipv4Packet<'_>, udp: &UdpView<'_>) -> Result<(), DispatchError> {
        let targets: Vec<u32> = match &self.settings.broadcast_policy {
            BroadcastPolicy::None => {
                log::trace!("broadcast {} -> {} not forwarded", ip.src, ip.dst);
                return Ok(());
            }
            BroadcastPolicy::AllProxies => self.registry.mapped_proxy_ids().into_iter().collect(),
            BroadcastPolicy::List(ids) => ids.clone(),
        };
        let setting = self
            .endpoints
            .map_addr_to_protocol(ip.src, udp.src_port, ip.dst, udp.dst_port, FlowProtocol::Udp);
        for proxy in targets {
            let body = MessageBody::UdpBCastMCastData {
                proxy_id: self.settings.proxy_id,
                compression: setting.compression,
                payload: ip.bytes.to_vec(),
            };
            if let Err(e) = self.send_to_proxy(proxy, setting.protocol, ip.src, ip.dst, body) {
                log::debug!("broadcast to remote proxy {} not sent: {}", proxy, e);
            }
        }
        Ok(())
    }

    fn on_local_tcp(&self, ip: &Ipv4Packet<'_>, tcp: &TcpView<'_>) -> Result<(), DispatchError> {
        let flow = FlowKey {
            local_ip: ip.src,
            local_port: tcp.src_port,
            remote_ip: ip.dst,
            remote_port: tcp.dst_port,
        };
        let seg = &tcp.segment;
        let now = Instant::now();

        if let Some(conn) = self.connections.find_by_flow(&flow) {
            let mut c = lock(&conn);
            let mut actions = Vec::new();
            c.on_local_segment(seg, &self.tcp, now, &mut actions);
            return self.apply(&mut c, actions);
        }

        if !seg.has(SYN) || seg.has(ACK) || seg.has(RST) {
            log::trace!("segment for unknown flow {}; replying RST", flow);
            return self.reset_host(&flow, seg);
        }
        let Some(proxy) = self.registry.resolve(ip.dst, tcp.dst_port) else {
            self.reset_host(&flow, seg)?;
            return Err(DispatchError::NotMapped(ip.dst));
        };
        let setting = self
            .endpoints
            .map_addr_to_protocol(ip.src, tcp.src_port, ip.dst, tcp.dst_port, FlowProtocol::Tcp);
        let kind = setting.connector_kind();
        if let Err(e) = self.registry.connector_for(proxy, kind) {
            self.reset_host(&flow, seg)?;
            return Err(e.into());
        }

        let linked = self.ensure_link(proxy, kind, setting.protocol, ip.src, ip.dst)?;
        let isn = self.random_isn();

        // Published already in SYN_RCVD: no other thread sees a half-built entry
        let mut actions = Vec::new();
        let created = self.connections.get_or_create(flow, proxy, |id| {
            let mut c = VirtualConnection::new(id, flow, proxy, setting, now);
            c.on_local_syn(seg, isn, linked, &self.tcp, now, &mut actions);
            c
        });
        let (conn, created) = match created {
            Ok(entry) => entry,
            Err(e) => {
                self.reset_host(&flow, seg)?;
                return Err(e.into());
            }
        };

        let mut c = lock(&conn);
        if created {
            Stats::bump(&self.stats.connections_opened);
        } else {
            c.on_local_segment(seg, &self.tcp, now, &mut actions);
        }
        self.apply(&mut c, actions)
    }

    /// RST toward a host whose segment matches no connection
    fn reset_host(&self, flow: &FlowKey, seg: &crate::tcp::Segment<'_>) -> Result<(), DispatchError> {
        match reset_reply(seg) {
            Some(rst) => {
                Stats::bump(&self.stats.connections_reset);
                self.segment_to_host(flow, &rst)
            }
            None => Ok(()),
        }
    }

    // ========================================================================
    // Connection Actions
    // ========================================================================

    /// Carry out state machine output; runs with the connection locked
    fn apply(&self, c: &mut VirtualConnection, actions: Vec<TcpAction>) -> Result<(), DispatchError> {
        let mut first_err = None;
        for action in actions {
            let result = match action {
                TcpAction::ToHost(seg) => {
                    if seg.flags & RST != 0 {
                        Stats::bump(&self.stats.connections_reset);
                    }
                    self.segment_to_host(&c.flow, &seg)
                }
                TcpAction::ToRemote(request) => self.request_to_remote(c, request),
                TcpAction::Destroy => {
                    if self.connections.remove(c.local_id).is_some() {
                        log::debug!("L{}-R{}: removed {}", c.local_id, c.remote_id, c.flow);
                    }
                    Ok(())
                }
            };
            if let Err(e) = result {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn segment_to_host(&self, flow: &FlowKey, seg: &HostSegment) -> Result<(), DispatchError> {
        let spec = TcpSegmentSpec {
            src_ip: flow.remote_ip,
            src_port: flow.remote_port,
            dst_ip: flow.local_ip,
            dst_port: flow.local_port,
            seq: seg.seq,
            ack: seg.ack,
            flags: seg.flags,
            window: seg.window,
            payload: &seg.payload,
        };
        let packet = build_tcp_packet(&spec, SYNTHESIZED_TCP_TTL, self.next_ident());
        self.send_to_host(flow.local_ip, packet)
    }

    fn request_to_remote(&self, c: &VirtualConnection, request: RemoteRequest) -> Result<(), DispatchError> {
        let body = match request {
            RemoteRequest::Open => MessageBody::TcpOpenConnection {
                local_id: c.local_id,
                local_port: c.flow.local_port,
                remote_port: c.flow.remote_port,
                proxy_id: self.settings.proxy_id,
                ports: self.settings.ports,
                compression: c.setting.compression,
            },
            RemoteRequest::Opened => MessageBody::TcpConnectionOpened {
                local_id: c.local_id,
                remote_id: c.remote_id,
                proxy_id: self.settings.proxy_id,
                ports: self.settings.ports,
                compression: c.setting.compression,
            },
            RemoteRequest::Data { payload, flags } => MessageBody::TcpData {
                local_id: c.local_id,
                remote_id: c.remote_id,
                flags,
                payload,
            },
            RemoteRequest::Close => MessageBody::TcpCloseConnection {
                local_id: c.local_id,
                remote_id: c.remote_id,
            },
            RemoteRequest::Reset => MessageBody::TcpResetConnection {
                local_id: c.local_id,
                remote_id: c.remote_id,
            },
        };
        self.send_to_proxy(c.remote_proxy, c.setting.protocol, c.flow.local_ip, c.flow.remote_ip, body)
    }

    // ========================================================================
    // Egress
    // ========================================================================

    /// Queue a message for `proxy_id`, opening the link first if it is down
    fn send_to_proxy(
        &self,
        proxy_id: u32,
        protocol: ProxyProtocol,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        body: MessageBody,
    ) -> Result<(), DispatchError> {
        let kind = ProtocolSetting::new(protocol).connector_kind();
        self.registry.connector_for(proxy_id, kind)?;
        self.ensure_link(proxy_id, kind, protocol, source, destination)?;
        let message = ProxyMessage::new(protocol, source, destination, body);
        self.push_remote(proxy_id, kind, message)
    }

    /// Send InitializeConnection unless the link is up or opening
    ///
    /// Returns whether the link is already established.
    fn ensure_link(
        &self,
        proxy_id: u32,
        kind: ConnectorKind,
        protocol: ProxyProtocol,
        source: Ipv4Addr,
        destination: Ipv4Addr,
    ) -> Result<bool, DispatchError> {
        if self.registry.begin_connect(proxy_id, kind) {
            log::info!("opening {} link to remote proxy {}", kind, proxy_id);
            let init = self.handshake(protocol, source, destination);
            if let Err(e) = self.push_remote(proxy_id, kind, init) {
                self.registry.set_link_state(proxy_id, kind, LinkState::Disconnected);
                return Err(e);
            }
        }
        Ok(self.registry.link_state(proxy_id, kind) == LinkState::Connected)
    }

    fn handshake(&self, protocol: ProxyProtocol, source: Ipv4Addr, destination: Ipv4Addr) -> ProxyMessage {
        ProxyMessage::new(
            protocol,
            source,
            destination,
            MessageBody::InitializeConnection {
                proxy_id: self.settings.proxy_id,
                ports: self.settings.ports,
            },
        )
    }

    fn push_remote(&self, proxy_id: u32, kind: ConnectorKind, mut message: ProxyMessage) -> Result<(), DispatchError> {
        message.reachable = self
            .registry
            .remote_proxy(proxy_id)
            .map_or(true, |p| p.local_reachable_from_remote);
        self.remote_tx
            .send(RemoteEgress {
                proxy_id,
                kind,
                message,
            })
            .map_err(|_| DispatchError::QueueUnavailable)?;
        Stats::bump(&self.stats.messages_out);
        Ok(())
    }

    /// Wrap an IP packet for a local host, resolving its MAC through the ARC
    fn send_to_host(&self, host: Ipv4Addr, packet: Vec<u8>) -> Result<(), DispatchError> {
        let mac = match self.arc.lookup(host) {
            Some(mac) => mac,
            None if host.is_broadcast() || host.is_multicast() || host.octets()[3] == 255 => group_mac(host),
            None => {
                log::trace!("no MAC for {}; sending ARP request", host);
                let request = build_arp(ARP_OP_REQUEST, self.mac, self.settings.internal_ip, MacAddr::ZERO, host);
                self.emit_local(wrap_ethernet(MacAddr::BROADCAST, self.mac, ETHERTYPE_ARP, &request))?;
                MacAddr::BROADCAST
            }
        };
        self.emit_local(wrap_ethernet(mac, self.mac, ETHERTYPE_IPV4, &packet))
    }

    fn emit_local(&self, frame: Vec<u8>) -> Result<(), DispatchError> {
        self.local_tx
            .send(LocalFrame {
                side: InterfaceSide::Internal,
                frame,
            })
            .map_err(|_| DispatchError::QueueUnavailable)?;
        Stats::bump(&self.stats.frames_out);
        Ok(())
    }

    fn next_ident(&self) -> u16 {
        self.ip_ident.fetch_add(1, Ordering::Relaxed)
    }

    fn random_isn(&self) -> u32 {
        let mut bytes = [0u8; 4];
        match self.rng.fill(&mut bytes) {
            Ok(()) => u32::from_be_bytes(bytes),
            Err(_) => self.stats.start_time.elapsed().as_nanos() as u32,
        }
    }

    // ========================================================================
    // Peer Messages
    // ========================================================================

    /// Handle one message received from a remote NetProxy
    pub fn on_proxy_message(&self, origin: MessageOrigin, msg: ProxyMessage) -> Result<InboundOutcome, DispatchError> {
        Stats::bump(&self.stats.messages_in);
        let now = Instant::now();

        match &msg.body {
            MessageBody::InitializeConnection { proxy_id, ports } => {
                self.on_link_up(*proxy_id, &origin, *ports, now);
                let reply = ProxyMessage::new(
                    msg.protocol,
                    msg.destination,
                    msg.source,
                    MessageBody::ConnectionInitialized {
                        proxy_id: self.settings.proxy_id,
                        ports: self.settings.ports,
                    },
                );
                return Ok(InboundOutcome {
                    peer: Some(*proxy_id),
                    reply: Some(reply),
                    close_link: false,
                });
            }
            MessageBody::ConnectionInitialized { proxy_id, ports } => {
                self.on_link_up(*proxy_id, &origin, *ports, now);
                return Ok(InboundOutcome {
                    peer: Some(*proxy_id),
                    ..Default::default()
                });
            }
            MessageBody::ConnectionError { local_proxy_id, .. } => {
                let peer = origin.proxy_id.unwrap_or(*local_proxy_id);
                log::warn!("remote proxy {} reported a connection error on the {} link", peer, origin.kind);
                self.on_link_lost(peer);
                return Ok(InboundOutcome {
                    close_link: true,
                    ..Default::default()
                });
            }
            _ => {}
        }

        let Some(sender) = origin.proxy_id else {
            log::warn!(
                "{:?} on an uninitialized {} link; replying ConnectionError",
                msg.message_type(),
                origin.kind
            );
            let reply = ProxyMessage::new(
                msg.protocol,
                msg.destination,
                msg.source,
                MessageBody::ConnectionError {
                    local_proxy_id: self.settings.proxy_id,
                    remote_proxy_id: 0,
                },
            );
            return Ok(InboundOutcome {
                peer: None,
                reply: Some(reply),
                close_link: true,
            });
        };

        let (protocol, source, destination) = (msg.protocol, msg.source, msg.destination);
        match msg.body {
            MessageBody::TcpOpenConnection {
                local_id,
                local_port,
                remote_port,
                compression,
                ..
            } => {
                let flow = FlowKey {
                    local_ip: destination,
                    local_port: remote_port,
                    remote_ip: source,
                    remote_port: local_port,
                };
                self.on_remote_open(sender, local_id, flow, ProtocolSetting { protocol, compression }, now)?;
            }
            MessageBody::TcpConnectionOpened {
                local_id,
                remote_id,
                compression,
                ..
            } => {
                let Some(conn) = self.find_circuit(sender, local_id, remote_id) else {
                    return self.reset_remote(sender, protocol, destination, source, remote_id, local_id);
                };
                let mut c = lock(&conn);
                self.connections.bind_remote(c.local_id, sender, local_id)?;
                let mut actions = Vec::new();
                c.on_remote_opened(local_id, compression, &self.tcp, now, &mut actions);
                self.apply(&mut c, actions)?;
            }
            MessageBody::TcpData {
                local_id,
                remote_id,
                flags,
                payload,
            } => {
                let Some(conn) = self.find_circuit(sender, local_id, remote_id) else {
                    return self.reset_remote(sender, protocol, destination, source, remote_id, local_id);
                };
                let mut c = lock(&conn);
                let mut actions = Vec::new();
                c.on_remote_data(payload, flags, &self.tcp, now, &mut actions);
                self.apply(&mut c, actions)?;
            }
            MessageBody::TcpCloseConnection { local_id, remote_id } => {
                let Some(conn) = self.find_circuit(sender, local_id, remote_id) else {
                    return self.reset_remote(sender, protocol, destination, source, remote_id, local_id);
                };
                let mut c = lock(&conn);
                let mut actions = Vec::new();
                c.on_remote_close(&self.tcp, now, &mut actions);
                self.apply(&mut c, actions)?;
            }
            MessageBody::TcpResetConnection { local_id, remote_id } => {
                if let Some(conn) = self.find_circuit(sender, local_id, remote_id) {
                    let mut c = lock(&conn);
                    let mut actions = Vec::new();
                    c.on_remote_reset(&self.tcp, &mut actions);
                    self.apply(&mut c, actions)?;
                }
            }
            MessageBody::Icmp {
                icmp_type,
                code,
                rest_of_header,
                ttl,
                payload,
                ..
            } => {
                if ttl == 0 {
                    log::trace!("ICMP {} -> {} from proxy {} dropped: TTL expired", source, destination, sender);
                    return Ok(InboundOutcome::default());
                }
                let packet = build_icmp_packet(
                    source,
                    destination,
                    ttl,
                    self.next_ident(),
                    icmp_type,
                    code,
                    rest_of_header,
                    &payload,
                );
                self.send_to_host(destination, packet)?;
            }
            MessageBody::UdpUnicastData { ttl, payload, .. } => {
                self.deliver_udp(source, destination, ttl, &payload)?;
            }
            MessageBody::MultipleUdpDatagrams { count, payload, .. } => {
                for (ttl, datagram) in unpack_datagrams(&payload, count)? {
                    self.deliver_udp(source, destination, ttl, &datagram)?;
                }
            }
            MessageBody::UdpBCastMCastData { payload, .. } | MessageBody::TunnelPacket { payload } => {
                let dst = parse_ipv4(&payload)?.dst;
                self.send_to_host(dst, payload)?;
            }
            MessageBody::InitializeConnection { .. }
            | MessageBody::ConnectionInitialized { .. }
            | MessageBody::ConnectionError { .. } => {}
        }
        Ok(InboundOutcome::default())
    }

    fn on_remote_open(
        &self,
        sender: u32,
        remote_id: u16,
        flow: FlowKey,
        setting: ProtocolSetting,
        now: Instant,
    ) -> Result<(), DispatchError> {
        if self.registry.is_mapped_address(flow.local_ip) {
            log::warn!("open request from proxy {} targets remote-mapped {}; resetting", sender, flow.local_ip);
            self.reset_remote(sender, setting.protocol, flow.local_ip, flow.remote_ip, 0, remote_id)?;
            return Err(DispatchError::NotMapped(flow.local_ip));
        }
        let created = self.connections.get_or_create_for_remote(sender, remote_id, flow, |id| {
            VirtualConnection::new(id, flow, sender, setting, now)
        });
        let (conn, created) = match created {
            Ok(entry) => entry,
            Err(e) => {
                self.reset_remote(sender, setting.protocol, flow.local_ip, flow.remote_ip, 0, remote_id)?;
                return Err(e.into());
            }
        };
        let mut c = lock(&conn);
        let mut actions = Vec::new();
        if created {
            Stats::bump(&self.stats.connections_opened);
            let isn = self.random_isn();
            c.on_remote_open(remote_id, setting.compression, isn, &self.tcp, now, &mut actions);
        } else {
            c.on_duplicate_open(&mut actions);
        }
        self.apply(&mut c, actions)
    }

    /// Find our end of a circuit; `ours` is 0 until the peer learned it
    fn find_circuit(&self, sender: u32, theirs: u16, ours: u16) -> Option<SharedConnection> {
        let conn = if ours != 0 {
            self.connections.get(ours)?
        } else {
            self.connections.find_by_remote(sender, theirs)?
        };
        {
            let c = lock(&conn);
            if c.remote_proxy != sender || (c.remote_id != 0 && c.remote_id != theirs) {
                return None;
            }
        }
        Some(conn)
    }

    /// TCPResetConnection for a circuit this side does not know
    fn reset_remote(
        &self,
        proxy_id: u32,
        protocol: ProxyProtocol,
        source: Ipv4Addr,
        destination: Ipv4Addr,
        ours: u16,
        theirs: u16,
    ) -> Result<InboundOutcome, DispatchError> {
        log::debug!("L{}-R{}: unknown circuit from proxy {}; replying reset", ours, theirs, proxy_id);
        Stats::bump(&self.stats.connections_reset);
        let body = MessageBody::TcpResetConnection {
            local_id: ours,
            remote_id: theirs,
        };
        self.send_to_proxy(proxy_id, protocol, source, destination, body)?;
        Ok(InboundOutcome::default())
    }

    fn deliver_udp(&self, source: Ipv4Addr, destination: Ipv4Addr, ttl: u8, datagram: &[u8]) -> Result<(), DispatchError> {
        if self.registry.is_mapped_address(destination) {
            log::debug!("UDP for remote-mapped {} dropped", destination);
            return Ok(());
        }
        let packet = build_ipv4_packet(source, destination, IP_PROTO_UDP, ttl, self.next_ident(), datagram);
        self.send_to_host(destination, packet)
    }

    // ========================================================================
    // Links
    // ========================================================================

    fn on_link_up(&self, proxy_id: u32, origin: &MessageOrigin, ports: ProxyPorts, now: Instant) {
        let address = origin
            .address
            .or_else(|| self.registry.remote_proxy(proxy_id).map(|p| p.address))
            .unwrap_or(Ipv4Addr::UNSPECIFIED);
        self.registry.on_peer_announced(proxy_id, address, ports);
        self.registry.set_link_state(proxy_id, origin.kind, LinkState::Connected);
        log::info!("{} link to remote proxy {} established", origin.kind, proxy_id);

        for (_, conn) in self.connections.for_proxy(proxy_id) {
            let mut c = lock(&conn);
            if c.setting.connector_kind() != origin.kind {
                continue;
            }
            let mut actions = Vec::new();
            c.on_link_established(now, &mut actions);
            if let Err(e) = self.apply(&mut c, actions) {
                log::debug!("L{}-R{}: open request not sent: {}", c.local_id, c.remote_id, e);
            }
        }
    }

    /// The peer tore down every link
    fn on_link_lost(&self, proxy_id: u32) {
        self.registry.drop_links(proxy_id);
        self.fail_connections(proxy_id, None);
    }

    /// A connector lost its transport to `proxy_id`
    ///
    /// Never waits for a connection lock: the caller may be the only thread
    /// draining the remote queue that a lock holder is blocked on. Busy
    /// connections are failed on the next [`Engine::reap`].
    pub fn on_transport_failure(&self, proxy_id: u32, kind: ConnectorKind) {
        self.registry.set_link_state(proxy_id, kind, LinkState::Disconnected);
        self.fail_connections(proxy_id, Some(kind));
    }

    fn fail_connections(&self, proxy_id: u32, kind: Option<ConnectorKind>) {
        let now = Instant::now();
        for (local_id, conn) in self.connections.for_proxy(proxy_id) {
            let mut c = match conn.try_lock() {
                Ok(c) => c,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    log::debug!("L{}: busy; link failure handled on the next timer pass", local_id);
                    lock(&self.deferred_failures).push(DeferredFailure {
                        local_id,
                        proxy_id,
                        kind,
                        at: now,
                    });
                    continue;
                }
            };
            self.fail_connection(&mut c, kind);
        }
    }

    fn fail_connection(&self, c: &mut VirtualConnection, kind: Option<ConnectorKind>) {
        if kind.map_or(false, |k| c.setting.connector_kind() != k) {
            return;
        }
        let mut actions = Vec::new();
        c.on_transport_failure(&self.tcp, &mut actions);
        if let Err(e) = self.apply(c, actions) {
            log::debug!("L{}-R{}: reset not delivered: {}", c.local_id, c.remote_id, e);
        }
    }

    /// Fail the connections that were busy when their link went down
    fn run_deferred_failures(&self) {
        let pending = std::mem::take(&mut *lock(&self.deferred_failures));
        for failure in pending {
            let Some(conn) = self.connections.get(failure.local_id) else {
                continue;
            };
            let mut c = lock(&conn);
            // The id may have been reused by a newer connection
            if c.remote_proxy != failure.proxy_id || c.opened_at() > failure.at {
                continue;
            }
            self.fail_connection(&mut c, failure.kind);
        }
    }

    // ========================================================================
    // Periodic Work
    // ========================================================================

    /// Run every connection timer; returns how many connections were removed
    pub fn reap(&self, now: Instant) -> usize {
        let before = self.connections.len();
        self.run_deferred_failures();
        for (_, conn) in self.connections.snapshot() {
            let mut c = lock(&conn);
            let mut actions = Vec::new();
            c.on_timer(&self.tcp, now, &mut actions);
            if let Err(e) = self.apply(&mut c, actions) {
                log::debug!("L{}-R{}: timer output dropped: {}", c.local_id, c.remote_id, e);
            }
        }
        before.saturating_sub(self.connections.len())
    }

    /// Start the auto-connections whose interval elapsed; returns how many
    pub fn auto_connect(&self, now: Instant) -> usize {
        let mut started = 0;
        for entry in self.registry.due_auto_connections(now) {
            let Some(info) = self.registry.remote_proxy(entry.proxy_id) else {
                continue;
            };
            self.registry
                .set_link_state(entry.proxy_id, entry.kind, LinkState::Connecting);
            let init = self.handshake(ProxyProtocol::default_for(entry.kind), self.settings.external_ip, info.address);
            match self.push_remote(entry.proxy_id, entry.kind, init) {
                Ok(()) => {
                    log::debug!("auto-connecting to remote proxy {} over {}", entry.proxy_id, entry.kind);
                    started += 1;
                }
                Err(e) => log::warn!("auto-connection to remote proxy {} failed: {}", entry.proxy_id, e),
            }
        }
        started
    }
}

/// Destination MAC for a broadcast or IPv4 multicast address
fn group_mac(ip: Ipv4Addr) -> MacAddr {
    if ip.is_multicast() {
        let o = ip.octets();
        MacAddr([0x01, 0x00, 0x5E, o[1] & 0x7F, o[2], o[3]])
    } else {
        MacAddr::BROADCAST
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address_range::AddressRangeDescriptor;
    use crate::classifier::ClassifiedFrame;
    use crate::packet::{build_udp_packet, tcp_flags::PSH};
    use crate::registry::RemoteProxyInfo;
    use std::sync::mpsc::TryRecvError;

    const PROXY_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
    const HOST_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x10]);

    fn host() -> Ipv4Addr {
        Ipv4Addr::new(192, 168, 1, 10)
    }

    fn remote_host() -> Ipv4Addr {
        Ipv4Addr::new(10, 1, 0, 5)
    }

    fn engine() -> (Engine, EngineQueues) {
        let settings = NetProxySettings {
            proxy_id: 1,
            internal_ip: Ipv4Addr::new(192, 168, 1, 1),
            external_ip: Ipv4Addr::new(172, 16, 0, 1),
            ..Default::default()
        };
        let (engine, queues) = Engine::new(settings, PROXY_MAC, EndpointTable::new());
        engine
            .registry()
            .add_remote_proxy_info(RemoteProxyInfo::new(2, Ipv4Addr::new(172, 16, 0, 2)));
        engine
            .registry()
            .add_address_mapping(AddressRangeDescriptor::parse("10.1.0.1-10.1.0.254").unwrap(), 2);
        engine.arc().insert(host(), HOST_MAC);
        (engine, queues)
    }

    fn origin() -> MessageOrigin {
        MessageOrigin {
            kind: ConnectorKind::Tcp,
            proxy_id: Some(2),
            address: Some(Ipv4Addr::new(172, 16, 0, 2)),
        }
    }

    fn peer_message(body: MessageBody) -> ProxyMessage {
        ProxyMessage::new(ProxyProtocol::Tcp, remote_host(), host(), body)
    }

    fn tcp_frame(flags: u8, seq: u32, ack: u32, payload: &[u8]) -> Vec<u8> {
        let spec = TcpSegmentSpec {
            src_ip: host(),
            src_port: 40000,
            dst_ip: remote_host(),
            dst_port: 22,
            seq,
            ack,
            flags,
            window: 65535,
            payload,
        };
        wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &build_tcp_packet(&spec, 64, 1))
    }

    fn host_segment(frame: &[u8]) -> (u8, u32, u32, usize) {
        let ClassifiedFrame {
            dst_mac,
            frame: Frame::Ipv4(ip),
            ..
        } = classify(frame).unwrap()
        else {
            panic!("not IPv4");
        };
        assert_eq!(dst_mac, HOST_MAC);
        assert_eq!(ip.ttl, SYNTHESIZED_TCP_TTL);
        let Transport::Tcp(tcp) = ip.transport else {
            panic!("not TCP");
        };
        (tcp.segment.flags, tcp.segment.seq, tcp.segment.ack, tcp.segment.payload.len())
    }

    /// SYN from the host through to ESTABLISHED; returns our circuit id and ISN
    fn establish(engine: &Engine, queues: &EngineQueues) -> (u16, u32) {
        engine.on_frame(&tcp_frame(SYN, 1000, 0, &[]), InterfaceSide::Internal).unwrap();
        let init = queues.remote.try_recv().unwrap();
        assert!(matches!(init.message.body, MessageBody::InitializeConnection { proxy_id: 1, .. }));

        engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::ConnectionInitialized {
                    proxy_id: 2,
                    ports: ProxyPorts::default(),
                }),
            )
            .unwrap();
        let open = queues.remote.try_recv().unwrap().message;
        let MessageBody::TcpOpenConnection { local_id, .. } = open.body else {
            panic!("expected open, got {:?}", open.body);
        };

        engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::TcpConnectionOpened {
                    local_id: 77,
                    remote_id: local_id,
                    proxy_id: 2,
                    ports: ProxyPorts::default(),
                    compression: Default::default(),
                }),
            )
            .unwrap();
        let (flags, isn, ack, _) = host_segment(&queues.local.try_recv().unwrap().frame);
        assert_eq!(flags, SYN | ACK);
        assert_eq!(ack, 1001);

        engine
            .on_frame(&tcp_frame(ACK, 1001, isn.wrapping_add(1), &[]), InterfaceSide::Internal)
            .unwrap();
        (local_id, isn)
    }

    #[test]
    fn test_arp_request_for_mapped_address_is_answered() {
        let (engine, queues) = engine();
        let request = build_arp(ARP_OP_REQUEST, HOST_MAC, host(), MacAddr::ZERO, remote_host());
        let frame = wrap_ethernet(MacAddr::BROADCAST, HOST_MAC, ETHERTYPE_ARP, &request);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();

        let reply = queues.local.try_recv().unwrap().frame;
        let Frame::Arp(arp) = classify(&reply).unwrap().frame else {
            panic!("not ARP");
        };
        assert_eq!(arp.op, ARP_OP_REPLY);
        assert_eq!(arp.sender_mac, PROXY_MAC);
        assert_eq!(arp.sender_ip, remote_host());

        let request = build_arp(ARP_OP_REQUEST, HOST_MAC, host(), MacAddr::ZERO, Ipv4Addr::new(8, 8, 8, 8));
        let frame = wrap_ethernet(MacAddr::BROADCAST, HOST_MAC, ETHERTYPE_ARP, &request);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();
        assert_eq!(queues.local.try_recv().unwrap_err(), TryRecvError::Empty);
    }

    #[test]
    fn test_syn_initializes_link_then_opens() {
        let (engine, queues) = engine();
        engine.on_frame(&tcp_frame(SYN, 1000, 0, &[]), InterfaceSide::Internal).unwrap();

        let init = queues.remote.try_recv().unwrap();
        assert_eq!(init.proxy_id, 2);
        assert_eq!(init.kind, ConnectorKind::Tcp);
        assert_eq!(init.message.source, host());
        assert_eq!(init.message.destination, remote_host());
        assert!(queues.remote.try_recv().is_err());
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Connecting);
        // Handshake is synchronized: no SYN-ACK before the peer answers
        assert!(queues.local.try_recv().is_err());

        let outcome = engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::ConnectionInitialized {
                    proxy_id: 2,
                    ports: ProxyPorts::default(),
                }),
            )
            .unwrap();
        assert_eq!(outcome.peer, Some(2));
        let open = queues.remote.try_recv().unwrap().message;
        assert!(matches!(
            open.body,
            MessageBody::TcpOpenConnection {
                local_port: 40000,
                remote_port: 22,
                proxy_id: 1,
                ..
            }
        ));
    }

    #[test]
    fn test_established_flow_forwards_data() {
        let (engine, queues) = engine();
        let (local_id, isn) = establish(&engine, &queues);

        let payload = [7u8; 500];
        engine
            .on_frame(&tcp_frame(ACK | PSH, 1001, isn.wrapping_add(1), &payload), InterfaceSide::Internal)
            .unwrap();
        let data = queues.remote.try_recv().unwrap().message;
        match data.body {
            MessageBody::TcpData {
                local_id: l,
                remote_id,
                payload,
                ..
            } => {
                assert_eq!(l, local_id);
                assert_eq!(remote_id, 77);
                assert_eq!(payload.len(), 500);
            }
            other => panic!("expected data, got {:?}", other),
        }

        engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::TcpData {
                    local_id: 77,
                    remote_id: local_id,
                    flags: 0,
                    payload: vec![1; 300],
                }),
            )
            .unwrap();
        let (flags, seq, _, _) = queues
            .local
            .try_iter()
            .map(|f| host_segment(&f.frame))
            .find(|seg| seg.3 == 300)
            .unwrap();
        assert!(flags & ACK != 0);
        assert_eq!(seq, isn.wrapping_add(1));
    }

    #[test]
    fn test_unmapped_syn_is_refused() {
        let (engine, queues) = engine();
        let spec = TcpSegmentSpec {
            src_ip: host(),
            src_port: 40001,
            dst_ip: Ipv4Addr::new(8, 8, 8, 8),
            dst_port: 443,
            seq: 5,
            ack: 0,
            flags: SYN,
            window: 1024,
            payload: &[],
        };
        let frame = wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &build_tcp_packet(&spec, 64, 1));
        assert!(matches!(
            engine.on_frame(&frame, InterfaceSide::Internal),
            Err(DispatchError::NotMapped(_))
        ));
        let (flags, _, ack, _) = host_segment(&queues.local.try_recv().unwrap().frame);
        assert_eq!(flags, RST | ACK);
        assert_eq!(ack, 6);
        assert!(engine.connections().is_empty());
    }

    #[test]
    fn test_remote_open_sends_syn_to_host() {
        let (engine, queues) = engine();
        engine
            .on_proxy_message(
                origin(),
                ProxyMessage::new(
                    ProxyProtocol::Tcp,
                    remote_host(),
                    host(),
                    MessageBody::TcpOpenConnection {
                        local_id: 9,
                        local_port: 50000,
                        remote_port: 80,
                        proxy_id: 2,
                        ports: ProxyPorts::default(),
                        compression: Default::default(),
                    },
                ),
            )
            .unwrap();
        let frame = queues.local.try_recv().unwrap().frame;
        let Frame::Ipv4(ip) = classify(&frame).unwrap().frame else {
            panic!("not IPv4");
        };
        assert_eq!((ip.src, ip.dst), (remote_host(), host()));
        let Transport::Tcp(tcp) = ip.transport else {
            panic!("not TCP");
        };
        assert_eq!((tcp.src_port, tcp.dst_port), (50000, 80));
        assert_eq!(tcp.segment.flags, SYN);
        assert_eq!(engine.connections().len(), 1);
        assert!(engine.connections().find_by_remote(2, 9).is_some());
    }

    #[test]
    fn test_uninitialized_link_gets_connection_error() {
        let (engine, _queues) = engine();
        let origin = MessageOrigin {
            kind: ConnectorKind::Udp,
            proxy_id: None,
            address: None,
        };
        let outcome = engine
            .on_proxy_message(
                origin,
                peer_message(MessageBody::TcpCloseConnection {
                    local_id: 1,
                    remote_id: 2,
                }),
            )
            .unwrap();
        assert!(outcome.close_link);
        assert!(matches!(
            outcome.reply.unwrap().body,
            MessageBody::ConnectionError { local_proxy_id: 1, .. }
        ));
    }

    #[test]
    fn test_initialize_is_answered_on_the_same_link() {
        let (engine, _queues) = engine();
        let origin = MessageOrigin {
            kind: ConnectorKind::Quic,
            proxy_id: None,
            address: Some(Ipv4Addr::new(172, 16, 0, 9)),
        };
        let outcome = engine
            .on_proxy_message(
                origin,
                peer_message(MessageBody::InitializeConnection {
                    proxy_id: 9,
                    ports: ProxyPorts::default(),
                }),
            )
            .unwrap();
        assert_eq!(outcome.peer, Some(9));
        let reply = outcome.reply.unwrap();
        assert_eq!((reply.source, reply.destination), (host(), remote_host()));
        assert!(matches!(reply.body, MessageBody::ConnectionInitialized { proxy_id: 1, .. }));
        assert_eq!(engine.registry().link_state(9, ConnectorKind::Quic), LinkState::Connected);
        assert!(engine.registry().remote_proxy(9).is_some());
    }

    #[test]
    fn test_unknown_circuit_is_reset() {
        let (engine, queues) = engine();
        engine.registry().set_link_state(2, ConnectorKind::Tcp, LinkState::Connected);
        engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::TcpData {
                    local_id: 40,
                    remote_id: 300,
                    flags: 0,
                    payload: vec![1, 2, 3],
                }),
            )
            .unwrap();
        let reset = queues.remote.try_recv().unwrap().message;
        assert_eq!(
            reset.body,
            MessageBody::TcpResetConnection {
                local_id: 300,
                remote_id: 40
            }
        );
    }

    #[test]
    fn test_udp_both_directions() {
        let (engine, queues) = engine();
        let packet = build_udp_packet(host(), 5353, remote_host(), 53, 40, 1, b"query");
        let frame = wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &packet);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();

        // Default UDP mapping: link handshake first, then the datagram
        let init = queues.remote.try_recv().unwrap();
        assert_eq!(init.kind, ConnectorKind::Udp);
        let data = queues.remote.try_recv().unwrap().message;
        let MessageBody::UdpUnicastData { ttl, payload, .. } = data.body else {
            panic!("expected UDP data");
        };
        assert_eq!(ttl, 40);
        assert_eq!(payload.len(), 8 + 5);

        let origin = MessageOrigin {
            kind: ConnectorKind::Udp,
            ..origin()
        };
        engine
            .on_proxy_message(
                origin,
                ProxyMessage::new(
                    ProxyProtocol::Udp,
                    remote_host(),
                    host(),
                    MessageBody::UdpUnicastData {
                        proxy_id: 2,
                        ttl: 33,
                        compression: Default::default(),
                        payload,
                    },
                ),
            )
            .unwrap();
        let frame = queues.local.try_recv().unwrap().frame;
        let Frame::Ipv4(ip) = classify(&frame).unwrap().frame else {
            panic!("not IPv4");
        };
        assert_eq!(ip.ttl, 33);
        let Transport::Udp(udp) = ip.transport else {
            panic!("not UDP");
        };
        assert_eq!((udp.src_port, udp.dst_port), (5353, 53));
        assert_eq!(udp.payload(), b"query");
    }

    #[test]
    fn test_icmp_echo_to_internal_ip_is_answered() {
        let (engine, queues) = engine();
        let packet = build_icmp_packet(host(), Ipv4Addr::new(192, 168, 1, 1), 64, 1, ICMP_ECHO_REQUEST, 0, 0x0001_0002, b"ping");
        let frame = wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &packet);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();

        let reply = queues.local.try_recv().unwrap().frame;
        let Frame::Ipv4(ip) = classify(&reply).unwrap().frame else {
            panic!("not IPv4");
        };
        let Transport::Icmp(icmp) = ip.transport else {
            panic!("not ICMP");
        };
        assert_eq!(icmp.icmp_type, ICMP_ECHO_REPLY);
        assert_eq!(icmp.rest_of_header, 0x0001_0002);
        assert_eq!(icmp.data, b"ping");
        assert!(queues.remote.try_recv().is_err());
    }

    #[test]
    fn test_icmp_ttl_is_decremented() {
        let (engine, queues) = engine();
        let packet = build_icmp_packet(host(), remote_host(), 10, 1, ICMP_ECHO_REQUEST, 0, 7, b"x");
        let frame = wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &packet);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();
        let _init = queues.remote.try_recv().unwrap();
        let MessageBody::Icmp { ttl, .. } = queues.remote.try_recv().unwrap().message.body else {
            panic!("expected ICMP");
        };
        assert_eq!(ttl, 9);

        let expired = build_icmp_packet(host(), remote_host(), 1, 2, ICMP_ECHO_REQUEST, 0, 7, b"x");
        let frame = wrap_ethernet(PROXY_MAC, HOST_MAC, ETHERTYPE_IPV4, &expired);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();
        assert!(queues.remote.try_recv().is_err());
    }

    #[test]
    fn test_broadcast_dropped_without_policy() {
        let (engine, queues) = engine();
        let packet = build_udp_packet(host(), 137, Ipv4Addr::BROADCAST, 137, 64, 1, b"hello");
        let frame = wrap_ethernet(MacAddr::BROADCAST, HOST_MAC, ETHERTYPE_IPV4, &packet);
        engine.on_frame(&frame, InterfaceSide::Internal).unwrap();
        assert!(queues.remote.try_recv().is_err());
    }

    #[test]
    fn test_connection_error_resets_flows() {
        let (engine, queues) = engine();
        establish(&engine, &queues);
        while queues.local.try_recv().is_ok() {}

        let outcome = engine
            .on_proxy_message(
                origin(),
                peer_message(MessageBody::ConnectionError {
                    local_proxy_id: 2,
                    remote_proxy_id: 1,
                }),
            )
            .unwrap();
        assert!(outcome.close_link);
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Disconnected);
        let (flags, _, _, _) = host_segment(&queues.local.try_recv().unwrap().frame);
        assert!(flags & RST != 0);
        assert!(engine.connections().is_empty());
    }

    #[test]
    fn test_transport_failure_skips_busy_connection_until_reap() {
        let (engine, queues) = engine();
        let (local_id, _) = establish(&engine, &queues);
        while queues.local.try_recv().is_ok() {}
        let conn = engine.connections().get(local_id).unwrap();

        // An ingress thread holds the connection while blocked on a full queue
        let guard = lock(&conn);
        let (done_tx, done_rx) = mpsc::channel();
        let shared = &engine;
        let returned = std::thread::scope(|scope| {
            scope.spawn(move || {
                shared.on_transport_failure(2, ConnectorKind::Tcp);
                let _ = done_tx.send(());
            });
            let returned = done_rx.recv_timeout(std::time::Duration::from_secs(2)).is_ok();
            drop(guard);
            returned
        });
        assert!(returned, "transport failure waited for a busy connection");
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Disconnected);
        assert_eq!(engine.connections().len(), 1);

        assert_eq!(engine.reap(Instant::now()), 1);
        assert!(engine.connections().is_empty());
        let (flags, _, _, _) = host_segment(&queues.local.try_recv().unwrap().frame);
        assert!(flags & RST != 0);
    }

    #[test]
    fn test_deferred_failure_spares_newer_connection() {
        let (engine, queues) = engine();
        let failed_at = Instant::now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let (local_id, _) = establish(&engine, &queues);
        // Failure recorded for an older connection that held the same id
        lock(&engine.deferred_failures).push(DeferredFailure {
            local_id,
            proxy_id: 2,
            kind: Some(ConnectorKind::Tcp),
            at: failed_at,
        });
        engine.reap(Instant::now());
        assert_eq!(engine.connections().len(), 1);
        assert!(lock(&engine.deferred_failures).is_empty());
    }

    #[test]
    fn test_syn_for_entry_being_opened_is_not_reset() {
        let (engine, queues) = engine();
        let flow = FlowKey {
            local_ip: host(),
            local_port: 40000,
            remote_ip: remote_host(),
            remote_port: 22,
        };
        let now = Instant::now();
        engine
            .connections()
            .get_or_create(flow, 2, |id| VirtualConnection::new(id, flow, 2, ProtocolSetting::default_tcp(), now))
            .unwrap();

        engine.on_frame(&tcp_frame(SYN, 1000, 0, &[]), InterfaceSide::Internal).unwrap();
        assert_eq!(engine.connections().len(), 1);
        assert!(queues.local.try_recv().is_err());
    }

    #[test]
    fn test_termination_flag() {
        let (engine, _queues) = engine();
        assert!(engine.is_running());
        engine.request_termination();
        assert!(engine.is_termination_requested());
        assert!(!engine.is_running());
    }
}
