//! QUIC connector
//!
//! One UDP socket serves every QUIC link, both the ones we open (client
//! role) and, when a certificate is configured, the ones remote proxies
//! open to us (server role). A driver thread runs the mio loop:
//!
//! ```text
//!   poll(socket, min(conn timeouts, 50ms))
//!     ├── recv_from ──► route by DCID ──► conn.recv ──► stream 0 ──► LinkEvent
//!     ├── on_timeout for every connection
//!     ├── stream backlogs ──► conn.send ──► send_to
//!     └── reap closed connections ──► LinkEvent::Closed
//! ```
//!
//! PWP messages travel back to back on client-initiated bidirectional
//! stream 0. Bytes written before the handshake finishes wait in a
//! per-link backlog.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use mio::net::UdpSocket;
use mio::{Events, Interest, Poll, Token};
use ring::rand::{SecureRandom, SystemRandom};

use netproxy_core::pwp::{self, ProxyMessage};
use netproxy_core::registry::ConnectorTarget;
use netproxy_core::ConnectorKind;

use super::{ipv4_of, Connector, ConnectorError, EventQueue, LinkEvent, LinkId, LinkTable, MessageReader};
use crate::lock;

// ============================================================================
// Constants
// ============================================================================

/// Maximum UDP payload size for QUIC packets
const MAX_DATAGRAM_SIZE: usize = 1350;

/// QUIC idle timeout in milliseconds
const IDLE_TIMEOUT_MS: u64 = 30_000;

/// ALPN protocol identifier; both ends must agree
const ALPN_PROTOCOL: &[u8] = b"netproxy-v1";

const SOCKET_TOKEN: Token = Token(0);

/// Stream carrying PWP messages
const MESSAGE_STREAM: u64 = 0;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Application error code sent when closing a link
const CLOSE_NORMAL: u64 = 0;
const CLOSE_PROTOCOL_ERROR: u64 = 1;

/// Certificate and key for accepting QUIC links
#[derive(Debug, Clone)]
pub struct QuicTls {
    pub cert_path: String,
    pub key_path: String,
}

fn base_config() -> Result<quiche::Config, quiche::Error> {
    let mut config = quiche::Config::new(quiche::PROTOCOL_VERSION)?;
    config.set_application_protos(&[ALPN_PROTOCOL])?;
    config.set_max_idle_timeout(IDLE_TIMEOUT_MS);
    config.set_max_recv_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_max_send_udp_payload_size(MAX_DATAGRAM_SIZE);
    config.set_initial_max_data(10_000_000);
    config.set_initial_max_stream_data_bidi_local(1_000_000);
    config.set_initial_max_stream_data_bidi_remote(1_000_000);
    config.set_initial_max_streams_bidi(16);
    config.set_initial_max_streams_uni(0);
    // Links are authenticated by the proxy handshake, not by certificates
    config.verify_peer(false);
    Ok(config)
}

fn new_cid(rng: &SystemRandom) -> Result<quiche::ConnectionId<'static>, ConnectorError> {
    let mut scid = [0u8; quiche::MAX_CONN_ID_LEN];
    rng.fill(&mut scid)?;
    Ok(quiche::ConnectionId::from_vec(scid.to_vec()))
}

// ============================================================================
// Driver State
// ============================================================================

struct QuicLink {
    conn: quiche::Connection,
    peer_addr: SocketAddr,
    link: LinkId,
    reader: MessageReader,
    /// Encoded messages not yet accepted by the stream
    backlog: Vec<u8>,
}

impl QuicLink {
    fn new(conn: quiche::Connection, peer_addr: SocketAddr, link: LinkId) -> Self {
        QuicLink {
            conn,
            peer_addr,
            link,
            reader: MessageReader::new(),
            backlog: Vec::new(),
        }
    }

    fn flush_backlog(&mut self) {
        if self.backlog.is_empty() || !self.conn.is_established() {
            return;
        }
        match self.conn.stream_send(MESSAGE_STREAM, &self.backlog, false) {
            Ok(n) => {
                self.backlog.drain(..n);
            }
            Err(quiche::Error::Done) => {}
            Err(e) => log::warn!("QUIC link {} stream write failed: {:?}", self.link, e),
        }
    }

    fn send_pending(&mut self, socket: &UdpSocket, out: &mut [u8]) {
        loop {
            match self.conn.send(out) {
                Ok((len, info)) => {
                    if let Err(e) = socket.send_to(&out[..len], info.to) {
                        log::debug!("QUIC send to {} failed: {}", info.to, e);
                        break;
                    }
                }
                Err(quiche::Error::Done) => break,
                Err(e) => {
                    log::debug!("QUIC link {} send error: {:?}", self.link, e);
                    break;
                }
            }
        }
    }

    fn read_streams(&mut self, peer: Option<u32>, out: &mut Vec<LinkEvent>) {
        let mut buf = [0u8; 4096];
        for stream_id in self.conn.readable() {
            loop {
                match self.conn.stream_recv(stream_id, &mut buf) {
                    Ok((n, fin)) => {
                        if stream_id == MESSAGE_STREAM {
                            self.reader.push(&buf[..n]);
                        } else {
                            log::debug!("QUIC link {}: {} bytes on unexpected stream {}", self.link, n, stream_id);
                        }
                        if fin {
                            break;
                        }
                    }
                    Err(quiche::Error::Done) => break,
                    Err(e) => {
                        log::debug!("QUIC link {} stream {} read error: {:?}", self.link, stream_id, e);
                        break;
                    }
                }
            }
        }

        let address = ipv4_of(self.peer_addr);
        loop {
            match self.reader.next_message() {
                Ok(Some(message)) => out.push(LinkEvent::Message {
                    link: self.link,
                    peer,
                    address,
                    message,
                }),
                Ok(None) => break,
                Err(e) => {
                    log::warn!("QUIC link {}: malformed message ({}); closing", self.link, e);
                    let _ = self.conn.close(true, CLOSE_PROTOCOL_ERROR, b"malformed message");
                    break;
                }
            }
        }
    }
}

struct Driver {
    socket: UdpSocket,
    local_addr: SocketAddr,
    client_config: quiche::Config,
    server_config: Option<quiche::Config>,
    conns: HashMap<quiche::ConnectionId<'static>, QuicLink>,
    links: LinkTable<quiche::ConnectionId<'static>>,
    rng: SystemRandom,
    recv_buf: Vec<u8>,
    send_buf: Vec<u8>,
}

impl Driver {
    fn next_timeout(&self) -> Option<Duration> {
        self.conns.values().filter_map(|q| q.conn.timeout()).min()
    }

    fn read_socket(&mut self, out: &mut Vec<LinkEvent>) {
        loop {
            let (len, from) = match self.socket.recv_from(&mut self.recv_buf) {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    log::debug!("QUIC socket receive failed: {}", e);
                    break;
                }
            };
            let mut pkt = self.recv_buf[..len].to_vec();
            self.process_packet(&mut pkt, from, out);
        }
    }

    fn process_packet(&mut self, pkt: &mut [u8], from: SocketAddr, out: &mut Vec<LinkEvent>) {
        let (dcid, scid, ty, version) = match quiche::Header::from_slice(pkt, quiche::MAX_CONN_ID_LEN) {
            Ok(hdr) => (hdr.dcid.clone().into_owned(), hdr.scid.clone().into_owned(), hdr.ty, hdr.version),
            Err(e) => {
                log::debug!("Unparseable QUIC header from {}: {:?}", from, e);
                return;
            }
        };

        let cid = if self.conns.contains_key(&dcid) {
            dcid
        } else if ty == quiche::Type::Initial {
            match self.accept(&dcid, &scid, version, from) {
                Some(cid) => cid,
                None => return,
            }
        } else {
            log::debug!("QUIC packet for unknown connection from {}", from);
            return;
        };

        let local = self.local_addr;
        let Some(q) = self.conns.get_mut(&cid) else {
            return;
        };
        if let Err(e) = q.conn.recv(pkt, quiche::RecvInfo { from, to: local }) {
            log::debug!("QUIC link {} recv error: {:?}", q.link, e);
            return;
        }
        let peer = self.links.peer_of(q.link);
        q.read_streams(peer, out);
    }

    fn accept(
        &mut self,
        dcid: &quiche::ConnectionId<'static>,
        peer_scid: &quiche::ConnectionId<'static>,
        version: u32,
        from: SocketAddr,
    ) -> Option<quiche::ConnectionId<'static>> {
        let Some(config) = self.server_config.as_mut() else {
            log::trace!("QUIC Initial from {} ignored (no certificate configured)", from);
            return None;
        };

        if !quiche::version_is_supported(version) {
            match quiche::negotiate_version(peer_scid, dcid, &mut self.send_buf) {
                Ok(len) => {
                    let _ = self.socket.send_to(&self.send_buf[..len], from);
                }
                Err(e) => log::debug!("QUIC version negotiation failed: {:?}", e),
            }
            return None;
        }

        let scid = match new_cid(&self.rng) {
            Ok(c) => c,
            Err(e) => {
                log::warn!("Cannot allocate a QUIC connection ID: {}", e);
                return None;
            }
        };
        match quiche::accept(&scid, None, self.local_addr, from, config) {
            Ok(conn) => {
                let link = self.links.insert(None, scid.clone());
                log::info!("Accepted QUIC link {} from {}", link, from);
                self.conns.insert(scid.clone(), QuicLink::new(conn, from, link));
                Some(scid)
            }
            Err(e) => {
                log::warn!("QUIC accept from {} failed: {:?}", from, e);
                None
            }
        }
    }

    fn on_timeouts(&mut self) {
        for q in self.conns.values_mut() {
            q.conn.on_timeout();
        }
    }

    fn flush(&mut self) {
        for q in self.conns.values_mut() {
            q.flush_backlog();
            q.send_pending(&self.socket, &mut self.send_buf);
        }
    }

    fn flush_one(&mut self, cid: &quiche::ConnectionId<'static>) {
        if let Some(q) = self.conns.get_mut(cid) {
            q.flush_backlog();
            q.send_pending(&self.socket, &mut self.send_buf);
        }
    }

    fn reap(&mut self, out: &mut Vec<LinkEvent>) {
        let closed: Vec<_> = self
            .conns
            .iter()
            .filter(|(_, q)| q.conn.is_closed())
            .map(|(cid, _)| cid.clone())
            .collect();
        for cid in closed {
            let Some(q) = self.conns.remove(&cid) else {
                continue;
            };
            // Still in the table means nobody closed it locally
            if let Some(l) = self.links.remove(q.link) {
                log::warn!(
                    "QUIC link {} to {} (remote proxy {:?}) closed{}",
                    q.link,
                    q.peer_addr,
                    l.peer,
                    if q.conn.is_timed_out() { " on idle timeout" } else { "" }
                );
                out.push(LinkEvent::Closed { link: q.link, peer: l.peer });
            }
        }
    }

    fn enqueue(&mut self, link: LinkId, bytes: &[u8]) -> Result<(), ConnectorError> {
        let cid = self
            .links
            .get(link)
            .map(|l| l.io.clone())
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed")))?;
        let q = self
            .conns
            .get_mut(&cid)
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed")))?;
        q.backlog.extend_from_slice(bytes);
        self.flush_one(&cid);
        Ok(())
    }
}

// ============================================================================
// Connector
// ============================================================================

pub struct QuicConnector {
    driver: Arc<Mutex<Driver>>,
    events: Arc<EventQueue>,
    running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
    local_addr: SocketAddr,
}

impl QuicConnector {
    /// Bind the socket and start the driver; `tls` enables accepting links
    pub fn bind(listen: SocketAddr, tls: Option<&QuicTls>, queue_capacity: usize) -> Result<Self, ConnectorError> {
        let poll = Poll::new()?;
        let mut socket = UdpSocket::bind(listen)?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        let local_addr = socket.local_addr()?;

        let server_config = match tls {
            Some(tls) => {
                let mut config = base_config()?;
                config.load_cert_chain_from_pem_file(&tls.cert_path)?;
                config.load_priv_key_from_pem_file(&tls.key_path)?;
                log::info!("QUIC connector accepting links on {}", local_addr);
                Some(config)
            }
            None => {
                log::info!("QUIC connector bound to {} (outgoing links only)", local_addr);
                None
            }
        };

        let driver = Arc::new(Mutex::new(Driver {
            socket,
            local_addr,
            client_config: base_config()?,
            server_config,
            conns: HashMap::new(),
            links: LinkTable::new(),
            rng: SystemRandom::new(),
            recv_buf: vec![0u8; 65535],
            send_buf: vec![0u8; MAX_DATAGRAM_SIZE],
        }));
        let events = Arc::new(EventQueue::new(queue_capacity));
        let running = Arc::new(AtomicBool::new(true));

        let thread = {
            let (driver, events, running) = (driver.clone(), events.clone(), running.clone());
            thread::Builder::new()
                .name("quic-driver".into())
                .spawn(move || drive(poll, driver, events, running))?
        };

        Ok(QuicConnector {
            driver,
            events,
            running,
            thread: Mutex::new(Some(thread)),
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

fn drive(mut poll: Poll, driver: Arc<Mutex<Driver>>, events: Arc<EventQueue>, running: Arc<AtomicBool>) {
    let mut ready = Events::with_capacity(1024);
    while running.load(Ordering::Acquire) {
        let timeout = lock(&driver)
            .next_timeout()
            .map_or(POLL_INTERVAL, |t| t.min(POLL_INTERVAL));
        if let Err(e) = poll.poll(&mut ready, Some(timeout)) {
            if e.kind() != io::ErrorKind::Interrupted {
                log::warn!("QUIC poll failed: {}", e);
                thread::sleep(POLL_INTERVAL);
            }
            continue;
        }

        // Events are handed out after the driver lock is released
        let out = {
            let mut d = lock(&driver);
            let mut out = Vec::new();
            d.read_socket(&mut out);
            d.on_timeouts();
            d.flush();
            d.reap(&mut out);
            out
        };
        for ev in out {
            events.push(ev);
        }
    }
}

impl Connector for QuicConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Quic
    }

    fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError> {
        let ConnectorTarget::Direct(addr) = target else {
            return Err(ConnectorError::UnsupportedTarget(ConnectorKind::Quic, target));
        };
        let mut guard = lock(&self.driver);
        let d = &mut *guard;
        if d.links.link_for(proxy_id).is_some() {
            return Ok(());
        }
        let scid = new_cid(&d.rng)?;
        let conn = quiche::connect(None, &scid, d.local_addr, addr, &mut d.client_config)?;
        let link = d.links.insert(Some(proxy_id), scid.clone());
        log::info!("Opening QUIC link {} to remote proxy {} at {}", link, proxy_id, addr);
        d.conns.insert(scid.clone(), QuicLink::new(conn, addr, link));
        d.flush_one(&scid);
        Ok(())
    }

    fn is_open(&self, proxy_id: u32) -> bool {
        lock(&self.driver).links.link_for(proxy_id).is_some()
    }

    fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let bytes = pwp::encode(msg)?;
        let mut d = lock(&self.driver);
        let link = d.links.link_for(proxy_id).ok_or(ConnectorError::NoLink(proxy_id))?;
        d.enqueue(link, &bytes)
    }

    fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let bytes = pwp::encode(msg)?;
        lock(&self.driver).enqueue(link, &bytes)
    }

    fn bind(&self, link: LinkId, proxy_id: u32) {
        if lock(&self.driver).links.bind(link, proxy_id) {
            log::debug!("QUIC link {} bound to remote proxy {}", link, proxy_id);
        }
    }

    fn receive(&self, timeout: Duration) -> Option<LinkEvent> {
        self.events.recv(timeout)
    }

    fn close(&self, link: LinkId) {
        let mut d = lock(&self.driver);
        if let Some(l) = d.links.remove(link) {
            if let Some(q) = d.conns.get_mut(&l.io) {
                let _ = q.conn.close(true, CLOSE_NORMAL, b"link closed");
            }
            d.flush_one(&l.io);
        }
    }

    fn shutdown(&self) {
        let ids = lock(&self.driver).links.ids();
        for id in ids {
            self.close(id);
        }
        self.running.store(false, Ordering::Release);
        if let Some(handle) = lock(&self.thread).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for QuicConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
