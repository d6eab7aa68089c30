//! Transport connectors to remote NetProxies
//!
//! Every connector carries PWP messages over one transport and reports
//! what arrives as [`LinkEvent`]s. A link is one transport association
//! (a TCP stream, a QUIC connection, a UDP peer address, a relay peer);
//! its remote proxy id is known from the start for links we open and is
//! bound after the link handshake for links the peer opened.
//!
//! ```text
//!                 ┌───────────── Connector ─────────────┐
//!  send(proxy) ──►│ LinkTable: proxy id ─► LinkId ─► io │──► wire
//!  reply(link) ──►│                                     │
//!                 │ readers ──► EventQueue ──► receive()│◄── wire
//!                 └─────────────────────────────────────┘
//! ```

pub mod crypto;
pub mod csr;
pub mod quic;
pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::Ipv4Addr;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Mutex;
use std::time::Duration;

use netproxy_core::pwp::{self, ProxyMessage, PwpError};
use netproxy_core::registry::ConnectorTarget;
use netproxy_core::relay::RelayError;
use netproxy_core::ConnectorKind;

use crate::lock;

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConnectorError {
    Io(io::Error),
    Quic(quiche::Error),
    /// Key agreement or AEAD failure
    Crypto,
    Wire(PwpError),
    Relay(RelayError),
    /// No open link to that proxy
    NoLink(u32),
    UnsupportedTarget(ConnectorKind, ConnectorTarget),
    Handshake(String),
}

impl fmt::Display for ConnectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectorError::Io(e) => write!(f, "I/O error: {}", e),
            ConnectorError::Quic(e) => write!(f, "QUIC error: {:?}", e),
            ConnectorError::Crypto => write!(f, "cryptographic failure"),
            ConnectorError::Wire(e) => write!(f, "wire error: {}", e),
            ConnectorError::Relay(e) => write!(f, "relay error: {}", e),
            ConnectorError::NoLink(id) => write!(f, "no open link to remote proxy {}", id),
            ConnectorError::UnsupportedTarget(kind, target) => {
                write!(f, "{} connector cannot reach {:?}", kind, target)
            }
            ConnectorError::Handshake(reason) => write!(f, "handshake failed: {}", reason),
        }
    }
}

impl std::error::Error for ConnectorError {}

impl From<io::Error> for ConnectorError {
    fn from(e: io::Error) -> Self {
        ConnectorError::Io(e)
    }
}

impl From<quiche::Error> for ConnectorError {
    fn from(e: quiche::Error) -> Self {
        ConnectorError::Quic(e)
    }
}

impl From<ring::error::Unspecified> for ConnectorError {
    fn from(_: ring::error::Unspecified) -> Self {
        ConnectorError::Crypto
    }
}

impl From<PwpError> for ConnectorError {
    fn from(e: PwpError) -> Self {
        ConnectorError::Wire(e)
    }
}

impl From<RelayError> for ConnectorError {
    fn from(e: RelayError) -> Self {
        ConnectorError::Relay(e)
    }
}

// ============================================================================
// Links and Events
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(pub u64);

impl fmt::Display for LinkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Message {
        link: LinkId,
        /// Remote proxy id, once known
        peer: Option<u32>,
        address: Option<Ipv4Addr>,
        message: ProxyMessage,
    },
    /// The transport went away without a local close
    Closed { link: LinkId, peer: Option<u32> },
}

pub trait Connector: Send + Sync {
    fn kind(&self) -> ConnectorKind;

    /// Open a link to `proxy_id` unless one is already up
    fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError>;

    fn is_open(&self, proxy_id: u32) -> bool;

    fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError>;

    /// Write on one link, whether or not its peer is known
    fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError>;

    /// Attach the peer id learned from the link handshake
    fn bind(&self, link: LinkId, proxy_id: u32);

    /// Next event, or `None` once `timeout` elapsed
    fn receive(&self, timeout: Duration) -> Option<LinkEvent>;

    fn close(&self, link: LinkId);

    /// Stop listening and close every link
    fn shutdown(&self);
}

/// Links of one connector, addressable by id and by remote proxy
#[derive(Debug)]
pub struct LinkTable<W> {
    links: HashMap<LinkId, Link<W>>,
    peers: HashMap<u32, LinkId>,
    next: u64,
}

#[derive(Debug)]
pub struct Link<W> {
    pub peer: Option<u32>,
    pub io: W,
}

impl<W> Default for LinkTable<W> {
    fn default() -> Self {
        LinkTable {
            links: HashMap::new(),
            peers: HashMap::new(),
            next: 1,
        }
    }
}

impl<W> LinkTable<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: Option<u32>, io: W) -> LinkId {
        let id = LinkId(self.next);
        self.next += 1;
        self.links.insert(id, Link { peer: None, io });
        if let Some(proxy_id) = peer {
            self.bind(id, proxy_id);
        }
        id
    }

    pub fn get(&self, id: LinkId) -> Option<&Link<W>> {
        self.links.get(&id)
    }

    pub fn get_mut(&mut self, id: LinkId) -> Option<&mut Link<W>> {
        self.links.get_mut(&id)
    }

    pub fn link_for(&self, proxy_id: u32) -> Option<LinkId> {
        self.peers.get(&proxy_id).copied()
    }

    /// A newer link to the same proxy replaces the older one for sending
    pub fn bind(&mut self, id: LinkId, proxy_id: u32) -> bool {
        let Some(link) = self.links.get_mut(&id) else {
            return false;
        };
        if let Some(old) = link.peer.replace(proxy_id) {
            if old != proxy_id && self.peers.get(&old) == Some(&id) {
                self.peers.remove(&old);
            }
        }
        self.peers.insert(proxy_id, id);
        true
    }

    pub fn peer_of(&self, id: LinkId) -> Option<u32> {
        self.links.get(&id).and_then(|l| l.peer)
    }

    pub fn remove(&mut self, id: LinkId) -> Option<Link<W>> {
        let link = self.links.remove(&id)?;
        if let Some(proxy_id) = link.peer {
            if self.peers.get(&proxy_id) == Some(&id) {
                self.peers.remove(&proxy_id);
            }
        }
        Some(link)
    }

    pub fn ids(&self) -> Vec<LinkId> {
        self.links.keys().copied().collect()
    }

    pub fn find<P>(&self, pred: P) -> Option<LinkId>
    where
        P: Fn(&W) -> bool,
    {
        self.links.iter().find(|(_, l)| pred(&l.io)).map(|(id, _)| *id)
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }
}

/// Bounded queue between a connector's readers and its `receive`
pub struct EventQueue {
    tx: SyncSender<LinkEvent>,
    rx: Mutex<Receiver<LinkEvent>>,
}

impl EventQueue {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        EventQueue { tx, rx: Mutex::new(rx) }
    }

    pub fn sender(&self) -> SyncSender<LinkEvent> {
        self.tx.clone()
    }

    /// Blocks while the queue is full
    pub fn push(&self, event: LinkEvent) {
        let _ = self.tx.send(event);
    }

    /// Non-blocking; drops the event when the queue is full
    pub fn offer(&self, event: LinkEvent) -> bool {
        match self.tx.try_send(event) {
            Ok(()) => true,
            Err(TrySendError::Full(ev)) => {
                log::warn!("link event queue full; dropping {:?}", event_kind(&ev));
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn recv(&self, timeout: Duration) -> Option<LinkEvent> {
        match lock(&self.rx).recv_timeout(timeout) {
            Ok(ev) => Some(ev),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

fn event_kind(ev: &LinkEvent) -> String {
    match ev {
        LinkEvent::Message { link, message, .. } => format!("{:?} on link {}", message.message_type(), link),
        LinkEvent::Closed { link, .. } => format!("close of link {}", link),
    }
}

// ============================================================================
// Stream Reassembly
// ============================================================================

/// Cuts PWP messages out of a byte stream
#[derive(Debug, Default)]
pub struct MessageReader {
    buf: Vec<u8>,
}

impl MessageReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// `Ok(None)` until a whole message is buffered; an error means the
    /// stream is out of sync and the link should be dropped
    pub fn next_message(&mut self) -> Result<Option<ProxyMessage>, PwpError> {
        let Some(len) = pwp::frame_length(&self.buf)? else {
            return Ok(None);
        };
        if self.buf.len() < len {
            return Ok(None);
        }
        let msg = pwp::decode(&self.buf[..len])?;
        self.buf.drain(..len);
        Ok(Some(msg))
    }

    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Decode every message of one datagram
pub fn decode_datagram(data: &[u8]) -> Result<Vec<ProxyMessage>, PwpError> {
    let mut reader = MessageReader::new();
    reader.push(data);
    let mut out = Vec::new();
    while let Some(msg) = reader.next_message()? {
        out.push(msg);
    }
    if reader.pending() > 0 {
        log::warn!("{} trailing bytes in datagram ignored", reader.pending());
    }
    Ok(out)
}

pub(crate) fn ipv4_of(addr: std::net::SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(ip) => ip.to_ipv4_mapped(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netproxy_core::protocol::ProxyProtocol;
    use netproxy_core::pwp::{MessageBody, ProxyPorts};

    fn init(id: u32) -> ProxyMessage {
        ProxyMessage::new(
            ProxyProtocol::Tcp,
            Ipv4Addr::new(172, 16, 0, 1),
            Ipv4Addr::new(172, 16, 0, 2),
            MessageBody::InitializeConnection {
                proxy_id: id,
                ports: ProxyPorts::default(),
            },
        )
    }

    #[test]
    fn test_link_table_binding() {
        let mut table = LinkTable::new();
        let a = table.insert(None, "accepted");
        let b = table.insert(Some(7), "opened");
        assert_eq!(table.link_for(7), Some(b));
        assert_eq!(table.peer_of(a), None);

        // A later handshake on another link takes over sending
        assert!(table.bind(a, 7));
        assert_eq!(table.link_for(7), Some(a));

        // Removing the stale link leaves the binding alone
        table.remove(b);
        assert_eq!(table.link_for(7), Some(a));
        table.remove(a);
        assert_eq!(table.link_for(7), None);
        assert!(table.is_empty());
    }

    #[test]
    fn test_message_reader_split_stream() {
        let mut wire = pwp::encode(&init(3)).unwrap();
        wire.extend_from_slice(&pwp::encode(&init(4)).unwrap());

        let mut reader = MessageReader::new();
        reader.push(&wire[..5]);
        assert_eq!(reader.next_message().unwrap(), None);
        reader.push(&wire[5..]);
        assert_eq!(reader.next_message().unwrap(), Some(init(3)));
        assert_eq!(reader.next_message().unwrap(), Some(init(4)));
        assert_eq!(reader.next_message().unwrap(), None);
        assert_eq!(reader.pending(), 0);
    }

    #[test]
    fn test_message_reader_rejects_garbage() {
        let mut reader = MessageReader::new();
        reader.push(&[0xEE, 0, 0, 0]);
        assert!(reader.next_message().is_err());
    }

    #[test]
    fn test_event_queue_timeout() {
        let q = EventQueue::new(1);
        assert!(q.recv(Duration::from_millis(1)).is_none());
        assert!(q.offer(LinkEvent::Closed { link: LinkId(1), peer: None }));
        assert!(!q.offer(LinkEvent::Closed { link: LinkId(2), peer: None }));
        assert_eq!(
            q.recv(Duration::from_millis(1)),
            Some(LinkEvent::Closed { link: LinkId(1), peer: None })
        );
    }
}
