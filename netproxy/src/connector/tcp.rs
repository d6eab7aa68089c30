//! TCP connector
//!
//! One TCP stream per link, PWP messages back to back on the stream. With
//! a pre-shared key every stream starts with the key exchange of
//! [`super::crypto`] and carries sealed records afterwards.
//!
//! Each link has a reader thread; writes happen on the caller's thread
//! under the link's own writer lock, never under the table lock.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use netproxy_core::pwp::{self, ProxyMessage};
use netproxy_core::registry::ConnectorTarget;
use netproxy_core::ConnectorKind;

use super::crypto::{self, Opener, PreSharedKey, Sealer};
use super::{ipv4_of, Connector, ConnectorError, EventQueue, LinkEvent, LinkId, LinkTable, MessageReader};
use crate::lock;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const READ_BUF_SIZE: usize = 16 * 1024;

struct TcpWriter {
    stream: TcpStream,
    sealer: Option<Sealer>,
}

impl TcpWriter {
    fn write_message(&mut self, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let bytes = pwp::encode(msg)?;
        match self.sealer.as_mut() {
            Some(sealer) => self.stream.write_all(&sealer.seal(&bytes)?)?,
            None => self.stream.write_all(&bytes)?,
        }
        Ok(())
    }
}

type SharedWriter = Arc<Mutex<TcpWriter>>;

struct Shared {
    key: Option<PreSharedKey>,
    links: Mutex<LinkTable<SharedWriter>>,
    events: EventQueue,
    running: AtomicBool,
}

pub struct TcpConnector {
    shared: Arc<Shared>,
    local_addr: Option<SocketAddr>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl TcpConnector {
    /// Create the connector; with `listen` set, accept links on that address
    pub fn new(
        listen: Option<SocketAddr>,
        key: Option<PreSharedKey>,
        queue_capacity: usize,
    ) -> Result<Self, ConnectorError> {
        let shared = Arc::new(Shared {
            key,
            links: Mutex::new(LinkTable::new()),
            events: EventQueue::new(queue_capacity),
            running: AtomicBool::new(true),
        });

        let mut local_addr = None;
        let mut acceptor = None;
        if let Some(addr) = listen {
            let listener = TcpListener::bind(addr)?;
            listener.set_nonblocking(true)?;
            local_addr = Some(listener.local_addr()?);
            log::info!(
                "TCP connector listening on {}{}",
                listener.local_addr()?,
                if shared.key.is_some() { " (encrypted)" } else { "" }
            );
            let shared = shared.clone();
            acceptor = Some(
                thread::Builder::new()
                    .name("tcp-accept".into())
                    .spawn(move || accept_loop(listener, shared))?,
            );
        }

        Ok(TcpConnector {
            shared,
            local_addr,
            acceptor: Mutex::new(acceptor),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    fn writer(&self, link: LinkId) -> Option<SharedWriter> {
        lock(&self.shared.links).get(link).map(|l| l.io.clone())
    }

    fn write(&self, link: LinkId, writer: SharedWriter, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let result = lock(&writer).write_message(msg);
        if let Err(e) = &result {
            log::warn!("TCP link {} write failed: {}", link, e);
            drop_link(&self.shared, link);
        }
        result
    }
}

impl Connector for TcpConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Tcp
    }

    fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError> {
        if self.is_open(proxy_id) {
            return Ok(());
        }
        let ConnectorTarget::Direct(addr) = target else {
            return Err(ConnectorError::UnsupportedTarget(ConnectorKind::Tcp, target));
        };
        log::info!("Opening TCP link to remote proxy {} at {}", proxy_id, addr);
        let stream = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)?;
        attach(&self.shared, stream, Some(proxy_id), true)?;
        Ok(())
    }

    fn is_open(&self, proxy_id: u32) -> bool {
        lock(&self.shared.links).link_for(proxy_id).is_some()
    }

    fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let found = {
            let links = lock(&self.shared.links);
            links
                .link_for(proxy_id)
                .and_then(|id| links.get(id).map(|l| (id, l.io.clone())))
        };
        let (link, writer) = found.ok_or(ConnectorError::NoLink(proxy_id))?;
        self.write(link, writer, msg)
    }

    fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let writer = self
            .writer(link)
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed")))?;
        self.write(link, writer, msg)
    }

    fn bind(&self, link: LinkId, proxy_id: u32) {
        if lock(&self.shared.links).bind(link, proxy_id) {
            log::debug!("TCP link {} bound to remote proxy {}", link, proxy_id);
        }
    }

    fn receive(&self, timeout: Duration) -> Option<LinkEvent> {
        self.shared.events.recv(timeout)
    }

    fn close(&self, link: LinkId) {
        drop_link(&self.shared, link);
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        let ids = lock(&self.shared.links).ids();
        for id in ids {
            drop_link(&self.shared, id);
        }
        if let Some(handle) = lock(&self.acceptor).take() {
            let _ = handle.join();
        }
    }
}

impl Drop for TcpConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Remove a link and shut its stream; the reader sees EOF and exits quietly
fn drop_link(shared: &Shared, link: LinkId) {
    let removed = lock(&shared.links).remove(link);
    if let Some(l) = removed {
        log::debug!("TCP link {} closed (peer {:?})", link, l.peer);
        let _ = lock(&l.io).stream.shutdown(Shutdown::Both);
    }
}

fn accept_loop(listener: TcpListener, shared: Arc<Shared>) {
    while shared.running.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, from)) => {
                log::debug!("Accepted TCP link from {}", from);
                if let Err(e) = attach(&shared, stream, None, false) {
                    log::warn!("TCP link from {} rejected: {}", from, e);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                log::warn!("TCP accept failed: {}", e);
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

/// Register a connected stream and start its reader
fn attach(
    shared: &Arc<Shared>,
    mut stream: TcpStream,
    peer: Option<u32>,
    initiator: bool,
) -> Result<LinkId, ConnectorError> {
    stream.set_nonblocking(false)?;
    stream.set_nodelay(true)?;
    let address = stream.peer_addr().ok().and_then(ipv4_of);

    let (sealer, opener) = match &shared.key {
        Some(key) => {
            stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;
            let (s, o) = crypto::handshake(&mut stream, key, initiator)?;
            stream.set_read_timeout(None)?;
            (Some(s), Some(o))
        }
        None => (None, None),
    };

    let reader = stream.try_clone()?;
    let writer = Arc::new(Mutex::new(TcpWriter { stream, sealer }));
    let link = lock(&shared.links).insert(peer, writer);

    let shared = shared.clone();
    thread::Builder::new()
        .name(format!("tcp-link-{}", link.0))
        .spawn(move || read_loop(reader, opener, link, address, shared))?;
    Ok(link)
}

fn read_loop(
    mut stream: TcpStream,
    mut opener: Option<Opener>,
    link: LinkId,
    address: Option<std::net::Ipv4Addr>,
    shared: Arc<Shared>,
) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut messages = MessageReader::new();

    let reason = 'read: loop {
        let n = match stream.read(&mut buf) {
            Ok(0) => break 'read "closed by peer".to_string(),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => break 'read e.to_string(),
        };

        match opener.as_mut() {
            Some(opener) => {
                opener.push(&buf[..n]);
                loop {
                    match opener.next_record() {
                        Ok(Some(plain)) => messages.push(&plain),
                        Ok(None) => break,
                        Err(e) => break 'read e.to_string(),
                    }
                }
            }
            None => messages.push(&buf[..n]),
        }

        loop {
            match messages.next_message() {
                Ok(Some(message)) => {
                    let peer = lock(&shared.links).peer_of(link);
                    shared.events.push(LinkEvent::Message {
                        link,
                        peer,
                        address,
                        message,
                    });
                }
                Ok(None) => break,
                Err(e) => break 'read format!("malformed message: {}", e),
            }
        }
    };

    // Present only if nobody closed the link locally
    let removed = lock(&shared.links).remove(link);
    if let Some(l) = removed {
        log::warn!("TCP link {} to remote proxy {:?} lost: {}", link, l.peer, reason);
        let _ = stream.shutdown(Shutdown::Both);
        shared.events.push(LinkEvent::Closed { link, peer: l.peer });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netproxy_core::protocol::ProxyProtocol;
    use netproxy_core::pwp::{MessageBody, ProxyPorts};
    use std::net::Ipv4Addr;

    fn hello(id: u32) -> ProxyMessage {
        ProxyMessage::new(
            ProxyProtocol::Tcp,
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            MessageBody::InitializeConnection {
                proxy_id: id,
                ports: ProxyPorts::default(),
            },
        )
    }

    fn listener(key: Option<PreSharedKey>) -> TcpConnector {
        TcpConnector::new(Some("127.0.0.1:0".parse().unwrap()), key, 16).unwrap()
    }

    #[test]
    fn test_open_send_receive() {
        let server = listener(None);
        let client = TcpConnector::new(None, None, 16).unwrap();
        let target = ConnectorTarget::Direct(server.local_addr().unwrap());

        client.open(2, target).unwrap();
        assert!(client.is_open(2));
        client.send(2, &hello(1)).unwrap();

        match server.receive(Duration::from_secs(5)) {
            Some(LinkEvent::Message { peer, message, address, .. }) => {
                assert_eq!(peer, None);
                assert_eq!(address, Some(Ipv4Addr::LOCALHOST));
                assert_eq!(message, hello(1));
            }
            other => panic!("expected a message, got {:?}", other),
        }
    }

    #[test]
    fn test_encrypted_link() {
        let key = PreSharedKey::from_passphrase("lab");
        let server = listener(Some(key.clone()));
        let client = TcpConnector::new(None, Some(key), 16).unwrap();

        client
            .open(2, ConnectorTarget::Direct(server.local_addr().unwrap()))
            .unwrap();
        client.send(2, &hello(1)).unwrap();
        let Some(LinkEvent::Message { link, message, .. }) = server.receive(Duration::from_secs(5)) else {
            panic!("no message over the encrypted link");
        };
        assert_eq!(message, hello(1));

        // The reply travels back on the accepted link
        server.bind(link, 1);
        server.send(1, &hello(2)).unwrap();
        let Some(LinkEvent::Message { peer, message, .. }) = client.receive(Duration::from_secs(5)) else {
            panic!("no reply");
        };
        assert_eq!(peer, Some(2));
        assert_eq!(message, hello(2));
    }

    #[test]
    fn test_peer_loss_reported() {
        let server = listener(None);
        let client = TcpConnector::new(None, None, 16).unwrap();
        client
            .open(2, ConnectorTarget::Direct(server.local_addr().unwrap()))
            .unwrap();
        client.send(2, &hello(1)).unwrap();
        let Some(LinkEvent::Message { link, .. }) = server.receive(Duration::from_secs(5)) else {
            panic!("no message");
        };
        server.close(link);

        match client.receive(Duration::from_secs(5)) {
            Some(LinkEvent::Closed { peer, .. }) => assert_eq!(peer, Some(2)),
            other => panic!("expected close, got {:?}", other),
        }
        assert!(!client.is_open(2));
        assert!(matches!(client.send(2, &hello(1)), Err(ConnectorError::NoLink(2))));
    }

    #[test]
    fn test_relay_target_rejected() {
        let client = TcpConnector::new(None, None, 4).unwrap();
        assert!(matches!(
            client.open(3, ConnectorTarget::Relay { proxy_id: 3 }),
            Err(ConnectorError::UnsupportedTarget(ConnectorKind::Tcp, _))
        ));
    }
}
