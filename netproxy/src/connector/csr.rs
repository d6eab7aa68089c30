//! CSR relay connector
//!
//! Reaches remote proxies through a `csr-relay` daemon. A single TCP
//! stream to the relay carries every link; after `Register` the relay
//! forwards our messages by destination id and delivers theirs tagged
//! with the sender id. A link here is one relay peer.
//!
//! ```text
//!  send(proxy 7) ──► Forward{to: 7, pwp} ──► relay ──► Deliver{from: us, pwp} ──► proxy 7
//! ```

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use netproxy_core::pwp::{self, ProxyMessage};
use netproxy_core::registry::ConnectorTarget;
use netproxy_core::relay::{read_message, write_message, RelayErrorCode, RelayMessage};
use netproxy_core::ConnectorKind;

use super::{Connector, ConnectorError, EventQueue, LinkEvent, LinkId, LinkTable};
use crate::lock;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REGISTER_TIMEOUT: Duration = Duration::from_secs(5);

struct Shared {
    /// Writer half of the relay stream, `None` while unregistered
    stream: Mutex<Option<TcpStream>>,
    /// Link io is the relay peer id
    links: Mutex<LinkTable<u32>>,
    events: EventQueue,
    running: AtomicBool,
}

pub struct CsrConnector {
    relay: SocketAddr,
    local_id: u32,
    shared: Arc<Shared>,
}

impl CsrConnector {
    pub fn new(relay: SocketAddr, local_id: u32, queue_capacity: usize) -> Self {
        CsrConnector {
            relay,
            local_id,
            shared: Arc::new(Shared {
                stream: Mutex::new(None),
                links: Mutex::new(LinkTable::new()),
                events: EventQueue::new(queue_capacity),
                running: AtomicBool::new(true),
            }),
        }
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.shared.stream).is_some()
    }

    /// Connect to the relay and claim our id, unless already done
    pub fn register(&self) -> Result<(), ConnectorError> {
        let mut slot = lock(&self.shared.stream);
        if slot.is_some() {
            return Ok(());
        }

        let mut stream = TcpStream::connect_timeout(&self.relay, CONNECT_TIMEOUT)?;
        stream.set_nodelay(true)?;
        write_message(
            &mut stream,
            &RelayMessage::Register {
                proxy_id: self.local_id,
            },
        )?;
        stream.set_read_timeout(Some(REGISTER_TIMEOUT))?;
        match read_message(&mut stream)? {
            RelayMessage::Registered { proxy_id } if proxy_id == self.local_id => {}
            RelayMessage::Error { code, proxy_id } => {
                return Err(ConnectorError::Handshake(format!(
                    "relay refused id {}: {}",
                    proxy_id, code
                )))
            }
            other => {
                return Err(ConnectorError::Handshake(format!(
                    "unexpected relay reply {:?}",
                    other
                )))
            }
        }
        stream.set_read_timeout(None)?;

        let reader = stream.try_clone()?;
        let shared = self.shared.clone();
        thread::Builder::new()
            .name("csr-relay".into())
            .spawn(move || read_loop(reader, shared))?;

        log::info!("Registered with CSR relay {} as proxy {}", self.relay, self.local_id);
        *slot = Some(stream);
        Ok(())
    }

    fn forward(&self, to: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let frame = RelayMessage::Forward {
            to,
            payload: pwp::encode(msg)?,
        };
        let mut slot = lock(&self.shared.stream);
        let stream = slot
            .as_mut()
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "not registered")))?;
        if let Err(e) = write_message(stream, &frame) {
            log::warn!("CSR relay write failed: {}", e);
            let _ = stream.shutdown(Shutdown::Both);
            *slot = None;
            return Err(e.into());
        }
        Ok(())
    }
}

/// Link for a relay peer, created on first sight
fn link_of(links: &mut LinkTable<u32>, peer: u32) -> LinkId {
    match links.find(|p| *p == peer) {
        Some(id) => id,
        None => links.insert(None, peer),
    }
}

fn read_loop(mut stream: TcpStream, shared: Arc<Shared>) {
    let reason = loop {
        let msg = match read_message(&mut stream) {
            Ok(m) => m,
            Err(e) => break e.to_string(),
        };
        match msg {
            RelayMessage::Deliver { from, payload } => {
                let message = match pwp::decode(&payload) {
                    Ok(m) => m,
                    Err(e) => {
                        log::warn!("Malformed message relayed from proxy {}: {}", from, e);
                        continue;
                    }
                };
                let (link, peer) = {
                    let mut links = lock(&shared.links);
                    let link = link_of(&mut links, from);
                    (link, links.peer_of(link))
                };
                shared.events.push(LinkEvent::Message {
                    link,
                    peer,
                    address: None,
                    message,
                });
            }
            RelayMessage::Error {
                code: RelayErrorCode::UnknownPeer,
                proxy_id,
            } => {
                log::warn!("CSR relay: remote proxy {} is not registered", proxy_id);
                let removed = {
                    let mut links = lock(&shared.links);
                    links.find(|p| *p == proxy_id).and_then(|id| links.remove(id).map(|l| (id, l)))
                };
                if let Some((link, l)) = removed {
                    shared.events.push(LinkEvent::Closed { link, peer: l.peer });
                }
            }
            other => log::debug!("Unexpected relay message {:?}", other),
        }
    };

    if !shared.running.load(Ordering::Acquire) {
        return;
    }
    log::warn!("CSR relay connection lost: {}", reason);
    *lock(&shared.stream) = None;
    let lost: Vec<_> = {
        let mut links = lock(&shared.links);
        links
            .ids()
            .into_iter()
            .filter_map(|id| links.remove(id).map(|l| (id, l.peer)))
            .collect()
    };
    for (link, peer) in lost {
        shared.events.push(LinkEvent::Closed { link, peer });
    }
}

impl Connector for CsrConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Csr
    }

    fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError> {
        let ConnectorTarget::Relay { proxy_id: relay_peer } = target else {
            return Err(ConnectorError::UnsupportedTarget(ConnectorKind::Csr, target));
        };
        self.register()?;
        let mut links = lock(&self.shared.links);
        let link = link_of(&mut links, relay_peer);
        links.bind(link, proxy_id);
        log::debug!("CSR link {} to remote proxy {}", link, proxy_id);
        Ok(())
    }

    fn is_open(&self, proxy_id: u32) -> bool {
        self.is_registered() && lock(&self.shared.links).link_for(proxy_id).is_some()
    }

    fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let to = {
            let links = lock(&self.shared.links);
            links
                .link_for(proxy_id)
                .and_then(|id| links.get(id).map(|l| l.io))
                .ok_or(ConnectorError::NoLink(proxy_id))?
        };
        self.forward(to, msg)
    }

    fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let to = lock(&self.shared.links)
            .get(link)
            .map(|l| l.io)
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "unknown relay link")))?;
        self.forward(to, msg)
    }

    fn bind(&self, link: LinkId, proxy_id: u32) {
        lock(&self.shared.links).bind(link, proxy_id);
    }

    fn receive(&self, timeout: Duration) -> Option<LinkEvent> {
        self.shared.events.recv(timeout)
    }

    /// The relay stream stays up for the other peers
    fn close(&self, link: LinkId) {
        lock(&self.shared.links).remove(link);
    }

    fn shutdown(&self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(stream) = lock(&self.shared.stream).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl Drop for CsrConnector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
