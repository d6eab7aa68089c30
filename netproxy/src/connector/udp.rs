//! UDP connector
//!
//! Links are peer socket addresses on one shared socket. Outgoing messages
//! go through a [`UdpBatcher`] and leave when [`UdpConnector::flush`] cuts a
//! batch; the UDP datagram manager thread calls it on the batcher's
//! deadlines. Link handshake replies bypass the batcher.
//!
//! A reset for a circuit evicts that circuit's queued messages first, so
//! stale data never trails the reset onto the wire.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use netproxy_core::pwp::{self, MessageBody, ProxyMessage};
use netproxy_core::registry::ConnectorTarget;
use netproxy_core::udp_batch::{Batch, BatchConfig, UdpBatcher, MAX_BATCH_BYTES};
use netproxy_core::ConnectorKind;

use super::{decode_datagram, ipv4_of, Connector, ConnectorError, LinkEvent, LinkId, LinkTable};
use crate::lock;

#[derive(Default)]
struct UdpLinks {
    table: LinkTable<SocketAddr>,
    by_addr: HashMap<SocketAddr, LinkId>,
}

impl UdpLinks {
    fn link_at(&mut self, addr: SocketAddr, peer: Option<u32>) -> LinkId {
        if let Some(id) = self.by_addr.get(&addr) {
            if let Some(proxy_id) = peer {
                self.table.bind(*id, proxy_id);
            }
            return *id;
        }
        let id = self.table.insert(peer, addr);
        self.by_addr.insert(addr, id);
        id
    }

    fn addr_of_proxy(&self, proxy_id: u32) -> Option<SocketAddr> {
        let id = self.table.link_for(proxy_id)?;
        self.table.get(id).map(|l| l.io)
    }
}

pub struct UdpConnector {
    socket: UdpSocket,
    links: Mutex<UdpLinks>,
    batcher: Mutex<UdpBatcher>,
    /// Messages of a datagram not yet handed out by `receive`
    inbox: Mutex<VecDeque<LinkEvent>>,
    recv_buf: Mutex<Vec<u8>>,
}

impl UdpConnector {
    pub fn bind(addr: SocketAddr, config: BatchConfig) -> Result<Self, ConnectorError> {
        let socket = UdpSocket::bind(addr)?;
        log::info!(
            "UDP connector bound to {} (batch threshold {} B, timeout {:?}, rate limit {} B/s)",
            socket.local_addr()?,
            config.threshold,
            config.timeout,
            config.rate_limit
        );
        Ok(UdpConnector {
            socket,
            links: Mutex::new(UdpLinks::default()),
            batcher: Mutex::new(UdpBatcher::new(config)),
            inbox: Mutex::new(VecDeque::new()),
            recv_buf: Mutex::new(vec![0u8; MAX_BATCH_BYTES + 1024]),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send every batch that is due; returns how many left
    pub fn flush(&self, now: Instant) -> usize {
        let batches = lock(&self.batcher).poll(now);
        self.transmit(batches)
    }

    fn transmit(&self, batches: Vec<Batch>) -> usize {
        let mut sent = 0;
        for batch in batches {
            let Some(addr) = lock(&self.links).addr_of_proxy(batch.proxy_id) else {
                log::debug!("UDP batch for remote proxy {} dropped: link gone", batch.proxy_id);
                continue;
            };
            let bytes = match batch.encode() {
                Ok(b) => b,
                Err(e) => {
                    log::warn!("UDP batch for remote proxy {} not encodable: {}", batch.proxy_id, e);
                    continue;
                }
            };
            match self.socket.send_to(&bytes, addr) {
                Ok(_) => {
                    log::trace!("UDP batch of {} messages ({} B) to {}", batch.messages.len(), bytes.len(), addr);
                    sent += 1;
                }
                Err(e) => log::warn!("UDP send to {} failed: {}; batch dropped", addr, e),
            }
        }
        sent
    }

    /// Earliest moment a queued batch becomes due
    pub fn next_deadline(&self) -> Option<Instant> {
        lock(&self.batcher).next_deadline()
    }

    pub fn queued_bytes(&self) -> usize {
        lock(&self.batcher).queued_bytes()
    }

    fn read_datagram(&self, timeout: Duration) -> io::Result<Option<(Vec<u8>, SocketAddr)>> {
        self.socket.set_read_timeout(Some(timeout.max(Duration::from_millis(1))))?;
        let mut buf = lock(&self.recv_buf);
        match self.socket.recv_from(&mut buf) {
            Ok((n, from)) => Ok(Some((buf[..n].to_vec(), from))),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl Connector for UdpConnector {
    fn kind(&self) -> ConnectorKind {
        ConnectorKind::Udp
    }

    /// Connectionless: opening only records the peer address
    fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError> {
        let ConnectorTarget::Direct(addr) = target else {
            return Err(ConnectorError::UnsupportedTarget(ConnectorKind::Udp, target));
        };
        let link = lock(&self.links).link_at(addr, Some(proxy_id));
        log::debug!("UDP link {} to remote proxy {} at {}", link, proxy_id, addr);
        Ok(())
    }

    fn is_open(&self, proxy_id: u32) -> bool {
        lock(&self.links).table.link_for(proxy_id).is_some()
    }

    fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        if !self.is_open(proxy_id) {
            return Err(ConnectorError::NoLink(proxy_id));
        }
        let now = Instant::now();
        {
            let mut batcher = lock(&self.batcher);
            if let MessageBody::TcpResetConnection { local_id, .. } = msg.body {
                let purged = batcher.purge(proxy_id, local_id);
                if purged > 0 {
                    log::debug!("L{}: {} queued UDP messages evicted by reset", local_id, purged);
                }
            }
            if !batcher.enqueue(proxy_id, msg.clone(), now) {
                return Ok(());
            }
        }
        self.flush(now);
        Ok(())
    }

    fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError> {
        let addr = lock(&self.links)
            .table
            .get(link)
            .map(|l| l.io)
            .ok_or_else(|| ConnectorError::Io(io::Error::new(io::ErrorKind::NotConnected, "unknown UDP link")))?;
        self.socket.send_to(&pwp::encode(msg)?, addr)?;
        Ok(())
    }

    fn bind(&self, link: LinkId, proxy_id: u32) {
        lock(&self.links).table.bind(link, proxy_id);
    }

    fn receive(&self, timeout: Duration) -> Option<LinkEvent> {
        if let Some(ev) = lock(&self.inbox).pop_front() {
            return Some(ev);
        }
        let (data, from) = match self.read_datagram(timeout) {
            Ok(Some(d)) => d,
            Ok(None) => return None,
            Err(e) => {
                log::debug!("UDP receive failed: {}", e);
                return None;
            }
        };
        let messages = match decode_datagram(&data) {
            Ok(m) => m,
            Err(e) => {
                log::warn!("Malformed UDP datagram from {}: {}; dropped", from, e);
                return None;
            }
        };

        let (link, peer) = {
            let mut links = lock(&self.links);
            let link = links.link_at(from, None);
            (link, links.table.peer_of(link))
        };
        let address = ipv4_of(from);
        let mut inbox = lock(&self.inbox);
        inbox.extend(messages.into_iter().map(|message| LinkEvent::Message {
            link,
            peer,
            address,
            message,
        }));
        inbox.pop_front()
    }

    fn close(&self, link: LinkId) {
        let mut links = lock(&self.links);
        if let Some(l) = links.table.remove(link) {
            links.by_addr.remove(&l.io);
            if let Some(proxy_id) = l.peer {
                lock(&self.batcher).discard(proxy_id);
            }
        }
    }

    /// Queued batches leave regardless of timers and rate
    fn shutdown(&self) {
        let batches = lock(&self.batcher).flush_all(Instant::now());
        let sent = self.transmit(batches);
        if sent > 0 {
            log::debug!("{} UDP batches flushed at shutdown", sent);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netproxy_core::protocol::ProxyProtocol;
    use std::net::Ipv4Addr;

    fn data(circuit: u16, len: usize) -> ProxyMessage {
        ProxyMessage::new(
            ProxyProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 1, 0, 1),
            MessageBody::TcpData {
                local_id: circuit,
                remote_id: 9,
                flags: 0,
                payload: vec![0xAB; len],
            },
        )
    }

    fn batched(timeout: Duration) -> UdpConnector {
        let config = BatchConfig {
            timeout,
            ..BatchConfig::default()
        };
        UdpConnector::bind("127.0.0.1:0".parse().unwrap(), config).unwrap()
    }

    #[test]
    fn test_unbatched_roundtrip_and_handshake_binding() {
        let a = batched(Duration::ZERO);
        let b = batched(Duration::ZERO);
        a.open(2, ConnectorTarget::Direct(b.local_addr().unwrap())).unwrap();
        a.send(2, &data(1, 10)).unwrap();

        let Some(LinkEvent::Message { link, peer, message, .. }) = b.receive(Duration::from_secs(2)) else {
            panic!("no datagram");
        };
        assert_eq!(peer, None);
        assert_eq!(message, data(1, 10));

        b.bind(link, 1);
        assert!(b.is_open(1));
        b.reply(link, &data(2, 5)).unwrap();
        let Some(LinkEvent::Message { peer, .. }) = a.receive(Duration::from_secs(2)) else {
            panic!("no reply");
        };
        assert_eq!(peer, Some(2));
    }

    #[test]
    fn test_small_messages_leave_in_one_datagram() {
        let a = batched(Duration::from_secs(60));
        let b = batched(Duration::ZERO);
        a.open(2, ConnectorTarget::Direct(b.local_addr().unwrap())).unwrap();
        for _ in 0..4 {
            a.send(2, &data(1, 20)).unwrap();
        }
        assert!(a.queued_bytes() > 0);
        assert!(b.receive(Duration::from_millis(50)).is_none());

        // Past the batching timeout everything leaves together
        assert_eq!(a.flush(Instant::now() + Duration::from_secs(61)), 1);
        for _ in 0..4 {
            assert!(b.receive(Duration::from_secs(2)).is_some());
        }
    }

    #[test]
    fn test_reset_evicts_queued_circuit_data() {
        let a = batched(Duration::from_secs(60));
        let b = batched(Duration::ZERO);
        a.open(2, ConnectorTarget::Direct(b.local_addr().unwrap())).unwrap();
        a.send(2, &data(7, 20)).unwrap();
        a.send(2, &data(8, 20)).unwrap();
        let reset = ProxyMessage::new(
            ProxyProtocol::Udp,
            Ipv4Addr::new(10, 0, 0, 1),
            Ipv4Addr::new(10, 1, 0, 1),
            MessageBody::TcpResetConnection {
                local_id: 7,
                remote_id: 9,
            },
        );
        a.send(2, &reset).unwrap();
        a.flush(Instant::now() + Duration::from_secs(61));

        let mut received = Vec::new();
        while let Some(LinkEvent::Message { message, .. }) = b.receive(Duration::from_millis(500)) {
            received.push(message.body.circuit_id());
            if received.len() == 2 {
                break;
            }
        }
        assert_eq!(received, vec![Some(8), Some(7)]);
    }

    #[test]
    fn test_send_without_link() {
        let a = batched(Duration::ZERO);
        assert!(matches!(a.send(5, &data(1, 1)), Err(ConnectorError::NoLink(5))));
    }
}
