//! Connector manager
//!
//! Owns one connector per enabled kind and sits between them and the
//! engine:
//! - outgoing: opens the link on demand, then sends ([`ConnectorManager::transmit`])
//! - incoming: turns [`LinkEvent`]s into engine calls and carries the
//!   engine's reply, peer binding or close back to the link
//!   ([`ConnectorManager::handle`])
//!
//! Any transport failure is reported to the engine so the connections
//! riding that link are reset locally.

use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use netproxy_core::udp_batch::BatchConfig;
use netproxy_core::{ConnectorKind, Engine, MessageOrigin, RemoteEgress};

use crate::connector::crypto::PreSharedKey;
use crate::connector::csr::CsrConnector;
use crate::connector::quic::{QuicConnector, QuicTls};
use crate::connector::tcp::TcpConnector;
use crate::connector::udp::UdpConnector;
use crate::connector::{Connector, ConnectorError, LinkEvent};

/// How long a receiver waits before re-checking the termination flag
pub const RECEIVE_TIMEOUT: Duration = Duration::from_millis(100);

/// Listener options that are not part of the engine settings
#[derive(Debug, Clone, Default)]
pub struct ConnectorOptions {
    /// Address the listeners bind to
    pub bind_ip: Option<Ipv4Addr>,
    pub quic_tls: Option<QuicTls>,
    pub tcp_key: Option<PreSharedKey>,
}

pub struct ConnectorManager {
    engine: Arc<Engine>,
    connectors: BTreeMap<ConnectorKind, Arc<dyn Connector>>,
    udp: Option<Arc<UdpConnector>>,
}

impl ConnectorManager {
    /// Bind a connector for every kind enabled in the engine settings
    pub fn start(engine: Arc<Engine>, options: &ConnectorOptions) -> Result<Self, ConnectorError> {
        let settings = engine.settings().clone();
        let ip = options.bind_ip.unwrap_or(Ipv4Addr::UNSPECIFIED);
        let at = |port| SocketAddr::V4(SocketAddrV4::new(ip, port));
        let capacity = settings.queue_capacity;

        let mut connectors: BTreeMap<ConnectorKind, Arc<dyn Connector>> = BTreeMap::new();
        let mut udp = None;
        for kind in &settings.enabled_connectors {
            let connector: Arc<dyn Connector> = match kind {
                ConnectorKind::Quic => Arc::new(QuicConnector::bind(
                    at(settings.ports.quic),
                    options.quic_tls.as_ref(),
                    capacity,
                )?),
                ConnectorKind::Tcp => Arc::new(TcpConnector::new(
                    Some(at(settings.ports.tcp)),
                    options.tcp_key.clone(),
                    capacity,
                )?),
                ConnectorKind::Udp => {
                    let c = Arc::new(UdpConnector::bind(at(settings.ports.udp), BatchConfig::from(&settings))?);
                    udp = Some(c.clone());
                    c
                }
                ConnectorKind::Csr => {
                    let c = CsrConnector::new(settings.csr_relay, settings.proxy_id, capacity);
                    if let Err(e) = c.register() {
                        log::warn!("CSR relay {} not reachable yet: {}", settings.csr_relay, e);
                    }
                    Arc::new(c)
                }
            };
            connectors.insert(*kind, connector);
        }
        log::info!(
            "Connectors: {}",
            connectors.keys().map(|k| k.to_string()).collect::<Vec<_>>().join(", ")
        );
        Ok(ConnectorManager { engine, connectors, udp })
    }

    /// Use ready-made connectors
    pub fn with_connectors(
        engine: Arc<Engine>,
        connectors: Vec<Arc<dyn Connector>>,
        udp: Option<Arc<UdpConnector>>,
    ) -> Self {
        let connectors = connectors.into_iter().map(|c| (c.kind(), c)).collect();
        ConnectorManager { engine, connectors, udp }
    }

    pub fn kinds(&self) -> Vec<ConnectorKind> {
        self.connectors.keys().copied().collect()
    }

    pub fn connector(&self, kind: ConnectorKind) -> Option<&Arc<dyn Connector>> {
        self.connectors.get(&kind)
    }

    pub fn udp(&self) -> Option<&Arc<UdpConnector>> {
        self.udp.as_ref()
    }

    // ========================================================================
    // Outgoing
    // ========================================================================

    /// Deliver one message from the engine's remote queue
    ///
    /// Failures drop the message; the engine hears about lost transports.
    pub fn transmit(&self, egress: RemoteEgress) {
        let RemoteEgress {
            proxy_id,
            kind,
            message,
        } = egress;
        let Some(connector) = self.connectors.get(&kind) else {
            log::warn!("No {} connector; {:?} for remote proxy {} dropped", kind, message.body.message_type(), proxy_id);
            self.engine.on_transport_failure(proxy_id, kind);
            return;
        };

        if !connector.is_open(proxy_id) {
            let opened = self
                .engine
                .registry()
                .connector_for(proxy_id, kind)
                .map_err(|e| e.to_string())
                .and_then(|target| connector.open(proxy_id, target).map_err(|e| e.to_string()));
            if let Err(e) = opened {
                log::warn!("Cannot open {} link to remote proxy {}: {}", kind, proxy_id, e);
                self.engine.on_transport_failure(proxy_id, kind);
                return;
            }
        }

        match connector.send(proxy_id, &message) {
            Ok(()) => log::trace!("{:?} sent to remote proxy {} over {}", message.body.message_type(), proxy_id, kind),
            Err(ConnectorError::Wire(e)) => {
                log::warn!("{:?} for remote proxy {} not encodable: {}", message.body.message_type(), proxy_id, e)
            }
            Err(e) => {
                log::warn!("Send to remote proxy {} over {} failed: {}", proxy_id, kind, e);
                self.engine.on_transport_failure(proxy_id, kind);
            }
        }
    }

    // ========================================================================
    // Incoming
    // ========================================================================

    pub fn handle(&self, kind: ConnectorKind, event: LinkEvent) {
        let Some(connector) = self.connectors.get(&kind) else {
            return;
        };
        match event {
            LinkEvent::Message {
                link,
                peer,
                address,
                message,
            } => {
                let origin = MessageOrigin {
                    kind,
                    proxy_id: peer,
                    address,
                };
                let outcome = match self.engine.on_proxy_message(origin, message) {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        log::debug!("Message on {} link {} dropped: {}", kind, link, e);
                        return;
                    }
                };
                if let Some(proxy_id) = outcome.peer {
                    connector.bind(link, proxy_id);
                }
                if let Some(reply) = outcome.reply {
                    if let Err(e) = connector.reply(link, &reply) {
                        log::warn!("Reply on {} link {} failed: {}", kind, link, e);
                    }
                }
                if outcome.close_link {
                    log::info!("Closing {} link {}", kind, link);
                    connector.close(link);
                }
            }
            LinkEvent::Closed { link, peer } => {
                log::info!("{} link {} lost (remote proxy {:?})", kind, link, peer);
                if let Some(proxy_id) = peer {
                    self.engine.on_transport_failure(proxy_id, kind);
                }
            }
        }
    }

    /// Receiver role for one connector kind; returns at termination
    pub fn receive_loop(&self, kind: ConnectorKind) {
        let Some(connector) = self.connectors.get(&kind).cloned() else {
            return;
        };
        while !self.engine.is_termination_requested() {
            if let Some(event) = connector.receive(RECEIVE_TIMEOUT) {
                self.handle(kind, event);
            }
        }
        log::debug!("{} receiver stopped", kind);
    }

    pub fn shutdown(&self) {
        for (kind, connector) in &self.connectors {
            log::debug!("Shutting down {} connector", kind);
            connector.shutdown();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::LinkId;
    use netproxy_core::protocol::ProxyProtocol;
    use netproxy_core::pwp::ProxyPorts;
    use netproxy_core::registry::{ConnectorTarget, LinkState, RemoteProxyInfo};
    use netproxy_core::{EndpointTable, EngineQueues, MacAddr, MessageBody, NetProxySettings, ProxyMessage};
    use std::sync::Mutex;

    /// Records what the manager asks of it
    #[derive(Default)]
    struct Recorder {
        opened: Mutex<Vec<(u32, ConnectorTarget)>>,
        sent: Mutex<Vec<(u32, ProxyMessage)>>,
        replies: Mutex<Vec<(LinkId, ProxyMessage)>>,
        bound: Mutex<Vec<(LinkId, u32)>>,
        closed: Mutex<Vec<LinkId>>,
        fail_sends: bool,
    }

    impl Connector for Recorder {
        fn kind(&self) -> ConnectorKind {
            ConnectorKind::Tcp
        }
        fn open(&self, proxy_id: u32, target: ConnectorTarget) -> Result<(), ConnectorError> {
            self.opened.lock().unwrap().push((proxy_id, target));
            Ok(())
        }
        fn is_open(&self, proxy_id: u32) -> bool {
            self.opened.lock().unwrap().iter().any(|(id, _)| *id == proxy_id)
        }
        fn send(&self, proxy_id: u32, msg: &ProxyMessage) -> Result<(), ConnectorError> {
            if self.fail_sends {
                return Err(ConnectorError::NoLink(proxy_id));
            }
            self.sent.lock().unwrap().push((proxy_id, msg.clone()));
            Ok(())
        }
        fn reply(&self, link: LinkId, msg: &ProxyMessage) -> Result<(), ConnectorError> {
            self.replies.lock().unwrap().push((link, msg.clone()));
            Ok(())
        }
        fn bind(&self, link: LinkId, proxy_id: u32) {
            self.bound.lock().unwrap().push((link, proxy_id));
        }
        fn receive(&self, _timeout: Duration) -> Option<LinkEvent> {
            None
        }
        fn close(&self, link: LinkId) {
            self.closed.lock().unwrap().push(link);
        }
        fn shutdown(&self) {}
    }

    fn engine() -> (Arc<Engine>, EngineQueues) {
        let settings = NetProxySettings {
            proxy_id: 1,
            external_ip: Ipv4Addr::new(172, 16, 0, 1),
            ..Default::default()
        };
        let (engine, queues) = Engine::new(settings, MacAddr([2, 0, 0, 0, 0, 1]), EndpointTable::new());
        engine
            .registry()
            .add_remote_proxy_info(RemoteProxyInfo::new(2, Ipv4Addr::new(172, 16, 0, 2)));
        (Arc::new(engine), queues)
    }

    fn manager(recorder: Arc<Recorder>) -> (ConnectorManager, Arc<Engine>, EngineQueues) {
        let (engine, queues) = engine();
        let m = ConnectorManager::with_connectors(engine.clone(), vec![recorder as Arc<dyn Connector>], None);
        (m, engine, queues)
    }

    fn init(proxy_id: u32) -> ProxyMessage {
        ProxyMessage::new(
            ProxyProtocol::Tcp,
            Ipv4Addr::new(172, 16, 0, 2),
            Ipv4Addr::new(172, 16, 0, 1),
            MessageBody::InitializeConnection {
                proxy_id,
                ports: ProxyPorts::default(),
            },
        )
    }

    #[test]
    fn test_transmit_opens_link_on_demand() {
        let recorder = Arc::new(Recorder::default());
        let (m, _engine, _queues) = manager(recorder.clone());

        m.transmit(RemoteEgress {
            proxy_id: 2,
            kind: ConnectorKind::Tcp,
            message: init(1),
        });
        m.transmit(RemoteEgress {
            proxy_id: 2,
            kind: ConnectorKind::Tcp,
            message: init(1),
        });

        let opened = recorder.opened.lock().unwrap().clone();
        assert_eq!(opened, vec![(2, ConnectorTarget::Direct("172.16.0.2:8751".parse().unwrap()))]);
        assert_eq!(recorder.sent.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_transmit_to_unknown_proxy_is_dropped() {
        let recorder = Arc::new(Recorder::default());
        let (m, _engine, _queues) = manager(recorder.clone());

        m.transmit(RemoteEgress {
            proxy_id: 99,
            kind: ConnectorKind::Tcp,
            message: init(1),
        });
        assert!(recorder.opened.lock().unwrap().is_empty());
        assert!(recorder.sent.lock().unwrap().is_empty());
    }

    #[test]
    fn test_send_failure_disconnects_link() {
        let recorder = Arc::new(Recorder {
            fail_sends: true,
            ..Default::default()
        });
        let (m, engine, _queues) = manager(recorder);
        engine.registry().set_link_state(2, ConnectorKind::Tcp, LinkState::Connected);

        m.transmit(RemoteEgress {
            proxy_id: 2,
            kind: ConnectorKind::Tcp,
            message: init(1),
        });
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Disconnected);
    }

    #[test]
    fn test_handshake_binds_and_replies() {
        let recorder = Arc::new(Recorder::default());
        let (m, engine, _queues) = manager(recorder.clone());

        m.handle(
            ConnectorKind::Tcp,
            LinkEvent::Message {
                link: LinkId(4),
                peer: None,
                address: Some(Ipv4Addr::new(172, 16, 0, 2)),
                message: init(2),
            },
        );

        assert_eq!(recorder.bound.lock().unwrap().clone(), vec![(LinkId(4), 2)]);
        let replies = recorder.replies.lock().unwrap().clone();
        assert_eq!(replies.len(), 1);
        assert!(matches!(
            replies[0].1.body,
            MessageBody::ConnectionInitialized { proxy_id: 1, .. }
        ));
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Connected);
    }

    #[test]
    fn test_lost_link_reported_to_engine() {
        let recorder = Arc::new(Recorder::default());
        let (m, engine, _queues) = manager(recorder);
        engine.registry().set_link_state(2, ConnectorKind::Tcp, LinkState::Connected);

        m.handle(
            ConnectorKind::Tcp,
            LinkEvent::Closed {
                link: LinkId(1),
                peer: Some(2),
            },
        );
        assert_eq!(engine.registry().link_state(2, ConnectorKind::Tcp), LinkState::Disconnected);
    }
}
