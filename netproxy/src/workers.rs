//! Role threads
//!
//! ```text
//!  internal-rx ─┐                              ┌─► local-tx ──► interfaces
//!  external-rx ─┼─► Engine ──► egress queues ──┤
//!  <kind>-rx ───┘     ▲                        └─► remote-tx ─► ConnectorManager
//!                     │
//!        reaper / auto-connect / udp-batcher / status
//! ```
//!
//! Every loop polls the engine's termination flag with a bounded wait, so
//! [`Workers::join`] returns shortly after `request_termination`.

use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::Ordering;
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use netproxy_core::{Engine, EngineQueues, InterfaceSide, NetworkInterface};

use crate::manager::ConnectorManager;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const REAP_INTERVAL: Duration = Duration::from_millis(100);
const AUTO_CONNECT_INTERVAL: Duration = Duration::from_secs(1);
const STATUS_INTERVAL: Duration = Duration::from_secs(5);
/// Upper bound on one UDP batcher sleep
const BATCH_IDLE: Duration = Duration::from_millis(50);

pub struct Interfaces {
    pub internal: Arc<dyn NetworkInterface>,
    pub external: Option<Arc<dyn NetworkInterface>>,
}

impl Interfaces {
    fn get(&self, side: InterfaceSide) -> Option<&Arc<dyn NetworkInterface>> {
        match side {
            InterfaceSide::Internal => Some(&self.internal),
            InterfaceSide::External => self.external.as_ref(),
        }
    }
}

pub struct Workers {
    handles: Vec<(String, JoinHandle<()>)>,
}

impl Workers {
    pub fn spawn(
        engine: Arc<Engine>,
        queues: EngineQueues,
        interfaces: Interfaces,
        manager: Arc<ConnectorManager>,
        status_addr: Option<SocketAddr>,
    ) -> io::Result<Self> {
        let mut workers = Workers { handles: Vec::new() };
        let interfaces = Arc::new(interfaces);
        let EngineQueues { local, remote } = queues;

        // Ingress
        workers.start("internal-rx", {
            let engine = engine.clone();
            let iface = interfaces.internal.clone();
            move || ingress(&engine, iface.as_ref(), InterfaceSide::Internal)
        })?;
        if let Some(iface) = interfaces.external.clone() {
            let engine = engine.clone();
            workers.start("external-rx", move || ingress(&engine, iface.as_ref(), InterfaceSide::External))?;
        }
        for kind in manager.kinds() {
            let manager = manager.clone();
            workers.start(&format!("{}-rx", kind), move || manager.receive_loop(kind))?;
        }

        // Egress
        workers.start("local-tx", {
            let engine = engine.clone();
            let interfaces = interfaces.clone();
            move || {
                while engine.is_running() {
                    let item = match local.recv_timeout(POLL_INTERVAL) {
                        Ok(item) => item,
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    };
                    let Some(iface) = interfaces.get(item.side) else {
                        log::debug!("No {:?} interface; frame dropped", item.side);
                        continue;
                    };
                    if let Err(e) = iface.write_frame(&item.frame) {
                        log::warn!("Write to {:?} interface failed: {}", item.side, e);
                    }
                }
            }
        })?;
        workers.start("remote-tx", {
            let engine = engine.clone();
            let manager = manager.clone();
            move || {
                while engine.is_running() {
                    match remote.recv_timeout(POLL_INTERVAL) {
                        Ok(egress) => manager.transmit(egress),
                        Err(RecvTimeoutError::Timeout) => continue,
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            }
        })?;

        // Periodic
        if manager.udp().is_some() {
            let engine = engine.clone();
            let manager = manager.clone();
            workers.start("udp-batcher", move || udp_batcher(&engine, &manager))?;
        }
        workers.start("auto-connect", {
            let engine = engine.clone();
            move || {
                every(&engine, AUTO_CONNECT_INTERVAL, || {
                    let started = engine.auto_connect(Instant::now());
                    if started > 0 {
                        log::debug!("{} auto-connections started", started);
                    }
                })
            }
        })?;
        workers.start("reaper", {
            let engine = engine.clone();
            move || {
                every(&engine, REAP_INTERVAL, || {
                    let removed = engine.reap(Instant::now());
                    if removed > 0 {
                        log::debug!("{} connections removed", removed);
                    }
                })
            }
        })?;
        if let Some(addr) = status_addr {
            let socket = UdpSocket::bind("0.0.0.0:0")?;
            let engine = engine.clone();
            workers.start("status", move || {
                every(&engine, STATUS_INTERVAL, || emit_status(&engine, &socket, addr))
            })?;
        }

        log::info!("{} worker threads started", workers.handles.len());
        Ok(workers)
    }

    fn start<F>(&mut self, name: &str, f: F) -> io::Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = thread::Builder::new().name(name.to_string()).spawn(f)?;
        self.handles.push((name.to_string(), handle));
        Ok(())
    }

    /// Join every thread in start order, then mark the engine stopped
    pub fn join(self, engine: &Engine) {
        for (name, handle) in self.handles {
            if handle.join().is_err() {
                log::error!("Worker {} panicked", name);
            } else {
                log::debug!("Worker {} stopped", name);
            }
        }
        engine.mark_stopped();
    }
}

fn ingress(engine: &Engine, iface: &dyn NetworkInterface, side: InterfaceSide) {
    let mut buf = vec![0u8; iface.mtu() + 64];
    while engine.is_running() {
        let n = match iface.read_frame(&mut buf, POLL_INTERVAL) {
            Ok(Some(n)) => n,
            Ok(None) => continue,
            Err(e) => {
                log::error!("Read from {:?} interface failed: {}", side, e);
                engine.request_termination();
                break;
            }
        };
        if let Err(e) = engine.on_frame(&buf[..n], side) {
            log::trace!("{:?} frame of {} bytes not handled: {}", side, n, e);
        }
    }
}

/// Run `tick` every `interval` until termination
fn every(engine: &Engine, interval: Duration, mut tick: impl FnMut()) {
    let mut next = Instant::now() + interval;
    while engine.is_running() {
        let now = Instant::now();
        if now >= next {
            tick();
            next = now + interval;
        }
        thread::sleep(next.saturating_duration_since(now).min(POLL_INTERVAL));
    }
}

/// Sleeps until the earliest batch deadline and sends whatever is due
fn udp_batcher(engine: &Engine, manager: &ConnectorManager) {
    let Some(udp) = manager.udp() else {
        return;
    };
    while engine.is_running() {
        let now = Instant::now();
        let sent = udp.flush(now);
        if sent > 0 {
            engine
                .stats()
                .udp_batches_flushed
                .fetch_add(sent as u64, Ordering::Relaxed);
        }
        let wait = udp
            .next_deadline()
            .map_or(BATCH_IDLE, |d| d.saturating_duration_since(Instant::now()))
            .clamp(Duration::from_millis(1), BATCH_IDLE);
        thread::sleep(wait);
    }
}

fn emit_status(engine: &Engine, socket: &UdpSocket, addr: SocketAddr) {
    match serde_json::to_vec(&engine.status()) {
        Ok(json) => {
            if let Err(e) = socket.send_to(&json, addr) {
                log::debug!("Status to {} not sent: {}", addr, e);
            }
        }
        Err(e) => log::warn!("Status not serializable: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netproxy_core::interface::MemoryInterface;
    use netproxy_core::stats::StatsSnapshot;
    use netproxy_core::{EndpointTable, MacAddr, NetProxySettings};

    fn engine() -> (Arc<Engine>, EngineQueues) {
        let settings = NetProxySettings {
            proxy_id: 3,
            ..Default::default()
        };
        let (engine, queues) = Engine::new(settings, MacAddr([2, 0, 0, 0, 0, 3]), EndpointTable::new());
        (Arc::new(engine), queues)
    }

    #[test]
    fn test_workers_stop_on_termination() {
        let (engine, queues) = engine();
        let (iface, _host) = MemoryInterface::pair(engine.mac_address(), 1500);
        let manager = Arc::new(ConnectorManager::with_connectors(engine.clone(), Vec::new(), None));
        let status = UdpSocket::bind("127.0.0.1:0").unwrap();
        status.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

        let workers = Workers::spawn(
            engine.clone(),
            queues,
            Interfaces {
                internal: Arc::new(iface),
                external: None,
            },
            manager,
            Some(status.local_addr().unwrap()),
        )
        .unwrap();

        let mut buf = [0u8; 2048];
        let (n, _) = status.recv_from(&mut buf).unwrap();
        let snapshot: StatsSnapshot = serde_json::from_slice(&buf[..n]).unwrap();
        assert_eq!(snapshot.proxy_id, 3);

        engine.request_termination();
        workers.join(&engine);
        assert!(!engine.is_running());
    }

    #[test]
    fn test_every_stops_when_terminated() {
        let (engine, _queues) = engine();
        engine.request_termination();
        let mut ticks = 0;
        every(&engine, Duration::from_millis(1), || ticks += 1);
        assert_eq!(ticks, 0);
    }
}
