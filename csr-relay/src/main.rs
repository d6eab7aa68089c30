//! NetProxy CSR Relay
//!
//! A TCP server that:
//! - Accepts connections from NetProxy CSR connectors
//! - Registers each connection under the NetProxy unique id it claims
//! - Relays proxy messages between registered NetProxies
//!
//! Frames are length-prefixed bincode [`RelayMessage`]s; the PWP payloads
//! inside are carried opaquely.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use netproxy_core::relay::{drain_messages, encode_message, RelayErrorCode, RelayMessage};

mod registry;

use registry::Registry;

// ============================================================================
// Constants
// ============================================================================

/// Default listen address (matches the NetProxy CSR default)
const DEFAULT_LISTEN: &str = "0.0.0.0:7878";

/// mio token for the listening socket
const LISTENER_TOKEN: Token = Token(0);

/// Poll timeout, bounds how late a termination signal is noticed
const POLL_TIMEOUT: Duration = Duration::from_millis(100);

const READ_CHUNK: usize = 16 * 1024;

// ============================================================================
// Main Entry Point
// ============================================================================

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args: Vec<String> = std::env::args().collect();

    // --listen <addr:port>  Address to accept CSR connectors on
    let listen: SocketAddr = parse_arg(&args, "--listen")
        .unwrap_or_else(|| DEFAULT_LISTEN.to_string())
        .parse()
        .map_err(|_| "Invalid listen address")?;

    let terminate = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGINT, terminate.clone())?;
    signal_hook::flag::register(signal_hook::consts::SIGTERM, terminate.clone())?;

    log::info!("NetProxy CSR relay starting...");
    let mut relay = Relay::new(listen)?;
    relay.run(&terminate)?;
    log::info!("CSR relay stopped");
    Ok(())
}

fn parse_arg(args: &[String], flag: &str) -> Option<String> {
    args.iter()
        .position(|a| a == flag)
        .and_then(|i| args.get(i + 1))
        .cloned()
}

// ============================================================================
// Peer Connection
// ============================================================================

struct Peer {
    stream: TcpStream,
    addr: SocketAddr,
    /// Bytes received but not yet decoded
    inbuf: Vec<u8>,
    /// Encoded frames waiting for the socket
    outbuf: Vec<u8>,
    /// WRITABLE interest is registered
    want_write: bool,
}

impl Peer {
    /// Read everything available; false once the peer is gone
    fn fill(&mut self) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return false,
                Ok(n) => self.inbuf.extend_from_slice(&chunk[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    log::debug!("Read from {} failed: {}", self.addr, e);
                    return false;
                }
            }
        }
    }

    /// Write as much of the backlog as the socket takes
    fn flush(&mut self) -> io::Result<()> {
        while !self.outbuf.is_empty() {
            match self.stream.write(&self.outbuf) {
                Ok(0) => return Err(io::Error::new(io::ErrorKind::WriteZero, "peer stopped reading")),
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

// ============================================================================
// Relay Structure
// ============================================================================

struct Relay {
    poll: Poll,
    listener: TcpListener,
    peers: HashMap<Token, Peer>,
    registry: Registry,
    next_token: usize,
}

impl Relay {
    fn new(listen: SocketAddr) -> io::Result<Self> {
        let poll = Poll::new()?;
        let mut listener = TcpListener::bind(listen)?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
        log::info!("Relay listening on {}", listener.local_addr()?);
        Ok(Relay {
            poll,
            listener,
            peers: HashMap::new(),
            registry: Registry::new(),
            next_token: 1,
        })
    }

    fn run(&mut self, terminate: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(256);
        while !terminate.load(Ordering::Relaxed) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_TIMEOUT)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => self.accept()?,
                    token => {
                        if event.is_readable() || event.is_read_closed() {
                            self.process_peer(token);
                        }
                        if event.is_writable() {
                            self.flush_peer(token);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn accept(&mut self) -> io::Result<()> {
        loop {
            let (mut stream, addr) = match self.listener.accept() {
                Ok(v) => v,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            };
            let token = Token(self.next_token);
            self.next_token += 1;
            self.poll
                .registry()
                .register(&mut stream, token, Interest::READABLE)?;
            let _ = stream.set_nodelay(true);
            log::info!("New connection from {} ({:?})", addr, token);
            self.peers.insert(
                token,
                Peer {
                    stream,
                    addr,
                    inbuf: Vec::new(),
                    outbuf: Vec::new(),
                    want_write: false,
                },
            );
        }
    }

    fn process_peer(&mut self, token: Token) {
        let (alive, decoded) = match self.peers.get_mut(&token) {
            Some(peer) => {
                let alive = peer.fill();
                (alive, drain_messages(&mut peer.inbuf))
            }
            None => return,
        };

        let messages = match decoded {
            Ok(messages) => messages,
            Err(e) => {
                log::warn!("Malformed frame on {:?}: {}; closing", token, e);
                self.close_peer(token);
                return;
            }
        };
        for msg in messages {
            self.handle_message(token, msg);
        }
        if !alive {
            self.close_peer(token);
        }
    }

    fn handle_message(&mut self, token: Token, msg: RelayMessage) {
        match msg {
            RelayMessage::Register { proxy_id } => {
                let reply = match self.registry.register(token, proxy_id) {
                    Ok(()) => {
                        log::debug!("{} proxies registered", self.registry.len());
                        RelayMessage::Registered { proxy_id }
                    }
                    Err(code) => RelayMessage::Error { code, proxy_id },
                };
                self.send(token, &reply);
            }
            RelayMessage::Forward { to, payload } => {
                let Some(from) = self.registry.proxy_of(token) else {
                    log::debug!("Forward from unregistered {:?}", token);
                    self.send(
                        token,
                        &RelayMessage::Error {
                            code: RelayErrorCode::NotRegistered,
                            proxy_id: to,
                        },
                    );
                    return;
                };
                match self.registry.route(to) {
                    Ok(dest) => {
                        log::trace!("Relaying {} bytes from proxy {} to proxy {}", payload.len(), from, to);
                        self.send(dest, &RelayMessage::Deliver { from, payload });
                    }
                    Err(code) => {
                        log::debug!("Proxy {} forwarded to unregistered proxy {}", from, to);
                        self.send(token, &RelayMessage::Error { code, proxy_id: to });
                    }
                }
            }
            other => log::warn!("Unexpected message from {:?}: {:?}", token, other),
        }
    }

    fn send(&mut self, token: Token, msg: &RelayMessage) {
        let frame = match encode_message(msg) {
            Ok(f) => f,
            Err(e) => {
                log::warn!("Cannot encode relay frame: {}", e);
                return;
            }
        };
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        peer.outbuf.extend_from_slice(&frame);
        self.flush_peer(token);
    }

    /// Flush a backlog and track WRITABLE interest
    fn flush_peer(&mut self, token: Token) {
        let Some(peer) = self.peers.get_mut(&token) else {
            return;
        };
        if let Err(e) = peer.flush() {
            log::debug!("Write to {} failed: {}", peer.addr, e);
            self.close_peer(token);
            return;
        }
        let want_write = !peer.outbuf.is_empty();
        if want_write != peer.want_write {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = self.poll.registry().reregister(&mut peer.stream, token, interest) {
                log::warn!("Reregister {:?} failed: {}", token, e);
            }
            peer.want_write = want_write;
        }
    }

    fn close_peer(&mut self, token: Token) {
        let Some(mut peer) = self.peers.remove(&token) else {
            return;
        };
        let _ = self.poll.registry().deregister(&mut peer.stream);
        self.registry.unregister(token);
        log::info!("Connection closed: {} ({:?})", peer.addr, token);
    }
}
