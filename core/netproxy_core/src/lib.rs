//! NetProxy Core
//!
//! This crate provides the engine of a NetProxy gateway, handling:
//! - Ethernet/ARP/IPv4 classification of frames from the local network
//! - Virtual TCP connections terminated locally and tunnelled as messages
//! - The proxy wire protocol (PWP) exchanged between NetProxies
//! - UDP batching, remote proxy registry and address mapping
//!
//! ```text
//!   local hosts                NetProxy A                          NetProxy B               remote hosts
//!  ┌──────────┐  frames   ┌──────────────────┐   PWP messages   ┌──────────────────┐  frames  ┌──────────┐
//!  │ 10.0.0.x │ ────────► │ Engine           │ ═══════════════► │ Engine           │ ───────► │ 10.1.0.x │
//!  │          │ ◄──────── │  (TCP/UDP/ICMP)  │ ◄═══════════════ │  (TCP/UDP/ICMP)  │ ◄─────── │          │
//!  └──────────┘           └──────────────────┘  QUIC/TCP/UDP/CSR └──────────────────┘          └──────────┘
//! ```
//!
//! Transports, interfaces and worker threads live in the `netproxy` daemon.

use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

// ============================================================================
// Modules
// ============================================================================

pub mod address_range;
pub mod arc;
pub mod classifier;
pub mod config;
pub mod connection_table;
pub mod engine;
pub mod interface;
pub mod packet;
pub mod protocol;
pub mod pwp;
pub mod registry;
pub mod relay;
pub mod stats;
pub mod tcp;
pub mod udp_batch;

pub use arc::{AddressResolutionCache, MacAddr};
pub use classifier::DispatchError;
pub use config::{EndpointTable, NetProxySettings};
pub use engine::{Engine, EngineQueues, InboundOutcome, InterfaceSide, LocalFrame, MessageOrigin, RemoteEgress};
pub use interface::NetworkInterface;
pub use protocol::{ConnectorKind, ProxyProtocol};
pub use pwp::{MessageBody, ProxyMessage};
pub use registry::RemoteProxyRegistry;

// ============================================================================
// Lock Helpers
// ============================================================================

// A worker that panicked while holding a table lock must not take the
// remaining workers down with it; the data is still structurally valid.

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn read_lock<T>(l: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    l.read().unwrap_or_else(|e| e.into_inner())
}

pub(crate) fn write_lock<T>(l: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    l.write().unwrap_or_else(|e| e.into_inner())
}
