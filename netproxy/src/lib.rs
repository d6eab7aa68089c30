//! NetProxy daemon
//!
//! Wires a [`netproxy_core::Engine`] to real I/O:
//! - Local interfaces (TAP device or raw `AF_PACKET` socket)
//! - Transport connectors to remote NetProxies (QUIC, TCP, UDP, CSR relay)
//! - The fixed set of worker threads that move frames and messages
//!
//! ```text
//!  ┌───────────┐ frames ┌──────────┐ ingress  ┌────────┐ remote egress ┌──────────────────┐
//!  │ interface │ ─────► │ ingress  │ ───────► │ Engine │ ────────────► │ remote tx        │
//!  │ (tap/raw) │ ◄───── │ local tx │ ◄─────── │        │ ◄──────────── │ ConnectorManager │
//!  └───────────┘        └──────────┘  local   └────────┘   link rx     └──────────────────┘
//! ```

use std::sync::{Mutex, MutexGuard};

pub mod config;
pub mod connector;
pub mod interface;
pub mod manager;
pub mod workers;

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}
