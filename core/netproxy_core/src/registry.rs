//! Remote proxy registry and address mapping
//!
//! ```text
//!   dest ip:port ──► AddressMappingTable ──► remote proxy id
//!                                                 │
//!                       RemoteProxyRegistry ◄─────┘
//!                       (addresses, reachability, link state,
//!                        auto-connection entries)
//! ```
//!
//! All registration calls are idempotent.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::address_range::AddressRangeDescriptor;
use crate::config::{DEFAULT_QUIC_PORT, DEFAULT_TCP_PORT, DEFAULT_UDP_PORT};
use crate::lock;
use crate::protocol::ConnectorKind;
use crate::pwp::ProxyPorts;

/// Proxy ids 0 and 0xFFFFFFFF are reserved
pub fn is_valid_proxy_id(id: u32) -> bool {
    id != 0 && id != u32::MAX
}

// ============================================================================
// Remote Proxy Info
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connectivity {
    /// Only the local proxy can open links
    Active,
    /// Only the remote proxy can open links
    Passive,
    Bidirectional,
}

impl Connectivity {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "active" => Some(Connectivity::Active),
            "passive" => Some(Connectivity::Passive),
            "bidirectional" => Some(Connectivity::Bidirectional),
            _ => None,
        }
    }
}

/// How to reach a remote proxy with one connector kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorTarget {
    Direct(SocketAddr),
    /// Through the CSR relay, addressed by proxy id
    Relay { proxy_id: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteProxyInfo {
    pub id: u32,
    pub address: Ipv4Addr,
    pub ports: ProxyPorts,
    /// The remote proxy can open links to us
    pub local_reachable_from_remote: bool,
    /// We can open links to the remote proxy
    pub remote_reachable_from_local: bool,
    pub settings_file: Option<String>,
}

impl RemoteProxyInfo {
    pub fn new(id: u32, address: Ipv4Addr) -> Self {
        RemoteProxyInfo {
            id,
            address,
            ports: ProxyPorts {
                quic: DEFAULT_QUIC_PORT,
                tcp: DEFAULT_TCP_PORT,
                udp: DEFAULT_UDP_PORT,
            },
            local_reachable_from_remote: true,
            remote_reachable_from_local: true,
            settings_file: None,
        }
    }

    pub fn set_connectivity(&mut self, c: Connectivity) {
        let (remote, local) = match c {
            Connectivity::Active => (true, false),
            Connectivity::Passive => (false, true),
            Connectivity::Bidirectional => (true, true),
        };
        self.remote_reachable_from_local = remote;
        self.local_reachable_from_remote = local;
    }

    /// `None` when neither side can reach the other
    pub fn connectivity(&self) -> Option<Connectivity> {
        match (self.remote_reachable_from_local, self.local_reachable_from_remote) {
            (true, true) => Some(Connectivity::Bidirectional),
            (true, false) => Some(Connectivity::Active),
            (false, true) => Some(Connectivity::Passive),
            (false, false) => None,
        }
    }

    pub fn reachability_unspecified(&self) -> bool {
        self.connectivity().is_none()
    }

    pub fn address_for(&self, kind: ConnectorKind) -> ConnectorTarget {
        let port = match kind {
            ConnectorKind::Quic => self.ports.quic,
            ConnectorKind::Tcp => self.ports.tcp,
            ConnectorKind::Udp => self.ports.udp,
            ConnectorKind::Csr => return ConnectorTarget::Relay { proxy_id: self.id },
        };
        ConnectorTarget::Direct(SocketAddr::V4(SocketAddrV4::new(self.address, port)))
    }
}

// ============================================================================
// Address Mapping Table
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MappingOutcome {
    Added,
    /// Same range and proxy already present
    Duplicate,
    /// Range already mapped to another proxy; the earlier entry keeps winning
    Conflict { existing: u32 },
}

/// Ordered (range → proxy id) list; lookups return the first match
#[derive(Debug, Clone, Default)]
pub struct AddressMappingTable {
    entries: Vec<(AddressRangeDescriptor, u32)>,
}

impl AddressMappingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, range: AddressRangeDescriptor, proxy_id: u32) -> MappingOutcome {
        if let Some((_, existing)) = self.entries.iter().find(|(r, _)| *r == range) {
            if *existing == proxy_id {
                return MappingOutcome::Duplicate;
            }
            let existing = *existing;
            log::warn!(
                "range {} already mapped to proxy {}; mapping to proxy {} will be shadowed",
                range,
                existing,
                proxy_id
            );
            self.entries.push((range, proxy_id));
            return MappingOutcome::Conflict { existing };
        }
        self.entries.push((range, proxy_id));
        MappingOutcome::Added
    }

    pub fn resolve(&self, ip: Ipv4Addr, port: u16) -> Option<u32> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains(ip, port))
            .map(|(_, id)| *id)
    }

    /// First match ignoring port ranges, for ICMP and whole-packet tunnels
    pub fn resolve_address(&self, ip: Ipv4Addr) -> Option<u32> {
        self.entries
            .iter()
            .find(|(r, _)| r.contains_address(ip))
            .map(|(_, id)| *id)
    }

    /// Whether any range covers `ip`, on any port
    pub fn covers_address(&self, ip: Ipv4Addr) -> bool {
        self.entries.iter().any(|(r, _)| r.contains_address(ip))
    }

    pub fn proxy_ids(&self) -> BTreeSet<u32> {
        self.entries.iter().map(|(_, id)| *id).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Auto Connections / Links
// ============================================================================

pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_millis(30_000);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoConnectionEntry {
    pub proxy_id: u32,
    pub kind: ConnectorKind,
    pub reconnect_interval: Duration,
    /// False when the remote proxy cannot be reached from here
    pub valid: bool,
    pub last_attempt: Option<Instant>,
}

impl AutoConnectionEntry {
    pub fn is_due(&self, now: Instant) -> bool {
        self.valid
            && self
                .last_attempt
                .map_or(true, |t| now.saturating_duration_since(t) >= self.reconnect_interval)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoConnectionUpdate {
    Added,
    Updated,
}

/// State of the transport link to one remote proxy over one connector kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    #[default]
    Disconnected,
    /// InitializeConnection sent, ConnectionInitialized pending
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    UnknownProxy(u32),
    ConnectorDisabled(ConnectorKind),
    /// No link and the remote side is configured as not reachable from here
    Unreachable(u32),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteError::UnknownProxy(id) => write!(f, "unknown remote proxy {}", id),
            RouteError::ConnectorDisabled(k) => write!(f, "connector {} is disabled", k),
            RouteError::Unreachable(id) => write!(f, "remote proxy {} is not reachable from here", id),
        }
    }
}

impl std::error::Error for RouteError {}

// ============================================================================
// Registry
// ============================================================================

/// Shared view of every remote proxy
///
/// Each table has its own lock. The only nesting is auto_connections → links.
#[derive(Debug)]
pub struct RemoteProxyRegistry {
    proxies: Mutex<HashMap<u32, RemoteProxyInfo>>,
    mappings: Mutex<AddressMappingTable>,
    auto_connections: Mutex<HashMap<(u32, ConnectorKind), AutoConnectionEntry>>,
    links: Mutex<HashMap<(u32, ConnectorKind), LinkState>>,
    enabled: BTreeSet<ConnectorKind>,
}

impl RemoteProxyRegistry {
    pub fn new(enabled: BTreeSet<ConnectorKind>) -> Self {
        RemoteProxyRegistry {
            proxies: Mutex::new(HashMap::new()),
            mappings: Mutex::new(AddressMappingTable::new()),
            auto_connections: Mutex::new(HashMap::new()),
            links: Mutex::new(HashMap::new()),
            enabled,
        }
    }

    pub fn is_enabled(&self, kind: ConnectorKind) -> bool {
        self.enabled.contains(&kind)
    }

    // --- proxies -----------------------------------------------------------

    /// Add or merge proxy info; returns true if anything changed
    pub fn add_remote_proxy_info(&self, info: RemoteProxyInfo) -> bool {
        if info.reachability_unspecified() {
            log::warn!(
                "both local and remote reachability are false for remote proxy {}",
                info.id
            );
        }
        let remote_reachable = info.remote_reachable_from_local;
        let id = info.id;

        let changed = {
            let mut proxies = lock(&self.proxies);
            match proxies.get_mut(&id) {
                Some(existing) if *existing == info => false,
                Some(existing) => {
                    log::info!("updated remote proxy {} ({})", id, info.address);
                    *existing = info;
                    true
                }
                None => {
                    log::info!("added remote proxy {} ({})", id, info.address);
                    proxies.insert(id, info);
                    true
                }
            }
        };

        if changed {
            for entry in lock(&self.auto_connections).values_mut() {
                if entry.proxy_id == id {
                    entry.valid = remote_reachable;
                }
            }
        }
        changed
    }

    pub fn remote_proxy(&self, id: u32) -> Option<RemoteProxyInfo> {
        lock(&self.proxies).get(&id).cloned()
    }

    pub fn remote_proxy_ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = lock(&self.proxies).keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Find the proxy owning a transport address
    pub fn proxy_by_address(&self, address: Ipv4Addr) -> Option<u32> {
        lock(&self.proxies)
            .values()
            .find(|p| p.address == address)
            .map(|p| p.id)
    }

    /// Whether proxy `id` has both reachability flags false
    pub fn is_reachability_unspecified(&self, id: u32) -> bool {
        lock(&self.proxies)
            .get(&id)
            .map_or(false, |p| p.reachability_unspecified())
    }

    /// Record the identity announced by a peer during the link handshake
    pub fn on_peer_announced(&self, id: u32, address: Ipv4Addr, ports: ProxyPorts) {
        let mut proxies = lock(&self.proxies);
        match proxies.get_mut(&id) {
            Some(p) => {
                if p.address != address || p.ports != ports {
                    log::info!("remote proxy {} now at {} {:?}", id, address, ports);
                    p.address = address;
                    p.ports = ports;
                }
                p.local_reachable_from_remote = true;
            }
            None => {
                log::info!("learned remote proxy {} at {}", id, address);
                let mut info = RemoteProxyInfo::new(id, address);
                info.ports = ports;
                info.set_connectivity(Connectivity::Passive);
                proxies.insert(id, info);
            }
        }
    }

    // --- address mapping ---------------------------------------------------

    pub fn add_address_mapping(&self, range: AddressRangeDescriptor, proxy_id: u32) -> MappingOutcome {
        let outcome = lock(&self.mappings).add(range, proxy_id);
        if outcome == MappingOutcome::Added {
            log::info!("mapped {} to remote proxy {}", range, proxy_id);
        }
        outcome
    }

    pub fn resolve(&self, ip: Ipv4Addr, port: u16) -> Option<u32> {
        lock(&self.mappings).resolve(ip, port)
    }

    pub fn resolve_address(&self, ip: Ipv4Addr) -> Option<u32> {
        lock(&self.mappings).resolve_address(ip)
    }

    pub fn is_mapped_address(&self, ip: Ipv4Addr) -> bool {
        lock(&self.mappings).covers_address(ip)
    }

    pub fn mapped_proxy_ids(&self) -> BTreeSet<u32> {
        lock(&self.mappings).proxy_ids()
    }

    // --- connectors and links ----------------------------------------------

    /// Resolve how to reach `proxy_id` with `kind`
    pub fn connector_for(&self, proxy_id: u32, kind: ConnectorKind) -> Result<ConnectorTarget, RouteError> {
        if !self.is_enabled(kind) {
            return Err(RouteError::ConnectorDisabled(kind));
        }
        let info = self
            .remote_proxy(proxy_id)
            .ok_or(RouteError::UnknownProxy(proxy_id))?;
        if !info.remote_reachable_from_local && self.link_state(proxy_id, kind) != LinkState::Connected {
            return Err(RouteError::Unreachable(proxy_id));
        }
        Ok(info.address_for(kind))
    }

    pub fn link_state(&self, proxy_id: u32, kind: ConnectorKind) -> LinkState {
        lock(&self.links)
            .get(&(proxy_id, kind))
            .copied()
            .unwrap_or_default()
    }

    pub fn set_link_state(&self, proxy_id: u32, kind: ConnectorKind, state: LinkState) {
        let previous = lock(&self.links).insert((proxy_id, kind), state);
        if previous != Some(state) {
            log::debug!("link {}/{}: {:?}", proxy_id, kind, state);
        }
    }

    /// Move a disconnected link to Connecting; false if it was already up or opening
    pub fn begin_connect(&self, proxy_id: u32, kind: ConnectorKind) -> bool {
        let mut links = lock(&self.links);
        let state = links.entry((proxy_id, kind)).or_default();
        if *state != LinkState::Disconnected {
            return false;
        }
        *state = LinkState::Connecting;
        log::debug!("link {}/{}: Connecting", proxy_id, kind);
        true
    }

    /// Mark every link to `proxy_id` disconnected; returns the kinds that were up
    pub fn drop_links(&self, proxy_id: u32) -> Vec<ConnectorKind> {
        let mut dropped = Vec::new();
        for ((id, kind), state) in lock(&self.links).iter_mut() {
            if *id == proxy_id && *state != LinkState::Disconnected {
                *state = LinkState::Disconnected;
                dropped.push(*kind);
            }
        }
        if !dropped.is_empty() {
            log::info!("dropped links to remote proxy {}: {:?}", proxy_id, dropped);
        }
        dropped
    }

    // --- auto connections --------------------------------------------------

    pub fn add_or_update_auto_connection(
        &self,
        proxy_id: u32,
        kind: ConnectorKind,
        reconnect_interval: Duration,
    ) -> AutoConnectionUpdate {
        let valid = self
            .remote_proxy(proxy_id)
            .map_or(false, |p| p.remote_reachable_from_local);
        if !valid {
            log::warn!(
                "auto-connection to remote proxy {} over {} is impossible: remote side is not reachable",
                proxy_id,
                kind
            );
        }

        let mut entries = lock(&self.auto_connections);
        match entries.get_mut(&(proxy_id, kind)) {
            Some(entry) => {
                entry.reconnect_interval = reconnect_interval;
                entry.valid = valid;
                AutoConnectionUpdate::Updated
            }
            None => {
                entries.insert(
                    (proxy_id, kind),
                    AutoConnectionEntry {
                        proxy_id,
                        kind,
                        reconnect_interval,
                        valid,
                        last_attempt: None,
                    },
                );
                AutoConnectionUpdate::Added
            }
        }
    }

    pub fn auto_connection(&self, proxy_id: u32, kind: ConnectorKind) -> Option<AutoConnectionEntry> {
        lock(&self.auto_connections).get(&(proxy_id, kind)).cloned()
    }

    /// Valid entries whose link is down and whose interval elapsed
    ///
    /// Returned entries are marked as attempted at `now`.
    pub fn due_auto_connections(&self, now: Instant) -> Vec<AutoConnectionEntry> {
        let mut due = Vec::new();
        let mut entries = lock(&self.auto_connections);
        for entry in entries.values_mut() {
            if !entry.is_due(now) || !self.is_enabled(entry.kind) {
                continue;
            }
            if self.link_state(entry.proxy_id, entry.kind) == LinkState::Connected {
                continue;
            }
            entry.last_attempt = Some(now);
            due.push(entry.clone());
        }
        due.sort_by_key(|e| (e.proxy_id, e.kind));
        due
    }
}

// ============================================================================
// Tests
// ============================================================================
