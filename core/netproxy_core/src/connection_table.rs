//! Table of virtual TCP connections
//!
//! Entries are keyed by local circuit id with two secondary indexes: the
//! flow 4-tuple (host side) and the (remote proxy, remote circuit id) pair
//! (tunnel side). Creation is a single check-and-insert under the table
//! lock, so a burst of identical SYNs yields exactly one entry.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use crate::lock;
use crate::tcp::{FlowKey, VirtualConnection};

pub type SharedConnection = Arc<Mutex<VirtualConnection>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableError {
    /// Every circuit id is in use or the configured maximum was reached
    Full,
    /// The remote circuit is already bound to another entry
    Duplicate { local_id: u16 },
}

impl fmt::Display for TableError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TableError::Full => write!(f, "connection table full"),
            TableError::Duplicate { local_id } => {
                write!(f, "remote circuit already bound to local id {}", local_id)
            }
        }
    }
}

impl std::error::Error for TableError {}

#[derive(Debug)]
struct Entry {
    conn: SharedConnection,
    flow: FlowKey,
    proxy_id: u32,
    remote_id: Option<u16>,
}

#[derive(Debug, Default)]
struct Inner {
    entries: HashMap<u16, Entry>,
    by_flow: HashMap<FlowKey, u16>,
    by_remote: HashMap<(u32, u16), u16>,
    last_id: u16,
}

impl Inner {
    fn allocate_id(&mut self) -> Option<u16> {
        let mut id = self.last_id;
        for _ in 0..u16::MAX {
            id = id.wrapping_add(1);
            if id != 0 && !self.entries.contains_key(&id) {
                self.last_id = id;
                return Some(id);
            }
        }
        None
    }

    fn insert(&mut self, id: u16, conn: SharedConnection, flow: FlowKey, proxy_id: u32, remote_id: Option<u16>) {
        self.by_flow.insert(flow, id);
        if let Some(remote) = remote_id {
            self.by_remote.insert((proxy_id, remote), id);
        }
        self.entries.insert(
            id,
            Entry {
                conn,
                flow,
                proxy_id,
                remote_id,
            },
        );
    }
}

#[derive(Debug)]
pub struct ConnectionTable {
    inner: Mutex<Inner>,
    capacity: usize,
}

impl ConnectionTable {
    pub fn new(capacity: usize) -> Self {
        ConnectionTable {
            inner: Mutex::new(Inner::default()),
            capacity: capacity.min(u16::MAX as usize - 1),
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, local_id: u16) -> Option<SharedConnection> {
        lock(&self.inner).entries.get(&local_id).map(|e| e.conn.clone())
    }

    pub fn find_by_flow(&self, flow: &FlowKey) -> Option<SharedConnection> {
        let inner = lock(&self.inner);
        let id = inner.by_flow.get(flow)?;
        inner.entries.get(id).map(|e| e.conn.clone())
    }

    pub fn find_by_remote(&self, proxy_id: u32, remote_id: u16) -> Option<SharedConnection> {
        let inner = lock(&self.inner);
        let id = inner.by_remote.get(&(proxy_id, remote_id))?;
        inner.entries.get(id).map(|e| e.conn.clone())
    }

    /// Look up the flow, creating the entry if absent
    ///
    /// `make` receives the new local id and runs under the table lock.
    /// Returns the entry and whether it was created.
    pub fn get_or_create<F>(&self, flow: FlowKey, proxy_id: u32, make: F) -> Result<(SharedConnection, bool), TableError>
    where
        F: FnOnce(u16) -> VirtualConnection,
    {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner.by_flow.get(&flow).and_then(|id| inner.entries.get(id)) {
            return Ok((entry.conn.clone(), false));
        }
        if inner.entries.len() >= self.capacity {
            return Err(TableError::Full);
        }
        let id = inner.allocate_id().ok_or(TableError::Full)?;
        let conn = Arc::new(Mutex::new(make(id)));
        inner.insert(id, conn.clone(), flow, proxy_id, None);
        Ok((conn, true))
    }

    /// Create the entry answering a peer's open request
    ///
    /// An existing binding for (proxy, remote id) is returned unchanged.
    pub fn get_or_create_for_remote<F>(
        &self,
        proxy_id: u32,
        remote_id: u16,
        flow: FlowKey,
        make: F,
    ) -> Result<(SharedConnection, bool), TableError>
    where
        F: FnOnce(u16) -> VirtualConnection,
    {
        let mut inner = lock(&self.inner);
        if let Some(entry) = inner
            .by_remote
            .get(&(proxy_id, remote_id))
            .and_then(|id| inner.entries.get(id))
        {
            return Ok((entry.conn.clone(), false));
        }
        if let Some(&local_id) = inner.by_flow.get(&flow) {
            return Err(TableError::Duplicate { local_id });
        }
        if inner.entries.len() >= self.capacity {
            return Err(TableError::Full);
        }
        let id = inner.allocate_id().ok_or(TableError::Full)?;
        let conn = Arc::new(Mutex::new(make(id)));
        inner.insert(id, conn.clone(), flow, proxy_id, Some(remote_id));
        Ok((conn, true))
    }

    /// Record the remote circuit id once the peer announced it
    pub fn bind_remote(&self, local_id: u16, proxy_id: u32, remote_id: u16) -> Result<(), TableError> {
        let mut inner = lock(&self.inner);
        match inner.by_remote.get(&(proxy_id, remote_id)) {
            Some(&existing) if existing == local_id => return Ok(()),
            Some(&existing) => return Err(TableError::Duplicate { local_id: existing }),
            None => {}
        }
        let Some(entry) = inner.entries.get_mut(&local_id) else {
            return Ok(());
        };
        let old = entry.remote_id.replace(remote_id).map(|r| (entry.proxy_id, r));
        entry.proxy_id = proxy_id;
        if let Some(old) = old {
            inner.by_remote.remove(&old);
        }
        inner.by_remote.insert((proxy_id, remote_id), local_id);
        Ok(())
    }

    pub fn remove(&self, local_id: u16) -> Option<SharedConnection> {
        let mut inner = lock(&self.inner);
        let entry = inner.entries.remove(&local_id)?;
        inner.by_flow.remove(&entry.flow);
        if let Some(remote) = entry.remote_id {
            inner.by_remote.remove(&(entry.proxy_id, remote));
        }
        Some(entry.conn)
    }

    /// Every entry, for timer processing outside the table lock
    pub fn snapshot(&self) -> Vec<(u16, SharedConnection)> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|(&id, e)| (id, e.conn.clone()))
            .collect()
    }

    /// Entries tunnelled to one remote proxy
    pub fn for_proxy(&self, proxy_id: u32) -> Vec<(u16, SharedConnection)> {
        lock(&self.inner)
            .entries
            .iter()
            .filter(|(_, e)| e.proxy_id == proxy_id)
            .map(|(&id, e)| (id, e.conn.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProtocolSetting;
    use std::net::Ipv4Addr;
    use std::thread;
    use std::time::Instant;

    fn flow(port: u16) -> FlowKey {
        FlowKey {
            local_ip: Ipv4Addr::new(192, 168, 0, 2),
            local_port: port,
            remote_ip: Ipv4Addr::new(10, 0, 0, 9),
            remote_port: 22,
        }
    }

    fn make(f: FlowKey) -> impl FnOnce(u16) -> VirtualConnection {
        move |id| VirtualConnection::new(id, f, 7, ProtocolSetting::default_tcp(), Instant::now())
    }

    #[test]
    fn test_get_or_create_is_idempotent() {
        let table = ConnectionTable::new(10);
        let (a, created) = table.get_or_create(flow(1000), 7, make(flow(1000))).unwrap();
        assert!(created);
        let (b, created) = table.get_or_create(flow(1000), 7, make(flow(1000))).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_concurrent_burst_creates_one_entry() {
        let table = Arc::new(ConnectionTable::new(100));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || table.get_or_create(flow(2000), 7, make(flow(2000))).unwrap().1)
            })
            .collect();
        let created = handles.into_iter().map(|h| h.join().unwrap()).filter(|c| *c).count();
        assert_eq!(created, 1);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_capacity() {
        let table = ConnectionTable::new(2);
        table.get_or_create(flow(1), 7, make(flow(1))).unwrap();
        table.get_or_create(flow(2), 7, make(flow(2))).unwrap();
        assert_eq!(
            table.get_or_create(flow(3), 7, make(flow(3))).unwrap_err(),
            TableError::Full
        );
    }

    #[test]
    fn test_remote_binding_and_removal() {
        let table = ConnectionTable::new(10);
        let (conn, _) = table.get_or_create(flow(1), 7, make(flow(1))).unwrap();
        let id = conn.lock().unwrap().local_id;
        table.bind_remote(id, 7, 44).unwrap();
        assert!(Arc::ptr_eq(&table.find_by_remote(7, 44).unwrap(), &conn));

        let (other, _) = table.get_or_create(flow(2), 7, make(flow(2))).unwrap();
        let other_id = other.lock().unwrap().local_id;
        assert_eq!(
            table.bind_remote(other_id, 7, 44),
            Err(TableError::Duplicate { local_id: id })
        );

        table.remove(id).unwrap();
        assert!(table.find_by_remote(7, 44).is_none());
        assert!(table.find_by_flow(&flow(1)).is_none());
        assert_eq!(table.for_proxy(7).len(), 1);
    }

    #[test]
    fn test_remote_open_is_deduplicated() {
        let table = ConnectionTable::new(10);
        let (a, created) = table.get_or_create_for_remote(7, 5, flow(1), make(flow(1))).unwrap();
        assert!(created);
        let (b, created) = table.get_or_create_for_remote(7, 5, flow(1), make(flow(1))).unwrap();
        assert!(!created);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn test_ids_skip_zero_and_used() {
        let table = ConnectionTable::new(10);
        let (a, _) = table.get_or_create(flow(1), 7, make(flow(1))).unwrap();
        let (b, _) = table.get_or_create(flow(2), 7, make(flow(2))).unwrap();
        let a = a.lock().unwrap().local_id;
        let b = b.lock().unwrap().local_id;
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }
}
