//! Lock-free engine counters
//!
//! Workers bump atomic counters; the status emitter takes a serializable
//! snapshot periodically.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

pub struct Stats {
    /// Frames read from either interface
    pub frames_in: AtomicU64,
    /// Frames written to either interface
    pub frames_out: AtomicU64,
    /// Frames dropped as malformed, unmapped or unsupported
    pub frames_dropped: AtomicU64,
    pub messages_in: AtomicU64,
    pub messages_out: AtomicU64,
    pub connections_opened: AtomicU64,
    pub connections_reset: AtomicU64,
    pub udp_batches_flushed: AtomicU64,
    pub start_time: Instant,
}

/// Point-in-time copy of [`Stats`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub proxy_id: u32,
    pub uptime_secs: u64,
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_dropped: u64,
    pub messages_in: u64,
    pub messages_out: u64,
    pub connections_opened: u64,
    pub connections_reset: u64,
    pub active_connections: u64,
    pub udp_batches_flushed: u64,
}

impl Stats {
    pub fn new() -> Self {
        Self {
            frames_in: AtomicU64::new(0),
            frames_out: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
            messages_in: AtomicU64::new(0),
            messages_out: AtomicU64::new(0),
            connections_opened: AtomicU64::new(0),
            connections_reset: AtomicU64::new(0),
            udp_batches_flushed: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self, proxy_id: u32, active_connections: usize) -> StatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            proxy_id,
            uptime_secs: self.start_time.elapsed().as_secs(),
            frames_in: get(&self.frames_in),
            frames_out: get(&self.frames_out),
            frames_dropped: get(&self.frames_dropped),
            messages_in: get(&self.messages_in),
            messages_out: get(&self.messages_out),
            connections_opened: get(&self.connections_opened),
            connections_reset: get(&self.connections_reset),
            active_connections: active_connections as u64,
            udp_batches_flushed: get(&self.udp_batches_flushed),
        }
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reads_counters() {
        let s = Stats::new();
        Stats::bump(&s.frames_in);
        Stats::bump(&s.frames_in);
        s.udp_batches_flushed.fetch_add(5, Ordering::Relaxed);
        let snap = s.snapshot(7, 3);
        assert_eq!(snap.frames_in, 2);
        assert_eq!(snap.udp_batches_flushed, 5);
        assert_eq!(snap.active_connections, 3);
        assert_eq!(snap.proxy_id, 7);
    }
}
