//! Batching and pacing for the UDP connector
//!
//! Messages bound for a remote proxy over UDP are queued per destination and
//! leave as one datagram per [`Batch`]. A queue is flushed when its size
//! reaches the threshold or when its oldest message has waited for the
//! batching timeout. Flushes are paced to a bytes-per-second ceiling.
//!
//! ```text
//!   enqueue(proxy, msg) ──► [queue proxy 1] ──┐
//!                           [queue proxy 2] ──┼──► poll(now) ──► Vec<Batch>
//!                           [queue proxy N] ──┘    (threshold | timeout | rate)
//! ```
//!
//! Several `UDPUnicastData` messages for one (source, destination) pair are
//! packed into a single `MultipleUDPDatagrams` when a batch is cut.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use crate::config::NetProxySettings;
use crate::pwp::{self, MessageBody, ProxyMessage, PwpError, MAX_PAYLOAD_LEN};
use crate::protocol::CompressionSetting;

/// Largest batch handed to a single UDP send
pub const MAX_BATCH_BYTES: usize = 65_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchConfig {
    /// Flush as soon as a queue holds this many bytes
    pub threshold: usize,
    /// Longest a message may wait; zero sends every message at once
    pub timeout: Duration,
    /// Bytes per second, zero for unlimited
    pub rate_limit: u64,
    /// Queued bytes per destination before new messages are dropped
    pub capacity: usize,
}

impl From<&NetProxySettings> for BatchConfig {
    fn from(s: &NetProxySettings) -> Self {
        BatchConfig {
            threshold: s.udp_batch_threshold,
            timeout: s.udp_batch_timeout,
            rate_limit: s.udp_rate_limit,
            capacity: s.udp_buffer_size,
        }
    }
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig::from(&NetProxySettings::default())
    }
}

/// Messages leaving together in one datagram
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub proxy_id: u32,
    pub messages: Vec<ProxyMessage>,
}

impl Batch {
    pub fn encoded_len(&self) -> usize {
        self.messages.iter().map(ProxyMessage::encoded_len).sum()
    }

    /// Concatenated PWP frames
    pub fn encode(&self) -> Result<Vec<u8>, PwpError> {
        let mut out = Vec::with_capacity(self.encoded_len());
        for msg in &self.messages {
            out.extend_from_slice(&pwp::encode(msg)?);
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct Queue {
    messages: VecDeque<ProxyMessage>,
    bytes: usize,
    oldest: Instant,
}

#[derive(Debug)]
pub struct UdpBatcher {
    config: BatchConfig,
    queues: BTreeMap<u32, Queue>,
    /// Earliest time the rate limit allows the next flush
    next_send_at: Option<Instant>,
}

impl UdpBatcher {
    pub fn new(config: BatchConfig) -> Self {
        UdpBatcher {
            config,
            queues: BTreeMap::new(),
            next_send_at: None,
        }
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Queue a message; false if the destination queue is full
    pub fn enqueue(&mut self, proxy_id: u32, msg: ProxyMessage, now: Instant) -> bool {
        let len = msg.encoded_len();
        let queue = self.queues.entry(proxy_id).or_insert_with(|| Queue {
            messages: VecDeque::new(),
            bytes: 0,
            oldest: now,
        });
        if queue.messages.is_empty() {
            queue.oldest = now;
        } else if queue.bytes + len > self.config.capacity && !msg.body.is_reset() {
            log::warn!(
                "UDP queue for proxy {} full ({} bytes); dropping {:?}",
                proxy_id,
                queue.bytes,
                msg.message_type()
            );
            return false;
        }
        queue.bytes += len;
        queue.messages.push_back(msg);
        true
    }

    pub fn queued_bytes(&self) -> usize {
        self.queues.values().map(|q| q.bytes).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.values().all(|q| q.messages.is_empty())
    }

    fn is_due(&self, queue: &Queue, now: Instant) -> bool {
        !queue.messages.is_empty()
            && (queue.bytes >= self.config.threshold
                || self.config.timeout.is_zero()
                || now.saturating_duration_since(queue.oldest) >= self.config.timeout)
    }

    fn rate_allows(&self, now: Instant) -> bool {
        self.next_send_at.map_or(true, |t| now >= t)
    }

    /// Cut every batch that is due and allowed by the rate limit
    pub fn poll(&mut self, now: Instant) -> Vec<Batch> {
        let mut out = Vec::new();
        loop {
            if !self.rate_allows(now) {
                break;
            }
            let due = self
                .queues
                .iter()
                .find(|(_, q)| self.is_due(q, now))
                .map(|(&id, _)| id);
            let Some(proxy_id) = due else { break };
            match self.cut(proxy_id, now) {
                Some(batch) => {
                    self.charge(batch.encoded_len(), now);
                    out.push(batch);
                }
                None => break,
            }
        }
        out
    }

    /// Drain everything regardless of timers and rate
    pub fn flush_all(&mut self, now: Instant) -> Vec<Batch> {
        let ids: Vec<u32> = self.queues.keys().copied().collect();
        let mut out = Vec::new();
        for id in ids {
            while let Some(batch) = self.cut(id, now) {
                out.push(batch);
            }
        }
        out
    }

    /// When `poll` should next be called, if anything is queued
    pub fn next_deadline(&self) -> Option<Instant> {
        let earliest = self
            .queues
            .values()
            .filter(|q| !q.messages.is_empty())
            .map(|q| {
                if q.bytes >= self.config.threshold {
                    q.oldest
                } else {
                    q.oldest + self.config.timeout
                }
            })
            .min()?;
        Some(match self.next_send_at {
            Some(t) if t > earliest => t,
            _ => earliest,
        })
    }

    /// Remove queued messages of a circuit, keeping resets
    pub fn purge(&mut self, proxy_id: u32, circuit: u16) -> usize {
        let Some(queue) = self.queues.get_mut(&proxy_id) else {
            return 0;
        };
        let before = queue.messages.len();
        queue
            .messages
            .retain(|m| m.body.is_reset() || m.body.circuit_id() != Some(circuit));
        queue.bytes = queue.messages.iter().map(ProxyMessage::encoded_len).sum();
        before - queue.messages.len()
    }

    /// Drop the whole queue of a proxy whose link went away
    pub fn discard(&mut self, proxy_id: u32) -> usize {
        self.queues.remove(&proxy_id).map_or(0, |q| q.messages.len())
    }

    fn charge(&mut self, bytes: usize, now: Instant) {
        if self.config.rate_limit == 0 {
            return;
        }
        let cost = Duration::from_secs_f64(bytes as f64 / self.config.rate_limit as f64);
        let base = match self.next_send_at {
            Some(t) if t > now => t,
            _ => now,
        };
        self.next_send_at = Some(base + cost);
    }

    fn cut(&mut self, proxy_id: u32, now: Instant) -> Option<Batch> {
        let limit = self.config.threshold.clamp(1, MAX_BATCH_BYTES);
        let queue = self.queues.get_mut(&proxy_id)?;
        let mut taken = Vec::new();
        let mut bytes = 0;
        while let Some(next) = queue.messages.front() {
            let len = next.encoded_len();
            if !taken.is_empty() && (bytes >= limit || bytes + len > MAX_BATCH_BYTES) {
                break;
            }
            bytes += len;
            if let Some(msg) = queue.messages.pop_front() {
                taken.push(msg);
            }
        }
        queue.bytes -= bytes;
        queue.oldest = now;
        if taken.is_empty() {
            return None;
        }
        log::trace!(
            "UDP batch for proxy {}: {} messages, {} bytes",
            proxy_id,
            taken.len(),
            bytes
        );
        Some(Batch {
            proxy_id,
            messages: pack_unicast(taken),
        })
    }
}

/// Merge unicast datagrams sharing (protocol, source, destination, compression)
fn pack_unicast(messages: Vec<ProxyMessage>) -> Vec<ProxyMessage> {
    type Key = (u8, Ipv4Addr, Ipv4Addr, u8, u32);
    struct Group {
        first: ProxyMessage,
        proxy_id: u32,
        compression: CompressionSetting,
        datagrams: Vec<(u8, Vec<u8>)>,
        bytes: usize,
    }

    let mut slots: Vec<Result<ProxyMessage, usize>> = Vec::with_capacity(messages.len());
    let mut groups: Vec<Group> = Vec::new();
    let mut open: HashMap<Key, usize> = HashMap::new();

    for msg in messages {
        let MessageBody::UdpUnicastData {
            proxy_id,
            ttl,
            compression,
            ref payload,
        } = msg.body
        else {
            slots.push(Ok(msg));
            continue;
        };
        let key = (
            msg.protocol.to_byte(),
            msg.source,
            msg.destination,
            compression.to_byte(),
            proxy_id,
        );
        let packed_len = 1 + payload.len();
        if let Some(&g) = open.get(&key) {
            let group = &mut groups[g];
            if group.datagrams.len() < u8::MAX as usize && group.bytes + packed_len <= MAX_PAYLOAD_LEN {
                group.bytes += packed_len;
                group.datagrams.push((ttl, payload.clone()));
                continue;
            }
        }
        open.insert(key, groups.len());
        slots.push(Err(groups.len()));
        groups.push(Group {
            proxy_id,
            compression,
            datagrams: vec![(ttl, payload.clone())],
            bytes: packed_len,
            first: msg,
        });
    }

    let mut groups: Vec<Option<Group>> = groups.into_iter().map(Some).collect();
    slots
        .into_iter()
        .filter_map(|slot| match slot {
            Ok(msg) => Some(msg),
            Err(g) => groups[g].take().map(|group| {
                if group.datagrams.len() == 1 {
                    return group.first;
                }
                let count = group.datagrams.len() as u8;
                let payload = pwp::pack_datagrams(group.datagrams.iter().map(|(t, d)| (*t, d.as_slice())));
                ProxyMessage {
                    protocol: group.first.protocol,
                    reachable: group.first.reachable,
                    source: group.first.source,
                    destination: group.first.destination,
                    body: MessageBody::MultipleUdpDatagrams {
                        proxy_id: group.proxy_id,
                        count,
                        compression: group.compression,
                        payload,
                    },
                }
            }),
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
