use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

use super::seq;
use super::{
    syn_timeout, FlowKey, HostSegment, LocalState, RemoteRequest, RemoteState, Segment, TcpAction, TcpSettings,
    DELAYED_ACK_TIMEOUT, MAX_RTO, MIN_RTO, RTT_ALPHA,
};
use crate::packet::tcp_flags::{ACK, FIN, PSH, RST, SYN, URG};
use crate::protocol::{CompressionSetting, ProtocolSetting};

/// Reply to a segment that belongs to no connection (RFC 793 reset generation)
pub fn reset_reply(seg: &Segment<'_>) -> Option<HostSegment> {
    if seg.has(RST) {
        return None;
    }
    Some(if seg.has(ACK) {
        HostSegment {
            flags: RST,
            seq: seg.ack,
            ack: 0,
            window: 0,
            payload: Vec::new(),
        }
    } else {
        HostSegment {
            flags: RST | ACK,
            seq: 0,
            ack: seg.seq.wrapping_add(seg.seq_len()),
            window: 0,
            payload: Vec::new(),
        }
    })
}

/// Data (or FIN) queued toward the local host
#[derive(Debug)]
struct OutSegment {
    seq: u32,
    flags: u8,
    payload: Vec<u8>,
    sent_at: Option<Instant>,
    transmissions: u32,
}

impl OutSegment {
    fn end(&self) -> u32 {
        self.seq
            .wrapping_add(self.payload.len() as u32)
            .wrapping_add((self.flags & FIN != 0) as u32)
    }
}

/// One proxied TCP flow
#[derive(Debug)]
pub struct VirtualConnection {
    pub local_id: u16,
    /// Circuit id assigned by the remote proxy, 0 until known
    pub remote_id: u16,
    pub flow: FlowKey,
    pub remote_proxy: u32,
    /// Transport and compression used toward the remote proxy
    pub setting: ProtocolSetting,
    /// Compression the remote proxy asked for
    pub remote_compression: CompressionSetting,

    local_state: LocalState,
    remote_state: RemoteState,

    // Sequence state. "in" is host → us, "out" is us → host.
    starting_in_seq: u32,
    starting_out_seq: u32,
    /// Next sequence number to assign to queued outgoing data
    out_seq: u32,
    /// Highest ACK received from the host
    last_ack_seq: u32,
    next_expected_in_seq: u32,
    /// Last ACK number we sent
    last_acked_seq: u32,
    receiver_window: u16,

    /// Stream offset of `next_expected_in_seq`
    in_offset: u64,
    out_of_order: BTreeMap<u64, Vec<u8>>,
    to_remote: Vec<u8>,
    to_remote_flags: u8,
    /// Host FIN received, TCPCloseConnection not emitted yet
    close_pending: bool,

    to_host: VecDeque<OutSegment>,
    fin_to_host_pending: bool,
    fin_seq: Option<u32>,
    syn_ack_sent: bool,

    srtt: Option<Duration>,
    rto: Duration,
    syn_attempts: usize,
    syn_last_sent: Option<Instant>,
    opened_at: Instant,
    last_local_activity: Instant,
    last_remote_activity: Instant,
    last_dup_ack: Option<Instant>,
    ack_pending_since: Option<Instant>,
    time_wait_since: Option<Instant>,
}

impl VirtualConnection {
    pub fn new(local_id: u16, flow: FlowKey, remote_proxy: u32, setting: ProtocolSetting, now: Instant) -> Self {
        VirtualConnection {
            local_id,
            remote_id: 0,
            flow,
            remote_proxy,
            setting,
            remote_compression: CompressionSetting::NONE,
            local_state: LocalState::Closed,
            remote_state: RemoteState::Unknown,
            starting_in_seq: 0,
            starting_out_seq: 0,
            out_seq: 0,
            last_ack_seq: 0,
            next_expected_in_seq: 0,
            last_acked_seq: 0,
            receiver_window: 0,
            in_offset: 0,
            out_of_order: BTreeMap::new(),
            to_remote: Vec::new(),
            to_remote_flags: 0,
            close_pending: false,
            to_host: VecDeque::new(),
            fin_to_host_pending: false,
            fin_seq: None,
            syn_ack_sent: false,
            srtt: None,
            rto: Duration::from_secs(1),
            syn_attempts: 0,
            syn_last_sent: None,
            opened_at: now,
            last_local_activity: now,
            last_remote_activity: now,
            last_dup_ack: None,
            ack_pending_since: None,
            time_wait_since: None,
        }
    }

    pub fn local_state(&self) -> LocalState {
        self.local_state
    }

    pub fn remote_state(&self) -> RemoteState {
        self.remote_state
    }

    pub fn opened_at(&self) -> Instant {
        self.opened_at
    }

    pub fn last_activity(&self) -> Instant {
        self.last_local_activity.max(self.last_remote_activity)
    }

    /// Bytes queued toward the host and not yet acknowledged
    pub fn pending_to_host(&self) -> usize {
        self.to_host.iter().map(|s| s.payload.len()).sum()
    }

    // ========================================================================
    // Opening
    // ========================================================================

    /// Host SYN toward a mapped address (passive open on our side)
    pub fn on_local_syn(
        &mut self,
        seg: &Segment<'_>,
        isn: u32,
        link_up: bool,
        s: &TcpSettings,
        now: Instant,
        out: &mut Vec<TcpAction>,
    ) {
        self.local_state = LocalState::SynRcvd;
        self.starting_in_seq = seg.seq;
        self.next_expected_in_seq = seg.seq.wrapping_add(1);
        self.last_acked_seq = seg.seq;
        self.receiver_window = seg.window;
        self.starting_out_seq = isn;
        // The SYN-ACK owns `isn` even while it is held back
        self.out_seq = isn.wrapping_add(1);
        self.last_ack_seq = isn;
        self.opened_at = now;
        self.last_local_activity = now;

        if link_up {
            self.request_open(now, out);
        } else {
            self.remote_state = RemoteState::WaitingConnEstablishment;
        }
        log::debug!(
            "L{}-R{}: SYN from {} moved to SYN_RCVD, remote {:?}",
            self.local_id,
            self.remote_id,
            self.flow,
            self.remote_state
        );

        if !s.synchronize_handshake {
            self.send_syn_ack(s, out);
        }
    }

    /// The link to the remote proxy came up
    pub fn on_link_established(&mut self, now: Instant, out: &mut Vec<TcpAction>) {
        if self.remote_state == RemoteState::WaitingConnEstablishment && self.local_state == LocalState::SynRcvd {
            self.request_open(now, out);
        }
    }

    fn request_open(&mut self, now: Instant, out: &mut Vec<TcpAction>) {
        out.push(TcpAction::ToRemote(RemoteRequest::Open));
        self.remote_state = RemoteState::ConnRequestSent;
        self.syn_attempts = 0;
        self.syn_last_sent = Some(now);
        self.last_remote_activity = now;
    }

    fn send_syn_ack(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        let isn = self.starting_out_seq;
        self.send_to_host(SYN | ACK, isn, Vec::new(), s, out);
        self.syn_ack_sent = true;
    }

    /// Peer TCPConnectionOpened
    pub fn on_remote_opened(
        &mut self,
        remote_id: u16,
        compression: CompressionSetting,
        s: &TcpSettings,
        now: Instant,
        out: &mut Vec<TcpAction>,
    ) {
        match self.remote_state {
            RemoteState::ConnRequestSent | RemoteState::WaitingConnEstablishment => {}
            RemoteState::ConnEstablished if self.remote_id == remote_id => return,
            other => {
                log::warn!(
                    "L{}-R{}: TCPConnectionOpened in remote state {:?}; ignored",
                    self.local_id,
                    remote_id,
                    other
                );
                return;
            }
        }
        self.remote_id = remote_id;
        self.remote_compression = compression;
        self.remote_state = RemoteState::ConnEstablished;
        self.syn_last_sent = None;
        self.last_remote_activity = now;
        log::debug!("L{}-R{}: remote connection established", self.local_id, self.remote_id);

        if self.local_state == LocalState::SynRcvd && !self.syn_ack_sent {
            self.send_syn_ack(s, out);
        }
        self.flush_to_remote(s, out);
        self.transmit(s, now, out);
    }

    /// Peer TCPOpenConnection for a freshly created entry (active open toward the host)
    pub fn on_remote_open(
        &mut self,
        remote_id: u16,
        compression: CompressionSetting,
        isn: u32,
        s: &TcpSettings,
        now: Instant,
        out: &mut Vec<TcpAction>,
    ) {
        self.remote_id = remote_id;
        self.remote_compression = compression;
        self.remote_state = RemoteState::ConnRequestReceived;
        self.local_state = LocalState::SynSent;
        self.starting_out_seq = isn;
        self.out_seq = isn.wrapping_add(1);
        self.last_ack_seq = isn;
        self.opened_at = now;
        self.last_remote_activity = now;
        self.syn_attempts = 0;
        self.send_syn(s, now, out);
        log::debug!(
            "L{}-R{}: open request for {}; SYN sent, moved to SYN_SENT",
            self.local_id,
            self.remote_id,
            self.flow
        );
    }

    /// Repeated TCPOpenConnection for an entry that already exists
    pub fn on_duplicate_open(&self, out: &mut Vec<TcpAction>) {
        if self.remote_state == RemoteState::ConnEstablished {
            out.push(TcpAction::ToRemote(RemoteRequest::Opened));
        }
    }

    fn send_syn(&mut self, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        let isn = self.starting_out_seq;
        self.send_to_host(SYN, isn, Vec::new(), s, out);
        self.syn_last_sent = Some(now);
    }

    // ========================================================================
    // Host Segments
    // ========================================================================

    pub fn on_local_segment(&mut self, seg: &Segment<'_>, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        self.last_local_activity = now;

        match self.local_state {
            LocalState::Closed if self.remote_state == RemoteState::Unknown && seg.has(SYN) && !seg.has(ACK) => {
                // Entry still being opened by the thread that created it
                log::trace!("L{}: SYN for a connection being opened; ignored", self.local_id);
                return;
            }
            LocalState::Closed | LocalState::Listen => {
                if let Some(rst) = reset_reply(seg) {
                    out.push(TcpAction::ToHost(rst));
                }
                out.push(TcpAction::Destroy);
                return;
            }
            LocalState::SynSent => return self.on_segment_in_syn_sent(seg, s, now, out),
            _ => {}
        }

        if seg.has(RST) {
            return self.on_host_reset(seg, s, out);
        }

        if seg.has(SYN) {
            if self.local_state == LocalState::SynRcvd && seg.seq == self.starting_in_seq && !seg.has(ACK) {
                // Retransmitted SYN
                if self.syn_ack_sent {
                    let isn = self.starting_out_seq;
                    self.send_to_host(SYN | ACK, isn, Vec::new(), s, out);
                }
                return;
            }
            log::warn!(
                "L{}-R{}: unexpected SYN in state {}; resetting",
                self.local_id,
                self.remote_id,
                self.local_state
            );
            let seq = self.snd_nxt();
            self.send_to_host(RST, seq, Vec::new(), s, out);
            self.reset_remote_if_needed(out);
            out.push(TcpAction::Destroy);
            return;
        }

        if !self.acceptable(seg, s) {
            log::trace!(
                "L{}-R{}: out-of-window segment seq {} (expected {}); ACKed and dropped",
                self.local_id,
                self.remote_id,
                seg.seq,
                self.next_expected_in_seq
            );
            self.send_ack(s, out);
            return;
        }

        if !seg.has(ACK) {
            return;
        }
        if !self.process_ack(seg, s, now, out) {
            return;
        }
        if !seg.payload.is_empty() {
            self.process_data(seg, s, now, out);
        }
        if seg.has(FIN) && !self.process_fin(seg, s, now, out) {
            return;
        }
        self.transmit(s, now, out);
    }

    fn on_segment_in_syn_sent(&mut self, seg: &Segment<'_>, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        if seg.has(ACK) && seg.ack != self.out_seq {
            log::debug!(
                "L{}-R{}: wrong ACK {} in SYN_SENT (expected {}); sending RST",
                self.local_id,
                self.remote_id,
                seg.ack,
                self.out_seq
            );
            self.send_to_host(RST, seg.ack, Vec::new(), s, out);
            return;
        }
        if seg.has(RST) {
            if seg.has(ACK) {
                log::debug!("L{}-R{}: host refused the connection", self.local_id, self.remote_id);
                self.reset_remote_if_needed(out);
                out.push(TcpAction::Destroy);
            }
            return;
        }
        if !seg.has(SYN) {
            return;
        }

        self.starting_in_seq = seg.seq;
        self.next_expected_in_seq = seg.seq.wrapping_add(1);
        self.last_acked_seq = seg.seq;
        self.receiver_window = seg.window;
        self.syn_last_sent = None;

        if seg.has(ACK) {
            self.last_ack_seq = seg.ack;
            self.local_state = LocalState::Established;
            self.send_ack(s, out);
            self.remote_state = RemoteState::ConnEstablished;
            out.push(TcpAction::ToRemote(RemoteRequest::Opened));
            log::debug!("L{}-R{}: moved to ESTABLISHED", self.local_id, self.remote_id);
            self.flush_to_remote(s, out);
            self.transmit(s, now, out);
        } else {
            // Simultaneous open
            self.local_state = LocalState::SynRcvd;
            self.send_syn_ack(s, out);
        }
    }

    fn on_host_reset(&mut self, seg: &Segment<'_>, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        let acceptable =
            seg.seq == self.next_expected_in_seq || seq::in_window(seg.seq, self.next_expected_in_seq, s.window as u32);
        if !acceptable {
            log::trace!("L{}-R{}: unacceptable RST dropped", self.local_id, self.remote_id);
            return;
        }
        log::debug!(
            "L{}-R{}: RST from host in state {}",
            self.local_id,
            self.remote_id,
            self.local_state
        );
        self.reset_remote_if_needed(out);
        out.push(TcpAction::Destroy);
    }

    fn acceptable(&self, seg: &Segment<'_>, s: &TcpSettings) -> bool {
        let wnd = s.window as u32;
        let len = seg.payload.len() as u32 + seg.has(FIN) as u32;
        let start = self.next_expected_in_seq;
        if len == 0 {
            seg.seq == start || seq::in_window(seg.seq, start, wnd)
        } else {
            seq::in_window(seg.seq, start, wnd) || seq::in_window(seg.seq.wrapping_add(len - 1), start, wnd)
        }
    }

    /// Returns false when processing of the segment must stop
    fn process_ack(&mut self, seg: &Segment<'_>, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) -> bool {
        let snd_nxt = self.snd_nxt();

        if self.local_state == LocalState::SynRcvd {
            if !self.syn_ack_sent || seg.ack != snd_nxt {
                log::debug!(
                    "L{}-R{}: unacceptable ACK {} in SYN_RCVD; sending RST",
                    self.local_id,
                    self.remote_id,
                    seg.ack
                );
                self.send_to_host(RST, seg.ack, Vec::new(), s, out);
                return false;
            }
            self.local_state = LocalState::Established;
            self.last_ack_seq = seg.ack;
            self.receiver_window = seg.window;
            log::debug!("L{}-R{}: moved to ESTABLISHED", self.local_id, self.remote_id);
            if self.remote_state == RemoteState::ConnRequestReceived {
                self.remote_state = RemoteState::ConnEstablished;
                out.push(TcpAction::ToRemote(RemoteRequest::Opened));
            }
            self.flush_to_remote(s, out);
            return true;
        }

        if seq::gt(seg.ack, snd_nxt) {
            self.send_ack(s, out);
            return false;
        }
        if seq::gt(seg.ack, self.last_ack_seq) {
            self.last_ack_seq = seg.ack;
            self.acknowledge_to_host(seg.ack, now);
        }
        self.receiver_window = seg.window;

        if let Some(fin_seq) = self.fin_seq {
            if seq::gt(seg.ack, fin_seq) {
                match self.local_state {
                    LocalState::FinWait1 => {
                        self.local_state = LocalState::FinWait2;
                        log::debug!("L{}-R{}: FIN acknowledged, FIN_WAIT_2", self.local_id, self.remote_id);
                    }
                    LocalState::Closing => return self.enter_time_wait(s, now, out),
                    LocalState::LastAck => {
                        self.local_state = LocalState::Closed;
                        log::debug!("L{}-R{}: LAST_ACK acknowledged, closed", self.local_id, self.remote_id);
                        out.push(TcpAction::Destroy);
                        return false;
                    }
                    _ => {}
                }
            }
        }
        true
    }

    fn acknowledge_to_host(&mut self, ack: u32, now: Instant) {
        while let Some(front) = self.to_host.front() {
            if front.sent_at.is_none() || !seq::le(front.end(), ack) {
                break;
            }
            if let Some(seg) = self.to_host.pop_front() {
                if seg.transmissions == 1 {
                    if let Some(sent) = seg.sent_at {
                        self.update_rtt(now.saturating_duration_since(sent));
                    }
                }
            }
        }
    }

    fn update_rtt(&mut self, sample: Duration) {
        let srtt = match self.srtt {
            None => sample,
            Some(old) => old.mul_f64(RTT_ALPHA) + sample.mul_f64(1.0 - RTT_ALPHA),
        };
        self.srtt = Some(srtt);
        self.rto = (srtt * 2).clamp(MIN_RTO, MAX_RTO);
    }

    fn process_data(&mut self, seg: &Segment<'_>, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        if !matches!(
            self.local_state,
            LocalState::Established | LocalState::FinWait1 | LocalState::FinWait2
        ) {
            log::trace!(
                "L{}-R{}: data after FIN in state {}; dropped",
                self.local_id,
                self.remote_id,
                self.local_state
            );
            return;
        }

        let had_holes = !self.out_of_order.is_empty();
        let mut data = seg.payload;
        let mut seg_seq = seg.seq;
        if seq::lt(seg_seq, self.next_expected_in_seq) {
            let skip = seq::delta(self.next_expected_in_seq, seg_seq) as usize;
            if skip >= data.len() {
                return;
            }
            data = &data[skip..];
            seg_seq = self.next_expected_in_seq;
        }

        if seg_seq != self.next_expected_in_seq {
            let offset = self.in_offset + seq::delta(seg_seq, self.next_expected_in_seq) as u64;
            self.out_of_order.entry(offset).or_insert_with(|| data.to_vec());
            log::trace!(
                "L{}-R{}: buffered out-of-order segment seq {} ({} bytes)",
                self.local_id,
                self.remote_id,
                seg_seq,
                data.len()
            );
            self.send_ack(s, out);
            return;
        }

        self.accept_in_order(data);
        while let Some((&offset, _)) = self.out_of_order.iter().next() {
            if offset > self.in_offset {
                break;
            }
            if let Some((offset, chunk)) = self.out_of_order.pop_first() {
                let skip = (self.in_offset - offset) as usize;
                if skip < chunk.len() {
                    self.accept_in_order(&chunk[skip..]);
                }
            }
        }

        self.to_remote_flags |= seg.flags & (PSH | URG);
        let unacked = seq::delta(self.next_expected_in_seq, self.last_acked_seq);
        if seg.has(PSH) || had_holes || unacked > s.max_unacked || seq::gt(seg.seq, self.last_acked_seq) {
            self.send_ack(s, out);
        } else {
            self.ack_pending_since.get_or_insert(now);
        }
        self.flush_to_remote(s, out);
    }

    fn accept_in_order(&mut self, data: &[u8]) {
        self.to_remote.extend_from_slice(data);
        self.next_expected_in_seq = self.next_expected_in_seq.wrapping_add(data.len() as u32);
        self.in_offset += data.len() as u64;
    }

    /// Returns false when the connection was destroyed
    fn process_fin(&mut self, seg: &Segment<'_>, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) -> bool {
        if seg.seq.wrapping_add(seg.payload.len() as u32) != self.next_expected_in_seq {
            return true;
        }
        let next = match self.local_state {
            LocalState::Established => LocalState::CloseWait,
            LocalState::FinWait1 => LocalState::Closing,
            LocalState::FinWait2 => LocalState::TimeWait,
            _ => return true,
        };

        self.next_expected_in_seq = self.next_expected_in_seq.wrapping_add(1);
        self.close_pending = true;
        self.flush_to_remote(s, out);
        self.send_ack(s, out);
        log::debug!(
            "L{}-R{}: FIN from host, {} -> {}",
            self.local_id,
            self.remote_id,
            self.local_state,
            next
        );

        if next == LocalState::TimeWait {
            return self.enter_time_wait(s, now, out);
        }
        self.local_state = next;
        if next == LocalState::CloseWait {
            self.last_dup_ack = Some(now);
        }
        true
    }

    fn enter_time_wait(&mut self, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) -> bool {
        self.local_state = LocalState::TimeWait;
        if s.ignore_time_wait {
            log::debug!("L{}-R{}: TIME_WAIT skipped", self.local_id, self.remote_id);
            out.push(TcpAction::Destroy);
            return false;
        }
        self.time_wait_since = Some(now);
        true
    }

    // ========================================================================
    // Peer Messages
    // ========================================================================

    /// Peer TCPData
    pub fn on_remote_data(
        &mut self,
        payload: Vec<u8>,
        flags: u8,
        s: &TcpSettings,
        now: Instant,
        out: &mut Vec<TcpAction>,
    ) {
        self.last_remote_activity = now;
        let open = matches!(
            self.local_state,
            LocalState::SynSent | LocalState::SynRcvd | LocalState::Established | LocalState::CloseWait
        );
        if !open || self.fin_to_host_pending {
            log::warn!(
                "L{}-R{}: {} bytes from remote in state {}; dropped",
                self.local_id,
                self.remote_id,
                payload.len(),
                self.local_state
            );
            return;
        }
        if payload.is_empty() {
            return;
        }
        let len = payload.len() as u32;
        self.to_host.push_back(OutSegment {
            seq: self.out_seq,
            flags: ACK | (flags & (PSH | URG)),
            payload,
            sent_at: None,
            transmissions: 0,
        });
        self.out_seq = self.out_seq.wrapping_add(len);
        self.transmit(s, now, out);
    }

    /// Peer TCPCloseConnection
    pub fn on_remote_close(&mut self, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        self.last_remote_activity = now;
        self.remote_state = if self.remote_state == RemoteState::DisconnRequestSent {
            RemoteState::Disconnected
        } else {
            RemoteState::DisconnRequestReceived
        };
        self.fin_to_host_pending = true;
        log::debug!(
            "L{}-R{}: close request from remote in state {}",
            self.local_id,
            self.remote_id,
            self.local_state
        );
        self.transmit(s, now, out);
    }

    /// Peer TCPResetConnection
    pub fn on_remote_reset(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        log::debug!("L{}-R{}: reset by remote", self.local_id, self.remote_id);
        self.remote_state = RemoteState::Disconnected;
        self.reset_local(s, out);
    }

    /// The transport carrying this flow failed
    pub fn on_transport_failure(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        log::warn!(
            "L{}-R{}: transport failure; resetting local connection",
            self.local_id,
            self.remote_id
        );
        self.remote_state = RemoteState::Disconnected;
        self.reset_local(s, out);
    }

    fn reset_local(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        match self.local_state {
            LocalState::Closed | LocalState::Listen | LocalState::TimeWait => {}
            LocalState::SynSent => {
                let seq = self.out_seq;
                self.send_to_host(RST, seq, Vec::new(), s, out);
            }
            _ => {
                let seq = self.snd_nxt();
                self.send_to_host(RST | ACK, seq, Vec::new(), s, out);
            }
        }
        self.local_state = LocalState::Closed;
        out.push(TcpAction::Destroy);
    }

    fn reset_remote_if_needed(&mut self, out: &mut Vec<TcpAction>) {
        if matches!(
            self.remote_state,
            RemoteState::ConnRequestSent
                | RemoteState::ConnRequestReceived
                | RemoteState::ConnEstablished
                | RemoteState::DisconnRequestSent
                | RemoteState::DisconnRequestReceived
        ) {
            out.push(TcpAction::ToRemote(RemoteRequest::Reset));
        }
        self.remote_state = RemoteState::Disconnected;
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Forward buffered host data, then a pending close, to the remote proxy
    fn flush_to_remote(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        if !self.remote_state.accepts_data() {
            return;
        }
        while !self.to_remote.is_empty() {
            let n = self.to_remote.len().min(s.max_payload);
            let payload: Vec<u8> = self.to_remote.drain(..n).collect();
            let flags = if self.to_remote.is_empty() {
                std::mem::take(&mut self.to_remote_flags)
            } else {
                0
            };
            out.push(TcpAction::ToRemote(RemoteRequest::Data { payload, flags }));
        }
        if self.close_pending {
            self.close_pending = false;
            out.push(TcpAction::ToRemote(RemoteRequest::Close));
            self.remote_state = if self.remote_state == RemoteState::DisconnRequestReceived {
                RemoteState::Disconnected
            } else {
                RemoteState::DisconnRequestSent
            };
        }
    }

    /// Sequence number of the next segment to put on the wire
    fn snd_nxt(&self) -> u32 {
        self.to_host
            .iter()
            .find(|seg| seg.sent_at.is_none())
            .map_or(self.out_seq, |seg| seg.seq)
    }

    fn advertised_window(&self, s: &TcpSettings) -> u16 {
        let buffered = self.to_remote.len().min(u16::MAX as usize) as u16;
        s.window.saturating_sub(buffered)
    }

    fn send_to_host(&mut self, flags: u8, seq: u32, payload: Vec<u8>, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        let ack = if flags & ACK != 0 {
            self.last_acked_seq = self.next_expected_in_seq;
            self.ack_pending_since = None;
            self.next_expected_in_seq
        } else {
            0
        };
        out.push(TcpAction::ToHost(HostSegment {
            flags,
            seq,
            ack,
            window: self.advertised_window(s),
            payload,
        }));
    }

    fn send_ack(&mut self, s: &TcpSettings, out: &mut Vec<TcpAction>) {
        let seq = self.snd_nxt();
        self.send_to_host(ACK, seq, Vec::new(), s, out);
    }

    /// Send queued segments that fit in the host's window; queue a FIN when due
    fn transmit(&mut self, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        if !matches!(
            self.local_state,
            LocalState::Established
                | LocalState::CloseWait
                | LocalState::FinWait1
                | LocalState::FinWait2
                | LocalState::Closing
                | LocalState::LastAck
        ) {
            return;
        }

        if self.fin_to_host_pending && self.fin_seq.is_none() {
            let next = match self.local_state {
                LocalState::Established => Some(LocalState::FinWait1),
                LocalState::CloseWait => Some(LocalState::LastAck),
                _ => None,
            };
            if let Some(next) = next {
                self.to_host.push_back(OutSegment {
                    seq: self.out_seq,
                    flags: FIN | ACK,
                    payload: Vec::new(),
                    sent_at: None,
                    transmissions: 0,
                });
                self.fin_seq = Some(self.out_seq);
                self.out_seq = self.out_seq.wrapping_add(1);
                log::debug!(
                    "L{}-R{}: FIN queued, {} -> {}",
                    self.local_id,
                    self.remote_id,
                    self.local_state,
                    next
                );
                self.local_state = next;
            }
        }

        let ack = self.next_expected_in_seq;
        let window = self.advertised_window(s);
        let window_end = self.last_ack_seq.wrapping_add(self.receiver_window as u32);
        let mut sent_any = false;
        for seg in self.to_host.iter_mut().filter(|seg| seg.sent_at.is_none()) {
            if !seg.payload.is_empty() && seq::gt(seg.end(), window_end) {
                break;
            }
            out.push(TcpAction::ToHost(HostSegment {
                flags: seg.flags,
                seq: seg.seq,
                ack,
                window,
                payload: seg.payload.clone(),
            }));
            seg.sent_at = Some(now);
            seg.transmissions = 1;
            sent_any = true;
        }
        if sent_any {
            self.last_acked_seq = ack;
            self.ack_pending_since = None;
        }
    }

    // ========================================================================
    // Timers
    // ========================================================================

    /// Periodic processing: retransmissions, handshake and teardown timers
    pub fn on_timer(&mut self, s: &TcpSettings, now: Instant, out: &mut Vec<TcpAction>) {
        let since = |t: Instant| now.saturating_duration_since(t);

        match self.local_state {
            LocalState::SynRcvd => {
                if matches!(
                    self.remote_state,
                    RemoteState::ConnRequestSent | RemoteState::WaitingConnEstablishment
                ) {
                    if since(self.opened_at) >= s.establishment_timeout {
                        log::warn!(
                            "L{}-R{}: remote connection not established within {:?}; resetting",
                            self.local_id,
                            self.remote_id,
                            s.establishment_timeout
                        );
                        self.reset_remote_if_needed(out);
                        let seq = self.snd_nxt();
                        self.send_to_host(RST | ACK, seq, Vec::new(), s, out);
                        out.push(TcpAction::Destroy);
                        return;
                    }
                    if let Some(last) = self.syn_last_sent {
                        if self.remote_state == RemoteState::ConnRequestSent
                            && since(last) >= syn_timeout(self.syn_attempts)
                        {
                            self.syn_attempts += 1;
                            self.syn_last_sent = Some(now);
                            log::trace!(
                                "L{}-R{}: open request retransmission #{}",
                                self.local_id,
                                self.remote_id,
                                self.syn_attempts
                            );
                            out.push(TcpAction::ToRemote(RemoteRequest::Open));
                        }
                    }
                }
            }
            LocalState::SynSent => {
                if since(self.opened_at) >= s.syn_sent_failure {
                    log::warn!(
                        "L{}-R{}: no SYN+ACK from host within {:?}; resetting",
                        self.local_id,
                        self.remote_id,
                        s.syn_sent_failure
                    );
                    self.reset_remote_if_needed(out);
                    let seq = self.out_seq;
                    self.send_to_host(RST, seq, Vec::new(), s, out);
                    out.push(TcpAction::Destroy);
                    return;
                }
                if let Some(last) = self.syn_last_sent {
                    if since(last) >= syn_timeout(self.syn_attempts) {
                        self.syn_attempts += 1;
                        self.send_syn(s, now, out);
                    }
                }
            }
            LocalState::TimeWait => {
                if self.time_wait_since.map_or(true, |t| since(t) >= s.msl * 2) {
                    log::debug!("L{}-R{}: TIME_WAIT expired", self.local_id, self.remote_id);
                    out.push(TcpAction::Destroy);
                }
                return;
            }
            _ => {}
        }

        // Retransmission of the oldest unacknowledged segment
        let rto = self.rto;
        let ack = self.next_expected_in_seq;
        let window = self.advertised_window(s);
        let mut retransmitted = false;
        if let Some(seg) = self.to_host.front_mut() {
            if let Some(sent) = seg.sent_at {
                if since(sent) >= rto {
                    out.push(TcpAction::ToHost(HostSegment {
                        flags: seg.flags,
                        seq: seg.seq,
                        ack,
                        window,
                        payload: seg.payload.clone(),
                    }));
                    seg.sent_at = Some(now);
                    seg.transmissions += 1;
                    retransmitted = true;
                }
            }
        }
        if retransmitted {
            self.rto = (rto * 2).min(MAX_RTO);
            self.last_acked_seq = ack;
            self.ack_pending_since = None;
            log::trace!("L{}-R{}: retransmission, RTO now {:?}", self.local_id, self.remote_id, self.rto);
        }

        if let Some(t) = self.ack_pending_since {
            if since(t) >= DELAYED_ACK_TIMEOUT && self.next_expected_in_seq != self.last_acked_seq {
                self.send_ack(s, out);
            }
        }

        // The host sits in FIN_WAIT until the remote side closes too
        if self.local_state == LocalState::CloseWait
            && self.remote_state == RemoteState::DisconnRequestSent
            && !s.ignore_teardown_timing
            && self.last_dup_ack.map_or(true, |t| since(t) >= s.dup_ack_interval)
        {
            self.send_ack(s, out);
            self.last_dup_ack = Some(now);
        }

        if since(self.last_activity()) >= s.idle_reset {
            log::info!(
                "L{}-R{}: idle for {:?}; resetting",
                self.local_id,
                self.remote_id,
                s.idle_reset
            );
            self.reset_remote_if_needed(out);
            self.reset_local(s, out);
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
