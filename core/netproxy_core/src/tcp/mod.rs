//! Virtual TCP endpoint emulation
//!
//! Each proxied TCP flow is terminated locally: NetProxy plays the remote
//! host toward the local host, while the payload travels through the tunnel
//! as PWP messages.
//!
//! ```text
//!   local host ◄──TCP segments──► VirtualConnection ◄──PWP──► remote NetProxy
//!                (LocalState)                     (RemoteState)
//! ```
//!
//! A [`VirtualConnection`] consumes events (host segments, peer requests,
//! timer ticks) and appends [`TcpAction`]s for the engine to carry out. It
//! never performs I/O itself.

mod connection;
pub mod seq;

pub use connection::{reset_reply, VirtualConnection};

use std::fmt;
use std::net::Ipv4Addr;
use std::time::Duration;

use crate::config::NetProxySettings;
use crate::packet::tcp_flags;

// ============================================================================
// States
// ============================================================================

/// RFC 793 state of the emulated endpoint facing the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LocalState {
    Closed,
    Listen,
    SynSent,
    SynRcvd,
    Established,
    FinWait1,
    FinWait2,
    CloseWait,
    Closing,
    LastAck,
    TimeWait,
}

impl fmt::Display for LocalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LocalState::Closed => "CLOSED",
            LocalState::Listen => "LISTEN",
            LocalState::SynSent => "SYN_SENT",
            LocalState::SynRcvd => "SYN_RCVD",
            LocalState::Established => "ESTABLISHED",
            LocalState::FinWait1 => "FIN_WAIT_1",
            LocalState::FinWait2 => "FIN_WAIT_2",
            LocalState::CloseWait => "CLOSE_WAIT",
            LocalState::Closing => "CLOSING",
            LocalState::LastAck => "LAST_ACK",
            LocalState::TimeWait => "TIME_WAIT",
        };
        f.write_str(s)
    }
}

/// State of the tunnel leg toward the remote NetProxy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteState {
    Unknown,
    ConnRequestSent,
    ConnRequestReceived,
    /// The link to the remote proxy is still being set up
    WaitingConnEstablishment,
    ConnEstablished,
    DisconnRequestSent,
    DisconnRequestReceived,
    Disconnected,
}

impl RemoteState {
    /// Whether payload may be forwarded to the remote proxy
    pub fn accepts_data(&self) -> bool {
        matches!(self, RemoteState::ConnEstablished | RemoteState::DisconnRequestReceived)
    }
}

// ============================================================================
// Settings
// ============================================================================

/// Retransmission schedule for SYN segments and open requests
pub const SYN_RETRANSMISSION_TIMEOUTS_MS: [u64; 9] = [100, 250, 500, 1000, 2000, 4000, 8000, 16000, 32000];

pub const MIN_RTO: Duration = Duration::from_millis(100);
pub const MAX_RTO: Duration = Duration::from_millis(60_000);
/// Weight of the previous estimate in the smoothed RTT
pub const RTT_ALPHA: f64 = 0.85;
pub const DELAYED_ACK_TIMEOUT: Duration = Duration::from_millis(200);

/// TTL of TCP packets synthesized toward local hosts
pub const SYNTHESIZED_TCP_TTL: u8 = 8;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSettings {
    pub max_payload: usize,
    pub max_unacked: u32,
    pub window: u16,
    pub synchronize_handshake: bool,
    pub ignore_time_wait: bool,
    pub ignore_teardown_timing: bool,
    pub syn_sent_failure: Duration,
    pub dup_ack_interval: Duration,
    pub establishment_timeout: Duration,
    pub idle_reset: Duration,
    pub msl: Duration,
}

impl Default for TcpSettings {
    fn default() -> Self {
        TcpSettings::from(&NetProxySettings::default())
    }
}

impl From<&NetProxySettings> for TcpSettings {
    fn from(s: &NetProxySettings) -> Self {
        TcpSettings {
            max_payload: s.max_tcp_payload,
            max_unacked: s.max_unacked_bytes,
            window: s.tcp_window,
            synchronize_handshake: s.synchronize_handshake,
            ignore_time_wait: s.ignore_time_wait,
            ignore_teardown_timing: s.ignore_teardown_timing,
            syn_sent_failure: s.syn_sent_failure,
            dup_ack_interval: s.dup_ack_interval,
            establishment_timeout: s.establishment_timeout,
            idle_reset: s.idle_reset,
            msl: s.msl,
        }
    }
}

pub fn syn_timeout(attempt: usize) -> Duration {
    let i = attempt.min(SYN_RETRANSMISSION_TIMEOUTS_MS.len() - 1);
    Duration::from_millis(SYN_RETRANSMISSION_TIMEOUTS_MS[i])
}

// ============================================================================
// Events and Actions
// ============================================================================

/// Endpoints of a proxied flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    /// Host on the local network segment
    pub local_ip: Ipv4Addr,
    pub local_port: u16,
    /// Host reached through the remote proxy
    pub remote_ip: Ipv4Addr,
    pub remote_port: u16,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} <-> {}:{}",
            self.local_ip, self.local_port, self.remote_ip, self.remote_port
        )
    }
}

/// A TCP segment received from the local host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment<'a> {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub payload: &'a [u8],
}

impl Segment<'_> {
    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    /// Sequence space consumed, counting SYN and FIN
    pub fn seq_len(&self) -> u32 {
        self.payload.len() as u32 + self.has(tcp_flags::SYN) as u32 + self.has(tcp_flags::FIN) as u32
    }
}

/// A segment to synthesize toward the local host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostSegment {
    pub flags: u8,
    pub seq: u32,
    pub ack: u32,
    pub window: u16,
    pub payload: Vec<u8>,
}

/// A request for the remote NetProxy
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteRequest {
    /// TCPOpenConnection
    Open,
    /// TCPConnectionOpened
    Opened,
    /// TCPData
    Data { payload: Vec<u8>, flags: u8 },
    /// TCPCloseConnection
    Close,
    /// TCPResetConnection
    Reset,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TcpAction {
    ToHost(HostSegment),
    ToRemote(RemoteRequest),
    /// Remove the connection from the table
    Destroy,
}
