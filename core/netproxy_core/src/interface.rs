//! Raw frame I/O seam
//!
//! The engine reads and writes whole Ethernet frames through
//! [`NetworkInterface`]. Device-backed implementations live in the daemon;
//! the in-memory pair here feeds tests.

use std::io;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Mutex;
use std::time::Duration;

use crate::arc::MacAddr;
use crate::lock;

pub trait NetworkInterface: Send + Sync {
    /// Read one frame into `buf`; `Ok(None)` when `timeout` elapsed
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>>;

    fn write_frame(&self, frame: &[u8]) -> io::Result<()>;

    fn mtu(&self) -> usize;

    fn mac_address(&self) -> MacAddr;
}

/// Interface side of an in-memory link
#[derive(Debug)]
pub struct MemoryInterface {
    mac: MacAddr,
    mtu: usize,
    inbound: Mutex<Receiver<Vec<u8>>>,
    outbound: Sender<Vec<u8>>,
}

/// Host side of an in-memory link: injects frames and observes writes
#[derive(Debug)]
pub struct MemoryHost {
    pub inject: Sender<Vec<u8>>,
    pub written: Receiver<Vec<u8>>,
}

impl MemoryInterface {
    pub fn pair(mac: MacAddr, mtu: usize) -> (MemoryInterface, MemoryHost) {
        let (inject, inbound) = mpsc::channel();
        let (outbound, written) = mpsc::channel();
        (
            MemoryInterface {
                mac,
                mtu,
                inbound: Mutex::new(inbound),
                outbound,
            },
            MemoryHost { inject, written },
        )
    }
}

impl NetworkInterface for MemoryInterface {
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        let frame = match lock(&self.inbound).recv_timeout(timeout) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => return Ok(None),
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "memory link closed"))
            }
        };
        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(Some(n))
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        if frame.len() > self.mtu + crate::packet::ETHERNET_HEADER_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds MTU {}", frame.len(), self.mtu),
            ));
        }
        self.outbound
            .send(frame.to_vec())
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "memory link closed"))
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }
}
