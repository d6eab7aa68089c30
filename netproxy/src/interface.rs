//! Local network interfaces
//!
//! [`Device`] is the daemon's [`NetworkInterface`]: a Linux TAP device, a
//! raw `AF_PACKET` socket bound to an existing interface, or the in-memory
//! pair from the core (tests).
//!
//! Interfaces are named on the command line as `tap:<name>` or
//! `raw:<name>`; a bare name means a raw socket.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use netproxy_core::interface::MemoryInterface;
use netproxy_core::{MacAddr, NetworkInterface};

const TUN_DEVICE: &str = "/dev/net/tun";
const TUNSETIFF: u64 = 0x4004_54ca;
const IFF_TAP: i16 = 0x0002;
const IFF_NO_PI: i16 = 0x1000;
const PACKET_OUTGOING: u8 = 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceSpec {
    Tap(String),
    Raw(String),
}

impl DeviceSpec {
    pub fn parse(s: &str) -> Result<Self, String> {
        let (kind, name) = match s.split_once(':') {
            Some((kind, name)) => (kind, name),
            None => ("raw", s),
        };
        if name.is_empty() || name.len() >= libc::IFNAMSIZ {
            return Err(format!("invalid interface name '{}'", name));
        }
        match kind {
            "tap" => Ok(DeviceSpec::Tap(name.to_string())),
            "raw" => Ok(DeviceSpec::Raw(name.to_string())),
            other => Err(format!("unknown interface type '{}' (expected tap or raw)", other)),
        }
    }
}

impl fmt::Display for DeviceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceSpec::Tap(name) => write!(f, "tap:{}", name),
            DeviceSpec::Raw(name) => write!(f, "raw:{}", name),
        }
    }
}

pub enum Device {
    Tap(TapDevice),
    Raw(RawSocket),
    Memory(MemoryInterface),
}

impl Device {
    pub fn open(spec: &DeviceSpec) -> io::Result<Device> {
        let device = match spec {
            DeviceSpec::Tap(name) => Device::Tap(TapDevice::open(name)?),
            DeviceSpec::Raw(name) => Device::Raw(RawSocket::open(name)?),
        };
        log::info!(
            "Opened {} (MAC {}, MTU {})",
            spec,
            device.mac_address(),
            device.mtu()
        );
        Ok(device)
    }

    fn inner(&self) -> &dyn NetworkInterface {
        match self {
            Device::Tap(d) => d,
            Device::Raw(d) => d,
            Device::Memory(d) => d,
        }
    }
}

impl NetworkInterface for Device {
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        self.inner().read_frame(buf, timeout)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        self.inner().write_frame(frame)
    }

    fn mtu(&self) -> usize {
        self.inner().mtu()
    }

    fn mac_address(&self) -> MacAddr {
        self.inner().mac_address()
    }
}

// ============================================================================
// ioctl helpers
// ============================================================================

/// `struct ifreq`: the name followed by a 24-byte union
#[repr(C)]
struct IfReq {
    name: [u8; libc::IFNAMSIZ],
    data: [u8; 24],
}

impl IfReq {
    fn new(name: &str) -> Self {
        let mut req = IfReq {
            name: [0; libc::IFNAMSIZ],
            data: [0; 24],
        };
        let n = name.len().min(libc::IFNAMSIZ - 1);
        req.name[..n].copy_from_slice(&name.as_bytes()[..n]);
        req
    }
}

fn ioctl(fd: RawFd, request: u64, req: &mut IfReq) -> io::Result<()> {
    // SAFETY: `req` is a valid, writable ifreq for the duration of the call.
    let rc = unsafe { libc::ioctl(fd, request as _, req as *mut IfReq) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// MAC address and MTU of interface `name`
fn interface_params(name: &str) -> io::Result<(MacAddr, usize)> {
    // SAFETY: plain socket(2); the fd is owned right after.
    let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: fd is a freshly created descriptor nobody else owns.
    let sock = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut req = IfReq::new(name);
    ioctl(sock.as_raw_fd(), libc::SIOCGIFHWADDR as u64, &mut req)?;
    // sockaddr: 2-byte family, then the hardware address
    let mut mac = [0u8; 6];
    mac.copy_from_slice(&req.data[2..8]);

    let mut req = IfReq::new(name);
    ioctl(sock.as_raw_fd(), libc::SIOCGIFMTU as u64, &mut req)?;
    let mtu = i32::from_ne_bytes([req.data[0], req.data[1], req.data[2], req.data[3]]);
    Ok((MacAddr(mac), mtu.max(0) as usize))
}

/// Wait until `fd` is readable; false on timeout
fn wait_readable(fd: RawFd, timeout: Duration) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
    // SAFETY: one valid pollfd.
    let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
    match rc {
        0 => Ok(false),
        n if n > 0 => Ok(true),
        _ => {
            let e = io::Error::last_os_error();
            if e.kind() == io::ErrorKind::Interrupted {
                Ok(false)
            } else {
                Err(e)
            }
        }
    }
}

// ============================================================================
// TAP
// ============================================================================

pub struct TapDevice {
    name: String,
    file: File,
    mac: MacAddr,
    mtu: usize,
}

impl TapDevice {
    pub fn open(name: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(TUN_DEVICE)?;
        let mut req = IfReq::new(name);
        req.data[..2].copy_from_slice(&(IFF_TAP | IFF_NO_PI).to_ne_bytes());
        ioctl(file.as_raw_fd(), TUNSETIFF, &mut req)?;
        let (mac, mtu) = interface_params(name)?;
        Ok(TapDevice {
            name: name.to_string(),
            file,
            mac,
            mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NetworkInterface for TapDevice {
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !wait_readable(self.file.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        // One read returns one whole frame
        (&self.file).read(buf).map(Some)
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        (&self.file).write_all(frame)
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }
}

// ============================================================================
// Raw AF_PACKET socket
// ============================================================================

pub struct RawSocket {
    name: String,
    fd: OwnedFd,
    mac: MacAddr,
    mtu: usize,
}

impl RawSocket {
    pub fn open(name: &str) -> io::Result<Self> {
        let cname = CString::new(name).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        // SAFETY: cname is NUL-terminated.
        let index = unsafe { libc::if_nametoindex(cname.as_ptr()) };
        if index == 0 {
            return Err(io::Error::last_os_error());
        }

        let protocol = (libc::ETH_P_ALL as u16).to_be();
        // SAFETY: plain socket(2); the fd is owned right after.
        let fd = unsafe { libc::socket(libc::AF_PACKET, libc::SOCK_RAW, protocol as libc::c_int) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: fd is a freshly created descriptor nobody else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        // SAFETY: sockaddr_ll is plain data; all-zero is a valid value.
        let mut addr: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = protocol;
        addr.sll_ifindex = index as i32;
        // SAFETY: addr is a valid sockaddr_ll of the given length.
        let rc = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const libc::sockaddr_ll as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }

        let (mac, mtu) = interface_params(name)?;
        Ok(RawSocket {
            name: name.to_string(),
            fd,
            mac,
            mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl NetworkInterface for RawSocket {
    /// Frames the host itself sent are skipped
    fn read_frame(&self, buf: &mut [u8], timeout: Duration) -> io::Result<Option<usize>> {
        if !wait_readable(self.fd.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        // SAFETY: sockaddr_ll is plain data; all-zero is a valid value.
        let mut from: libc::sockaddr_ll = unsafe { std::mem::zeroed() };
        let mut from_len = std::mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t;
        // SAFETY: buf and from are valid for writes of the given lengths.
        let n = unsafe {
            libc::recvfrom(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_DONTWAIT,
                &mut from as *mut libc::sockaddr_ll as *mut libc::sockaddr,
                &mut from_len,
            )
        };
        if n < 0 {
            let e = io::Error::last_os_error();
            return match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => Ok(None),
                _ => Err(e),
            };
        }
        if from.sll_pkttype == PACKET_OUTGOING {
            return Ok(None);
        }
        Ok(Some(n as usize))
    }

    fn write_frame(&self, frame: &[u8]) -> io::Result<()> {
        // SAFETY: frame is valid for reads of its length.
        let n = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                frame.as_ptr() as *const libc::c_void,
                frame.len(),
                0,
            )
        };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        if n as usize != frame.len() {
            return Err(io::Error::new(io::ErrorKind::WriteZero, "short frame write"));
        }
        Ok(())
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn mac_address(&self) -> MacAddr {
        self.mac
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_spec_parse() {
        assert_eq!(DeviceSpec::parse("tap:tap0").unwrap(), DeviceSpec::Tap("tap0".into()));
        assert_eq!(DeviceSpec::parse("raw:eth1").unwrap(), DeviceSpec::Raw("eth1".into()));
        assert_eq!(DeviceSpec::parse("eth0").unwrap(), DeviceSpec::Raw("eth0".into()));
        assert!(DeviceSpec::parse("tun:x").is_err());
        assert!(DeviceSpec::parse("tap:").is_err());
        assert!(DeviceSpec::parse("raw:averyveryverylongname").is_err());
        assert_eq!(DeviceSpec::Tap("tap0".into()).to_string(), "tap:tap0");
    }

    #[test]
    fn test_memory_device_delegates() {
        let mac = MacAddr([2, 0, 0, 0, 0, 7]);
        let (iface, host) = MemoryInterface::pair(mac, 1500);
        let device = Device::Memory(iface);
        assert_eq!(device.mac_address(), mac);
        assert_eq!(device.mtu(), 1500);

        host.inject.send(vec![9; 60]).unwrap();
        let mut buf = [0u8; 2048];
        assert_eq!(device.read_frame(&mut buf, Duration::from_millis(100)).unwrap(), Some(60));
        device.write_frame(&[1, 2, 3]).unwrap();
        assert_eq!(host.written.recv().unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn test_missing_interface_fails() {
        assert!(interface_params("nosuchif0").is_err());
    }
}
