//! The seam to the virtual Ethernet interface.
//!
//! The tap driver itself is an external collaborator; the overlay consumes
//! it through [`FrameDevice`]: read a frame, write a frame, and report the
//! MTU and hardware address. A Linux implementation over `/dev/net/tun`
//! lives in [`linux`]; [`MemoryDevice`] provides an in-memory pair for
//! tests.

use std::future::Future;
use std::pin::Pin;

use protocol::MacAddr;
use tokio::sync::{mpsc, Mutex};

use crate::error::{AgentError, Result};

/// Length of an Ethernet header: two addresses plus the EtherType.
pub const ETHERNET_HEADER_LENGTH: usize = 14;

/// A virtual Ethernet interface carrying whole frames.
pub trait FrameDevice: Send + Sync {
    /// Reads one frame into `buf`, returning its length.
    fn read_frame<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>>;

    /// Writes one frame.
    fn write_frame<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>>;

    /// The interface MTU; read buffers are sized MTU plus the Ethernet
    /// header.
    fn mtu(&self) -> usize;

    /// The interface hardware address.
    fn hardware_address(&self) -> MacAddr;
}

/// Extracts the destination address from an Ethernet frame header.
pub fn destination(frame: &[u8]) -> Result<MacAddr> {
    if frame.len() < ETHERNET_HEADER_LENGTH {
        return Err(AgentError::Device(format!(
            "frame of {} bytes is shorter than an Ethernet header",
            frame.len()
        )));
    }

    let mut dst = [0u8; 6];
    dst.copy_from_slice(&frame[..6]);
    Ok(MacAddr::from_bytes(dst))
}

/// An in-memory frame device. [`MemoryDevice::pair`] yields two devices
/// wired back to back: frames written to one are read from the other.
pub struct MemoryDevice {
    mtu: usize,
    mac: MacAddr,
    incoming: Mutex<mpsc::Receiver<Vec<u8>>>,
    outgoing: mpsc::Sender<Vec<u8>>,
}

impl MemoryDevice {
    /// Creates two devices forming a point-to-point link.
    pub fn pair(mtu: usize, mac_a: MacAddr, mac_b: MacAddr) -> (Self, Self) {
        let (a_tx, b_rx) = mpsc::channel(64);
        let (b_tx, a_rx) = mpsc::channel(64);

        (
            Self {
                mtu,
                mac: mac_a,
                incoming: Mutex::new(a_rx),
                outgoing: a_tx,
            },
            Self {
                mtu,
                mac: mac_b,
                incoming: Mutex::new(b_rx),
                outgoing: b_tx,
            },
        )
    }
}

impl FrameDevice for MemoryDevice {
    fn read_frame<'a>(
        &'a self,
        buf: &'a mut [u8],
    ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
        Box::pin(async move {
            let mut incoming = self.incoming.lock().await;
            let frame = incoming
                .recv()
                .await
                .ok_or_else(|| AgentError::Device("memory device closed".to_string()))?;

            let len = frame.len().min(buf.len());
            buf[..len].copy_from_slice(&frame[..len]);
            Ok(len)
        })
    }

    fn write_frame<'a>(
        &'a self,
        frame: &'a [u8],
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(async move {
            self.outgoing
                .send(frame.to_vec())
                .await
                .map_err(|_| AgentError::Device("memory device closed".to_string()))
        })
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn hardware_address(&self) -> MacAddr {
        self.mac
    }
}

/// Linux tap adapter over `/dev/net/tun`.
#[cfg(target_os = "linux")]
pub mod linux {
    use std::io;
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    use tokio::io::unix::AsyncFd;

    use super::*;

    // _IOW('T', 202, int); not exported by libc.
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

    /// A TAP interface: created via `TUNSETIFF`, configured over a control
    /// socket, and driven non-blocking through the tokio reactor.
    pub struct TapDevice {
        fd: AsyncFd<OwnedFd>,
        name: String,
        mtu: usize,
        mac: MacAddr,
    }

    impl TapDevice {
        /// Opens and configures the interface: MTU, hardware address, up.
        pub fn open(name: &str, mtu: usize, mac: MacAddr) -> Result<Self> {
            if name.len() >= libc::IFNAMSIZ {
                return Err(AgentError::Device(format!(
                    "interface name \"{name}\" is too long"
                )));
            }

            let fd = unsafe {
                let raw = libc::open(
                    b"/dev/net/tun\0".as_ptr() as *const libc::c_char,
                    libc::O_RDWR | libc::O_NONBLOCK,
                );
                if raw < 0 {
                    return Err(last_os_error("open /dev/net/tun"));
                }
                OwnedFd::from_raw_fd(raw)
            };

            let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
            for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
                *dst = *src as libc::c_char;
            }
            unsafe {
                ifr.ifr_ifru.ifru_flags = (libc::IFF_TAP | libc::IFF_NO_PI) as libc::c_short;
            }

            if unsafe { libc::ioctl(fd.as_raw_fd(), TUNSETIFF, &ifr) } < 0 {
                return Err(last_os_error("TUNSETIFF"));
            }

            configure(name, mtu, mac)?;

            let fd = AsyncFd::new(fd)
                .map_err(|err| AgentError::Device(format!("could not register tap fd: {err}")))?;

            Ok(Self {
                fd,
                name: name.to_string(),
                mtu,
                mac,
            })
        }

        /// The interface name.
        pub fn name(&self) -> &str {
            &self.name
        }

        async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
            loop {
                let mut guard = self.fd.readable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::read(
                            inner.as_raw_fd(),
                            buf.as_mut_ptr() as *mut libc::c_void,
                            buf.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(n as usize)
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }

        async fn send(&self, frame: &[u8]) -> io::Result<()> {
            loop {
                let mut guard = self.fd.writable().await?;
                match guard.try_io(|inner| {
                    let n = unsafe {
                        libc::write(
                            inner.as_raw_fd(),
                            frame.as_ptr() as *const libc::c_void,
                            frame.len(),
                        )
                    };
                    if n < 0 {
                        Err(io::Error::last_os_error())
                    } else {
                        Ok(())
                    }
                }) {
                    Ok(result) => return result,
                    Err(_would_block) => continue,
                }
            }
        }
    }

    impl FrameDevice for TapDevice {
        fn read_frame<'a>(
            &'a self,
            buf: &'a mut [u8],
        ) -> Pin<Box<dyn Future<Output = Result<usize>> + Send + 'a>> {
            Box::pin(async move { Ok(self.recv(buf).await?) })
        }

        fn write_frame<'a>(
            &'a self,
            frame: &'a [u8],
        ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + 'a>> {
            Box::pin(async move { Ok(self.send(frame).await?) })
        }

        fn mtu(&self) -> usize {
            self.mtu
        }

        fn hardware_address(&self) -> MacAddr {
            self.mac
        }
    }

    /// Sets the MTU and hardware address and brings the link up, over an
    /// AF_INET control socket.
    fn configure(name: &str, mtu: usize, mac: MacAddr) -> Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(last_os_error("control socket"));
        }
        let sock = unsafe { OwnedFd::from_raw_fd(sock) };

        let mut ifr: libc::ifreq = unsafe { std::mem::zeroed() };
        for (dst, src) in ifr.ifr_name.iter_mut().zip(name.as_bytes()) {
            *dst = *src as libc::c_char;
        }

        unsafe {
            ifr.ifr_ifru.ifru_mtu = mtu as libc::c_int;
        }
        if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFMTU, &ifr) } < 0 {
            return Err(last_os_error("SIOCSIFMTU"));
        }

        let mut hwaddr = libc::sockaddr {
            sa_family: libc::ARPHRD_ETHER as libc::sa_family_t,
            sa_data: [0; 14],
        };
        for (dst, src) in hwaddr.sa_data.iter_mut().zip(mac.as_bytes()) {
            *dst = *src as libc::c_char;
        }
        unsafe {
            ifr.ifr_ifru.ifru_hwaddr = hwaddr;
        }
        if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFHWADDR, &ifr) } < 0 {
            return Err(last_os_error("SIOCSIFHWADDR"));
        }

        if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCGIFFLAGS, &ifr) } < 0 {
            return Err(last_os_error("SIOCGIFFLAGS"));
        }
        unsafe {
            ifr.ifr_ifru.ifru_flags |= (libc::IFF_UP | libc::IFF_RUNNING) as libc::c_short;
        }
        if unsafe { libc::ioctl(sock.as_raw_fd(), libc::SIOCSIFFLAGS, &ifr) } < 0 {
            return Err(last_os_error("SIOCSIFFLAGS"));
        }

        Ok(())
    }

    fn last_os_error(operation: &str) -> AgentError {
        AgentError::Device(format!("{operation}: {}", io::Error::last_os_error()))
    }
}
