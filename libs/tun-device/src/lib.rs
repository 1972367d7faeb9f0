//! TUN device creation and packet IO.
//!
//! The device is created with a name hint and an MTU (default 1280, which
//! leaves room for the WireGuard and data-channel overhead on any sane
//! path). Address assignment and link state are the caller's business; this
//! crate only owns the file descriptor.

#[cfg(target_os = "linux")]
#[path = "linux.rs"]
mod platform;

#[cfg(target_os = "macos")]
#[path = "macos.rs"]
mod platform;

#[cfg(target_os = "linux")]
mod ioctl;

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use tokio::io::unix::AsyncFd;

/// Default MTU of the tunnel interface.
pub const DEFAULT_MTU: u16 = 1280;

/// The largest packet we ever read from or write to the device.
pub const MAX_PACKET_SIZE: usize = 1500;

pub struct TunDevice {
    fd: AsyncFd<OwnedFd>,
    name: String,
    mtu: u16,
}

impl TunDevice {
    /// Creates a new TUN device.
    ///
    /// `name_hint` is passed to the kernel; the actual name may differ
    /// (e.g. when the hint contains a `%d` pattern) and is reported by
    /// [`TunDevice::name`]. Requires `CAP_NET_ADMIN` on Linux and root on
    /// macOS; a permission failure surfaces as [`io::ErrorKind::PermissionDenied`].
    pub fn create(name_hint: &str, mtu: u16) -> io::Result<Self> {
        let (fd, name) = platform::create(name_hint)?;

        set_non_blocking(fd.as_raw_fd())?;

        tracing::debug!(%name, %mtu, "Created TUN device");

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name,
            mtu,
        })
    }

    /// Wraps a pre-opened TUN file descriptor.
    ///
    /// Used on platforms where a privileged parent hands us the device.
    /// The caller must guarantee `fd` refers to a TUN device in non-packet-
    /// info mode.
    pub fn from_fd(fd: OwnedFd, name: String, mtu: u16) -> io::Result<Self> {
        set_non_blocking(fd.as_raw_fd())?;

        Ok(Self {
            fd: AsyncFd::new(fd)?,
            name,
            mtu,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    /// Reads one IP packet from the device.
    pub async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.readable().await?;

            match guard.try_io(|inner| platform::read(inner.as_raw_fd(), buf)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }

    /// Writes one IP packet to the device.
    pub async fn write(&self, packet: &[u8]) -> io::Result<usize> {
        loop {
            let mut guard = self.fd.writable().await?;

            match guard.try_io(|inner| platform::write(inner.as_raw_fd(), packet)) {
                Ok(result) => return result,
                Err(_would_block) => continue,
            }
        }
    }
}

fn set_non_blocking(fd: RawFd) -> io::Result<()> {
    // Safety: FFI calls on a descriptor we own.
    unsafe {
        match libc::fcntl(fd, libc::F_GETFL) {
            -1 => Err(io::Error::last_os_error()),
            flags => match libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) {
                -1 => Err(io::Error::last_os_error()),
                _ => Ok(()),
            },
        }
    }
}
