//! Thin `ioctl` wrapper used by the platform modules.

use std::io;
use std::os::fd::RawFd;

/// Executes an ioctl on the given file descriptor.
///
/// # Safety
///
/// The file descriptor must be valid and `payload` must match what the
/// request code expects.
pub(crate) unsafe fn exec<P>(
    fd: RawFd,
    code: libc::c_ulong,
    req: &mut Request<P>,
) -> io::Result<()> {
    let ret = unsafe { libc::ioctl(fd, code as _, req) };

    if ret < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// The data layout the kernel expects for interface requests (`struct ifreq`).
#[repr(C)]
pub(crate) struct Request<P> {
    pub(crate) name: [libc::c_uchar; libc::IF_NAMESIZE],
    pub(crate) payload: P,
}

impl<P: Default> Request<P> {
    pub(crate) fn new(name: &str) -> io::Result<Self> {
        if name.len() >= libc::IF_NAMESIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "interface name too long",
            ));
        }

        let mut request = Self {
            name: [0; libc::IF_NAMESIZE],
            payload: P::default(),
        };

        for (dst, src) in request.name.iter_mut().zip(name.bytes()) {
            *dst = src;
        }

        Ok(request)
    }

    pub(crate) fn name(&self) -> String {
        let len = self.name.iter().position(|b| *b == 0).unwrap_or(0);

        String::from_utf8_lossy(&self.name[..len]).into_owned()
    }
}
