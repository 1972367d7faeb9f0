use libc::{
    c_void, connect, ctl_info, getsockopt, ioctl, iovec, msghdr, sendmsg, sockaddr_ctl, socket,
    socklen_t, AF_INET, AF_INET6, AF_SYSTEM, AF_SYS_CONTROL, CTLIOCGINFO, IF_NAMESIZE, PF_SYSTEM,
    SOCK_DGRAM, SYSPROTO_CONTROL, UTUN_OPT_IFNAME,
};
use std::io;
use std::mem::size_of;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

const CTL_NAME: &[u8] = b"com.apple.net.utun_control";

/// Creates a fresh `utun` device.
///
/// The name hint is ignored: macOS numbers utun devices itself, the kernel
/// picks the first free unit. The real name is read back via
/// `UTUN_OPT_IFNAME`.
pub(crate) fn create(_name_hint: &str) -> io::Result<(OwnedFd, String)> {
    // Safety: FFI.
    let fd = match unsafe { socket(PF_SYSTEM, SOCK_DGRAM, SYSPROTO_CONTROL) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => unsafe { OwnedFd::from_raw_fd(fd) },
    };

    let mut info = ctl_info {
        ctl_id: 0,
        ctl_name: [0; 96],
    };
    for (dst, src) in info.ctl_name.iter_mut().zip(CTL_NAME) {
        *dst = *src as libc::c_char;
    }

    // Safety: The descriptor is a system-control socket and `info` is
    // properly initialized.
    if unsafe { ioctl(fd.as_raw_fd(), CTLIOCGINFO, &mut info as *mut ctl_info) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let addr = sockaddr_ctl {
        sc_len: size_of::<sockaddr_ctl>() as u8,
        sc_family: AF_SYSTEM as u8,
        ss_sysaddr: AF_SYS_CONTROL as u16,
        sc_id: info.ctl_id,
        sc_unit: 0, // First free unit.
        sc_reserved: Default::default(),
    };

    // Safety: `addr` lives for the duration of the call.
    let ret = unsafe {
        connect(
            fd.as_raw_fd(),
            &addr as *const sockaddr_ctl as _,
            size_of::<sockaddr_ctl>() as socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let name = fd_name(fd.as_raw_fd())?;

    Ok((fd, name))
}

fn fd_name(fd: RawFd) -> io::Result<String> {
    let mut name = [0u8; IF_NAMESIZE];
    let mut len = name.len() as socklen_t;

    // Safety: The buffer is valid for `len` bytes.
    let ret = unsafe {
        getsockopt(
            fd,
            SYSPROTO_CONTROL,
            UTUN_OPT_IFNAME,
            name.as_mut_ptr() as *mut c_void,
            &mut len as *mut socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }

    let end = name.iter().position(|b| *b == 0).unwrap_or(0);

    Ok(String::from_utf8_lossy(&name[..end]).into_owned())
}

/// utun frames carry a 4-byte address-family header; strip it on read.
pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    let mut hdr = [0u8; 4];
    let mut iov = [
        iovec {
            iov_base: hdr.as_mut_ptr() as _,
            iov_len: hdr.len(),
        },
        iovec {
            iov_base: buf.as_mut_ptr() as _,
            iov_len: buf.len(),
        },
    ];

    let mut msg_hdr = msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: iov.as_mut_ptr(),
        msg_iovlen: iov.len() as _,
        msg_control: std::ptr::null_mut(),
        msg_controllen: 0,
        msg_flags: 0,
    };

    // Safety: The iovecs point at live buffers.
    match unsafe { libc::recvmsg(fd, &mut msg_hdr, 0) } {
        -1 => Err(io::Error::last_os_error()),
        0..=4 => Ok(0),
        n => Ok(n as usize - 4),
    }
}

/// Prepend the address-family header the kernel expects.
pub(crate) fn write(fd: RawFd, packet: &[u8]) -> io::Result<usize> {
    let af = match packet.first().map(|b| b >> 4) {
        Some(6) => AF_INET6,
        _ => AF_INET,
    };

    let mut hdr = [0u8, 0, 0, af as u8];
    let mut iov = [
        iovec {
            iov_base: hdr.as_mut_ptr() as _,
            iov_len: hdr.len(),
        },
        iovec {
            iov_base: packet.as_ptr() as *mut _,
            iov_len: packet.len(),
        },
    ];

    let msg_hdr = msghdr {
        msg_name: std::ptr::null_mut(),
        msg_namelen: 0,
        msg_iov: iov.as_mut_ptr(),
        msg_iovlen: iov.len() as _,
        msg_control: std::ptr::null_mut(),
        msg_controllen: 0,
        msg_flags: 0,
    };

    // Safety: The iovecs point at live buffers.
    match unsafe { sendmsg(fd, &msg_hdr, 0) } {
        -1 => Err(io::Error::last_os_error()),
        0..=4 => Ok(0),
        n => Ok(n as usize - 4),
    }
}
