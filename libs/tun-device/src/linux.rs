use crate::ioctl;
use std::ffi::CStr;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

const TUN_FILE: &CStr = c"/dev/net/tun";
const TUNSETIFF: libc::c_ulong = 0x4004_54ca;

#[derive(Default)]
#[repr(C)]
struct SetTunFlags {
    flags: libc::c_short,
}

pub(crate) fn create(name_hint: &str) -> io::Result<(OwnedFd, String)> {
    // Safety: The path is a valid C string.
    let fd = match unsafe { libc::open(TUN_FILE.as_ptr(), libc::O_RDWR) } {
        -1 => return Err(io::Error::last_os_error()),
        fd => fd,
    };

    // Safety: We just opened the file descriptor.
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut request = ioctl::Request::<SetTunFlags>::new(name_hint)?;
    request.payload.flags = (libc::IFF_TUN | libc::IFF_NO_PI) as libc::c_short;

    // Safety: The descriptor is valid and the payload matches TUNSETIFF.
    unsafe {
        ioctl::exec(std::os::fd::AsRawFd::as_raw_fd(&fd), TUNSETIFF, &mut request)?;
    }

    Ok((fd, request.name()))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    // Safety: The descriptor and buffer are valid for the duration of the call.
    match unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}

pub(crate) fn write(fd: RawFd, packet: &[u8]) -> io::Result<usize> {
    // Safety: The descriptor and buffer are valid for the duration of the call.
    match unsafe { libc::write(fd, packet.as_ptr().cast(), packet.len()) } {
        -1 => Err(io::Error::last_os_error()),
        n => Ok(n as usize),
    }
}
