//! Raw HCI socket system calls.

use libc::{c_int, sockaddr, socklen_t, AF_BLUETOOTH, SOCK_CLOEXEC, SOCK_NONBLOCK, SOCK_RAW};
use std::{
    io::{Error, Result},
    mem::size_of,
    os::fd::{AsRawFd, FromRawFd, OwnedFd},
};

use crate::sys::{sockaddr_hci, BTPROTO_HCI};

/// Opens a raw HCI socket in non-blocking mode.
pub fn hci_socket() -> Result<OwnedFd> {
    match unsafe { libc::socket(AF_BLUETOOTH, SOCK_RAW | SOCK_NONBLOCK | SOCK_CLOEXEC, BTPROTO_HCI) } {
        -1 => Err(Error::last_os_error()),
        fd => Ok(unsafe { OwnedFd::from_raw_fd(fd) }),
    }
}

/// Binds an HCI socket to the specified device and channel.
pub fn bind(socket: &OwnedFd, addr: &sockaddr_hci) -> Result<()> {
    let ret = unsafe {
        libc::bind(
            socket.as_raw_fd(),
            addr as *const sockaddr_hci as *const sockaddr,
            size_of::<sockaddr_hci>() as socklen_t,
        )
    };
    match ret {
        0 => Ok(()),
        _ => Err(Error::last_os_error()),
    }
}

/// Sends one datagram.
pub fn send(socket: &OwnedFd, buf: &[u8], flags: c_int) -> Result<usize> {
    match unsafe { libc::send(socket.as_raw_fd(), buf.as_ptr() as *const _, buf.len(), flags) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}

/// Receives one datagram, truncating it to the buffer length.
pub fn recv(socket: &OwnedFd, buf: &mut [u8], flags: c_int) -> Result<usize> {
    match unsafe { libc::recv(socket.as_raw_fd(), buf.as_mut_ptr() as *mut _, buf.len(), flags) } {
        -1 => Err(Error::last_os_error()),
        n => Ok(n as usize),
    }
}
