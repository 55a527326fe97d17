//! Thin syscall wrappers for descriptors the reactor owns.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::fd::RawFd;

use crate::Fd;

pub(crate) fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// One `recv` on a managed stream socket. `Ok(0)` is a peer close.
pub fn recv(fd: Fd, buf: &mut [u8]) -> io::Result<usize> {
    let n = unsafe { libc::recv(fd.raw(), buf.as_mut_ptr().cast(), buf.len(), 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One `send` on a managed stream socket. SIGPIPE is suppressed; a broken
/// pipe comes back as an error instead.
pub fn send(fd: Fd, buf: &[u8]) -> io::Result<usize> {
    let n = unsafe {
        libc::send(
            fd.raw(),
            buf.as_ptr().cast(),
            buf.len(),
            libc::MSG_NOSIGNAL,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One datagram out of a managed socket.
pub fn send_to(fd: Fd, buf: &[u8], dst: SocketAddr) -> io::Result<usize> {
    let addr = socket2::SockAddr::from(dst);
    let n = unsafe {
        libc::sendto(
            fd.raw(),
            buf.as_ptr().cast(),
            buf.len(),
            libc::MSG_NOSIGNAL,
            addr.as_ptr().cast(),
            addr.len(),
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// One datagram into `buf`, with the sender's address.
pub fn recv_from(fd: Fd, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
    let mut storage = socket2::SockAddrStorage::zeroed();
    let mut len = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    let n = unsafe {
        libc::recvfrom(
            fd.raw(),
            buf.as_mut_ptr().cast(),
            buf.len(),
            0,
            storage.view_as::<libc::sockaddr_storage>() as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    // Safety: the kernel filled `storage`/`len` with a valid address.
    let addr = unsafe { socket2::SockAddr::new(storage, len) }
        .as_socket()
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidData, "non-IP peer address"))?;
    Ok((n as usize, addr))
}
