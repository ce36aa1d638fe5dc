//! Thin owned wrapper over a UDP socket file descriptor.

use crate::errors::{Errno, Error};

pub(crate) struct SocketFd(libc::c_int);

impl SocketFd {
    /// Create an `AF_INET/SOCK_DGRAM` socket with address reuse enabled.
    pub(crate) fn new_udp() -> Result<Self, Error> {
        let fd = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if fd < 0 {
            return Err(Error::NetCreateSocket(Errno::last()));
        }
        let sock = SocketFd(fd);

        let enable: libc::c_int = 1;
        let err = unsafe {
            libc::setsockopt(
                sock.0,
                libc::SOL_SOCKET,
                libc::SO_REUSEADDR,
                (&enable) as *const _ as *const libc::c_void,
                core::mem::size_of_val(&enable) as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(Error::NetSetSockOpt(Errno::last()));
        }

        Ok(sock)
    }

    /// Bind the local endpoint. `ip` is in host order.
    pub(crate) fn bind(&self, ip: u32, port: u16) -> Result<(), Error> {
        let addr = sockaddr_in(ip, port);
        let err = unsafe {
            libc::bind(
                self.0,
                (&addr) as *const _ as *const libc::sockaddr,
                core::mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if err != 0 {
            return Err(Error::NetBind(Errno::last()));
        }
        Ok(())
    }

    /// Transmit the whole buffer as one datagram. A zero-length buffer sends
    /// a zero-length datagram. May transiently block on a full kernel TX
    /// buffer.
    pub(crate) fn send_to(&self, buf: &[u8], ip: u32, port: u16) -> Result<usize, Error> {
        let addr = sockaddr_in(ip, port);
        let sent = unsafe {
            libc::sendto(
                self.0,
                buf.as_ptr() as *const libc::c_void,
                buf.len(),
                0,
                (&addr) as *const _ as *const libc::sockaddr,
                core::mem::size_of_val(&addr) as libc::socklen_t,
            )
        };
        if sent < 0 {
            return Err(Error::NetSend(Errno::last()));
        }
        Ok(sent as usize)
    }

    /// Receive one datagram into `buf`, returning its length.
    ///
    /// With `block`, waits for a datagram. Without, returns `Ok(None)` when
    /// nothing is queued.
    pub(crate) fn recv(&self, buf: &mut [u8], block: bool) -> Result<Option<usize>, Error> {
        // MSG_TRUNC reports the real datagram length even when it exceeds
        // the buffer, so exact-size checks catch oversized messages too.
        let flags = libc::MSG_TRUNC | if block { 0 } else { libc::MSG_DONTWAIT };
        let received = unsafe {
            libc::recv(
                self.0,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                flags,
            )
        };
        if received < 0 {
            let errno = Errno::last();
            if !block && (errno.raw() == libc::EAGAIN || errno.raw() == libc::EWOULDBLOCK) {
                return Ok(None);
            }
            return Err(Error::NetRecv(errno));
        }
        Ok(Some(received as usize))
    }

    /// The raw file descriptor, for `select`.
    pub(crate) fn raw(&self) -> libc::c_int {
        self.0
    }
}

impl Drop for SocketFd {
    fn drop(&mut self) {
        unsafe { libc::close(self.0) };
    }
}

fn sockaddr_in(ip: u32, port: u16) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: port.to_be(),
        sin_addr: libc::in_addr { s_addr: ip.to_be() },
        sin_zero: [0; 8],
    }
}
