//! Raw `NETLINK_ROUTE` socket.

use std::io;
use std::os::unix::io::RawFd;

use crate::HostError;

/// The kernel-facing half of the host network manager, as a seam: the real
/// implementation is a route socket; tests substitute a scripted kernel.
pub(crate) trait RouteSocket: Send {
    fn send(&mut self, msg: &[u8]) -> Result<(), HostError>;
    fn recv(&mut self) -> Result<Vec<u8>, HostError>;
}

/// RAII wrapper over an `AF_NETLINK`/`NETLINK_ROUTE` socket.
pub(crate) struct NetlinkSocket {
    fd: RawFd,
}

impl NetlinkSocket {
    pub fn open() -> Result<Self, HostError> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                libc::NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(HostError::Io(io::Error::last_os_error()));
        }

        let mut addr: libc::sockaddr_nl = unsafe { std::mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as libc::sa_family_t;
        let rc = unsafe {
            libc::bind(
                fd,
                &addr as *const libc::sockaddr_nl as *const libc::sockaddr,
                std::mem::size_of::<libc::sockaddr_nl>() as libc::socklen_t,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            unsafe { libc::close(fd) };
            return Err(HostError::Io(err));
        }

        Ok(NetlinkSocket { fd })
    }
}

impl RouteSocket for NetlinkSocket {
    fn send(&mut self, msg: &[u8]) -> Result<(), HostError> {
        let rc = unsafe { libc::send(self.fd, msg.as_ptr().cast(), msg.len(), 0) };
        if rc < 0 {
            return Err(HostError::Io(io::Error::last_os_error()));
        }
        if rc as usize != msg.len() {
            return Err(HostError::Malformed("short netlink send"));
        }
        Ok(())
    }

    fn recv(&mut self) -> Result<Vec<u8>, HostError> {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let rc = unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(HostError::Io(err));
            }
            buf.truncate(rc as usize);
            return Ok(buf);
        }
    }
}

impl Drop for NetlinkSocket {
    fn drop(&mut self) {
        unsafe { libc::close(self.fd) };
    }
}
