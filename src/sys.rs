//! libc-backed implementations of the tunnel seams

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::traits::{Descriptor, DeviceRequester};

/// A connected kernel-control socket used as the tunnel descriptor.
///
/// Holds a raw descriptor: it is closed explicitly, exactly once, by the
/// lifecycle guard and must not be used after that.
#[derive(Debug)]
pub struct ControlFd {
    fd: RawFd,
}

impl ControlFd {
    pub(crate) fn from_raw(fd: RawFd) -> Self {
        Self { fd }
    }
}

impl AsRawFd for ControlFd {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

fn check(rc: libc::c_int) -> io::Result<()> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

impl Descriptor for ControlFd {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let n = unsafe { libc::read(self.fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let n = unsafe { libc::write(self.fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(n as usize)
    }

    fn shutdown(&self) -> io::Result<()> {
        check(unsafe { libc::shutdown(self.fd, libc::SHUT_RDWR) })
    }

    fn close(&self) -> io::Result<()> {
        check(unsafe { libc::close(self.fd) })
    }
}

/// Issues device requests on a throwaway IPv4 datagram socket.
///
/// Each call opens its own socket, so calls need no synchronization.
#[derive(Debug, Default, Clone, Copy)]
pub struct InetRequester;

impl DeviceRequester for InetRequester {
    fn request(&self, code: u64, record: &mut [u8]) -> io::Result<()> {
        let sock = unsafe { libc::socket(libc::AF_INET, libc::SOCK_DGRAM, 0) };
        if sock < 0 {
            return Err(io::Error::last_os_error());
        }
        // Closed on return, after errno has been captured
        let sock = unsafe { OwnedFd::from_raw_fd(sock) };

        check(unsafe { libc::ioctl(sock.as_raw_fd(), code as _, record.as_mut_ptr()) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_control_fd_over_socket_pair() {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_DGRAM, 0, fds.as_mut_ptr()) };
        assert_eq!(rc, 0);
        let near = ControlFd::from_raw(fds[0]);
        let far = ControlFd::from_raw(fds[1]);

        assert_eq!(far.write(&[0, 0, 0, 2, 0x45]).unwrap(), 5);
        let mut buf = [0u8; 16];
        assert_eq!(near.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf[..5], &[0, 0, 0, 2, 0x45]);

        near.shutdown().unwrap();
        assert_eq!(near.read(&mut buf).unwrap(), 0);

        near.close().unwrap();
        far.close().unwrap();
    }

    #[test]
    fn test_unknown_request_fails() {
        let mut record = [0u8; 32];
        record[..2].copy_from_slice(b"lo");
        assert!(InetRequester.request(0, &mut record).is_err());
    }
}
