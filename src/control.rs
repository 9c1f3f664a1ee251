//! Kernel Control Socket
//!
//! Provisions a tunnel interface through the kernel-control handshake:
//! open a system socket, resolve the driver's control id from its
//! well-known name, connect to it (the kernel creates the interface), and
//! read back the interface name the kernel picked.
//!
//! The two records passed to the kernel are built byte by byte at fixed
//! offsets rather than through `#[repr(C)]` structs.

use std::io;
use std::os::fd::{AsRawFd, FromRawFd, IntoRawFd, OwnedFd};

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, warn};

use crate::config::ControlConfig;
use crate::error::{Error, Result};
use crate::sys::ControlFd;

/// Size of `ctl_info.ctl_name` (MAX_KCTL_NAME)
pub const CTL_NAME_CAPACITY: usize = 96;

/// Size of `struct ctl_info`
pub const CTL_INFO_LEN: usize = 4 + CTL_NAME_CAPACITY;

/// Size of `struct sockaddr_ctl`
pub const SOCKADDR_CTL_LEN: usize = 32;

/// Buffer offered to the kernel for the interface name, terminator included
pub const IFNAME_BUF_LEN: usize = 32;

/// `struct ctl_info`
///
/// | offset | len | field |
/// |--------|-----|-------|
/// | 0      | 4   | `ctl_id`, native endian, filled in by the kernel |
/// | 4      | 96  | `ctl_name`, NUL padded |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlInfo([u8; CTL_INFO_LEN]);

impl CtlInfo {
    /// Lookup record for `name`. Names that do not fit are truncated so
    /// the terminator always survives.
    pub fn new(name: &str) -> Self {
        let mut bytes = [0u8; CTL_INFO_LEN];
        let name = name.as_bytes();
        let len = name.len().min(CTL_NAME_CAPACITY - 1);
        bytes[4..4 + len].copy_from_slice(&name[..len]);
        Self(bytes)
    }

    pub fn control_id(&self) -> u32 {
        NativeEndian::read_u32(&self.0[0..4])
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.0
    }
}

/// `struct sockaddr_ctl`
///
/// | offset | len | field |
/// |--------|-----|-------|
/// | 0      | 1   | `sc_len` (32) |
/// | 1      | 1   | `sc_family` (AF_SYSTEM) |
/// | 2      | 2   | `ss_sysaddr` (AF_SYS_CONTROL), native endian |
/// | 4      | 4   | `sc_id`, native endian |
/// | 8      | 4   | `sc_unit`, 0 = next free unit |
/// | 12     | 20  | reserved |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SockaddrCtl([u8; SOCKADDR_CTL_LEN]);

impl SockaddrCtl {
    pub fn new(config: &ControlConfig, control_id: u32) -> Self {
        let mut bytes = [0u8; SOCKADDR_CTL_LEN];
        bytes[0] = SOCKADDR_CTL_LEN as u8;
        bytes[1] = config.address_family;
        NativeEndian::write_u16(&mut bytes[2..4], config.sys_address);
        NativeEndian::write_u32(&mut bytes[4..8], control_id);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// Decode a kernel-written interface name, stopping at the first NUL
pub fn parse_interface_name(buf: &[u8]) -> String {
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    String::from_utf8_lossy(&buf[..end]).into_owned()
}

/// A kernel control socket in the middle of the provisioning handshake.
///
/// Dropping it before [`into_descriptor`](Self::into_descriptor) closes the
/// socket, so a failed handshake never leaks the descriptor.
#[derive(Debug)]
pub struct ControlSocket {
    fd: OwnedFd,
}

impl ControlSocket {
    /// Allocate a kernel-control datagram socket
    pub fn open(config: &ControlConfig) -> Result<Self> {
        let fd = unsafe { libc::socket(config.domain, libc::SOCK_DGRAM, config.protocol) };
        if fd < 0 {
            return Err(Error::Creation {
                op: "open control socket",
                source: io::Error::last_os_error(),
            });
        }
        debug!("Opened kernel control socket (fd {})", fd);
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Resolve the numeric control id for the configured driver name
    pub fn resolve_control_id(&self, config: &ControlConfig) -> Result<u32> {
        let mut info = CtlInfo::new(&config.name);
        let rc = unsafe {
            libc::ioctl(
                self.fd.as_raw_fd(),
                config.info_request as _,
                info.as_mut_bytes().as_mut_ptr(),
            )
        };
        if rc < 0 {
            return Err(Error::Lookup {
                op: "resolve control id",
                name: config.name.clone(),
                source: io::Error::last_os_error(),
            });
        }

        let id = info.control_id();
        debug!("Resolved kernel control {} to id {}", config.name, id);
        Ok(id)
    }

    /// Connect to the control, which makes the kernel create the interface
    pub fn connect(&self, config: &ControlConfig, control_id: u32) -> Result<()> {
        let addr = SockaddrCtl::new(config, control_id);
        let rc = unsafe {
            libc::connect(
                self.fd.as_raw_fd(),
                addr.as_bytes().as_ptr() as *const libc::sockaddr,
                SOCKADDR_CTL_LEN as libc::socklen_t,
            )
        };
        if rc < 0 {
            return Err(Error::Connect {
                op: "connect control",
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    /// Read back the name the kernel gave the new interface.
    ///
    /// The interface already exists by now, so a failure here is a plain
    /// `Error::Io` rather than a (retryable) connect error.
    pub fn fetch_assigned_name(&self, config: &ControlConfig) -> Result<String> {
        let mut buf = [0u8; IFNAME_BUF_LEN];
        let mut len = IFNAME_BUF_LEN as libc::socklen_t;
        let rc = unsafe {
            libc::getsockopt(
                self.fd.as_raw_fd(),
                config.protocol,
                config.ifname_option,
                buf.as_mut_ptr() as *mut libc::c_void,
                &mut len,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            warn!("Failed to read assigned interface name: {}", err);
            return Err(Error::Io(err));
        }

        let len = (len as usize).min(IFNAME_BUF_LEN);
        let name = parse_interface_name(&buf[..len]);
        if name.is_empty() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                "kernel returned an empty interface name",
            )));
        }
        Ok(name)
    }

    /// Hand the connected socket over as a tunnel descriptor
    pub fn into_descriptor(self) -> ControlFd {
        ControlFd::from_raw(self.fd.into_raw_fd())
    }
}
