//! Tunnel Traits
//!
//! The seams between tunnel logic and the operating system:
//! - `Descriptor`: the provisioned tunnel descriptor (packet I/O, shutdown, close)
//! - `DeviceRequester`: issues a legacy device request against an interface record
//! - `Tunnel`: the public surface a collaborator programs against
//!
//! Production code uses the libc-backed types in [`crate::sys`]; tests use
//! the in-memory doubles in `mock`.

use std::io;
use std::net::IpAddr;

use crate::configure::InterfaceAddressSet;
use crate::error::Result;

/// A kernel descriptor carrying framed packets.
///
/// All methods take `&self`: reads, writes and shutdown run concurrently
/// from several threads, and `close` is called exactly once by the
/// lifecycle guard after every in-flight call has returned.
pub trait Descriptor: Send + Sync {
    /// Blocking read of one frame into `buf`. `Ok(0)` means the
    /// descriptor was shut down.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    /// Blocking write of one frame.
    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Shut down both directions, waking any blocked reader.
    fn shutdown(&self) -> io::Result<()>;

    /// Release the descriptor.
    fn close(&self) -> io::Result<()>;
}

/// Issues one device request (`ioctl`) with a caller-built record.
///
/// `record` is the full interface request: name in the first 16 bytes,
/// payload after it. Implementations may mutate the record in place.
pub trait DeviceRequester: Send + Sync {
    fn request(&self, code: u64, record: &mut [u8]) -> io::Result<()>;
}

/// A tunnel interface.
///
/// Object safe, so collaborators can hold a `Box<dyn Tunnel>`.
pub trait Tunnel: Send + Sync {
    /// Kernel-assigned interface name, e.g. `utun3`.
    fn name(&self) -> &str;

    /// Read one packet, without its frame header. Blocks until a packet
    /// arrives or the tunnel is closed.
    fn read_packet(&self) -> Result<Vec<u8>>;

    /// Write one IPv4 packet.
    fn write_packet(&self, packet: &[u8]) -> Result<()>;

    fn mtu(&self) -> Result<u32>;

    fn set_mtu(&self, mtu: u32) -> Result<()>;

    /// Local, destination and netmask addresses of the interface.
    fn addresses(&self) -> Result<InterfaceAddressSet>;

    /// Replace the interface's addresses. IPv4 only; `mask` must be 4 bytes.
    fn set_addresses(&self, local: IpAddr, dest: IpAddr, mask: &[u8]) -> Result<()>;

    /// Request close. Blocked reads return `Error::Closed`; the descriptor
    /// is released once in-flight calls drain.
    fn close(&self) -> Result<()>;
}
