//! Packet Channel
//!
//! Framed packet I/O over the tunnel descriptor. Every frame carries a
//! 4-byte big-endian address-family tag in front of the raw IP packet;
//! writes add it, reads strip it.

use std::io;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};
use tracing::trace;

use crate::error::{Error, Result};
use crate::lifecycle::LifecycleGuard;
use crate::traits::Descriptor;

/// Frame header size
pub const HEADER_LEN: usize = 4;

/// Read buffer size, large enough for any practical packet
pub const MAX_FRAME_LEN: usize = 65536;

const READ_OP: &str = "read packet";
const WRITE_OP: &str = "write packet";

/// Prepend the family tag to `packet`
pub fn frame(family: u32, packet: &[u8]) -> Vec<u8> {
    let mut frame = vec![0u8; HEADER_LEN + packet.len()];
    BigEndian::write_u32(&mut frame[..HEADER_LEN], family);
    frame[HEADER_LEN..].copy_from_slice(packet);
    frame
}

/// Split a frame into its family tag and packet. `None` if the frame is
/// shorter than the header.
pub fn unframe(frame: &[u8]) -> Option<(u32, &[u8])> {
    if frame.len() < HEADER_LEN {
        return None;
    }
    Some((BigEndian::read_u32(&frame[..HEADER_LEN]), &frame[HEADER_LEN..]))
}

// Errors a socket returns once it has been shut down or closed
fn is_shutdown_error(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EBADF) | Some(libc::ENOTCONN) | Some(libc::ESHUTDOWN)
    )
}

/// Read one packet, blocking until one arrives or the tunnel closes.
///
/// Interrupted reads are retried. A read that returns nothing, or fails
/// once the guard is closing, means the descriptor was shut down and
/// surfaces as `Error::Closed`.
pub fn read_packet<D: Descriptor>(guard: &LifecycleGuard<D>) -> Result<Vec<u8>> {
    let descriptor = guard.retain(READ_OP)?;
    let mut buf = vec![0u8; MAX_FRAME_LEN];

    loop {
        match descriptor.read(&mut buf) {
            Ok(0) => return Err(Error::Closed { op: READ_OP }),
            Ok(n) => {
                return match unframe(&buf[..n]) {
                    Some((_, packet)) => Ok(packet.to_vec()),
                    None => Err(Error::Read {
                        op: READ_OP,
                        source: io::Error::new(
                            io::ErrorKind::InvalidData,
                            format!("frame of {} bytes is shorter than its header", n),
                        ),
                    }),
                };
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {
                trace!("Tunnel read interrupted, retrying");
                continue;
            }
            Err(e) if is_shutdown_error(&e) || guard.is_closed() => {
                return Err(Error::Closed { op: READ_OP });
            }
            Err(source) => return Err(Error::Read { op: READ_OP, source }),
        }
    }
}

/// Write one packet tagged with `family`. A short write is an error.
pub fn write_packet<D: Descriptor>(guard: &LifecycleGuard<D>, family: u32, packet: &[u8]) -> Result<()> {
    let descriptor = guard.retain(WRITE_OP)?;
    let frame = frame(family, packet);

    match descriptor.write(&frame) {
        Ok(n) if n == frame.len() => Ok(()),
        Ok(n) => Err(Error::Write {
            op: WRITE_OP,
            source: io::Error::new(
                io::ErrorKind::WriteZero,
                format!("short write: {} of {} bytes", n, frame.len()),
            ),
        }),
        Err(e) if is_shutdown_error(&e) || guard.is_closed() => Err(Error::Closed { op: WRITE_OP }),
        Err(source) => Err(Error::Write { op: WRITE_OP, source }),
    }
}

/// IP version from the first header nibble
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|b| b >> 4)
}

/// Extract the source IPv4 address from a raw IP packet
pub fn source_v4(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || ip_version(packet) != Some(4) {
        return None;
    }
    Some(Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]))
}

/// Extract the destination IPv4 address from a raw IP packet
pub fn destination_v4(packet: &[u8]) -> Option<Ipv4Addr> {
    if packet.len() < 20 || ip_version(packet) != Some(4) {
        return None;
    }
    Some(Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]))
}
