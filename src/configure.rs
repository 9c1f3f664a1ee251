//! Interface Configuration
//!
//! MTU and IPv4 address get/set on a tunnel interface, issued as legacy
//! device requests through [`ifreq_request`]. Each call holds a lease on
//! the tunnel, so configuration fails with `Error::Closed` once the
//! tunnel is closing.

use std::net::{IpAddr, Ipv4Addr};

use byteorder::{ByteOrder, NativeEndian};
use tracing::{debug, warn};

use crate::device::UtunDevice;
use crate::error::{Error, Result};
use crate::ifreq::{ifreq_request, pack_sockaddr_in, unpack_sockaddr_in, DeviceRequest, SOCKADDR_IN_LEN};
use crate::traits::{Descriptor, DeviceRequester};

/// IPv4 addressing of a point-to-point interface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAddressSet {
    pub local: Ipv4Addr,
    pub destination: Ipv4Addr,
    pub netmask: Ipv4Addr,
}

impl InterfaceAddressSet {
    pub fn new(local: Ipv4Addr, destination: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        Self {
            local,
            destination,
            netmask,
        }
    }

    /// Prefix length of the netmask, `None` if it is not contiguous
    pub fn prefix_len(&self) -> Option<u8> {
        let mask = u32::from(self.netmask);
        let ones = mask.leading_ones();
        if mask.checked_shl(ones).unwrap_or(0) == 0 {
            Some(ones as u8)
        } else {
            None
        }
    }
}

// IPv4-mapped IPv6 addresses still fit in 4 bytes
fn as_ipv4(addr: IpAddr) -> Option<Ipv4Addr> {
    match addr {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

impl<D: Descriptor, R: DeviceRequester> UtunDevice<D, R> {
    fn device_request(&self, op: &'static str, request: DeviceRequest, payload: &mut [u8]) -> Result<()> {
        let code = request.code(&self.config().requests);
        ifreq_request(self.requester(), self.name(), code, payload).map_err(|source| Error::Ioctl {
            op,
            request: request.name(),
            code,
            source,
        })
    }

    /// Current MTU of the interface
    pub fn mtu(&self) -> Result<u32> {
        const OP: &str = "get MTU";
        let _lease = self.guard().retain(OP)?;

        let mut buf = [0u8; 4];
        self.device_request(OP, DeviceRequest::GetMtu, &mut buf)?;
        Ok(NativeEndian::read_u32(&buf))
    }

    /// Set the MTU of the interface
    pub fn set_mtu(&self, mtu: u32) -> Result<()> {
        const OP: &str = "set MTU";
        let _lease = self.guard().retain(OP)?;

        let mut buf = [0u8; 4];
        NativeEndian::write_u32(&mut buf, mtu);
        self.device_request(OP, DeviceRequest::SetMtu, &mut buf)?;
        debug!("Set MTU of {} to {}", self.name(), mtu);
        Ok(())
    }

    /// Local, destination and netmask addresses of the interface
    pub fn addresses(&self) -> Result<InterfaceAddressSet> {
        const OP: &str = "get addresses";
        let _lease = self.guard().retain(OP)?;

        let family = self.config().inet_family;
        let read = |request: DeviceRequest| -> Result<Ipv4Addr> {
            let mut sockaddr = pack_sockaddr_in(family, Ipv4Addr::UNSPECIFIED);
            self.device_request(OP, request, &mut sockaddr)?;
            Ok(unpack_sockaddr_in(&sockaddr))
        };

        let local = read(DeviceRequest::GetAddr)?;
        let destination = read(DeviceRequest::GetDstAddr)?;
        let netmask = read(DeviceRequest::GetNetmask)?;
        Ok(InterfaceAddressSet::new(local, destination, netmask))
    }

    /// Replace the interface's addresses.
    ///
    /// IPv4 only: an address that does not fit in 4 bytes, or a mask that
    /// is not exactly 4 bytes long, is rejected before any request is made.
    /// Existing addresses are removed first; that removal may fail (the
    /// interface might have none yet) without failing the call.
    pub fn set_addresses(&self, local: IpAddr, dest: IpAddr, mask: &[u8]) -> Result<()> {
        const OP: &str = "set addresses";

        let (local, dest) = match (as_ipv4(local), as_ipv4(dest)) {
            (Some(local), Some(dest)) => (local, dest),
            _ => {
                return Err(Error::Unsupported {
                    op: OP,
                    reason: "only IPv4 is supported".into(),
                })
            }
        };
        let mask: [u8; 4] = mask.try_into().map_err(|_| Error::Unsupported {
            op: OP,
            reason: format!("netmask must be 4 bytes, got {}", mask.len()),
        })?;

        let _lease = self.guard().retain(OP)?;

        let mut removal = [0u8; SOCKADDR_IN_LEN * 3];
        if let Err(e) = self.device_request(OP, DeviceRequest::DeleteAddr, &mut removal) {
            let missing = e
                .os_error()
                .and_then(|e| e.raw_os_error())
                .map_or(false, |errno| errno == libc::EADDRNOTAVAIL);
            if missing {
                debug!("No existing address to remove on {}", self.name());
            } else {
                warn!("Ignoring failed address removal on {}: {}", self.name(), e);
            }
        }

        let family = self.config().inet_family;
        let mut records = Vec::with_capacity(SOCKADDR_IN_LEN * 3);
        for addr in [local, dest, Ipv4Addr::from(mask)] {
            records.extend_from_slice(&pack_sockaddr_in(family, addr));
        }
        self.device_request(OP, DeviceRequest::AddAddr, &mut records)?;

        debug!(
            "Set addresses of {}: local {} dest {} mask {}",
            self.name(),
            local,
            dest,
            Ipv4Addr::from(mask)
        );
        Ok(())
    }

    /// [`set_addresses`](Self::set_addresses) from an address set
    pub fn set_address_set(&self, set: &InterfaceAddressSet) -> Result<()> {
        self.set_addresses(
            IpAddr::V4(set.local),
            IpAddr::V4(set.destination),
            &set.netmask.octets(),
        )
    }
}
