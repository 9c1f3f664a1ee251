//! Interface Request Records
//!
//! Every configuration call funnels through [`ifreq_request`], the only
//! place the `struct ifreq` layout is defined:
//!
//! | offset | len          | field |
//! |--------|--------------|-------|
//! | 0      | 16           | interface name, NUL padded |
//! | 16     | max(16, n)   | request payload |
//!
//! Address payloads are packed `sockaddr_in` records:
//!
//! | offset | len | field |
//! |--------|-----|-------|
//! | 0      | 1   | `sin_len` (16) |
//! | 1      | 1   | `sin_family` |
//! | 2      | 2   | `sin_port`, big endian |
//! | 4      | 4   | `sin_addr` |
//! | 8      | 8   | zero |

use std::io;
use std::net::Ipv4Addr;

use byteorder::{BigEndian, ByteOrder};

use crate::config::RequestCodes;
use crate::traits::DeviceRequester;

/// Interface name field size (IFNAMSIZ)
pub const IFNAMSIZ: usize = 16;

/// Smallest record handed to the kernel: name plus a 16-byte union.
/// Darwin `struct ifreq` size; other platforms differ.
pub const MIN_RECORD_LEN: usize = IFNAMSIZ + 16;

/// Packed `sockaddr_in` size
pub const SOCKADDR_IN_LEN: usize = 16;

/// A `struct ifreq` (or `ifaliasreq`) image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IfreqRecord {
    bytes: Vec<u8>,
}

impl IfreqRecord {
    /// Build a record for interface `name` carrying `payload`.
    ///
    /// Names longer than the field are cut at 16 bytes.
    pub fn new(name: &str, payload: &[u8]) -> Self {
        let len = MIN_RECORD_LEN.max(IFNAMSIZ + payload.len());
        let mut bytes = vec![0u8; len];

        let name = name.as_bytes();
        let name_len = name.len().min(IFNAMSIZ);
        bytes[..name_len].copy_from_slice(&name[..name_len]);
        bytes[IFNAMSIZ..IFNAMSIZ + payload.len()].copy_from_slice(payload);

        Self { bytes }
    }

    pub fn name_bytes(&self) -> &[u8] {
        &self.bytes[..IFNAMSIZ]
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[IFNAMSIZ..]
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_mut_bytes(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

/// Pack an IPv4 address into a `sockaddr_in` record
pub fn pack_sockaddr_in(family: u8, addr: Ipv4Addr) -> [u8; SOCKADDR_IN_LEN] {
    let mut bytes = [0u8; SOCKADDR_IN_LEN];
    bytes[0] = SOCKADDR_IN_LEN as u8;
    bytes[1] = family;
    BigEndian::write_u16(&mut bytes[2..4], 0);
    bytes[4..8].copy_from_slice(&addr.octets());
    bytes
}

/// Extract the IPv4 address from a `sockaddr_in` record
pub fn unpack_sockaddr_in(bytes: &[u8]) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    if bytes.len() >= 8 {
        octets.copy_from_slice(&bytes[4..8]);
    }
    Ipv4Addr::from(octets)
}

/// The device requests the configurator issues
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRequest {
    GetMtu,
    SetMtu,
    GetAddr,
    GetDstAddr,
    GetNetmask,
    DeleteAddr,
    AddAddr,
}

impl DeviceRequest {
    /// Conventional request name, for error context
    pub fn name(self) -> &'static str {
        match self {
            DeviceRequest::GetMtu => "SIOCGIFMTU",
            DeviceRequest::SetMtu => "SIOCSIFMTU",
            DeviceRequest::GetAddr => "SIOCGIFADDR",
            DeviceRequest::GetDstAddr => "SIOCGIFDSTADDR",
            DeviceRequest::GetNetmask => "SIOCGIFNETMASK",
            DeviceRequest::DeleteAddr => "SIOCDIFADDR",
            DeviceRequest::AddAddr => "SIOCAIFADDR",
        }
    }

    /// Numeric request code from configuration
    pub fn code(self, codes: &RequestCodes) -> u64 {
        match self {
            DeviceRequest::GetMtu => codes.get_mtu,
            DeviceRequest::SetMtu => codes.set_mtu,
            DeviceRequest::GetAddr => codes.get_addr,
            DeviceRequest::GetDstAddr => codes.get_dst_addr,
            DeviceRequest::GetNetmask => codes.get_netmask,
            DeviceRequest::DeleteAddr => codes.delete_addr,
            DeviceRequest::AddAddr => codes.add_addr,
        }
    }
}

/// Issue one device request for interface `name`.
///
/// Builds the record, hands it to `requester`, then copies whatever the
/// kernel wrote after the name back into `payload`.
pub fn ifreq_request<R>(requester: &R, name: &str, code: u64, payload: &mut [u8]) -> io::Result<()>
where
    R: DeviceRequester + ?Sized,
{
    let mut record = IfreqRecord::new(name, payload);
    let result = requester.request(code, record.as_mut_bytes());
    let len = payload.len();
    payload.copy_from_slice(&record.payload()[..len]);
    result
}
