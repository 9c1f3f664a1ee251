//! utunnel - Kernel-Control Tunnel Interfaces
//!
//! Creates a virtual point-to-point network interface through the kernel
//! control socket and gives the owning process packet-level access to it,
//! plus control over its MTU and IPv4 addressing.
//!
//! # Architecture
//!
//! - `control`: the kernel-control handshake that provisions the interface
//! - `packet`: framed packet reads and writes over the tunnel descriptor
//! - `configure`: MTU and address get/set through legacy device requests
//! - `lifecycle`: the reference-counted guard that lets I/O, configuration
//!   and close run concurrently without double-closing the descriptor
//!
//! # Example
//!
//! ```no_run
//! use std::net::{IpAddr, Ipv4Addr};
//! use utunnel::UtunDevice;
//!
//! # fn main() -> utunnel::Result<()> {
//! let tun = UtunDevice::open()?;
//! tun.set_mtu(1400)?;
//! tun.set_addresses(
//!     IpAddr::V4(Ipv4Addr::new(10, 8, 0, 1)),
//!     IpAddr::V4(Ipv4Addr::new(10, 8, 0, 2)),
//!     &[255, 255, 255, 0],
//! )?;
//!
//! let packet = tun.read_packet()?;
//! println!("{} bytes from {}", packet.len(), tun.name());
//! tun.close()?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod configure;
pub mod control;
pub mod device;
pub mod error;
pub mod ifreq;
pub mod lifecycle;
pub mod packet;
pub mod sys;
pub mod traits;

#[cfg(any(test, feature = "mock"))]
pub mod mock;

pub use config::TunnelConfig;
pub use configure::InterfaceAddressSet;
pub use device::UtunDevice;
pub use error::{Error, Result};
pub use traits::Tunnel;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::{ControlConfig, RequestCodes, TunnelConfig};
    pub use crate::configure::InterfaceAddressSet;
    pub use crate::device::UtunDevice;
    pub use crate::error::{Error, Result};
    pub use crate::lifecycle::Phase;
    pub use crate::traits::{Descriptor, DeviceRequester, Tunnel};
}
