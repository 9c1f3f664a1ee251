//! Tunnel Device
//!
//! [`UtunDevice`] is the handle a caller owns: the kernel-assigned
//! interface name, the descriptor behind its lifecycle guard, and the
//! backend used for configuration requests. Packet I/O lives in
//! [`crate::packet`], MTU and addressing in [`crate::configure`].

use std::fmt;
use std::net::IpAddr;

use tracing::{debug, info, warn};

use crate::config::TunnelConfig;
use crate::configure::InterfaceAddressSet;
use crate::control::ControlSocket;
use crate::error::Result;
use crate::lifecycle::{LifecycleGuard, Phase};
use crate::packet;
use crate::sys::{ControlFd, InetRequester};
use crate::traits::{Descriptor, DeviceRequester, Tunnel};

/// A tunnel interface and the descriptor that keeps it alive.
///
/// The interface disappears when the descriptor is closed, either through
/// [`close`](Self::close) once in-flight calls drain, or when the handle is
/// dropped.
pub struct UtunDevice<D: Descriptor = ControlFd, R: DeviceRequester = InetRequester> {
    name: String,
    guard: LifecycleGuard<D>,
    requester: R,
    config: TunnelConfig,
}

impl UtunDevice {
    /// Create a new tunnel interface with the default (Darwin) constants
    pub fn open() -> Result<Self> {
        Self::open_with(&TunnelConfig::default())
    }

    /// Create a new tunnel interface.
    ///
    /// The kernel picks the interface name; read it back with
    /// [`name`](Self::name). Requires root.
    pub fn open_with(config: &TunnelConfig) -> Result<Self> {
        config.validate()?;

        if !nix::unistd::Uid::effective().is_root() {
            warn!("Creating a tunnel without root privileges, the kernel will likely refuse");
        }

        let socket = ControlSocket::open(&config.control)?;
        let control_id = socket.resolve_control_id(&config.control)?;
        socket.connect(&config.control, control_id)?;
        let name = socket.fetch_assigned_name(&config.control)?;

        info!("Created tunnel interface {}", name);
        Ok(Self::from_parts(name, socket.into_descriptor(), InetRequester, config.clone()))
    }
}

impl<D: Descriptor, R: DeviceRequester> UtunDevice<D, R> {
    /// Assemble a device from an already provisioned descriptor
    pub fn from_parts(name: impl Into<String>, descriptor: D, requester: R, config: TunnelConfig) -> Self {
        Self {
            name: name.into(),
            guard: LifecycleGuard::new(descriptor),
            requester,
            config,
        }
    }

    /// Kernel-assigned interface name
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &TunnelConfig {
        &self.config
    }

    /// Lifecycle phase of the underlying descriptor
    pub fn phase(&self) -> Phase {
        self.guard.phase()
    }

    pub(crate) fn guard(&self) -> &LifecycleGuard<D> {
        &self.guard
    }

    pub(crate) fn requester(&self) -> &R {
        &self.requester
    }

    /// Read one packet, without its frame header
    pub fn read_packet(&self) -> Result<Vec<u8>> {
        packet::read_packet(&self.guard)
    }

    /// Write one packet, tagged as IPv4
    pub fn write_packet(&self, packet: &[u8]) -> Result<()> {
        packet::write_packet(&self.guard, u32::from(self.config.inet_family), packet)
    }

    /// Request close.
    ///
    /// Wakes blocked readers with `Error::Closed`; the descriptor itself is
    /// closed when the last in-flight call returns. A second close fails
    /// with `Error::Closed`.
    pub fn close(&self) -> Result<()> {
        debug!("Closing tunnel interface {}", self.name);
        self.guard.request_close("close")
    }
}

impl<D: Descriptor, R: DeviceRequester> fmt::Debug for UtunDevice<D, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UtunDevice")
            .field("name", &self.name)
            .field("phase", &self.guard.phase())
            .field("in_flight", &self.guard.in_flight())
            .finish()
    }
}

impl<D: Descriptor, R: DeviceRequester> Tunnel for UtunDevice<D, R> {
    fn name(&self) -> &str {
        UtunDevice::name(self)
    }

    fn read_packet(&self) -> Result<Vec<u8>> {
        UtunDevice::read_packet(self)
    }

    fn write_packet(&self, packet: &[u8]) -> Result<()> {
        UtunDevice::write_packet(self, packet)
    }

    fn mtu(&self) -> Result<u32> {
        UtunDevice::mtu(self)
    }

    fn set_mtu(&self, mtu: u32) -> Result<()> {
        UtunDevice::set_mtu(self, mtu)
    }

    fn addresses(&self) -> Result<InterfaceAddressSet> {
        UtunDevice::addresses(self)
    }

    fn set_addresses(&self, local: IpAddr, dest: IpAddr, mask: &[u8]) -> Result<()> {
        UtunDevice::set_addresses(self, local, dest, mask)
    }

    fn close(&self) -> Result<()> {
        UtunDevice::close(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mock::{MockDescriptor, MockRequester};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn mock_device() -> (UtunDevice<MockDescriptor, MockRequester>, MockDescriptor) {
        let config = TunnelConfig::default();
        let descriptor = MockDescriptor::new();
        let requester = MockRequester::new(config.requests);
        (
            UtunDevice::from_parts("utun4", descriptor.clone(), requester, config),
            descriptor,
        )
    }

    #[test]
    fn test_name_and_framing() {
        let (device, descriptor) = mock_device();
        assert_eq!(device.name(), "utun4");

        device.write_packet(&[0x45, 0, 0, 20]).unwrap();
        assert_eq!(descriptor.take_written(), vec![vec![0, 0, 0, 2, 0x45, 0, 0, 20]]);

        descriptor.push_packet(2, &[0x45, 1, 2, 3]);
        assert_eq!(device.read_packet().unwrap(), vec![0x45, 1, 2, 3]);
    }

    #[test]
    fn test_close_unblocks_pending_read() {
        let (device, descriptor) = mock_device();
        let device = Arc::new(device);

        let reader = {
            let device = Arc::clone(&device);
            thread::spawn(move || device.read_packet())
        };

        assert!(descriptor.wait_for_blocked_reader(Duration::from_secs(5)));
        device.close().unwrap();

        let result = reader.join().unwrap();
        assert!(matches!(result, Err(Error::Closed { op: "read packet" })));
        assert!(descriptor.is_shut_down());
        assert_eq!(descriptor.close_count(), 1);
        assert_eq!(device.phase(), Phase::Released);
    }

    #[test]
    fn test_close_is_deferred_until_reads_drain() {
        let (device, descriptor) = mock_device();
        let device = Arc::new(device);

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let device = Arc::clone(&device);
                thread::spawn(move || device.read_packet())
            })
            .collect();
        assert!(descriptor.wait_for_blocked_reader(Duration::from_secs(5)));

        device.close().unwrap();
        for reader in readers {
            assert!(reader.join().unwrap().unwrap_err().is_closed());
        }

        assert_eq!(descriptor.close_count(), 1);
        assert!(matches!(device.close(), Err(Error::Closed { op: "close" })));
        assert!(matches!(device.write_packet(&[0x45]), Err(Error::Closed { .. })));
        assert_eq!(descriptor.close_count(), 1);
    }

    #[test]
    fn test_drop_releases_descriptor() {
        let (device, descriptor) = mock_device();
        drop(device);
        assert_eq!(descriptor.close_count(), 1);

        let (device, descriptor) = mock_device();
        device.close().unwrap();
        drop(device);
        assert_eq!(descriptor.close_count(), 1);
    }

    #[test]
    fn test_usable_as_trait_object() {
        let (device, descriptor) = mock_device();
        let tunnel: Box<dyn Tunnel> = Box::new(device);

        tunnel.set_mtu(1280).unwrap();
        assert_eq!(tunnel.mtu().unwrap(), 1280);
        tunnel.write_packet(&[0x45]).unwrap();
        assert_eq!(descriptor.take_written().len(), 1);
        assert_eq!(tunnel.name(), "utun4");

        tunnel.close().unwrap();
        assert!(tunnel.read_packet().unwrap_err().is_closed());
    }

    #[test]
    fn test_debug_output() {
        let (device, _descriptor) = mock_device();
        let debug = format!("{:?}", device);
        assert!(debug.contains("utun4"));
        assert!(debug.contains("Open"));
    }

    #[cfg(not(target_os = "macos"))]
    #[test]
    fn test_open_fails_without_kernel_control() {
        assert!(matches!(
            UtunDevice::open(),
            Err(Error::Creation { op: "open control socket", .. })
        ));
    }
}
