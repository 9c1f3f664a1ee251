//! # Mock Tunnel Backends
//!
//! In-memory stand-ins for the tunnel descriptor and the device-request
//! socket, for tests that cannot create a real interface.
//!
//! - [`MockDescriptor`]: scripted reads (frames or errors), reads that block
//!   until data arrives or the descriptor is shut down, write capture,
//!   short writes, close counting
//! - [`MockRequester`]: keeps MTU and address state keyed by request code,
//!   records every request it sees, injectable failures
//!
//! Both are cheap handles over shared state: keep a clone to inspect the
//! mock after moving the other into a device.
//!
//! ```ignore
//! use utunnel::config::TunnelConfig;
//! use utunnel::mock::{MockDescriptor, MockRequester};
//! use utunnel::UtunDevice;
//!
//! let config = TunnelConfig::default();
//! let descriptor = MockDescriptor::new();
//! let requester = MockRequester::new(config.requests);
//! let tun = UtunDevice::from_parts("utun9", descriptor.clone(), requester.clone(), config);
//!
//! tun.set_mtu(1400).unwrap();
//! assert_eq!(tun.mtu().unwrap(), 1400);
//! assert_eq!(requester.calls().len(), 2);
//! ```

use std::collections::{HashMap, VecDeque};
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use byteorder::{ByteOrder, NativeEndian};

use crate::config::RequestCodes;
use crate::ifreq::{IFNAMSIZ, SOCKADDR_IN_LEN};
use crate::packet;
use crate::traits::{Descriptor, DeviceRequester};

// ============================================
// MockDescriptor
// ============================================

#[derive(Default)]
struct DescriptorState {
    reads: VecDeque<io::Result<Vec<u8>>>,
    written: Vec<Vec<u8>>,
    write_limit: Option<usize>,
    shut_down: bool,
    closes: usize,
    blocked_readers: usize,
}

#[derive(Default)]
struct DescriptorInner {
    state: Mutex<DescriptorState>,
    changed: Condvar,
}

/// Mock tunnel descriptor
#[derive(Clone, Default)]
pub struct MockDescriptor {
    inner: Arc<DescriptorInner>,
}

impl MockDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, DescriptorState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push_read(&self, read: io::Result<Vec<u8>>) {
        self.state().reads.push_back(read);
        self.inner.changed.notify_all();
    }

    /// Queue a raw frame (header included) for the next read
    pub fn push_frame(&self, frame: Vec<u8>) {
        self.push_read(Ok(frame));
    }

    /// Queue a packet, framed with `family`
    pub fn push_packet(&self, family: u32, packet: &[u8]) {
        self.push_read(Ok(packet::frame(family, packet)));
    }

    /// Queue an error for the next read
    pub fn push_error(&self, err: io::Error) {
        self.push_read(Err(err));
    }

    /// Frames written so far, clearing the capture
    pub fn take_written(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut self.state().written)
    }

    /// Accept at most `max` bytes per write
    pub fn limit_writes(&self, max: usize) {
        self.state().write_limit = Some(max);
    }

    pub fn is_shut_down(&self) -> bool {
        self.state().shut_down
    }

    pub fn close_count(&self) -> usize {
        self.state().closes
    }

    /// Wait until some thread is parked inside `read`
    pub fn wait_for_blocked_reader(&self, timeout: Duration) -> bool {
        let state = self.state();
        let (state, _) = self
            .inner
            .changed
            .wait_timeout_while(state, timeout, |s| s.blocked_readers == 0)
            .unwrap_or_else(PoisonError::into_inner);
        state.blocked_readers > 0
    }
}

impl Descriptor for MockDescriptor {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut state = self.state();
        loop {
            if state.closes > 0 {
                return Err(io::Error::from_raw_os_error(libc::EBADF));
            }
            if let Some(next) = state.reads.pop_front() {
                return next.map(|frame| {
                    let n = frame.len().min(buf.len());
                    buf[..n].copy_from_slice(&frame[..n]);
                    n
                });
            }
            if state.shut_down {
                return Ok(0);
            }

            state.blocked_readers += 1;
            self.inner.changed.notify_all();
            state = self
                .inner
                .changed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
            state.blocked_readers -= 1;
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state();
        if state.closes > 0 || state.shut_down {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }
        let n = state.write_limit.map_or(buf.len(), |max| max.min(buf.len()));
        state.written.push(buf[..n].to_vec());
        Ok(n)
    }

    fn shutdown(&self) -> io::Result<()> {
        self.state().shut_down = true;
        self.inner.changed.notify_all();
        Ok(())
    }

    fn close(&self) -> io::Result<()> {
        self.state().closes += 1;
        self.inner.changed.notify_all();
        Ok(())
    }
}

// ============================================
// MockRequester
// ============================================

/// One request as the mock received it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub code: u64,
    pub record: Vec<u8>,
}

impl RecordedRequest {
    /// Interface name carried in the record
    pub fn name(&self) -> String {
        crate::control::parse_interface_name(&self.record[..IFNAMSIZ])
    }

    pub fn payload(&self) -> &[u8] {
        &self.record[IFNAMSIZ..]
    }
}

type SockaddrBytes = [u8; SOCKADDR_IN_LEN];

struct RequesterState {
    codes: RequestCodes,
    mtu: u32,
    local: Option<SockaddrBytes>,
    dest: Option<SockaddrBytes>,
    mask: Option<SockaddrBytes>,
    calls: Vec<RecordedRequest>,
    failures: HashMap<u64, i32>,
}

/// Mock device-request backend that echoes stored interface state
#[derive(Clone)]
pub struct MockRequester {
    inner: Arc<Mutex<RequesterState>>,
}

impl MockRequester {
    /// New mock with MTU 1500 and no addresses
    pub fn new(codes: RequestCodes) -> Self {
        Self {
            inner: Arc::new(Mutex::new(RequesterState {
                codes,
                mtu: 1500,
                local: None,
                dest: None,
                mask: None,
                calls: Vec::new(),
                failures: HashMap::new(),
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, RequesterState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Make every request with `code` fail with `errno`
    pub fn fail_with(&self, code: u64, errno: i32) {
        self.state().failures.insert(code, errno);
    }

    /// Every request seen so far, in order
    pub fn calls(&self) -> Vec<RecordedRequest> {
        self.state().calls.clone()
    }

    pub fn mtu(&self) -> u32 {
        self.state().mtu
    }
}

fn copy_out(slot: &Option<SockaddrBytes>, payload: &mut [u8]) -> io::Result<()> {
    match slot {
        Some(addr) => {
            payload[..SOCKADDR_IN_LEN].copy_from_slice(addr);
            Ok(())
        }
        None => Err(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL)),
    }
}

fn sockaddr_at(payload: &[u8], index: usize) -> SockaddrBytes {
    let mut addr = [0u8; SOCKADDR_IN_LEN];
    let start = index * SOCKADDR_IN_LEN;
    addr.copy_from_slice(&payload[start..start + SOCKADDR_IN_LEN]);
    addr
}

impl DeviceRequester for MockRequester {
    fn request(&self, code: u64, record: &mut [u8]) -> io::Result<()> {
        let mut state = self.state();
        state.calls.push(RecordedRequest {
            code,
            record: record.to_vec(),
        });
        if let Some(&errno) = state.failures.get(&code) {
            return Err(io::Error::from_raw_os_error(errno));
        }

        let codes = state.codes;
        let payload = &mut record[IFNAMSIZ..];

        if code == codes.get_mtu {
            NativeEndian::write_u32(&mut payload[..4], state.mtu);
        } else if code == codes.set_mtu {
            state.mtu = NativeEndian::read_u32(&payload[..4]);
        } else if code == codes.get_addr {
            copy_out(&state.local, payload)?;
        } else if code == codes.get_dst_addr {
            copy_out(&state.dest, payload)?;
        } else if code == codes.get_netmask {
            copy_out(&state.mask, payload)?;
        } else if code == codes.delete_addr {
            if state.local.take().is_none() {
                return Err(io::Error::from_raw_os_error(libc::EADDRNOTAVAIL));
            }
            state.dest = None;
            state.mask = None;
        } else if code == codes.add_addr {
            state.local = Some(sockaddr_at(payload, 0));
            state.dest = Some(sockaddr_at(payload, 1));
            state.mask = Some(sockaddr_at(payload, 2));
        } else {
            return Err(io::Error::from_raw_os_error(libc::ENOTTY));
        }
        Ok(())
    }
}
