//! Descriptor Lifecycle Guard
//!
//! Reference-counted access gate for the tunnel descriptor. Every operation
//! holds a [`Lease`] while it touches the descriptor; a close request flips
//! the guard into draining and the descriptor is physically closed by
//! whichever lease drop brings the in-flight count to zero.
//!
//! States:
//! - `Open`: not closed, any number of leases
//! - `Draining`: closed, leases still outstanding
//! - `Released`: closed, no leases, descriptor closed
//!
//! The mutex protects bookkeeping only. Reads, writes and requests run
//! outside the lock, so they are serialized against the close transition
//! and not against each other.

use std::ops::Deref;
use std::sync::{Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::traits::Descriptor;

/// Observable state of a guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Open,
    Draining,
    Released,
}

#[derive(Debug, Default)]
struct GuardState {
    in_flight: usize,
    closed: bool,
    released: bool,
}

/// Guards a descriptor against being closed while in use
pub struct LifecycleGuard<D: Descriptor> {
    descriptor: D,
    state: Mutex<GuardState>,
}

/// Proof that an operation holds the descriptor open.
///
/// Dropping the lease releases it, on every exit path.
pub struct Lease<'a, D: Descriptor> {
    guard: &'a LifecycleGuard<D>,
}

impl<D: Descriptor> LifecycleGuard<D> {
    /// Wrap a live descriptor
    pub fn new(descriptor: D) -> Self {
        Self {
            descriptor,
            state: Mutex::new(GuardState::default()),
        }
    }

    // A panic while holding the lock cannot leave the counters
    // half-updated, so a poisoned lock is still usable.
    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take a lease for operation `op`.
    ///
    /// Fails with `Error::Closed` once a close has been requested, even
    /// while earlier leases are still draining.
    pub fn retain(&self, op: &'static str) -> Result<Lease<'_, D>> {
        let mut state = self.state();
        if state.closed {
            return Err(Error::Closed { op });
        }
        state.in_flight += 1;
        Ok(Lease { guard: self })
    }

    fn release(&self) {
        let last = {
            let mut state = self.state();
            debug_assert!(state.in_flight > 0, "lease released twice");
            state.in_flight = state.in_flight.saturating_sub(1);

            let last = state.closed && state.in_flight == 0 && !state.released;
            if last {
                state.released = true;
            }
            last
        };

        // `released` is already set, so no other path can reach this close.
        if last {
            match self.descriptor.close() {
                Ok(()) => debug!("Tunnel descriptor released"),
                Err(e) => warn!("Failed to close tunnel descriptor: {}", e),
            }
        }
    }

    /// Request close.
    ///
    /// Runs under its own lease like any other operation, marks the guard
    /// closed and shuts the descriptor down so blocked readers wake up.
    /// The physical close happens when the last lease drops, which may be
    /// this call's own.
    pub fn request_close(&self, op: &'static str) -> Result<()> {
        let lease = self.retain(op)?;
        {
            let mut state = self.state();
            // Lost a race with a concurrent close request
            if state.closed {
                return Err(Error::Closed { op });
            }
            state.closed = true;
            debug!("Close requested with {} operation(s) in flight", state.in_flight - 1);
        }

        let result = lease
            .shutdown()
            .map_err(|source| Error::Shutdown { op, source });
        drop(lease);
        result
    }

    /// Current phase
    pub fn phase(&self) -> Phase {
        let state = self.state();
        match (state.closed, state.released) {
            (false, _) => Phase::Open,
            (true, false) => Phase::Draining,
            (true, true) => Phase::Released,
        }
    }

    /// Number of leases currently held
    pub fn in_flight(&self) -> usize {
        self.state().in_flight
    }

    /// Whether a close has been requested
    pub fn is_closed(&self) -> bool {
        self.state().closed
    }
}

impl<D: Descriptor> Drop for LifecycleGuard<D> {
    fn drop(&mut self) {
        // No lease can outlive the guard, so nothing is in flight here.
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if !state.released {
            state.released = true;
            if let Err(e) = self.descriptor.close() {
                warn!("Failed to close tunnel descriptor on drop: {}", e);
            }
        }
    }
}

impl<D: Descriptor> Deref for Lease<'_, D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.guard.descriptor
    }
}

impl<D: Descriptor> Drop for Lease<'_, D> {
    fn drop(&mut self) {
        self.guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::{mpsc, Arc};
    use std::thread;
    use std::time::Duration;

    #[derive(Default)]
    struct Counters {
        busy: AtomicUsize,
        closes: AtomicUsize,
        shutdowns: AtomicUsize,
        closed_while_busy: AtomicBool,
    }

    impl Counters {
        fn closes(&self) -> usize {
            self.closes.load(Ordering::SeqCst)
        }
    }

    /// Counts closes and flags any close that happens while work is running
    #[derive(Default, Clone)]
    struct CountingDescriptor(Arc<Counters>);

    impl Descriptor for CountingDescriptor {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn shutdown(&self) -> io::Result<()> {
            self.0.shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            if self.0.busy.load(Ordering::SeqCst) != 0 {
                self.0.closed_while_busy.store(true, Ordering::SeqCst);
            }
            self.0.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counted_guard() -> (LifecycleGuard<CountingDescriptor>, Arc<Counters>) {
        let descriptor = CountingDescriptor::default();
        let counters = descriptor.0.clone();
        (LifecycleGuard::new(descriptor), counters)
    }

    #[test]
    fn test_close_waits_for_outstanding_leases() {
        let (guard, counters) = counted_guard();

        let mut leases: Vec<_> = (0..3).map(|_| guard.retain("test").unwrap()).collect();
        assert_eq!(guard.in_flight(), 3);

        guard.request_close("close").unwrap();
        assert_eq!(guard.phase(), Phase::Draining);
        assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);

        while leases.len() > 1 {
            leases.pop();
            assert_eq!(counters.closes(), 0);
        }
        leases.pop();

        assert_eq!(counters.closes(), 1);
        assert_eq!(guard.phase(), Phase::Released);
        assert_eq!(guard.in_flight(), 0);
    }

    #[test]
    fn test_close_without_leases_releases_immediately() {
        let (guard, counters) = counted_guard();
        assert_eq!(guard.phase(), Phase::Open);

        guard.request_close("close").unwrap();

        assert_eq!(guard.phase(), Phase::Released);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_retain_fails_after_close_while_draining() {
        let (guard, counters) = counted_guard();
        let held = guard.retain("read packet").unwrap();

        guard.request_close("close").unwrap();

        let err = guard.retain("write packet").err().unwrap();
        assert!(matches!(err, Error::Closed { op: "write packet" }));
        assert!(matches!(guard.request_close("close"), Err(Error::Closed { .. })));

        drop(held);
        assert!(guard.retain("write packet").is_err());
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_drop_closes_unclosed_descriptor_once() {
        let (guard, counters) = counted_guard();
        drop(guard.retain("test").unwrap());
        assert_eq!(counters.closes(), 0);

        drop(guard);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_drop_after_release_does_not_double_close() {
        let (guard, counters) = counted_guard();
        guard.request_close("close").unwrap();
        assert_eq!(counters.closes(), 1);

        drop(guard);
        assert_eq!(counters.closes(), 1);
    }

    #[test]
    fn test_randomized_interleavings_close_exactly_once() {
        let mut rng = rand::thread_rng();

        for _ in 0..40 {
            let (guard, counters) = counted_guard();
            let retained = AtomicUsize::new(0);
            let released = AtomicUsize::new(0);
            let close_after = Duration::from_micros(rng.gen_range(0..300));

            thread::scope(|s| {
                for _ in 0..6 {
                    s.spawn(|| {
                        let mut rng = rand::thread_rng();
                        for _ in 0..500 {
                            let lease = match guard.retain("stress") {
                                Ok(lease) => lease,
                                Err(e) => {
                                    assert!(e.is_closed());
                                    return;
                                }
                            };
                            retained.fetch_add(1, Ordering::SeqCst);
                            counters.busy.fetch_add(1, Ordering::SeqCst);
                            if rng.gen_bool(0.2) {
                                thread::yield_now();
                            }
                            counters.busy.fetch_sub(1, Ordering::SeqCst);
                            released.fetch_add(1, Ordering::SeqCst);
                            drop(lease);
                        }
                    });
                }

                thread::sleep(close_after);
                guard.request_close("close").unwrap();
                assert!(guard.retain("after close").is_err());
            });

            assert_eq!(retained.load(Ordering::SeqCst), released.load(Ordering::SeqCst));
            assert_eq!(guard.phase(), Phase::Released);
            assert_eq!(guard.in_flight(), 0);
            assert_eq!(counters.closes(), 1);
            assert!(!counters.closed_while_busy.load(Ordering::SeqCst));
        }
    }

    #[test]
    fn test_concurrent_close_requests_succeed_once() {
        for _ in 0..50 {
            let (guard, counters) = counted_guard();
            let held = guard.retain("read packet").unwrap();

            let results: Vec<_> = thread::scope(|s| {
                let closers: Vec<_> = (0..4)
                    .map(|_| s.spawn(|| guard.request_close("close")))
                    .collect();
                closers.into_iter().map(|c| c.join().unwrap()).collect()
            });

            let succeeded = results.iter().filter(|r| r.is_ok()).count();
            assert_eq!(succeeded, 1);
            for result in results.iter().filter(|r| r.is_err()) {
                assert!(matches!(result, Err(Error::Closed { op: "close" })));
            }
            assert_eq!(counters.shutdowns.load(Ordering::SeqCst), 1);
            assert_eq!(counters.closes(), 0);

            drop(held);
            assert_eq!(counters.closes(), 1);
            assert_eq!(guard.phase(), Phase::Released);
        }
    }

    /// Blocks inside `close` until the test lets it continue
    struct GatedDescriptor {
        entered: Mutex<mpsc::Sender<()>>,
        proceed: Mutex<mpsc::Receiver<()>>,
    }

    impl Descriptor for GatedDescriptor {
        fn read(&self, _buf: &mut [u8]) -> io::Result<usize> {
            Ok(0)
        }

        fn write(&self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn shutdown(&self) -> io::Result<()> {
            Ok(())
        }

        fn close(&self) -> io::Result<()> {
            self.entered.lock().unwrap().send(()).unwrap();
            self.proceed
                .lock()
                .unwrap()
                .recv_timeout(Duration::from_secs(5))
                .unwrap();
            Ok(())
        }
    }

    #[test]
    fn test_descriptor_closes_outside_bookkeeping_lock() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (proceed_tx, proceed_rx) = mpsc::channel();
        let guard = LifecycleGuard::new(GatedDescriptor {
            entered: Mutex::new(entered_tx),
            proceed: Mutex::new(proceed_rx),
        });

        thread::scope(|s| {
            let closer = s.spawn(|| guard.request_close("close"));
            entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

            // close(2) is in progress on the other thread
            assert!(guard.state.try_lock().is_ok());
            assert_eq!(guard.phase(), Phase::Released);
            assert!(guard.retain("read packet").is_err());

            proceed_tx.send(()).unwrap();
            closer.join().unwrap().unwrap();
        });
    }
}
