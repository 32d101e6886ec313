//! Concurrency primitives for the write path.

use crossbeam_channel::{Receiver, RecvError, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::{Condvar, Mutex};
use std::time::Duration;
use tracing::debug;

use crate::{Result, TsdbeError};

/// Caps the number of concurrent writers.
///
/// Slots are tokens in a bounded channel: acquiring receives a token,
/// releasing sends it back.
pub struct WriteLimiter {
    slots: Receiver<()>,
    returns: Sender<()>,
    capacity: usize,
}

impl WriteLimiter {
    /// Creates a limiter with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (returns, slots) = bounded(capacity);
        for _ in 0..capacity {
            // Cannot fail: the channel was just created with this capacity.
            let _ = returns.send(());
        }

        Self {
            slots,
            returns,
            capacity,
        }
    }

    /// Takes a free slot right away, or waits up to `timeout` for one.
    pub fn acquire(&self, timeout: Duration) -> Result<WriteSlot<'_>> {
        match self.slots.try_recv() {
            Ok(()) => return Ok(WriteSlot { limiter: self }),
            Err(TryRecvError::Empty) => {}
            Err(TryRecvError::Disconnected) => {
                return Err(TsdbeError::ChannelReceive {
                    channel: "write_limiter".to_string(),
                });
            }
        }

        debug!(workers = self.capacity, "all write slots busy, waiting");
        match self.slots.recv_timeout(timeout) {
            Ok(()) => Ok(WriteSlot { limiter: self }),
            Err(RecvTimeoutError::Timeout) => Err(TsdbeError::WriteTimeout {
                timeout_ms: timeout.as_millis() as u64,
                workers: self.capacity,
            }),
            Err(RecvTimeoutError::Disconnected) => Err(RecvError.into()),
        }
    }

    /// Returns the worker budget.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Returns the number of free slots.
    pub fn available(&self) -> usize {
        self.slots.len()
    }

    fn release(&self) {
        let _ = self.returns.send(());
    }
}

/// A reserved write slot, returned to the limiter on drop.
pub struct WriteSlot<'a> {
    limiter: &'a WriteLimiter,
}

impl Drop for WriteSlot<'_> {
    fn drop(&mut self) {
        self.limiter.release();
    }
}

/// Counts in-flight operations so that a caller can wait for all of them.
///
/// Entering does not block and is not refused while someone is waiting.
#[derive(Default)]
pub struct InflightBarrier {
    count: Mutex<usize>,
    drained: Condvar,
}

impl InflightBarrier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers one in-flight operation until the guard is dropped.
    pub fn enter(&self) -> InflightGuard<'_> {
        *self.count.lock() += 1;
        InflightGuard { barrier: self }
    }

    /// Blocks until no operation is in flight.
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.drained.wait(&mut count);
        }
    }

    /// Number of operations currently in flight.
    pub fn in_flight(&self) -> usize {
        *self.count.lock()
    }

    fn leave(&self) {
        let mut count = self.count.lock();
        *count -= 1;
        if *count == 0 {
            self.drained.notify_all();
        }
    }
}

pub struct InflightGuard<'a> {
    barrier: &'a InflightBarrier,
}

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.barrier.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread;
    use std::time::Instant;

    #[test]
    fn limiter_hands_out_capacity_slots() {
        let limiter = WriteLimiter::new(2);
        assert_eq!(limiter.capacity(), 2);

        let first = limiter.acquire(Duration::ZERO).unwrap();
        let _second = limiter.acquire(Duration::ZERO).unwrap();
        assert_eq!(limiter.available(), 0);

        drop(first);
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn limiter_times_out_when_saturated() {
        let limiter = WriteLimiter::new(1);
        let _held = limiter.acquire(Duration::ZERO).unwrap();

        let started = Instant::now();
        let err = limiter
            .acquire(Duration::from_millis(50))
            .err()
            .expect("second acquire must fail");
        assert!(started.elapsed() >= Duration::from_millis(50));
        match err {
            TsdbeError::WriteTimeout {
                timeout_ms,
                workers,
            } => {
                assert_eq!(timeout_ms, 50);
                assert_eq!(workers, 1);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn limiter_waiter_gets_released_slot() {
        let limiter = Arc::new(WriteLimiter::new(1));
        let held = limiter.acquire(Duration::ZERO).unwrap();

        let waiter = {
            let limiter = Arc::clone(&limiter);
            thread::spawn(move || limiter.acquire(Duration::from_secs(5)).is_ok())
        };
        thread::sleep(Duration::from_millis(20));
        drop(held);

        assert!(waiter.join().unwrap());
        assert_eq!(limiter.available(), 1);
    }

    #[test]
    fn zero_capacity_defaults_to_one() {
        let limiter = WriteLimiter::new(0);
        assert_eq!(limiter.capacity(), 1);
        assert!(limiter.acquire(Duration::ZERO).is_ok());
    }

    #[test]
    fn barrier_wait_returns_immediately_when_idle() {
        let barrier = InflightBarrier::new();
        barrier.wait();
        assert_eq!(barrier.in_flight(), 0);
    }

    #[test]
    fn barrier_waits_for_in_flight_guards() {
        let barrier = Arc::new(InflightBarrier::new());
        let finished = Arc::new(AtomicBool::new(false));
        let (entered_tx, entered_rx) = crossbeam_channel::bounded(1);

        let worker = {
            let barrier = Arc::clone(&barrier);
            let finished = Arc::clone(&finished);
            thread::spawn(move || {
                let _guard = barrier.enter();
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                finished.store(true, Ordering::SeqCst);
            })
        };

        entered_rx.recv().unwrap();
        assert_eq!(barrier.in_flight(), 1);
        barrier.wait();
        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(barrier.in_flight(), 0);
        worker.join().unwrap();
    }
}
