//! Single-producer single-consumer pipe with batched publication.
//!
//! The writer accumulates elements in a [`YQueue`](crate::yqueue::YQueue)
//! and publishes them in batches by advancing a single shared atomic. The
//! reader prefetches that limit once per batch, so steady-state transfer
//! touches the atomic once per batch on each side rather than once per
//! element.
//!
//! The same atomic doubles as the sleep handshake. When the reader finds
//! the pipe drained it parks a sentinel in the atomic and stops polling;
//! the next flush observes the sentinel, publishes anyway and returns
//! `false`, which tells the caller the reader must be woken out of band
//! (see [`crate::signaler`]).
//!
//! # Safety
//!
//! The queue's cursor state is split between a writing and a reading role.
//! This module is the one place that shares a queue between two threads; it
//! is sound because the writer half only ever pushes and unpushes while the
//! reader half only ever pops positions the flush protocol has published to
//! it, with the release/acquire pair on the shared atomic ordering the two.

#![allow(unsafe_code)]

use crate::yqueue::YQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Parked in the shared atomic while the reader is asleep.
const SENTINEL: u64 = u64::MAX;

struct Shared<T, const N: usize> {
    queue: YQueue<T, N>,
    /// Position up to which the reader may read, or [`SENTINEL`] while the
    /// reader is asleep.
    limit: AtomicU64,
}

// One writer handle and one reader handle exist per pipe. The writer only
// calls push/unpush (back cursor), the reader only calls pop/front (begin
// cursor) on positions below the published limit.
unsafe impl<T: Send, const N: usize> Send for Shared<T, N> {}
unsafe impl<T: Send, const N: usize> Sync for Shared<T, N> {}

/// Writing half of a pipe.
pub struct YPipeWriter<T, const N: usize> {
    shared: Arc<Shared<T, N>>,
    /// First position not yet published to the reader.
    flush_from: u64,
    /// Position up to which elements are complete and may be published.
    flush_to: u64,
}

/// Reading half of a pipe.
pub struct YPipeReader<T, const N: usize> {
    shared: Arc<Shared<T, N>>,
    /// Prefetched publication limit.
    read_to: u64,
}

/// Create a connected writer/reader pair.
#[must_use]
pub fn ypipe<T: Send, const N: usize>() -> (YPipeWriter<T, N>, YPipeReader<T, N>) {
    let shared = Arc::new(Shared {
        queue: YQueue::new(),
        limit: AtomicU64::new(0),
    });
    (
        YPipeWriter {
            shared: Arc::clone(&shared),
            flush_from: 0,
            flush_to: 0,
        },
        YPipeReader {
            shared,
            read_to: 0,
        },
    )
}

impl<T: Send, const N: usize> YPipeWriter<T, N> {
    /// Append `value` to the pipe without publishing it.
    ///
    /// With `incomplete` set the element is held back past the next flush
    /// as well, so a multi-element record never becomes visible half way.
    pub fn write(&mut self, value: T, incomplete: bool) {
        self.shared.queue.push(value);
        if !incomplete {
            self.flush_to = self.shared.queue.back_pos();
        }
    }

    /// Pop the most recently written element back out of the pipe, if it
    /// has not been marked complete yet. Used to roll back a partially
    /// written record.
    pub fn unwrite(&mut self) -> Option<T> {
        if self.shared.queue.back_pos() == self.flush_to {
            return None;
        }
        Some(unsafe { self.shared.queue.unpush() })
    }

    /// Publish all complete elements to the reader.
    ///
    /// Returns `false` when the reader had gone to sleep in the meantime:
    /// the elements are published regardless, but the caller must deliver
    /// a wakeup or the reader will never look.
    #[must_use = "a false return means the reader is asleep and must be woken"]
    pub fn flush(&mut self) -> bool {
        if self.flush_from == self.flush_to {
            return true;
        }
        match self.shared.limit.compare_exchange(
            self.flush_from,
            self.flush_to,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                self.flush_from = self.flush_to;
                true
            }
            Err(observed) => {
                // Only the sleep sentinel can be in the slot here: the
                // reader parks it exactly when it has consumed everything
                // published so far, which is our flush_from.
                debug_assert_eq!(observed, SENTINEL);
                self.shared.limit.store(self.flush_to, Ordering::Release);
                self.flush_from = self.flush_to;
                false
            }
        }
    }
}

impl<T: Send, const N: usize> YPipeReader<T, N> {
    /// Check whether at least one element is readable.
    ///
    /// A `false` return means the reader is now registered as asleep and
    /// will stay silent until the writer's next flush reports that a
    /// wakeup is due.
    pub fn check_read(&mut self) -> bool {
        let front = self.shared.queue.front_pos();
        if front < self.read_to {
            return true;
        }
        match self.shared.limit.compare_exchange(
            front,
            SENTINEL,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Nothing published beyond what we consumed; we are asleep.
            Ok(_) => {
                self.read_to = front;
                false
            }
            Err(published) => {
                if published == SENTINEL {
                    // Still asleep from an earlier check.
                    return false;
                }
                self.read_to = published;
                true
            }
        }
    }

    /// Read the next element, if one is available.
    pub fn read(&mut self) -> Option<T> {
        if !self.check_read() {
            return None;
        }
        Some(unsafe { self.shared.queue.pop() })
    }

    /// Apply `f` to the next readable element without consuming it.
    /// Returns `false` if the pipe has nothing to read.
    pub fn probe(&mut self, f: impl FnOnce(&T) -> bool) -> bool {
        if !self.check_read() {
            return false;
        }
        f(unsafe { self.shared.queue.front() })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::thread;

    type Pair = (YPipeWriter<u64, 16>, YPipeReader<u64, 16>);

    #[test]
    fn flush_publishes_batches() {
        let (mut tx, mut rx): Pair = ypipe();
        tx.write(1, false);
        tx.write(2, false);
        assert!(rx.read().is_none(), "unflushed elements must stay hidden");

        // The reader is asleep now, so the flush must ask for a wakeup.
        assert!(!tx.flush());
        assert_eq!(rx.read(), Some(1));
        assert_eq!(rx.read(), Some(2));
        assert!(rx.read().is_none());
    }

    #[test]
    fn flush_before_first_check_needs_no_wakeup() {
        let (mut tx, mut rx): Pair = ypipe();
        tx.write(7, false);
        assert!(tx.flush(), "reader never slept, no wakeup due");
        assert!(rx.check_read());
        assert_eq!(rx.read(), Some(7));
    }

    #[test]
    fn incomplete_elements_are_held_back() {
        let (mut tx, mut rx): Pair = ypipe();
        tx.write(1, true);
        tx.write(2, true);
        assert!(tx.flush(), "nothing complete, flush is a no-op");
        assert!(rx.read().is_none());

        tx.write(3, false);
        let _ = tx.flush();
        assert_eq!(rx.read(), Some(1));
        assert_eq!(rx.read(), Some(2));
        assert_eq!(rx.read(), Some(3));
    }

    #[test]
    fn unwrite_rolls_back_incomplete_tail() {
        let (mut tx, mut rx): Pair = ypipe();
        tx.write(1, false);
        tx.write(2, true);
        tx.write(3, true);
        assert_eq!(tx.unwrite(), Some(3));
        assert_eq!(tx.unwrite(), Some(2));
        assert_eq!(tx.unwrite(), None, "complete elements stay put");
        let _ = tx.flush();
        assert_eq!(rx.read(), Some(1));
        assert!(rx.read().is_none());
    }

    #[test]
    fn repeated_sleep_checks_are_stable() {
        let (mut tx, mut rx): Pair = ypipe();
        assert!(!rx.check_read());
        assert!(!rx.check_read(), "second check while asleep stays false");
        tx.write(5, false);
        assert!(!tx.flush(), "reader was asleep");
        assert!(rx.check_read());
        assert_eq!(rx.read(), Some(5));
    }

    #[test]
    fn probe_sees_without_consuming() {
        let (mut tx, mut rx): Pair = ypipe();
        tx.write(11, false);
        let _ = tx.flush();
        assert!(rx.probe(|v| *v == 11));
        assert_eq!(rx.read(), Some(11));
        assert!(!rx.probe(|_| true));
    }

    #[test]
    fn two_thread_transfer_keeps_order() {
        const COUNT: u64 = 100_000;
        let (mut tx, mut rx): Pair = ypipe();
        let done = AtomicBool::new(false);

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..COUNT {
                    tx.write(i, false);
                    if i % 7 == 0 {
                        let _ = tx.flush();
                    }
                }
                let _ = tx.flush();
                done.store(true, Ordering::SeqCst);
            });

            let mut expected = 0u64;
            loop {
                match rx.read() {
                    Some(v) => {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                    None => {
                        if done.load(Ordering::SeqCst) {
                            // Writer finished; drain whatever it published
                            // after our last look.
                            while let Some(v) = rx.read() {
                                assert_eq!(v, expected);
                                expected += 1;
                            }
                            break;
                        }
                        std::hint::spin_loop();
                    }
                }
            }
            assert_eq!(expected, COUNT);
        });
    }

    #[test]
    fn two_thread_transfer_with_rollbacks() {
        const RECORDS: u64 = 20_000;
        let (mut tx, mut rx): Pair = ypipe();

        thread::scope(|s| {
            s.spawn(|| {
                for i in 0..RECORDS {
                    // Start a record, abandon it, then write the real one.
                    tx.write(i * 1000, true);
                    assert_eq!(tx.unwrite(), Some(i * 1000));
                    tx.write(i, false);
                    let _ = tx.flush();
                }
            });

            let mut expected = 0u64;
            while expected < RECORDS {
                match rx.read() {
                    Some(v) => {
                        assert_eq!(v, expected);
                        expected += 1;
                    }
                    None => std::hint::spin_loop(),
                }
            }
        });
    }
}
