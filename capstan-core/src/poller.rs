//! Readiness poller and timer schedule for engine threads.
//!
//! A thin wrapper over `poll(2)`. Registered descriptors carry an opaque
//! token that comes back with each readiness event, so the owning thread
//! can route events without the poller knowing anything about handlers.
//! Error and hangup conditions are folded into both readiness directions;
//! whoever acts on the event discovers the failure from the actual I/O
//! call, which is where it can be handled.
//!
//! [`Timers`] keeps the deadline schedule for the same thread. The thread
//! asks for the time budget until the next deadline, sleeps in the poller
//! for at most that long, then collects whatever expired.
//!
//! # Safety
//!
//! The single unsafe call hands the pollfd array to `poll(2)`. Registered
//! descriptors are borrowed, not owned; callers keep them open until they
//! deregister them.

#![allow(unsafe_code)]

use smallvec::SmallVec;
use std::collections::BTreeMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Readiness directions a registration asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    pub const READABLE: Self = Self {
        readable: true,
        writable: false,
    };
    pub const WRITABLE: Self = Self {
        readable: false,
        writable: true,
    };
    pub const BOTH: Self = Self {
        readable: true,
        writable: true,
    };
    pub const NONE: Self = Self {
        readable: false,
        writable: false,
    };

    fn events(self) -> libc::c_short {
        let mut events = 0;
        if self.readable {
            events |= libc::POLLIN;
        }
        if self.writable {
            events |= libc::POLLOUT;
        }
        events
    }
}

/// One readiness event delivered by [`Poller::wait`].
#[derive(Debug, Clone, Copy)]
pub struct Event {
    pub token: u32,
    pub readable: bool,
    pub writable: bool,
}

struct Entry {
    fd: RawFd,
    token: u32,
    interest: Interest,
}

/// Level-triggered descriptor poller.
pub struct Poller {
    entries: Vec<Entry>,
    pollfds: Vec<libc::pollfd>,
    load: Arc<AtomicUsize>,
}

impl Poller {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            pollfds: Vec::new(),
            load: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Shared registration count, used to pick the least busy thread when
    /// placing new connections.
    #[must_use]
    pub fn load_handle(&self) -> Arc<AtomicUsize> {
        Arc::clone(&self.load)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Register `fd` under `token`. The descriptor must stay open until
    /// [`Self::remove`].
    pub fn add(&mut self, fd: RawFd, token: u32, interest: Interest) {
        debug_assert!(
            self.entries.iter().all(|e| e.fd != fd),
            "descriptor registered twice"
        );
        self.entries.push(Entry {
            fd,
            token,
            interest,
        });
        self.load.fetch_add(1, Ordering::Relaxed);
    }

    /// Change the readiness directions `fd` is watched for.
    pub fn set_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.fd == fd) {
            entry.interest = interest;
        }
    }

    /// Deregister `fd`. Events already collected for it may still be
    /// delivered once; routing by token is expected to drop them.
    pub fn remove(&mut self, fd: RawFd) {
        if let Some(index) = self.entries.iter().position(|e| e.fd == fd) {
            self.entries.swap_remove(index);
            self.load.fetch_sub(1, Ordering::Relaxed);
        }
    }

    /// Wait up to `timeout` (`None` blocks indefinitely) and collect
    /// readiness events into `events`.
    pub fn wait(&mut self, timeout: Option<Duration>, events: &mut Vec<Event>) -> io::Result<()> {
        events.clear();
        self.pollfds.clear();
        self.pollfds.extend(self.entries.iter().map(|e| libc::pollfd {
            fd: e.fd,
            events: e.interest.events(),
            revents: 0,
        }));

        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            // Round up so sub-millisecond deadlines do not busy-spin.
            Some(d) => d
                .as_millis()
                .saturating_add(u128::from(d.subsec_nanos() % 1_000_000 != 0))
                .min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let rc = unsafe {
            libc::poll(
                self.pollfds.as_mut_ptr(),
                self.pollfds.len() as libc::nfds_t,
                timeout_ms,
            )
        };
        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                // The caller re-evaluates timers and polls again.
                return Ok(());
            }
            return Err(err);
        }

        for (pfd, entry) in self.pollfds.iter().zip(&self.entries) {
            if pfd.revents == 0 {
                continue;
            }
            let failed = pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0;
            events.push(Event {
                token: entry.token,
                readable: pfd.revents & libc::POLLIN != 0 || failed,
                writable: pfd.revents & libc::POLLOUT != 0 || failed,
            });
        }
        Ok(())
    }
}

impl Default for Poller {
    fn default() -> Self {
        Self::new()
    }
}

/// Deadline schedule keyed by expiry instant, with an insertion sequence
/// number breaking ties so equal deadlines fire in registration order.
pub struct Timers {
    entries: BTreeMap<(Instant, u64), TimerKey>,
    seq: u64,
}

/// Identifies a timer to its owner: which registration it belongs to and
/// which of the owner's timers it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerKey {
    pub token: u32,
    pub id: u32,
}

impl Timers {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
            seq: 0,
        }
    }

    /// Schedule timer `id` for `token` to fire after `after`.
    pub fn add(&mut self, after: Duration, token: u32, id: u32) {
        let key = (Instant::now() + after, self.seq);
        self.seq += 1;
        self.entries.insert(key, TimerKey { token, id });
    }

    /// Drop a scheduled timer. Missing timers are ignored; cancelling an
    /// already fired timer is the common case.
    pub fn cancel(&mut self, token: u32, id: u32) {
        self.entries
            .retain(|_, timer| !(timer.token == token && timer.id == id));
    }

    /// Drop every timer belonging to `token`.
    pub fn cancel_all(&mut self, token: u32) {
        self.entries.retain(|_, timer| timer.token != token);
    }

    /// Time budget until the next deadline. `None` means sleep freely.
    #[must_use]
    pub fn next_timeout(&self, now: Instant) -> Option<Duration> {
        self.entries
            .keys()
            .next()
            .map(|(deadline, _)| deadline.saturating_duration_since(now))
    }

    /// Remove and return every timer whose deadline has passed.
    pub fn collect_expired(&mut self, now: Instant) -> SmallVec<[TimerKey; 4]> {
        let mut expired = SmallVec::new();
        while let Some((&key, _)) = self.entries.first_key_value() {
            if key.0 > now {
                break;
            }
            if let Some(timer) = self.entries.remove(&key) {
                expired.push(timer);
            }
        }
        expired
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for Timers {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaler::Signaler;

    #[test]
    fn reports_readable_when_data_arrives() {
        let signaler = Signaler::new().unwrap();
        let mut poller = Poller::new();
        let mut events = Vec::new();
        poller.add(signaler.fd(), 7, Interest::READABLE);

        poller
            .wait(Some(Duration::from_millis(10)), &mut events)
            .unwrap();
        assert!(events.is_empty());

        signaler.send().unwrap();
        poller
            .wait(Some(Duration::from_millis(100)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].token, 7);
        assert!(events[0].readable);
    }

    #[test]
    fn removed_descriptor_goes_quiet() {
        let signaler = Signaler::new().unwrap();
        let mut poller = Poller::new();
        let mut events = Vec::new();
        poller.add(signaler.fd(), 1, Interest::READABLE);
        signaler.send().unwrap();

        poller
            .wait(Some(Duration::from_millis(100)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);

        poller.remove(signaler.fd());
        assert!(poller.is_empty());
        poller
            .wait(Some(Duration::from_millis(10)), &mut events)
            .unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn interest_changes_take_effect() {
        let signaler = Signaler::new().unwrap();
        let mut poller = Poller::new();
        let mut events = Vec::new();
        poller.add(signaler.fd(), 3, Interest::NONE);
        signaler.send().unwrap();

        poller
            .wait(Some(Duration::from_millis(10)), &mut events)
            .unwrap();
        assert!(events.is_empty(), "no interest, no events");

        poller.set_interest(signaler.fd(), Interest::READABLE);
        poller
            .wait(Some(Duration::from_millis(100)), &mut events)
            .unwrap();
        assert_eq!(events.len(), 1);
    }

    #[test]
    fn load_follows_registrations() {
        let a = Signaler::new().unwrap();
        let b = Signaler::new().unwrap();
        let mut poller = Poller::new();
        let load = poller.load_handle();
        poller.add(a.fd(), 1, Interest::READABLE);
        poller.add(b.fd(), 2, Interest::READABLE);
        assert_eq!(load.load(Ordering::Relaxed), 2);
        poller.remove(a.fd());
        assert_eq!(load.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn timers_fire_in_deadline_order() {
        let mut timers = Timers::new();
        timers.add(Duration::from_millis(30), 1, 0);
        timers.add(Duration::from_millis(10), 2, 0);
        timers.add(Duration::from_millis(20), 3, 0);

        let now = Instant::now();
        assert!(timers.next_timeout(now).unwrap() <= Duration::from_millis(10));

        let later = now + Duration::from_millis(50);
        let fired = timers.collect_expired(later);
        let order: Vec<u32> = fired.iter().map(|t| t.token).collect();
        assert_eq!(order, vec![2, 3, 1]);
        assert!(timers.is_empty());
    }

    #[test]
    fn equal_deadlines_fire_in_insertion_order() {
        let mut timers = Timers::new();
        timers.add(Duration::from_millis(5), 9, 0);
        timers.add(Duration::from_millis(5), 9, 1);
        let fired = timers.collect_expired(Instant::now() + Duration::from_millis(10));
        let ids: Vec<u32> = fired.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }

    #[test]
    fn cancelled_timer_stays_silent() {
        let mut timers = Timers::new();
        timers.add(Duration::from_millis(5), 1, 0);
        timers.add(Duration::from_millis(5), 1, 1);
        timers.cancel(1, 0);
        let fired = timers.collect_expired(Instant::now() + Duration::from_millis(10));
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].id, 1);

        timers.add(Duration::from_millis(5), 2, 0);
        timers.cancel_all(2);
        assert!(timers.is_empty());
    }

    #[test]
    fn expired_timers_stop_contributing_to_timeout() {
        let mut timers = Timers::new();
        timers.add(Duration::from_millis(1), 1, 0);
        timers.add(Duration::from_secs(60), 1, 1);
        std::thread::sleep(Duration::from_millis(5));
        let now = Instant::now();
        assert_eq!(timers.collect_expired(now).len(), 1);
        let next = timers.next_timeout(now).unwrap();
        assert!(next > Duration::from_secs(50));
    }
}
