//! File-descriptor based wakeup primitive.
//!
//! A signaler carries wakeup tokens between threads: the sending side adds
//! a token, the receiving side consumes one, and the receiving side can
//! poll or block on a file descriptor until a token arrives. Exposing the
//! descriptor is the point: it lets a mailbox wakeup sit in the same
//! `poll()` set as the network sockets an I/O thread is watching.
//!
//! On Linux the tokens live in an `eventfd` in semaphore mode, which is a
//! single descriptor and a single syscall per operation. Other Unix
//! platforms fall back to a connected socket pair carrying one byte per
//! token.
//!
//! # Safety
//!
//! Unsafe code is limited to `poll(2)` on the signaler's own descriptor,
//! which stays valid for the lifetime of `self`.

#![allow(unsafe_code)]

use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::time::Duration;

#[cfg(target_os = "linux")]
use nix::sys::eventfd::{EfdFlags, EventFd};
#[cfg(not(target_os = "linux"))]
use std::io::{Read, Write};
#[cfg(not(target_os = "linux"))]
use std::os::unix::net::UnixStream;

/// One-way token channel with a pollable receive side.
#[derive(Debug)]
pub struct Signaler {
    #[cfg(target_os = "linux")]
    event: EventFd,
    #[cfg(not(target_os = "linux"))]
    tx: UnixStream,
    #[cfg(not(target_os = "linux"))]
    rx: UnixStream,
}

impl Signaler {
    pub fn new() -> io::Result<Self> {
        #[cfg(target_os = "linux")]
        {
            let event = EventFd::from_flags(
                EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_SEMAPHORE,
            )?;
            Ok(Self { event })
        }
        #[cfg(not(target_os = "linux"))]
        {
            let (tx, rx) = UnixStream::pair()?;
            tx.set_nonblocking(true)?;
            rx.set_nonblocking(true)?;
            Ok(Self { tx, rx })
        }
    }

    /// Descriptor that becomes readable while tokens are pending.
    #[must_use]
    pub fn fd(&self) -> RawFd {
        #[cfg(target_os = "linux")]
        {
            self.event.as_fd().as_raw_fd()
        }
        #[cfg(not(target_os = "linux"))]
        {
            self.rx.as_raw_fd()
        }
    }

    /// Deliver one wakeup token.
    pub fn send(&self) -> io::Result<()> {
        #[cfg(target_os = "linux")]
        loop {
            match self.event.arm() {
                Ok(_) => return Ok(()),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        #[cfg(not(target_os = "linux"))]
        loop {
            match (&self.tx).write(&[1u8]) {
                Ok(_) => return Ok(()),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // A full buffer already holds more than enough tokens to
                // wake the receiver.
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e),
            }
        }
    }

    /// Consume one token if any is pending. Never blocks.
    pub fn try_recv(&self) -> io::Result<bool> {
        #[cfg(target_os = "linux")]
        loop {
            match self.event.read() {
                Ok(_) => return Ok(true),
                Err(nix::errno::Errno::EAGAIN) => return Ok(false),
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        #[cfg(not(target_os = "linux"))]
        {
            let mut token = [0u8; 1];
            loop {
                match (&self.rx).read(&mut token) {
                    Ok(0) => return Ok(false),
                    Ok(_) => return Ok(true),
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }
        }
    }

    /// Wait until a token is pending or the timeout elapses. `None` waits
    /// indefinitely. Returns whether a token is pending.
    pub fn wait(&self, timeout: Option<Duration>) -> io::Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd(),
            events: libc::POLLIN,
            revents: 0,
        };
        let timeout_ms: libc::c_int = match timeout {
            None => -1,
            Some(d) => d.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            return Ok(rc > 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn tokens_are_counted() {
        let s = Signaler::new().unwrap();
        assert!(!s.try_recv().unwrap());
        s.send().unwrap();
        s.send().unwrap();
        s.send().unwrap();
        assert!(s.try_recv().unwrap());
        assert!(s.try_recv().unwrap());
        assert!(s.try_recv().unwrap());
        assert!(!s.try_recv().unwrap());
    }

    #[test]
    fn wait_times_out_when_idle() {
        let s = Signaler::new().unwrap();
        assert!(!s.wait(Some(Duration::from_millis(10))).unwrap());
    }

    #[test]
    fn wait_sees_pending_token() {
        let s = Signaler::new().unwrap();
        s.send().unwrap();
        assert!(s.wait(Some(Duration::from_millis(0))).unwrap());
        assert!(s.try_recv().unwrap());
    }

    #[test]
    fn wakes_a_waiting_thread() {
        let s = Arc::new(Signaler::new().unwrap());
        let waker = Arc::clone(&s);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            waker.send().unwrap();
        });
        assert!(s.wait(Some(Duration::from_secs(5))).unwrap());
        assert!(s.try_recv().unwrap());
        handle.join().unwrap();
    }
}
