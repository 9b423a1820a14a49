//! Many-writer command mailbox with a pollable wakeup.
//!
//! Each engine thread owns one mailbox. Any thread may send into it; the
//! owning thread drains it. Sends go through a small mutex-serialized
//! [`ypipe`](crate::ypipe), so the receive path stays lock-free and a
//! sender only pays the wakeup syscall when the receiver has actually gone
//! to sleep.
//!
//! The receiving side alternates between an active and a passive state.
//! While active it reads straight from the pipe. When the pipe runs dry it
//! turns passive and parks on the signaler; the sender whose flush caught
//! the receiver parked delivers exactly one token, which the receiver
//! consumes on its way back to active. One token per sleep, no matter how
//! many commands pile up in between.

use crate::signaler::Signaler;
use crate::ypipe::{ypipe, YPipeReader, YPipeWriter};
use parking_lot::Mutex;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Elements per mailbox storage chunk. Command traffic is sparse, so the
/// chunks are much smaller than message pipe chunks.
pub const COMMAND_PIPE_GRANULARITY: usize = 16;

struct SendSide<T: Send> {
    writer: Mutex<YPipeWriter<T, COMMAND_PIPE_GRANULARITY>>,
    signaler: Arc<Signaler>,
}

/// Cloneable sending half of a mailbox.
pub struct MailboxSender<T: Send> {
    inner: Arc<SendSide<T>>,
}

impl<T: Send> Clone for MailboxSender<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send> MailboxSender<T> {
    /// Deliver `value` to the owning thread, waking it if it is parked.
    pub fn send(&self, value: T) {
        let awake = {
            let mut writer = self.inner.writer.lock();
            writer.write(value, false);
            writer.flush()
        };
        if !awake {
            if let Err(err) = self.inner.signaler.send() {
                tracing::error!(?err, "mailbox wakeup failed");
            }
        }
    }
}

/// Receiving half of a mailbox, owned by a single thread.
pub struct Mailbox<T: Send> {
    reader: YPipeReader<T, COMMAND_PIPE_GRANULARITY>,
    signaler: Arc<Signaler>,
    /// True while commands may be pending without a fresh wakeup token.
    active: bool,
}

/// Create a connected sender/receiver pair.
pub fn mailbox<T: Send>() -> io::Result<(MailboxSender<T>, Mailbox<T>)> {
    let (writer, reader) = ypipe();
    let signaler = Arc::new(Signaler::new()?);
    let sender = MailboxSender {
        inner: Arc::new(SendSide {
            writer: Mutex::new(writer),
            signaler: Arc::clone(&signaler),
        }),
    };
    let receiver = Mailbox {
        reader,
        signaler,
        active: false,
    };
    Ok((sender, receiver))
}

impl<T: Send> Mailbox<T> {
    /// Descriptor that becomes readable when a parked mailbox gets traffic.
    /// Poll it alongside I/O sources, then drain with a zero timeout.
    #[must_use]
    pub fn signal_fd(&self) -> RawFd {
        self.signaler.fd()
    }

    /// Receive the next command, waiting up to `timeout` (`None` waits
    /// indefinitely). Returns `Ok(None)` if the timeout elapses first.
    pub fn recv(&mut self, timeout: Option<Duration>) -> io::Result<Option<T>> {
        if self.active {
            if let Some(value) = self.reader.read() {
                return Ok(Some(value));
            }
            self.active = false;
        }
        if !self.signaler.wait(timeout)? {
            return Ok(None);
        }
        let consumed = self.signaler.try_recv()?;
        debug_assert!(consumed, "poll reported a token that is not there");
        self.active = true;
        Ok(self.reader.read())
    }
}
