//! The reaper thread.
//!
//! A closed socket still has work to do: pipes to drain and terminate,
//! children on I/O threads to shut down. Instead of blocking the user
//! thread, [`Socket::close`] ships the socket core here and returns. The
//! reaper polls each adopted core's mailbox descriptor, lets the core
//! process its remaining commands, and destroys it once it reports dead.
//!
//! A core that cannot finish inside its linger budget is force-closed:
//! its pipes and child records are dropped outright, trading undelivered
//! messages for a bounded shutdown.
//!
//! [`Socket::close`]: crate::socket::Socket::close

use crate::command::{Command, CommandKind, Dest, Target};
use crate::ctx::{CtxShared, TERM_TID};
use crate::socket::SocketCore;
use capstan_core::mailbox::Mailbox;
use capstan_core::poller::{Event, Interest, Poller, Timers};
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

const MAILBOX_TOKEN: u32 = 0;
/// Timer id for a core's linger deadline (token = the core's tid).
const LINGER_TIMER: u32 = 1;
/// Headroom past the linger deadline for the termination handshakes,
/// which need a command round trip per pipe even when there is nothing
/// left to drain.
const ACK_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct Reaper {
    ctx: Arc<CtxShared>,
    mailbox: Mailbox<Command>,
    poller: Poller,
    timers: Timers,
    cores: HashMap<u32, Box<SocketCore>>,
    terminating: bool,
}

impl Reaper {
    pub(crate) fn new(ctx: Arc<CtxShared>, mailbox: Mailbox<Command>) -> Self {
        Self {
            ctx,
            mailbox,
            poller: Poller::new(),
            timers: Timers::new(),
            cores: HashMap::new(),
            terminating: false,
        }
    }

    pub(crate) fn run(mut self) {
        tracing::debug!("[Reaper] running");
        self.poller
            .add(self.mailbox.signal_fd(), MAILBOX_TOKEN, Interest::READABLE);
        let mut events: Vec<Event> = Vec::new();

        loop {
            let timeout = self.timers.next_timeout(Instant::now());
            if let Err(err) = self.poller.wait(timeout, &mut events) {
                tracing::warn!(%err, "[Reaper] poll failed");
                continue;
            }

            loop {
                let cmd = match self.mailbox.recv(Some(Duration::ZERO)) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(%err, "[Reaper] mailbox failure");
                        break;
                    }
                };
                match (cmd.dest.target, cmd.kind) {
                    (Target::Thread, CommandKind::Stop) => self.terminating = true,
                    (Target::Thread, CommandKind::Reap { core }) => self.adopt(core),
                    (target, kind) => tracing::trace!(
                        ?target,
                        kind = kind.name(),
                        "[Reaper] unroutable command"
                    ),
                }
            }

            let tokens: Vec<u32> = events
                .iter()
                .map(|e| e.token)
                .filter(|t| *t != MAILBOX_TOKEN)
                .collect();
            for tid in tokens {
                self.drive(tid);
            }

            for key in self.timers.collect_expired(Instant::now()) {
                if key.id != LINGER_TIMER {
                    continue;
                }
                if let Some(core) = self.cores.get_mut(&key.token) {
                    tracing::debug!(tid = key.token, "[Reaper] linger expired, force closing");
                    core.force_close();
                    self.drive(key.token);
                }
            }

            if self.terminating && self.cores.is_empty() {
                self.ctx
                    .send_command(Command::new(Dest::thread(TERM_TID), CommandKind::Done));
                break;
            }
        }
        tracing::debug!("[Reaper] stopped");
    }

    /// Take ownership of a closed socket core.
    fn adopt(&mut self, mut core: Box<SocketCore>) {
        let tid = core.tid();
        tracing::debug!(tid, "[Reaper] core adopted");
        core.process_pending();
        if core.is_dead() {
            drop(core);
            self.ctx.destroy_socket(tid);
            return;
        }
        self.poller.add(core.signal_fd(), tid, Interest::READABLE);
        // The sessions police the linger deadline themselves; the grace
        // on top covers their termination handshakes so the force-close
        // only catches peers that went silent.
        let budget = core.linger().unwrap_or(Duration::ZERO) + ACK_GRACE;
        self.timers.add(budget, tid, LINGER_TIMER);
        self.cores.insert(tid, core);
    }

    /// Let a core drain its mailbox, destroying it once dead.
    fn drive(&mut self, tid: u32) {
        let Some(core) = self.cores.get_mut(&tid) else {
            return;
        };
        core.process_pending();
        if core.is_dead() {
            let core = match self.cores.remove(&tid) {
                Some(core) => core,
                None => return,
            };
            self.poller.remove(core.signal_fd());
            self.timers.cancel_all(tid);
            drop(core);
            self.ctx.destroy_socket(tid);
        }
    }
}
