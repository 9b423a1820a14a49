//! The I/O thread reactor.
//!
//! Each I/O thread runs one [`IoThread::run`] loop driving a set of
//! [`IoHandler`]s (listeners, connecters, sessions with their engines)
//! keyed by object id. One pass of the loop waits for readiness or the
//! next timer deadline, drains the command mailbox completely (installing
//! newly plugged handlers as they arrive, so commands queued right behind
//! a plug still find their handler), dispatches descriptor events and
//! expired timers, and finally applies the plug and retire requests the
//! handlers queued while running.
//!
//! Handlers never touch the poller or timer wheel directly between
//! callbacks; everything they need during a callback arrives through
//! [`IoCtx`], which also buffers structural changes (new handlers,
//! retirements) so the handler table is never mutated mid-dispatch.

use crate::command::{Command, CommandKind, Dest, ObjectId, Target};
use crate::ctx::CtxShared;
use capstan_core::mailbox::Mailbox;
use capstan_core::poller::{Event, Interest, Poller, Timers};
use hashbrown::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Poller token of the thread's own command mailbox.
const MAILBOX_TOKEN: u32 = 0;

/// An object living on an I/O thread.
///
/// Callbacks receive an [`IoCtx`] scoped to the running thread; a handler
/// that wants to go away calls [`IoCtx::retire`] with its own id and is
/// dropped once the current dispatch pass finishes.
pub(crate) trait IoHandler: Send {
    /// Called once, on the I/O thread, after the handler is inserted.
    fn plug(&mut self, io: &mut IoCtx<'_>);

    /// A command addressed to this handler's object id.
    fn process(&mut self, io: &mut IoCtx<'_>, cmd: CommandKind);

    /// Readiness on a descriptor registered under this handler's id.
    fn io_event(&mut self, io: &mut IoCtx<'_>, readable: bool, writable: bool);

    /// A timer registered under this handler's id expired.
    fn timer_event(&mut self, io: &mut IoCtx<'_>, timer_id: u32);
}

/// Per-callback view of the owning I/O thread.
pub(crate) struct IoCtx<'a> {
    pub(crate) tid: u32,
    pub(crate) ctx: &'a Arc<CtxShared>,
    pub(crate) poller: &'a mut Poller,
    pub(crate) timers: &'a mut Timers,
    plugs: &'a mut Vec<(ObjectId, Box<dyn IoHandler>)>,
    retired: &'a mut Vec<ObjectId>,
}

impl IoCtx<'_> {
    /// Send a command to any object in the context.
    pub(crate) fn send(&self, dest: Dest, kind: CommandKind) {
        self.ctx.send_command(Command::new(dest, kind));
    }

    /// Queue a handler for insertion on this thread once the current
    /// dispatch pass finishes.
    pub(crate) fn plug(&mut self, id: ObjectId, handler: Box<dyn IoHandler>) {
        self.plugs.push((id, handler));
    }

    /// Queue a handler for removal. The handler must already have
    /// deregistered its descriptors.
    pub(crate) fn retire(&mut self, id: ObjectId) {
        self.retired.push(id);
    }
}

/// One reactor thread: a poller, a timer wheel and a table of handlers.
pub(crate) struct IoThread {
    tid: u32,
    ctx: Arc<CtxShared>,
    mailbox: Mailbox<Command>,
    poller: Poller,
}

impl IoThread {
    pub(crate) fn new(
        tid: u32,
        ctx: Arc<CtxShared>,
        mailbox: Mailbox<Command>,
        poller: Poller,
    ) -> Self {
        Self {
            tid,
            ctx,
            mailbox,
            poller,
        }
    }

    pub(crate) fn run(self) {
        let IoThread {
            tid,
            ctx,
            mut mailbox,
            mut poller,
        } = self;
        let mut handlers: HashMap<ObjectId, Box<dyn IoHandler>> = HashMap::new();
        let mut timers = Timers::new();
        let mut events: Vec<Event> = Vec::new();
        let mut stopping = false;

        poller.add(mailbox.signal_fd(), MAILBOX_TOKEN, Interest::READABLE);
        tracing::debug!(tid, "[IoThread] running");

        loop {
            let timeout = timers.next_timeout(Instant::now());
            if let Err(err) = poller.wait(timeout, &mut events) {
                tracing::warn!(tid, %err, "[IoThread] poll failed");
                continue;
            }

            let mut plugs: Vec<(ObjectId, Box<dyn IoHandler>)> = Vec::new();
            let mut retired: Vec<ObjectId> = Vec::new();

            // Commands first: they may retire the very handlers the
            // collected events point at.
            loop {
                let cmd = match mailbox.recv(Some(Duration::ZERO)) {
                    Ok(Some(cmd)) => cmd,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(tid, %err, "[IoThread] mailbox failure");
                        break;
                    }
                };
                match (cmd.dest.target, cmd.kind) {
                    (Target::Thread, CommandKind::Stop) => stopping = true,
                    // Plugged inline: commands for the new handler may sit
                    // right behind its Plug in this same drain.
                    (Target::Thread, CommandKind::Plug { id, mut handler }) => {
                        let mut io = IoCtx {
                            tid,
                            ctx: &ctx,
                            poller: &mut poller,
                            timers: &mut timers,
                            plugs: &mut plugs,
                            retired: &mut retired,
                        };
                        handler.plug(&mut io);
                        handlers.insert(id, handler);
                        tracing::trace!(tid, id, "[IoThread] handler plugged");
                    }
                    (Target::Object(id), kind) => {
                        let mut io = IoCtx {
                            tid,
                            ctx: &ctx,
                            poller: &mut poller,
                            timers: &mut timers,
                            plugs: &mut plugs,
                            retired: &mut retired,
                        };
                        match handlers.get_mut(&id) {
                            Some(handler) => handler.process(&mut io, kind),
                            None => tracing::trace!(
                                tid,
                                id,
                                kind = kind.name(),
                                "[IoThread] command for retired object"
                            ),
                        }
                    }
                    (target, kind) => tracing::trace!(
                        tid,
                        ?target,
                        kind = kind.name(),
                        "[IoThread] unroutable command"
                    ),
                }
            }

            for event in &events {
                if event.token == MAILBOX_TOKEN || retired.contains(&event.token) {
                    continue;
                }
                if let Some(handler) = handlers.get_mut(&event.token) {
                    let mut io = IoCtx {
                        tid,
                        ctx: &ctx,
                        poller: &mut poller,
                        timers: &mut timers,
                        plugs: &mut plugs,
                        retired: &mut retired,
                    };
                    handler.io_event(&mut io, event.readable, event.writable);
                }
            }

            for key in timers.collect_expired(Instant::now()) {
                if retired.contains(&key.token) {
                    continue;
                }
                if let Some(handler) = handlers.get_mut(&key.token) {
                    let mut io = IoCtx {
                        tid,
                        ctx: &ctx,
                        poller: &mut poller,
                        timers: &mut timers,
                        plugs: &mut plugs,
                        retired: &mut retired,
                    };
                    handler.timer_event(&mut io, key.id);
                }
            }

            apply_pending(tid, &ctx, &mut poller, &mut timers, &mut handlers, plugs, retired);

            if stopping {
                if !handlers.is_empty() {
                    tracing::warn!(
                        tid,
                        leftover = handlers.len(),
                        "[IoThread] stopping with handlers still plugged"
                    );
                }
                break;
            }
        }
        tracing::debug!(tid, "[IoThread] stopped");
    }
}

/// Standalone poller/timer/queue set for driving handlers without a
/// reactor thread.
#[cfg(test)]
pub(crate) struct TestReactor {
    pub(crate) ctx: Arc<CtxShared>,
    pub(crate) poller: Poller,
    pub(crate) timers: Timers,
    plugs: Vec<(ObjectId, Box<dyn IoHandler>)>,
    retired: Vec<ObjectId>,
}

#[cfg(test)]
impl TestReactor {
    pub(crate) fn new(ctx: Arc<CtxShared>) -> Self {
        Self {
            ctx,
            poller: Poller::new(),
            timers: Timers::new(),
            plugs: Vec::new(),
            retired: Vec::new(),
        }
    }

    pub(crate) fn io(&mut self, tid: u32) -> IoCtx<'_> {
        IoCtx {
            tid,
            ctx: &self.ctx,
            poller: &mut self.poller,
            timers: &mut self.timers,
            plugs: &mut self.plugs,
            retired: &mut self.retired,
        }
    }

    pub(crate) fn retired(&self) -> &[ObjectId] {
        &self.retired
    }

    pub(crate) fn take_plugs(&mut self) -> Vec<(ObjectId, Box<dyn IoHandler>)> {
        std::mem::take(&mut self.plugs)
    }
}

/// Insert queued handlers (running their `plug` callbacks) and remove
/// retired ones, repeating until neither list grows.
fn apply_pending(
    tid: u32,
    ctx: &Arc<CtxShared>,
    poller: &mut Poller,
    timers: &mut Timers,
    handlers: &mut HashMap<ObjectId, Box<dyn IoHandler>>,
    mut plugs: Vec<(ObjectId, Box<dyn IoHandler>)>,
    mut retired: Vec<ObjectId>,
) {
    while !plugs.is_empty() || !retired.is_empty() {
        for id in std::mem::take(&mut retired) {
            if handlers.remove(&id).is_some() {
                timers.cancel_all(id);
                tracing::trace!(tid, id, "[IoThread] handler retired");
            }
        }
        for (id, mut handler) in std::mem::take(&mut plugs) {
            let mut io = IoCtx {
                tid,
                ctx,
                poller: &mut *poller,
                timers: &mut *timers,
                plugs: &mut plugs,
                retired: &mut retired,
            };
            handler.plug(&mut io);
            handlers.insert(id, handler);
            tracing::trace!(tid, id, "[IoThread] handler plugged");
        }
    }
}
