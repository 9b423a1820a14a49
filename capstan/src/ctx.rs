//! Context: the shared state every socket and I/O thread hangs off.
//!
//! A [`Context`] owns a slot table mapping thread ids to mailbox senders.
//! Slot 0 is the termination mailbox read by whoever calls
//! [`Context::terminate`], slot 1 the reaper, slots 2..2+N the I/O
//! threads, and everything above that is handed to sockets as they are
//! created. Any thread can deliver a command to any other by id through
//! [`CtxShared::send_command`]; commands to a retired slot are dropped,
//! which keeps stale traffic from a dead socket harmless.
//!
//! Termination mirrors socket reaping: the first terminator flags the
//! context, tells every live socket to stop, and parks on the termination
//! mailbox until the reaper has destroyed the last core and reports
//! `Done`. Only then are the I/O threads stopped and joined, so in-flight
//! pipe handshakes always have a live peer.

use crate::command::{Command, CommandKind, Dest, ObjectId};
use crate::io_thread::IoThread;
use crate::reaper::Reaper;
use crate::socket::Socket;
use bytes::Bytes;
use capstan_core::error::EngineError;
use capstan_core::mailbox::{mailbox, Mailbox, MailboxSender};
use capstan_core::poller::Poller;
use capstan_core::socket_type::SocketType;
use hashbrown::HashMap;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Slot of the mailbox drained by `Context::terminate`.
pub(crate) const TERM_TID: u32 = 0;
/// Slot of the reaper thread.
pub(crate) const REAPER_TID: u32 = 1;
/// First I/O thread slot; sockets start above the I/O threads.
pub(crate) const FIRST_IO_TID: u32 = 2;

/// A socket's entry in the inproc name registry.
#[derive(Debug, Clone)]
pub(crate) struct InprocEntry {
    /// Where `Bind` commands carrying the binder's pipe end go.
    pub dest: Dest,
    pub socket_type: SocketType,
    pub recv_hwm: usize,
    pub send_hwm: usize,
    pub identity: Bytes,
}

/// State shared between user threads, I/O threads and the reaper.
pub(crate) struct CtxShared {
    slots: RwLock<Vec<Option<MailboxSender<Command>>>>,
    empty_slots: Mutex<Vec<u32>>,
    /// Live user sockets; entries leave at full destruction, not close.
    sockets: Mutex<Vec<u32>>,
    inproc: Mutex<HashMap<String, InprocEntry>>,
    terminating: AtomicBool,
    next_object_id: AtomicU32,
    io_loads: Vec<Arc<AtomicUsize>>,
    io_thread_count: u32,
    term_mailbox: Mutex<Mailbox<Command>>,
}

impl CtxShared {
    /// Deliver `cmd` to its destination's mailbox.
    ///
    /// Commands addressed to a retired slot are dropped: a destroyed
    /// socket may still be named by traffic that was in flight when it
    /// went away.
    pub(crate) fn send_command(&self, cmd: Command) {
        let slots = self.slots.read();
        match slots.get(cmd.dest.tid as usize).and_then(Option::as_ref) {
            Some(sender) => sender.send(cmd),
            None => {
                tracing::trace!(
                    dest = %cmd.dest,
                    kind = cmd.kind.name(),
                    "[Ctx] dropping command to retired slot"
                );
            }
        }
    }

    /// Fresh id for a handler or pipe endpoint. Never zero.
    pub(crate) fn next_object_id(&self) -> ObjectId {
        self.next_object_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn is_terminating(&self) -> bool {
        self.terminating.load(Ordering::SeqCst)
    }

    /// Pick the least loaded I/O thread allowed by `affinity` (bit N
    /// selects thread N; zero allows all).
    pub(crate) fn choose_io_thread(&self, affinity: u64) -> Result<u32, EngineError> {
        let mut best: Option<(u32, usize)> = None;
        for i in 0..self.io_thread_count {
            if affinity != 0 && (i >= 64 || affinity & (1u64 << i) == 0) {
                continue;
            }
            let load = self.io_loads[i as usize].load(Ordering::Relaxed);
            if best.map_or(true, |(_, l)| load < l) {
                best = Some((FIRST_IO_TID + i, load));
            }
        }
        best.map(|(tid, _)| tid)
            .ok_or(EngineError::ResourceExhausted("I/O threads"))
    }

    /// Claim a socket slot and wire its mailbox into the table.
    pub(crate) fn register_socket(&self) -> Result<(u32, Mailbox<Command>), EngineError> {
        if self.is_terminating() {
            return Err(EngineError::Terminated);
        }
        let tid = self
            .empty_slots
            .lock()
            .pop()
            .ok_or(EngineError::ResourceExhausted("socket slots"))?;
        let (sender, receiver) = mailbox()?;
        self.slots.write()[tid as usize] = Some(sender);
        self.sockets.lock().push(tid);
        tracing::debug!(tid, "[Ctx] socket slot claimed");
        Ok((tid, receiver))
    }

    /// Final teardown of a reaped socket, called from the reaper once its
    /// core has no children or pipes left.
    pub(crate) fn destroy_socket(&self, tid: u32) {
        self.slots.write()[tid as usize] = None;
        self.empty_slots.lock().push(tid);
        let last = {
            let mut sockets = self.sockets.lock();
            sockets.retain(|t| *t != tid);
            sockets.is_empty()
        };
        tracing::debug!(tid, "[Ctx] socket destroyed");
        if last && self.is_terminating() {
            self.send_command(Command::new(Dest::thread(REAPER_TID), CommandKind::Stop));
        }
    }

    pub(crate) fn register_inproc(&self, name: &str, entry: InprocEntry) -> Result<(), EngineError> {
        let mut registry = self.inproc.lock();
        if registry.contains_key(name) {
            return Err(EngineError::AddressInUse(format!("inproc://{name}")));
        }
        registry.insert(name.to_owned(), entry);
        Ok(())
    }

    pub(crate) fn unregister_inproc(&self, name: &str) {
        self.inproc.lock().remove(name);
    }

    pub(crate) fn lookup_inproc(&self, name: &str) -> Option<InprocEntry> {
        self.inproc.lock().get(name).cloned()
    }

    /// Bare context for driving components by hand: `slot_count` mailboxes
    /// are registered starting at slot 0 and their receivers returned. No
    /// threads run.
    #[cfg(test)]
    pub(crate) fn for_tests(slot_count: usize) -> (Arc<Self>, Vec<Mailbox<Command>>) {
        let mut slots = Vec::with_capacity(slot_count);
        let mut receivers = Vec::with_capacity(slot_count);
        for _ in 0..slot_count {
            let (sender, receiver) = mailbox().unwrap();
            slots.push(Some(sender));
            receivers.push(receiver);
        }
        let (_unused_tx, term_rx) = mailbox().unwrap();
        let shared = Arc::new(Self {
            slots: RwLock::new(slots),
            empty_slots: Mutex::new(Vec::new()),
            sockets: Mutex::new(Vec::new()),
            inproc: Mutex::new(HashMap::new()),
            terminating: AtomicBool::new(false),
            next_object_id: AtomicU32::new(1),
            io_loads: Vec::new(),
            io_thread_count: 0,
            term_mailbox: Mutex::new(term_rx),
        });
        (shared, receivers)
    }
}

/// Configuration for a [`Context`].
#[derive(Debug, Clone)]
pub struct ContextBuilder {
    io_threads: usize,
    max_sockets: usize,
}

impl Default for ContextBuilder {
    fn default() -> Self {
        Self {
            io_threads: num_cpus::get(),
            max_sockets: 1024,
        }
    }
}

impl ContextBuilder {
    /// Number of I/O threads to run. Zero is legal for inproc-only use.
    #[must_use]
    pub fn io_threads(mut self, count: usize) -> Self {
        self.io_threads = count;
        self
    }

    /// Maximum number of concurrently open sockets.
    #[must_use]
    pub fn max_sockets(mut self, count: usize) -> Self {
        self.max_sockets = count;
        self
    }

    /// Spawn the I/O threads and reaper and hand back the context.
    pub fn build(self) -> Result<Context, EngineError> {
        let io_threads = u32::try_from(self.io_threads)
            .map_err(|_| EngineError::ResourceExhausted("I/O thread count"))?;
        let total_slots = FIRST_IO_TID as usize + io_threads as usize + self.max_sockets;

        let (term_sender, term_receiver) = mailbox()?;
        let (reaper_sender, reaper_receiver) = mailbox()?;
        let mut io_parts = Vec::with_capacity(io_threads as usize);
        let mut io_loads = Vec::with_capacity(io_threads as usize);
        for _ in 0..io_threads {
            let (sender, receiver) = mailbox()?;
            let poller = Poller::new();
            io_loads.push(poller.load_handle());
            io_parts.push((sender, receiver, poller));
        }

        let mut slots: Vec<Option<MailboxSender<Command>>> = (0..total_slots).map(|_| None).collect();
        slots[TERM_TID as usize] = Some(term_sender);
        slots[REAPER_TID as usize] = Some(reaper_sender);
        for (i, (sender, _, _)) in io_parts.iter().enumerate() {
            slots[FIRST_IO_TID as usize + i] = Some(sender.clone());
        }
        // Pop order hands out the lowest free socket slot first.
        let first_socket = FIRST_IO_TID + io_threads;
        let empty_slots: Vec<u32> = (first_socket..total_slots as u32).rev().collect();

        let shared = Arc::new(CtxShared {
            slots: RwLock::new(slots),
            empty_slots: Mutex::new(empty_slots),
            sockets: Mutex::new(Vec::new()),
            inproc: Mutex::new(HashMap::new()),
            terminating: AtomicBool::new(false),
            next_object_id: AtomicU32::new(1),
            io_loads,
            io_thread_count: io_threads,
            term_mailbox: Mutex::new(term_receiver),
        });

        let mut handles = ThreadHandles {
            io: Vec::with_capacity(io_threads as usize),
            reaper: None,
        };
        let reaper = Reaper::new(Arc::clone(&shared), reaper_receiver);
        match std::thread::Builder::new()
            .name("capstan-reaper".into())
            .spawn(move || reaper.run())
        {
            Ok(handle) => handles.reaper = Some(handle),
            Err(err) => return Err(err.into()),
        }
        for (i, (_, receiver, poller)) in io_parts.into_iter().enumerate() {
            let tid = FIRST_IO_TID + i as u32;
            let io_thread = IoThread::new(tid, Arc::clone(&shared), receiver, poller);
            match std::thread::Builder::new()
                .name(format!("capstan-io-{i}"))
                .spawn(move || io_thread.run())
            {
                Ok(handle) => handles.io.push(handle),
                Err(err) => {
                    abandon_threads(&shared, &mut handles);
                    return Err(err.into());
                }
            }
        }

        tracing::debug!(
            io_threads,
            max_sockets = self.max_sockets,
            "[Ctx] context started"
        );
        let guard = Arc::new(TermGuard {
            shared: Arc::clone(&shared),
            threads: Mutex::new(handles),
            done: Mutex::new(false),
        });
        Ok(Context { shared, guard })
    }
}

/// Stop whatever threads came up before a spawn failure.
fn abandon_threads(shared: &Arc<CtxShared>, handles: &mut ThreadHandles) {
    for i in 0..handles.io.len() {
        shared.send_command(Command::new(
            Dest::thread(FIRST_IO_TID + i as u32),
            CommandKind::Stop,
        ));
    }
    shared.send_command(Command::new(Dest::thread(REAPER_TID), CommandKind::Stop));
    for handle in handles.io.drain(..) {
        let _ = handle.join();
    }
    if let Some(handle) = handles.reaper.take() {
        let _ = handle.join();
    }
}

struct ThreadHandles {
    io: Vec<JoinHandle<()>>,
    reaper: Option<JoinHandle<()>>,
}

/// Joins the service threads when the last handle goes away.
pub(crate) struct TermGuard {
    shared: Arc<CtxShared>,
    threads: Mutex<ThreadHandles>,
    done: Mutex<bool>,
}

impl TermGuard {
    fn terminate(&self) -> Result<(), EngineError> {
        // Concurrent terminators queue up here and observe `done`.
        let mut done = self.done.lock();
        if *done {
            return Ok(());
        }
        self.shared.terminating.store(true, Ordering::SeqCst);

        let live: Vec<u32> = self.shared.sockets.lock().clone();
        tracing::debug!(sockets = live.len(), "[Ctx] terminating");
        if live.is_empty() {
            self.shared
                .send_command(Command::new(Dest::thread(REAPER_TID), CommandKind::Stop));
        } else {
            for tid in live {
                self.shared
                    .send_command(Command::new(Dest::socket(tid), CommandKind::Stop));
            }
        }

        // Reaper reports Done once the last socket core is destroyed.
        {
            let mut term = self.shared.term_mailbox.lock();
            loop {
                match term.recv(None)? {
                    Some(cmd) if matches!(cmd.kind, CommandKind::Done) => break,
                    Some(_) | None => {}
                }
            }
        }

        for i in 0..self.shared.io_thread_count {
            self.shared
                .send_command(Command::new(Dest::thread(FIRST_IO_TID + i), CommandKind::Stop));
        }
        let mut handles = self.threads.lock();
        for handle in handles.io.drain(..) {
            let _ = handle.join();
        }
        if let Some(handle) = handles.reaper.take() {
            let _ = handle.join();
        }
        *done = true;
        tracing::debug!("[Ctx] context terminated");
        Ok(())
    }
}

impl Drop for TermGuard {
    fn drop(&mut self) {
        let _ = self.terminate();
    }
}

/// Handle to a running engine instance.
///
/// Cheap to clone; all clones refer to the same I/O thread pool and
/// socket table. The context shuts down when [`terminate`] is called or
/// the last handle (including those held by open sockets) is dropped.
///
/// [`terminate`]: Context::terminate
#[derive(Clone)]
pub struct Context {
    shared: Arc<CtxShared>,
    guard: Arc<TermGuard>,
}

impl Context {
    /// Context with default settings: one I/O thread per CPU, 1024
    /// socket slots.
    pub fn new() -> Result<Self, EngineError> {
        ContextBuilder::default().build()
    }

    /// Start configuring a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::default()
    }

    /// Create a socket of the given pattern.
    pub fn socket(&self, socket_type: SocketType) -> Result<Socket, EngineError> {
        Socket::create(self, socket_type)
    }

    /// Shut the context down: close every socket (honouring linger),
    /// destroy them, then stop and join the service threads.
    ///
    /// Blocks until sockets still held by the application are dropped or
    /// closed. Idempotent; concurrent callers all return once teardown
    /// finishes.
    pub fn terminate(&self) -> Result<(), EngineError> {
        self.guard.terminate()
    }

    pub(crate) fn shared(&self) -> &Arc<CtxShared> {
        &self.shared
    }

    pub(crate) fn guard(&self) -> &Arc<TermGuard> {
        &self.guard
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("io_threads", &self.shared.io_thread_count)
            .field("terminating", &self.shared.is_terminating())
            .finish()
    }
}
