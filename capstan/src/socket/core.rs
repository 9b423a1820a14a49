//! The state machine behind every socket handle.
//!
//! A [`SocketCore`] owns the socket's mailbox slot, its pipe endpoints,
//! its endpoint records and the pattern state. It has no thread of its
//! own: user calls drive it directly, and every command another thread
//! sends it is drained at the next call (or, after close, by the
//! reaper). Listeners and sessions created here live on I/O threads and
//! are tracked as children until they acknowledge their termination.

use super::{Events, Pattern, PipeMap, SendError};
use crate::command::{Command, CommandKind, Dest, ObjectId, Target};
use crate::ctx::{CtxShared, InprocEntry, REAPER_TID};
use crate::listener::Listener;
use crate::monitor::{create_monitor, SocketEvent, SocketEventSender, SocketMonitor};
use crate::pipe::{pipe_pair, Pipe, PipeEvent};
use crate::session::Session;
use crate::tcp::bind_listener;
use bytes::Bytes;
use capstan_core::endpoint::{Endpoint, EndpointError};
use capstan_core::error::EngineError;
use capstan_core::mailbox::Mailbox;
use capstan_core::msg::Msg;
use capstan_core::options::SocketOptions;
use capstan_core::socket_type::SocketType;
use hashbrown::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// What a socket set up for an endpoint string, so `unbind` and
/// `disconnect` can tear down exactly that.
enum EndpointRecord {
    /// TCP or IPC bind: the listener object on its I/O thread.
    Listener(Dest),
    /// TCP or IPC connect: the session object on its I/O thread.
    Session(Dest),
    /// Inproc bind: the registered name.
    InprocBind(String),
    /// Inproc connect: our end of the direct pipe.
    InprocPipe(ObjectId),
}

pub(crate) struct SocketCore {
    tid: u32,
    ctx: Arc<CtxShared>,
    mailbox: Mailbox<Command>,
    socket_type: SocketType,
    options: SocketOptions,
    pattern: Pattern,
    pipes: PipeMap,
    /// Listeners and sessions that owe us a `TermAck`.
    children: Vec<Dest>,
    pending_term_acks: usize,
    endpoints: HashMap<String, EndpointRecord>,
    last_endpoint: Option<String>,
    monitor: Option<SocketEventSender>,
    closing: bool,
}

fn address_error(err: EndpointError) -> EngineError {
    match err {
        EndpointError::Unresolvable(ep) | EndpointError::NoNetworkAddress(ep) => {
            EngineError::AddressUnresolvable(ep)
        }
        other => EngineError::AddressUnresolvable(other.to_string()),
    }
}

impl SocketCore {
    pub(crate) fn create(
        ctx: &Arc<CtxShared>,
        socket_type: SocketType,
    ) -> Result<Self, EngineError> {
        let (tid, mailbox) = ctx.register_socket()?;
        let options = SocketOptions::default();
        let pattern = Pattern::new(socket_type, &options);
        tracing::debug!(socket = socket_type.as_str(), tid, "[Socket] created");
        Ok(Self {
            tid,
            ctx: Arc::clone(ctx),
            mailbox,
            socket_type,
            options,
            pattern,
            pipes: HashMap::new(),
            children: Vec::new(),
            pending_term_acks: 0,
            endpoints: HashMap::new(),
            last_endpoint: None,
            monitor: None,
            closing: false,
        })
    }

    pub(crate) fn tid(&self) -> u32 {
        self.tid
    }

    pub(crate) fn socket_type(&self) -> SocketType {
        self.socket_type
    }

    pub(crate) fn options(&self) -> &SocketOptions {
        &self.options
    }

    pub(crate) fn set_options(&mut self, options: SocketOptions) -> Result<(), EngineError> {
        if let Some(identity) = &options.identity {
            SocketOptions::validate_identity(identity)?;
        }
        self.options = options;
        self.pattern.options_changed(&self.options);
        Ok(())
    }

    pub(crate) fn last_endpoint(&self) -> Option<String> {
        self.last_endpoint.clone()
    }

    pub(crate) fn monitor(&mut self) -> SocketMonitor {
        let (sender, receiver) = create_monitor();
        self.monitor = Some(sender);
        receiver
    }

    fn emit(&self, event: SocketEvent) {
        if let Some(sender) = &self.monitor {
            let _ = sender.send(event);
        }
    }

    /// Start accepting (or, for inproc, announcing) on an endpoint.
    pub(crate) fn bind(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.process_pending();
        let parsed = Endpoint::parse(endpoint).map_err(address_error)?;
        if let Endpoint::Inproc(name) = &parsed {
            self.ctx.register_inproc(
                name,
                InprocEntry {
                    dest: Dest::socket(self.tid),
                    socket_type: self.socket_type,
                    recv_hwm: self.options.recv_hwm,
                    send_hwm: self.options.send_hwm,
                    identity: self.options.identity.clone().unwrap_or_default(),
                },
            )?;
            let key = parsed.to_string();
            self.endpoints
                .insert(key.clone(), EndpointRecord::InprocBind(name.clone()));
            self.last_endpoint = Some(key);
            self.emit(SocketEvent::Listening(parsed));
            return Ok(());
        }

        let addr = parsed.socket_addr().map_err(address_error)?;
        let listener = match bind_listener(addr, self.options.backlog) {
            Ok(listener) => listener,
            Err(err) => {
                tracing::warn!(endpoint = %parsed, %err, "[Socket] bind failed");
                self.emit(SocketEvent::BindFailed(parsed.clone()));
                return Err(if err.kind() == io::ErrorKind::AddrInUse {
                    EngineError::AddressInUse(parsed.to_string())
                } else {
                    EngineError::Io(err)
                });
            }
        };
        let local = listener.local_addr()?;
        // Report the resolved address: a wildcard port becomes the
        // ephemeral one the kernel picked.
        let bound = match &parsed {
            Endpoint::Tcp { host, .. } => Endpoint::Tcp {
                host: if host == "*" {
                    local.ip().to_string()
                } else {
                    host.clone()
                },
                port: local.port(),
            },
            other => other.clone(),
        };
        let key = bound.to_string();
        if self.endpoints.contains_key(&key) {
            return Err(EngineError::AddressInUse(key));
        }

        let io_tid = self.ctx.choose_io_thread(self.options.affinity)?;
        let listener_id = self.ctx.next_object_id();
        let handler = Listener::new(
            listener_id,
            Dest::socket(self.tid),
            listener,
            bound.clone(),
            self.options.clone(),
            self.socket_type,
            self.monitor.clone(),
        );
        let child = Dest::object(io_tid, listener_id);
        self.children.push(child);
        self.ctx.send_command(Command::new(
            Dest::thread(io_tid),
            CommandKind::Plug {
                id: listener_id,
                handler: Box::new(handler),
            },
        ));
        self.endpoints
            .insert(key.clone(), EndpointRecord::Listener(child));
        self.last_endpoint = Some(key);
        tracing::debug!(endpoint = %bound, tid = io_tid, "[Socket] listening");
        self.emit(SocketEvent::Listening(bound));
        Ok(())
    }

    /// Connect to an endpoint, setting up the session (or inproc pipe)
    /// that will carry traffic for it.
    pub(crate) fn connect(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.process_pending();
        let parsed = Endpoint::parse(endpoint).map_err(address_error)?;
        let key = parsed.to_string();
        if self.endpoints.contains_key(&key) {
            return Err(EngineError::AddressInUse(key));
        }
        if parsed.is_inproc() {
            return self.connect_inproc(parsed, key);
        }

        let io_tid = self.ctx.choose_io_thread(self.options.affinity)?;
        let session_id = self.ctx.next_object_id();
        let session_dest = Dest::object(io_tid, session_id);

        // The pipe exists up front so sends queue while the connection
        // is still being dialed; `immediate` defers it to the session's
        // first completed handshake.
        let session_pipe = if self.options.immediate {
            None
        } else {
            let ids = (self.ctx.next_object_id(), self.ctx.next_object_id());
            let (socket_end, session_end) = pipe_pair(
                &self.ctx,
                ids,
                (Dest::pipe(self.tid, ids.0), session_dest),
                (self.options.recv_hwm, self.options.send_hwm),
            );
            self.pipes.insert(ids.0, socket_end);
            self.pattern.attach(ids.0, &mut self.pipes);
            Some(session_end)
        };

        let session = Session::connecting(
            session_id,
            io_tid,
            Dest::socket(self.tid),
            parsed.clone(),
            self.options.clone(),
            self.socket_type,
            session_pipe,
            self.monitor.clone(),
        );
        self.children.push(session_dest);
        self.ctx.send_command(Command::new(
            Dest::thread(io_tid),
            CommandKind::Plug {
                id: session_id,
                handler: Box::new(session),
            },
        ));
        self.endpoints
            .insert(key, EndpointRecord::Session(session_dest));
        tracing::debug!(endpoint = %parsed, tid = io_tid, "[Socket] connecting");
        Ok(())
    }

    /// Wire a pipe straight to a socket bound in this context.
    fn connect_inproc(&mut self, parsed: Endpoint, key: String) -> Result<(), EngineError> {
        let Endpoint::Inproc(name) = &parsed else {
            return Err(EngineError::AddressUnresolvable(key));
        };
        let entry = self
            .ctx
            .lookup_inproc(name)
            .ok_or_else(|| EngineError::AddressUnresolvable(key.clone()))?;
        if !self.socket_type.is_compatible(entry.socket_type) {
            return Err(EngineError::protocol(format!(
                "{} cannot talk to {}",
                self.socket_type.as_str(),
                entry.socket_type.as_str()
            )));
        }

        // With no wire in between, a single queue carries each direction
        // and both sides' watermarks add up. Zero on either side means
        // unbounded.
        let send_total = if self.options.send_hwm > 0 && entry.recv_hwm > 0 {
            self.options.send_hwm + entry.recv_hwm
        } else {
            0
        };
        let recv_total = if self.options.recv_hwm > 0 && entry.send_hwm > 0 {
            self.options.recv_hwm + entry.send_hwm
        } else {
            0
        };

        let ids = (self.ctx.next_object_id(), self.ctx.next_object_id());
        let (mut local, mut remote) = pipe_pair(
            &self.ctx,
            ids,
            (
                Dest::pipe(self.tid, ids.0),
                Dest::pipe(entry.dest.tid, ids.1),
            ),
            (recv_total, send_total),
        );
        local.set_identity(entry.identity.clone());
        remote.set_identity(self.options.identity.clone().unwrap_or_default());

        self.pipes.insert(ids.0, local);
        self.pattern.attach(ids.0, &mut self.pipes);
        self.ctx
            .send_command(Command::new(entry.dest, CommandKind::Bind { pipe: remote }));
        self.endpoints
            .insert(key, EndpointRecord::InprocPipe(ids.0));
        tracing::debug!(endpoint = %parsed, "[Socket] connected inproc");
        Ok(())
    }

    /// Tear down whatever `bind` or `connect` set up for this endpoint.
    pub(crate) fn shutdown_endpoint(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.process_pending();
        let parsed = Endpoint::parse(endpoint).map_err(address_error)?;
        let record = self
            .endpoints
            .remove(&parsed.to_string())
            .ok_or(EngineError::InvalidState(
                "endpoint is not attached to this socket",
            ))?;
        match record {
            EndpointRecord::Listener(child) | EndpointRecord::Session(child) => {
                self.children.retain(|c| *c != child);
                self.pending_term_acks += 1;
                self.ctx.send_command(Command::new(
                    child,
                    CommandKind::Term {
                        linger: self.options.linger,
                    },
                ));
            }
            EndpointRecord::InprocBind(name) => self.ctx.unregister_inproc(&name),
            EndpointRecord::InprocPipe(id) => {
                if let Some(pipe) = self.pipes.get_mut(&id) {
                    pipe.terminate(true);
                }
            }
        }
        tracing::debug!(endpoint = %parsed, "[Socket] endpoint shut down");
        Ok(())
    }

    pub(crate) fn send(&mut self, msg: Msg) -> Result<(), EngineError> {
        if self.closing || self.ctx.is_terminating() {
            return Err(EngineError::Terminated);
        }
        self.process_pending();
        let deadline = self.options.send_timeout.map(|t| Instant::now() + t);
        let mut msg = msg;
        loop {
            match self.pattern.send(msg, &mut self.pipes) {
                Ok(()) => return Ok(()),
                Err(SendError::Fatal(err)) => return Err(err),
                Err(SendError::Full(back)) => msg = back,
            }
            if self.ctx.is_terminating() {
                return Err(EngineError::Terminated);
            }
            self.block_on_mailbox(deadline)?;
        }
    }

    pub(crate) fn recv(&mut self) -> Result<Msg, EngineError> {
        if self.closing || self.ctx.is_terminating() {
            return Err(EngineError::Terminated);
        }
        self.process_pending();
        let deadline = self.options.recv_timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(msg) = self.pattern.recv(&mut self.pipes)? {
                return Ok(msg);
            }
            if self.ctx.is_terminating() {
                return Err(EngineError::Terminated);
            }
            self.block_on_mailbox(deadline)?;
        }
    }

    /// Park on the mailbox until a command arrives or the deadline
    /// passes. Commands are what signal progress: every pipe activation
    /// travels through here.
    fn block_on_mailbox(&mut self, deadline: Option<Instant>) -> Result<(), EngineError> {
        let wait = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(EngineError::WouldBlock);
                }
                Some(deadline - now)
            }
            None => None,
        };
        match self.mailbox.recv(wait) {
            Ok(Some(cmd)) => {
                self.process_command(cmd);
                self.process_pending();
                Ok(())
            }
            Ok(None) => Err(EngineError::WouldBlock),
            Err(err) => Err(err.into()),
        }
    }

    pub(crate) fn events(&mut self) -> Events {
        self.process_pending();
        Events {
            readable: self.pattern.has_in(&mut self.pipes),
            writable: self.pattern.has_out(&mut self.pipes),
        }
    }

    pub(crate) fn subscribe(&mut self, prefix: Bytes) -> Result<(), EngineError> {
        self.pattern.subscribe(prefix)
    }

    pub(crate) fn unsubscribe(&mut self, prefix: &[u8]) -> Result<(), EngineError> {
        self.pattern.unsubscribe(prefix)
    }

    /// Drain every queued command.
    pub(crate) fn process_pending(&mut self) {
        loop {
            match self.mailbox.recv(Some(Duration::ZERO)) {
                Ok(Some(cmd)) => self.process_command(cmd),
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(%err, tid = self.tid, "[Socket] mailbox failure");
                    return;
                }
            }
        }
    }

    fn process_command(&mut self, cmd: Command) {
        match cmd.dest.target {
            Target::Pipe(id) => self.process_pipe_command(id, cmd.kind),
            _ => self.process_socket_command(cmd.kind),
        }
    }

    fn process_pipe_command(&mut self, id: ObjectId, kind: CommandKind) {
        if let CommandKind::PipeIdentity { identity } = kind {
            self.pattern.identity_changed(id, identity, &mut self.pipes);
            return;
        }
        let Some(pipe) = self.pipes.get_mut(&id) else {
            tracing::trace!(id, kind = kind.name(), "[Socket] command for gone pipe");
            return;
        };
        match pipe.process_command(kind) {
            PipeEvent::ReadActivated => self.pattern.read_activated(id),
            PipeEvent::WriteActivated => self.pattern.write_activated(id),
            PipeEvent::Terminated => {
                self.pattern.terminated(id);
                self.pipes.remove(&id);
            }
            PipeEvent::None => {}
        }
    }

    fn process_socket_command(&mut self, kind: CommandKind) {
        match kind {
            CommandKind::Bind { pipe } => self.bind_pipe(pipe),
            CommandKind::Own { child } => {
                if self.closing {
                    // Too late to adopt: terminate it right away.
                    self.pending_term_acks += 1;
                    self.ctx.send_command(Command::new(
                        child,
                        CommandKind::Term {
                            linger: self.options.linger,
                        },
                    ));
                } else {
                    self.children.push(child);
                }
            }
            CommandKind::TermReq { child } => {
                if let Some(pos) = self.children.iter().position(|c| *c == child) {
                    self.children.remove(pos);
                    self.pending_term_acks += 1;
                    self.ctx.send_command(Command::new(
                        child,
                        CommandKind::Term {
                            linger: self.options.linger,
                        },
                    ));
                }
            }
            CommandKind::TermAck => {
                self.pending_term_acks = self.pending_term_acks.saturating_sub(1);
            }
            CommandKind::Stop => {}
            other => {
                tracing::trace!(kind = other.name(), tid = self.tid, "[Socket] dropped command");
            }
        }
    }

    /// Adopt a pipe end somebody built for us (an accepted session, or
    /// an inproc connector).
    fn bind_pipe(&mut self, pipe: Pipe) {
        let id = pipe.id();
        let identity = pipe.identity().clone();
        self.pipes.insert(id, pipe);
        self.pattern.attach(id, &mut self.pipes);
        if !identity.is_empty() {
            self.pattern
                .identity_changed(id, identity, &mut self.pipes);
        }
        if self.closing {
            // The handshake still runs so the peer learns we are gone.
            if let Some(pipe) = self.pipes.get_mut(&id) {
                pipe.terminate(false);
            }
        }
    }

    /// Begin shutdown: unregister names, terminate children and pipes.
    /// The core is dead once every pipe and child has acknowledged.
    pub(crate) fn start_close(&mut self) {
        if self.closing {
            return;
        }
        self.closing = true;
        self.process_pending();
        tracing::debug!(socket = self.socket_type.as_str(), tid = self.tid, "[Socket] closing");
        for record in self.endpoints.values() {
            if let EndpointRecord::InprocBind(name) = record {
                self.ctx.unregister_inproc(name);
            }
        }
        // Pipes before children: a session only keeps draining through its
        // linger window if the pipe's terminate request reaches it ahead of
        // the object-level Term.
        for pipe in self.pipes.values_mut() {
            pipe.terminate(false);
        }
        for child in self.children.drain(..) {
            self.pending_term_acks += 1;
            self.ctx.send_command(Command::new(
                child,
                CommandKind::Term {
                    linger: self.options.linger,
                },
            ));
        }
        self.endpoints.clear();
    }

    /// Hand a closed core to the reaper thread.
    pub(crate) fn reap(core: Box<SocketCore>) {
        let ctx = Arc::clone(&core.ctx);
        ctx.send_command(Command::new(
            Dest::thread(REAPER_TID),
            CommandKind::Reap { core },
        ));
    }

    pub(crate) fn signal_fd(&self) -> RawFd {
        self.mailbox.signal_fd()
    }

    pub(crate) fn is_dead(&self) -> bool {
        self.closing && self.pipes.is_empty() && self.pending_term_acks == 0
    }

    /// Abandon the termination handshakes still in flight.
    pub(crate) fn force_close(&mut self) {
        if !self.pipes.is_empty() || self.pending_term_acks > 0 {
            tracing::debug!(
                pipes = self.pipes.len(),
                acks = self.pending_term_acks,
                tid = self.tid,
                "[Socket] force closing"
            );
        }
        self.pipes.clear();
        self.pending_term_acks = 0;
    }

    pub(crate) fn linger(&self) -> Option<Duration> {
        self.options.linger
    }
}

impl Drop for SocketCore {
    fn drop(&mut self) {
        self.emit(SocketEvent::Closed);
        tracing::debug!(socket = self.socket_type.as_str(), tid = self.tid, "[Socket] closed");
    }
}
