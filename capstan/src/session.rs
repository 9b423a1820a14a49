//! Connection sessions.
//!
//! A [`Session`] is the I/O-thread handler that couples one engine to
//! one socket pipe. Connecting sessions are created by `connect` and
//! spawn a connecter that delivers an engine once the stream is up,
//! reconnecting with backoff every time the engine dies. Accepted
//! sessions arrive from a listener with their engine already attached
//! and ask the owning socket to terminate them when the connection
//! drops.
//!
//! The session's pipe end is addressed as the session object itself, so
//! activation and termination commands for the pipe arrive through the
//! ordinary handler dispatch and can be answered by poking the engine.

use crate::command::{CommandKind, Dest, ObjectId};
use crate::connector::TcpConnector;
use crate::engine::{StreamEngine, HANDSHAKE_TIMER};
use crate::io_thread::{IoCtx, IoHandler};
use crate::monitor::{SocketEvent, SocketEventSender};
use crate::pipe::{pipe_pair, Pipe, PipeEvent, ReadOutcome};
use bytes::Bytes;
use capstan_core::endpoint::Endpoint;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;
use capstan_core::options::SocketOptions;
use capstan_core::socket_type::SocketType;
use std::time::Duration;

/// Timer id of the linger deadline, registered under the session id.
const LINGER_TIMER: u32 = 2;

/// Pipe-facing half of a session, split out so the engine can borrow it
/// while the session still owns the engine.
pub(crate) struct SessionInner {
    id: ObjectId,
    tid: u32,
    /// The owning socket core.
    socket: Dest,
    endpoint: Endpoint,
    options: SocketOptions,
    socket_type: SocketType,
    pipe: Option<Pipe>,
    peer_identity: Option<Bytes>,
    /// The pipe delivered its delimiter; nothing more will be pulled.
    outbound_finished: bool,
    /// The last pulled frame carried a continuation flag.
    outbound_mid_message: bool,
}

impl SessionInner {
    #[inline]
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn peer_identity(&self) -> Option<&Bytes> {
        self.peer_identity.as_ref()
    }

    /// Next message for the wire, if the pipe has one.
    pub(crate) fn pull_outbound(&mut self) -> Option<Msg> {
        let pipe = self.pipe.as_mut()?;
        match pipe.read() {
            ReadOutcome::Msg(msg) => {
                self.outbound_mid_message = msg.has_more();
                Some(msg)
            }
            ReadOutcome::Empty => None,
            ReadOutcome::Finished => {
                self.outbound_finished = true;
                None
            }
        }
    }

    /// Swallow the rest of a message a dead engine pulled only part of,
    /// so a replacement engine starts pulling at a message boundary.
    fn discard_half_pulled(&mut self) {
        while self.outbound_mid_message && self.pipe.is_some() {
            if self.pull_outbound().is_none() {
                break;
            }
        }
    }

    /// Queue a decoded message towards the socket. The message comes
    /// back when the pipe is over its watermark.
    pub(crate) fn push_inbound(&mut self, msg: Msg) -> Result<(), Msg> {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.write(msg),
            None => Err(msg),
        }
    }

    pub(crate) fn flush_inbound(&mut self) {
        if let Some(pipe) = self.pipe.as_mut() {
            pipe.flush();
        }
    }

    /// The engine finished its handshake. Late-binds the pipe when the
    /// session was created without one and forwards the peer's identity
    /// to the socket so routing patterns can re-key.
    pub(crate) fn engine_ready(&mut self, io: &mut IoCtx<'_>, identity: Bytes) {
        self.peer_identity = Some(identity.clone());
        match self.pipe.as_ref() {
            Some(pipe) => {
                if !identity.is_empty() {
                    io.send(pipe.peer_dest(), CommandKind::PipeIdentity { identity });
                }
            }
            None => {
                let ids = (io.ctx.next_object_id(), io.ctx.next_object_id());
                let dests = (
                    Dest::pipe(self.socket.tid, ids.0),
                    Dest::object(self.tid, self.id),
                );
                let (mut socket_end, session_end) = pipe_pair(
                    io.ctx,
                    ids,
                    dests,
                    (self.options.recv_hwm, self.options.send_hwm),
                );
                socket_end.set_identity(identity);
                self.pipe = Some(session_end);
                io.send(self.socket, CommandKind::Bind { pipe: socket_end });
            }
        }
    }

    /// Apply a pipe command to this session's pipe end.
    pub(crate) fn process_pipe_command(&mut self, kind: CommandKind) -> PipeEvent {
        match self.pipe.as_mut() {
            Some(pipe) => pipe.process_command(kind),
            None => PipeEvent::None,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests(
        ctx: &std::sync::Arc<crate::ctx::CtxShared>,
        id: ObjectId,
    ) -> (Self, Pipe) {
        let ids = (ctx.next_object_id(), ctx.next_object_id());
        let dests = (Dest::pipe(0, ids.0), Dest::object(0, id));
        let (socket_end, session_end) = pipe_pair(ctx, ids, dests, (1000, 1000));
        let inner = Self {
            id,
            tid: 0,
            socket: Dest::socket(0),
            endpoint: Endpoint::parse("tcp://127.0.0.1:0").unwrap(),
            options: SocketOptions::default(),
            socket_type: SocketType::Pair,
            pipe: Some(session_end),
            peer_identity: None,
            outbound_finished: false,
            outbound_mid_message: false,
        };
        (inner, socket_end)
    }
}

pub(crate) struct Session {
    inner: SessionInner,
    engine: Option<Box<StreamEngine>>,
    /// Connecter handler currently working for this session.
    connector: Option<ObjectId>,
    /// True for sessions created by a listener.
    accepted: bool,
    terminating: bool,
    /// Termination is draining queued messages within a linger budget.
    draining: bool,
    monitor: Option<SocketEventSender>,
}

impl Session {
    /// Session for an outgoing connection. `pipe` is present unless the
    /// socket was configured to queue only towards live connections.
    pub(crate) fn connecting(
        id: ObjectId,
        tid: u32,
        socket: Dest,
        endpoint: Endpoint,
        options: SocketOptions,
        socket_type: SocketType,
        pipe: Option<Pipe>,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            inner: SessionInner {
                id,
                tid,
                socket,
                endpoint,
                options,
                socket_type,
                pipe,
                peer_identity: None,
                outbound_finished: false,
                outbound_mid_message: false,
            },
            engine: None,
            connector: None,
            accepted: false,
            terminating: false,
            draining: false,
            monitor,
        }
    }

    /// Session for an accepted connection, engine included.
    pub(crate) fn accepted(
        id: ObjectId,
        tid: u32,
        socket: Dest,
        endpoint: Endpoint,
        options: SocketOptions,
        socket_type: SocketType,
        engine: Box<StreamEngine>,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            inner: SessionInner {
                id,
                tid,
                socket,
                endpoint,
                options,
                socket_type,
                pipe: None,
                peer_identity: None,
                outbound_finished: false,
                outbound_mid_message: false,
            },
            engine: Some(engine),
            connector: None,
            accepted: true,
            terminating: false,
            draining: false,
            monitor,
        }
    }

    fn emit(&self, event: SocketEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }

    fn spawn_connector(&mut self, io: &mut IoCtx<'_>, deferred: bool) {
        let cid = io.ctx.next_object_id();
        let connector = TcpConnector::new(
            cid,
            self.inner.id,
            self.inner.endpoint.clone(),
            self.inner.options.clone(),
            self.inner.socket_type,
            self.monitor.clone(),
            deferred,
        );
        io.plug(cid, Box::new(connector));
        self.connector = Some(cid);
    }

    fn stop_connector(&mut self, io: &mut IoCtx<'_>) {
        if let Some(cid) = self.connector.take() {
            io.send(Dest::object(self.inner.tid, cid), CommandKind::Stop);
        }
    }

    /// React to what a pipe command did to the pipe.
    fn on_pipe_event(&mut self, io: &mut IoCtx<'_>, event: PipeEvent) {
        match event {
            PipeEvent::ReadActivated => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(err) = engine.output_resumed(&mut self.inner, io) {
                        self.engine_failed(io, err);
                        return;
                    }
                }
                self.after_engine_pass(io);
            }
            PipeEvent::WriteActivated => {
                if let Some(engine) = self.engine.as_mut() {
                    if let Err(err) = engine.input_resumed(&mut self.inner, io) {
                        self.engine_failed(io, err);
                        return;
                    }
                }
                self.after_engine_pass(io);
            }
            PipeEvent::Terminated => {
                self.inner.pipe = None;
                self.maybe_finish(io);
            }
            PipeEvent::None => {}
        }
    }

    /// The engine's stream died or broke protocol.
    fn engine_failed(&mut self, io: &mut IoCtx<'_>, err: EngineError) {
        let Some(mut engine) = self.engine.take() else {
            return;
        };
        let handshaking = engine.is_handshaking();
        engine.unplug(io);
        drop(engine);

        if handshaking {
            tracing::warn!(
                endpoint = %self.inner.endpoint,
                %err,
                "[Session] handshake failed"
            );
            self.emit(SocketEvent::HandshakeFailed(self.inner.endpoint.clone()));
        } else {
            tracing::debug!(
                endpoint = %self.inner.endpoint,
                %err,
                "[Session] connection lost"
            );
            self.emit(SocketEvent::Disconnected(self.inner.endpoint.clone()));
        }

        // Drop the half-written tail of any inbound message, and swallow
        // the rest of any outbound message the engine pulled only part
        // of, so neither side of the pipe is left mid-message.
        if let Some(pipe) = self.inner.pipe.as_mut() {
            pipe.rollback();
            pipe.flush();
        }
        self.inner.discard_half_pulled();
        // A delimiter at the head of the pipe would otherwise sit
        // unread until a replacement engine shows up.
        if let Some(pipe) = self.inner.pipe.as_mut() {
            pipe.check_read();
        }

        if self.terminating {
            self.maybe_finish(io);
        } else if self.accepted {
            io.send(
                self.inner.socket,
                CommandKind::TermReq {
                    child: Dest::object(self.inner.tid, self.inner.id),
                },
            );
        } else {
            self.spawn_connector(io, true);
        }
    }

    fn start_termination(&mut self, io: &mut IoCtx<'_>, linger: Option<Duration>) {
        if self.terminating {
            return;
        }
        self.terminating = true;

        // A connection still being dialed counts as drainable: the
        // linger budget covers messages queued before it came up, so
        // the connecter keeps dialing and the drain holds out for its
        // late engine. It is stopped once the pipe is gone.
        let expecting_engine = self.engine.is_some() || self.connector.is_some();
        let drain = self.inner.pipe.is_some()
            && expecting_engine
            && matches!(linger, Some(budget) if !budget.is_zero());
        self.draining = drain;
        if !drain {
            self.stop_connector(io);
        }
        if let Some(pipe) = self.inner.pipe.as_mut() {
            pipe.terminate(drain);
            if self.engine.is_none() {
                // With no engine a delimiter already at the head of the
                // pipe would never be read; the probe consumes it and
                // lets the handshake finish right away.
                pipe.check_read();
            }
        }
        if drain {
            if let Some(budget) = linger {
                io.timers.add(budget, self.inner.id, LINGER_TIMER);
            }
        } else if let Some(engine) = self.engine.as_mut() {
            engine.discard_pending(io);
        }
        self.maybe_finish(io);
    }

    /// Move a draining engine into its closing state once the pipe has
    /// nothing more to give, then try to finish.
    fn after_engine_pass(&mut self, io: &mut IoCtx<'_>) {
        if self.terminating && self.inner.outbound_finished {
            if let Some(engine) = self.engine.as_mut() {
                engine.begin_close(io);
            }
        }
        self.maybe_finish(io);
    }

    /// Complete termination when both the pipe handshake and the engine
    /// drain are done.
    fn maybe_finish(&mut self, io: &mut IoCtx<'_>) {
        if !self.terminating || self.inner.pipe.is_some() {
            return;
        }
        if let Some(engine) = self.engine.as_ref() {
            if !engine.is_drained() {
                return;
            }
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.unplug(io);
        }
        self.engine = None;
        self.stop_connector(io);
        io.timers.cancel(self.inner.id, LINGER_TIMER);
        io.send(self.inner.socket, CommandKind::TermAck);
        io.retire(self.inner.id);
        tracing::debug!(
            id = self.inner.id,
            endpoint = %self.inner.endpoint,
            "[Session] terminated"
        );
    }
}

impl IoHandler for Session {
    fn plug(&mut self, io: &mut IoCtx<'_>) {
        if self.accepted {
            io.send(
                self.inner.socket,
                CommandKind::Own {
                    child: Dest::object(self.inner.tid, self.inner.id),
                },
            );
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.plug(io);
        } else {
            self.spawn_connector(io, false);
        }
    }

    fn process(&mut self, io: &mut IoCtx<'_>, cmd: CommandKind) {
        match cmd {
            CommandKind::Attach { engine } => {
                self.connector = None;
                if self.terminating && !(self.draining && self.inner.pipe.is_some()) {
                    // Too late: the stream closes with the engine.
                    drop(engine);
                    self.maybe_finish(io);
                    return;
                }
                let mut engine = engine;
                engine.plug(io);
                self.engine = Some(engine);
            }
            CommandKind::Term { linger } => self.start_termination(io, linger),
            kind @ (CommandKind::ActivateRead
            | CommandKind::ActivateWrite { .. }
            | CommandKind::PipeTerm
            | CommandKind::PipeTermAck) => {
                let event = self.inner.process_pipe_command(kind);
                self.on_pipe_event(io, event);
            }
            other => tracing::trace!(
                id = self.inner.id,
                kind = other.name(),
                "[Session] dropping unexpected command"
            ),
        }
    }

    fn io_event(&mut self, io: &mut IoCtx<'_>, readable: bool, writable: bool) {
        if let Some(engine) = self.engine.as_mut() {
            if let Err(err) = engine.handle_io(&mut self.inner, io, readable, writable) {
                self.engine_failed(io, err);
                return;
            }
        }
        self.after_engine_pass(io);
    }

    fn timer_event(&mut self, io: &mut IoCtx<'_>, timer_id: u32) {
        match timer_id {
            HANDSHAKE_TIMER => {
                let stalled = self.engine.as_ref().is_some_and(|e| e.is_handshaking());
                if stalled {
                    let budget = self.inner.options.handshake_timeout;
                    self.engine_failed(io, EngineError::HandshakeTimeout(budget));
                }
            }
            LINGER_TIMER => {
                // Linger budget spent: stop draining and discard.
                self.draining = false;
                if let Some(pipe) = self.inner.pipe.as_mut() {
                    pipe.terminate(false);
                }
                if let Some(engine) = self.engine.as_mut() {
                    engine.discard_pending(io);
                }
                self.maybe_finish(io);
            }
            other => tracing::trace!(
                id = self.inner.id,
                timer = other,
                "[Session] unknown timer"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Target};
    use crate::ctx::CtxShared;
    use crate::io_thread::TestReactor;
    use capstan_core::mailbox::Mailbox;

    fn drain(rx: &mut Mailbox<Command>) -> Vec<Command> {
        let mut out = Vec::new();
        while let Ok(Some(cmd)) = rx.recv(Some(Duration::ZERO)) {
            out.push(cmd);
        }
        out
    }

    #[test]
    fn test_term_without_engine_acks_and_retires() {
        let (ctx, mut rx) = CtxShared::for_tests(1);
        let mut rx0 = rx.pop().unwrap();
        let mut reactor = TestReactor::new(ctx.clone());

        let session_id = 500;
        let ids = (ctx.next_object_id(), ctx.next_object_id());
        let (mut socket_end, session_end) = pipe_pair(
            &ctx,
            ids,
            (Dest::pipe(0, ids.0), Dest::object(0, session_id)),
            (100, 100),
        );
        let mut session = Session::connecting(
            session_id,
            0,
            Dest::socket(0),
            Endpoint::parse("tcp://127.0.0.1:1").unwrap(),
            SocketOptions::default(),
            SocketType::Pair,
            Some(session_end),
            None,
        );

        session.process(
            &mut reactor.io(0),
            CommandKind::Term {
                linger: Some(Duration::from_secs(1)),
            },
        );

        // Ferry commands between the ends, draining the socket end the
        // way its core would, until the handshake completes.
        for _ in 0..4 {
            for cmd in drain(&mut rx0) {
                match cmd.dest.target {
                    Target::Pipe(_) => {
                        socket_end.process_command(cmd.kind);
                    }
                    Target::Object(_) => session.process(&mut reactor.io(0), cmd.kind),
                    Target::Socket => {
                        assert!(matches!(cmd.kind, CommandKind::TermAck));
                        assert_eq!(reactor.retired(), &[session_id]);
                        return;
                    }
                    Target::Thread => {}
                }
            }
            // Reading the delimiter is what moves the socket end to ack.
            while matches!(
                socket_end.read(),
                crate::pipe::ReadOutcome::Msg(_) | crate::pipe::ReadOutcome::Finished
            ) {}
        }
        panic!("session never acked its termination");
    }

    #[test]
    fn test_linger_drain_outlasts_a_pending_connect() {
        let (ctx, mut rx) = CtxShared::for_tests(1);
        let mut rx0 = rx.pop().unwrap();
        let mut reactor = TestReactor::new(ctx.clone());

        let session_id = 700;
        let ids = (ctx.next_object_id(), ctx.next_object_id());
        let (mut socket_end, session_end) = pipe_pair(
            &ctx,
            ids,
            (Dest::pipe(0, ids.0), Dest::object(0, session_id)),
            (100, 100),
        );
        let mut session = Session::connecting(
            session_id,
            0,
            Dest::socket(0),
            Endpoint::parse("tcp://127.0.0.1:1").unwrap(),
            SocketOptions::default(),
            SocketType::Pair,
            Some(session_end),
            None,
        );
        session.plug(&mut reactor.io(0));
        let _ = reactor.take_plugs();

        socket_end.write(Msg::from("queued")).unwrap();
        socket_end.flush();

        // The socket tears its end down before telling the session, the
        // same order its close path uses.
        socket_end.terminate(false);
        for cmd in drain(&mut rx0) {
            if let Target::Object(id) = cmd.dest.target {
                if id == session_id {
                    session.process(&mut reactor.io(0), cmd.kind);
                }
            }
        }
        session.process(
            &mut reactor.io(0),
            CommandKind::Term {
                linger: Some(Duration::from_secs(5)),
            },
        );

        // No engine ever attaches, so nothing moves; the drain must
        // still hold the ack back for its whole budget.
        for cmd in drain(&mut rx0) {
            match cmd.dest.target {
                Target::Pipe(_) => {
                    socket_end.process_command(cmd.kind);
                }
                Target::Socket => {
                    assert!(
                        !matches!(cmd.kind, CommandKind::TermAck),
                        "acked while the linger drain should be waiting"
                    );
                }
                _ => {}
            }
        }
        assert!(reactor.retired().is_empty());

        // Budget spent: the session gives up and finishes.
        session.timer_event(&mut reactor.io(0), LINGER_TIMER);
        let mut acked = false;
        for _ in 0..4 {
            for cmd in drain(&mut rx0) {
                match cmd.dest.target {
                    Target::Pipe(_) => {
                        socket_end.process_command(cmd.kind);
                    }
                    Target::Object(id) if id == session_id => {
                        session.process(&mut reactor.io(0), cmd.kind);
                    }
                    Target::Socket => {
                        if matches!(cmd.kind, CommandKind::TermAck) {
                            acked = true;
                        }
                    }
                    _ => {}
                }
            }
            if acked {
                break;
            }
        }
        assert!(acked, "session never finished after its linger expired");
        assert_eq!(reactor.retired(), &[session_id]);
    }

    #[test]
    fn test_term_with_empty_queue_finishes_despite_connector() {
        let (ctx, mut rx) = CtxShared::for_tests(1);
        let mut rx0 = rx.pop().unwrap();
        let mut reactor = TestReactor::new(ctx.clone());

        let session_id = 800;
        let ids = (ctx.next_object_id(), ctx.next_object_id());
        let (mut socket_end, session_end) = pipe_pair(
            &ctx,
            ids,
            (Dest::pipe(0, ids.0), Dest::object(0, session_id)),
            (100, 100),
        );
        let mut session = Session::connecting(
            session_id,
            0,
            Dest::socket(0),
            Endpoint::parse("tcp://127.0.0.1:1").unwrap(),
            SocketOptions::default(),
            SocketType::Pair,
            Some(session_end),
            None,
        );
        session.plug(&mut reactor.io(0));
        let _ = reactor.take_plugs();
        let connector_id = session.connector.unwrap();

        socket_end.terminate(false);
        for cmd in drain(&mut rx0) {
            if let Target::Object(id) = cmd.dest.target {
                if id == session_id {
                    session.process(&mut reactor.io(0), cmd.kind);
                }
            }
        }
        session.process(
            &mut reactor.io(0),
            CommandKind::Term {
                linger: Some(Duration::from_secs(5)),
            },
        );

        // Nothing was queued, so the delimiter probe finishes the pipe
        // handshake without waiting out the linger budget.
        let mut acked = false;
        let mut connector_stopped = false;
        for _ in 0..4 {
            for cmd in drain(&mut rx0) {
                match cmd.dest.target {
                    Target::Pipe(_) => {
                        socket_end.process_command(cmd.kind);
                    }
                    Target::Object(id) if id == session_id => {
                        session.process(&mut reactor.io(0), cmd.kind);
                    }
                    Target::Object(id) if id == connector_id => {
                        connector_stopped |= matches!(cmd.kind, CommandKind::Stop);
                    }
                    Target::Socket => {
                        acked |= matches!(cmd.kind, CommandKind::TermAck);
                    }
                    _ => {}
                }
            }
            if acked {
                break;
            }
        }
        assert!(acked, "empty session should ack without spending the linger");
        assert!(connector_stopped, "the connecter must be told to stop");
        assert_eq!(reactor.retired(), &[session_id]);
    }

    #[test]
    fn test_plug_spawns_connector_for_connecting_session() {
        let (ctx, _rx) = CtxShared::for_tests(1);
        let mut reactor = TestReactor::new(ctx.clone());

        let mut session = Session::connecting(
            600,
            0,
            Dest::socket(0),
            Endpoint::parse("tcp://127.0.0.1:1").unwrap(),
            SocketOptions::default(),
            SocketType::Pair,
            None,
            None,
        );
        session.plug(&mut reactor.io(0));
        assert!(session.connector.is_some());
        let plugs = reactor.take_plugs();
        assert_eq!(plugs.len(), 1);
        assert_eq!(Some(plugs[0].0), session.connector);
    }
}
