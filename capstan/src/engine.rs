//! Per-connection protocol engine.
//!
//! A [`StreamEngine`] owns one connected stream and runs it through
//! three states:
//!
//! - **Handshaking**: the 12-byte greeting goes out immediately, the
//!   peer's greeting is validated (signature, version, pattern
//!   compatibility), then exactly one identity frame is exchanged each
//!   way. A stalled peer is cut off by the handshake timer.
//! - **Ready**: outbound messages are pulled from the session pipe and
//!   encoded into a write buffer, inbound bytes are decoded and pushed
//!   into the pipe. A frame the pipe refuses is parked and read
//!   interest is dropped until the pipe reactivates; write interest is
//!   dropped whenever the write buffer runs dry.
//! - **Closing**: no further input, the write buffer drains, then the
//!   session releases the engine and the stream closes with it.
//!
//! The engine never talks to the poller outside the session callbacks
//! that drive it; its descriptor and timers are registered under the
//! owning session's id.

use crate::command::ObjectId;
use crate::io_thread::IoCtx;
use crate::session::SessionInner;
use bytes::{Buf, BytesMut};
use capstan_core::codec::{Decoder, Encoder};
use capstan_core::endpoint::Endpoint;
use capstan_core::error::EngineError;
use capstan_core::greeting::{Greeting, GREETING_SIZE};
use capstan_core::msg::Msg;
use capstan_core::options::SocketOptions;
use capstan_core::poller::Interest;
use capstan_core::socket_type::SocketType;
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::os::fd::AsRawFd;

/// Timer id of the handshake deadline, registered under the session id.
pub(crate) const HANDSHAKE_TIMER: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EngineState {
    Handshaking,
    Ready,
    Closing,
}

pub(crate) struct StreamEngine {
    stream: TcpStream,
    endpoint: Endpoint,
    socket_type: SocketType,
    options: SocketOptions,
    /// Object id of the owning session; also the poller token.
    token: ObjectId,
    state: EngineState,
    encoder: Encoder,
    decoder: Decoder,
    out_buf: BytesMut,
    in_buf: BytesMut,
    /// Decoded frame the session pipe refused.
    parked: Option<Msg>,
    peer_greeting: Option<Greeting>,
    identity_queued: bool,
    peer_identity: Option<bytes::Bytes>,
    /// Local read/write interest mirror, to skip redundant poller calls.
    interest_in: bool,
    interest_out: bool,
    input_stopped: bool,
}

impl StreamEngine {
    pub(crate) fn new(
        stream: TcpStream,
        endpoint: Endpoint,
        socket_type: SocketType,
        options: SocketOptions,
        token: ObjectId,
    ) -> Self {
        let encoder = Encoder::new(options.endianness);
        let decoder = Decoder::new(options.endianness, options.max_msg_size);
        Self {
            stream,
            endpoint,
            socket_type,
            options,
            token,
            state: EngineState::Handshaking,
            encoder,
            decoder,
            out_buf: BytesMut::new(),
            in_buf: BytesMut::new(),
            parked: None,
            peer_greeting: None,
            identity_queued: false,
            peer_identity: None,
            interest_in: true,
            interest_out: true,
            input_stopped: false,
        }
    }

    #[inline]
    pub(crate) fn is_handshaking(&self) -> bool {
        self.state == EngineState::Handshaking
    }

    /// Register the stream and queue the greeting. Called once, on the
    /// I/O thread, when the session takes the engine over.
    pub(crate) fn plug(&mut self, io: &mut IoCtx<'_>) {
        io.poller
            .add(self.stream.as_raw_fd(), self.token, Interest::BOTH);
        self.interest_in = true;
        self.interest_out = true;
        if !self.options.handshake_timeout.is_zero() {
            io.timers
                .add(self.options.handshake_timeout, self.token, HANDSHAKE_TIMER);
        }
        let greeting = Greeting::new(self.socket_type).encode();
        self.out_buf.extend_from_slice(&greeting);
        tracing::debug!(
            endpoint = %self.endpoint,
            socket_type = self.socket_type.as_str(),
            "[Engine] handshake started"
        );
    }

    /// Deregister the stream; dropping the engine then closes it.
    pub(crate) fn unplug(&mut self, io: &mut IoCtx<'_>) {
        io.poller.remove(self.stream.as_raw_fd());
        io.timers.cancel(self.token, HANDSHAKE_TIMER);
    }

    /// Drive the engine after poller readiness on its stream.
    pub(crate) fn handle_io(
        &mut self,
        session: &mut SessionInner,
        io: &mut IoCtx<'_>,
        readable: bool,
        _writable: bool,
    ) -> Result<(), EngineError> {
        if readable && !self.input_stopped && self.state != EngineState::Closing {
            self.read_wire()?;
        }
        if self.state == EngineState::Handshaking {
            self.advance_handshake(session, io)?;
        }
        if self.state == EngineState::Ready {
            self.pump_in(session)?;
            self.pump_out(session);
        }
        self.write_wire()?;
        self.settle_interest(io);
        Ok(())
    }

    /// The session pipe made room again; resume pushing inbound frames.
    pub(crate) fn input_resumed(
        &mut self,
        session: &mut SessionInner,
        io: &mut IoCtx<'_>,
    ) -> Result<(), EngineError> {
        if self.state != EngineState::Ready || !self.input_stopped {
            return Ok(());
        }
        self.input_stopped = false;
        self.pump_in(session)?;
        if !self.input_stopped {
            // Catch up on bytes that piled up while the pipe was full.
            self.read_wire()?;
            self.pump_in(session)?;
        }
        self.settle_interest(io);
        Ok(())
    }

    /// The session pipe has fresh outbound messages.
    pub(crate) fn output_resumed(
        &mut self,
        session: &mut SessionInner,
        io: &mut IoCtx<'_>,
    ) -> Result<(), EngineError> {
        if self.state != EngineState::Ready {
            return Ok(());
        }
        self.pump_out(session);
        self.write_wire()?;
        self.settle_interest(io);
        Ok(())
    }

    /// Stop taking input and drain what is already encoded.
    pub(crate) fn begin_close(&mut self, io: &mut IoCtx<'_>) {
        if self.state == EngineState::Closing {
            return;
        }
        self.state = EngineState::Closing;
        self.parked = None;
        self.in_buf.clear();
        io.timers.cancel(self.token, HANDSHAKE_TIMER);
        self.settle_interest(io);
    }

    /// Throw away anything still unwritten; the next drain check passes.
    pub(crate) fn discard_pending(&mut self, io: &mut IoCtx<'_>) {
        self.out_buf.clear();
        self.begin_close(io);
    }

    #[inline]
    pub(crate) fn is_drained(&self) -> bool {
        self.state == EngineState::Closing && self.out_buf.is_empty()
    }

    fn advance_handshake(
        &mut self,
        session: &mut SessionInner,
        io: &mut IoCtx<'_>,
    ) -> Result<(), EngineError> {
        if self.peer_greeting.is_none() {
            if self.in_buf.len() < GREETING_SIZE {
                return Ok(());
            }
            let greeting = Greeting::parse(&self.in_buf[..GREETING_SIZE])?;
            if !self.socket_type.is_compatible(greeting.socket_type) {
                return Err(EngineError::protocol(format!(
                    "{} peer is incompatible with a {} socket",
                    greeting.socket_type.as_str(),
                    self.socket_type.as_str()
                )));
            }
            self.in_buf.advance(GREETING_SIZE);
            self.peer_greeting = Some(greeting);
        }
        if !self.identity_queued {
            let identity = self.options.identity.clone().unwrap_or_default();
            self.encoder
                .encode_into(&Msg::from(identity), &mut self.out_buf);
            self.identity_queued = true;
        }
        if self.peer_identity.is_none() {
            let Some(frame) = self.decoder.decode(&mut self.in_buf)? else {
                return Ok(());
            };
            if frame.has_more() {
                return Err(EngineError::protocol(
                    "identity frame carries a continuation flag",
                ));
            }
            self.peer_identity = Some(frame.to_bytes());
        }

        io.timers.cancel(self.token, HANDSHAKE_TIMER);
        self.state = EngineState::Ready;
        tracing::debug!(
            endpoint = %self.endpoint,
            peer_type = self
                .peer_greeting
                .map(|g| g.socket_type.as_str())
                .unwrap_or("?"),
            "[Engine] handshake complete"
        );
        let identity = self.peer_identity.clone().unwrap_or_default();
        session.engine_ready(io, identity);
        Ok(())
    }

    /// Read until the stream would block, growing the receive buffer.
    fn read_wire(&mut self) -> Result<(), EngineError> {
        loop {
            let start = self.in_buf.len();
            self.in_buf.resize(start + self.options.read_buffer_size, 0);
            match self.stream.read(&mut self.in_buf[start..]) {
                Ok(0) => {
                    self.in_buf.truncate(start);
                    return Err(EngineError::Io(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "connection closed by peer",
                    )));
                }
                Ok(n) => {
                    self.in_buf.truncate(start + n);
                    if n < self.options.read_buffer_size {
                        return Ok(());
                    }
                }
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                    self.in_buf.truncate(start);
                    return Ok(());
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {
                    self.in_buf.truncate(start);
                }
                Err(err) => {
                    self.in_buf.truncate(start);
                    return Err(err.into());
                }
            }
        }
    }

    fn write_wire(&mut self) -> Result<(), EngineError> {
        while !self.out_buf.is_empty() {
            match self.stream.write(&self.out_buf) {
                Ok(0) => {
                    return Err(EngineError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "stream accepted no bytes",
                    )));
                }
                Ok(n) => self.out_buf.advance(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err.into()),
            }
        }
        Ok(())
    }

    /// Decode buffered bytes into the session pipe until it refuses.
    fn pump_in(&mut self, session: &mut SessionInner) -> Result<(), EngineError> {
        loop {
            let msg = match self.parked.take() {
                Some(msg) => msg,
                None => match self.decoder.decode(&mut self.in_buf)? {
                    Some(msg) => msg,
                    None => break,
                },
            };
            if let Err(refused) = session.push_inbound(msg) {
                self.parked = Some(refused);
                if !self.input_stopped {
                    self.input_stopped = true;
                    tracing::trace!(
                        endpoint = %self.endpoint,
                        "[Engine] inbound parked on a full pipe"
                    );
                }
                break;
            }
        }
        session.flush_inbound();
        Ok(())
    }

    /// Encode outbound messages up to the write batch cap.
    fn pump_out(&mut self, session: &mut SessionInner) {
        while self.out_buf.len() < self.options.write_buffer_size {
            let Some(msg) = session.pull_outbound() else {
                break;
            };
            self.encoder.encode_into(&msg, &mut self.out_buf);
        }
    }

    fn settle_interest(&mut self, io: &mut IoCtx<'_>) {
        let readable = self.state != EngineState::Closing && !self.input_stopped;
        let writable = !self.out_buf.is_empty();
        if readable != self.interest_in || writable != self.interest_out {
            self.interest_in = readable;
            self.interest_out = writable;
            io.poller
                .set_interest(self.stream.as_raw_fd(), Interest { readable, writable });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Target};
    use crate::ctx::CtxShared;
    use crate::io_thread::TestReactor;
    use crate::pipe::{Pipe, ReadOutcome};
    use capstan_core::mailbox::Mailbox;
    use std::net::TcpListener;
    use std::time::Duration;

    fn stream_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        client.set_nonblocking(true).unwrap();
        server.set_nonblocking(true).unwrap();
        (client, server)
    }

    fn engine_for(
        stream: TcpStream,
        socket_type: SocketType,
        options: SocketOptions,
        token: ObjectId,
    ) -> StreamEngine {
        let endpoint = Endpoint::parse("tcp://127.0.0.1:0").unwrap();
        StreamEngine::new(stream, endpoint, socket_type, options, token)
    }

    /// Deliver queued pipe commands to whichever end they address.
    fn pump(
        rx: &mut Mailbox<Command>,
        sessions: &mut [&mut SessionInner],
        socket_ends: &mut [&mut Pipe],
    ) {
        while let Ok(Some(cmd)) = rx.recv(Some(Duration::ZERO)) {
            match cmd.dest.target {
                Target::Pipe(id) => {
                    if let Some(end) = socket_ends.iter_mut().find(|p| p.id() == id) {
                        end.process_command(cmd.kind);
                    }
                }
                Target::Object(id) => {
                    if let Some(sess) = sessions.iter_mut().find(|s| s.id() == id) {
                        sess.process_pipe_command(cmd.kind);
                    }
                }
                _ => {}
            }
        }
    }

    fn drive(
        engine: &mut StreamEngine,
        session: &mut SessionInner,
        reactor: &mut TestReactor,
    ) -> Result<(), EngineError> {
        engine.handle_io(session, &mut reactor.io(0), true, true)
    }

    #[test]
    fn test_handshake_completes_between_two_engines() {
        let (ctx, _rx) = CtxShared::for_tests(1);
        let mut reactor = TestReactor::new(ctx.clone());
        let (client, server) = stream_pair();

        let mut opts_a = SocketOptions::default();
        opts_a.identity = Some(bytes::Bytes::from_static(b"client"));
        let mut a = engine_for(client, SocketType::Pair, opts_a, 100);
        let mut b = engine_for(server, SocketType::Pair, SocketOptions::default(), 101);

        let (mut sess_a, _sock_a) = SessionInner::for_tests(&ctx, 100);
        let (mut sess_b, _sock_b) = SessionInner::for_tests(&ctx, 101);
        a.plug(&mut reactor.io(0));
        b.plug(&mut reactor.io(0));

        // A few passes lets the greetings and identity frames cross.
        for _ in 0..10 {
            if !a.is_handshaking() && !b.is_handshaking() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
            drive(&mut a, &mut sess_a, &mut reactor).unwrap();
            drive(&mut b, &mut sess_b, &mut reactor).unwrap();
        }
        assert!(!a.is_handshaking());
        assert!(!b.is_handshaking());
        assert_eq!(sess_b.peer_identity().map(|b| &b[..]), Some(&b"client"[..]));
        assert_eq!(sess_a.peer_identity().map(|b| &b[..]), Some(&b""[..]));
    }

    #[test]
    fn test_incompatible_peer_is_refused() {
        let (ctx, _rx) = CtxShared::for_tests(1);
        let mut reactor = TestReactor::new(ctx.clone());
        let (client, server) = stream_pair();

        let mut a = engine_for(client, SocketType::Push, SocketOptions::default(), 100);
        let mut b = engine_for(server, SocketType::Sub, SocketOptions::default(), 101);
        let (mut sess_a, _sock_a) = SessionInner::for_tests(&ctx, 100);
        let (mut sess_b, _sock_b) = SessionInner::for_tests(&ctx, 101);
        a.plug(&mut reactor.io(0));
        b.plug(&mut reactor.io(0));

        let mut refused = false;
        for _ in 0..10 {
            std::thread::sleep(Duration::from_millis(5));
            let ra = drive(&mut a, &mut sess_a, &mut reactor);
            let rb = drive(&mut b, &mut sess_b, &mut reactor);
            if matches!(ra, Err(EngineError::Protocol(_)))
                || matches!(rb, Err(EngineError::Protocol(_)))
            {
                refused = true;
                break;
            }
        }
        assert!(refused, "mismatched socket types must fail the handshake");
    }

    #[test]
    fn test_messages_flow_after_handshake() {
        let (ctx, mut rx) = CtxShared::for_tests(1);
        let mut rx0 = rx.pop().unwrap();
        let mut reactor = TestReactor::new(ctx.clone());
        let (client, server) = stream_pair();

        let mut a = engine_for(client, SocketType::Pair, SocketOptions::default(), 100);
        let mut b = engine_for(server, SocketType::Pair, SocketOptions::default(), 101);
        let (mut sess_a, mut sock_a) = SessionInner::for_tests(&ctx, 100);
        let (mut sess_b, mut sock_b) = SessionInner::for_tests(&ctx, 101);
        a.plug(&mut reactor.io(0));
        b.plug(&mut reactor.io(0));

        for _ in 0..10 {
            if !a.is_handshaking() && !b.is_handshaking() {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
            drive(&mut a, &mut sess_a, &mut reactor).unwrap();
            drive(&mut b, &mut sess_b, &mut reactor).unwrap();
        }
        assert!(!a.is_handshaking() && !b.is_handshaking());

        sock_a.write(Msg::from("across the wire")).unwrap();
        sock_a.flush();

        let mut got = None;
        for _ in 0..20 {
            pump(
                &mut rx0,
                &mut [&mut sess_a, &mut sess_b],
                &mut [&mut sock_a, &mut sock_b],
            );
            drive(&mut a, &mut sess_a, &mut reactor).unwrap();
            std::thread::sleep(Duration::from_millis(5));
            drive(&mut b, &mut sess_b, &mut reactor).unwrap();
            pump(
                &mut rx0,
                &mut [&mut sess_a, &mut sess_b],
                &mut [&mut sock_a, &mut sock_b],
            );
            if let ReadOutcome::Msg(msg) = sock_b.read() {
                got = Some(msg);
                break;
            }
        }
        let msg = got.expect("message crossed the connection");
        assert_eq!(msg.data(), b"across the wire");
    }
}
