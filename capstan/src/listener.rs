//! TCP accept loop.
//!
//! A [`Listener`] wraps an already-bound non-blocking [`TcpListener`]
//! and turns readiness into accepted sessions. Binding itself happens on
//! the caller's thread so address errors surface from `bind` directly;
//! the listener only ever reports accept-time problems.

use crate::command::{CommandKind, Dest, ObjectId};
use crate::engine::StreamEngine;
use crate::io_thread::{IoCtx, IoHandler};
use crate::monitor::{SocketEvent, SocketEventSender};
use crate::session::Session;
use crate::tcp;
use capstan_core::endpoint::Endpoint;
use capstan_core::options::SocketOptions;
use capstan_core::poller::Interest;
use capstan_core::socket_type::SocketType;
use std::net::TcpListener;
use std::os::fd::AsRawFd;

pub(crate) struct Listener {
    id: ObjectId,
    /// The owning socket core.
    socket: Dest,
    listener: TcpListener,
    endpoint: Endpoint,
    options: SocketOptions,
    socket_type: SocketType,
    monitor: Option<SocketEventSender>,
}

impl Listener {
    pub(crate) fn new(
        id: ObjectId,
        socket: Dest,
        listener: TcpListener,
        endpoint: Endpoint,
        options: SocketOptions,
        socket_type: SocketType,
        monitor: Option<SocketEventSender>,
    ) -> Self {
        Self {
            id,
            socket,
            listener,
            endpoint,
            options,
            socket_type,
            monitor,
        }
    }

    fn emit(&self, event: SocketEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }
}

impl IoHandler for Listener {
    fn plug(&mut self, io: &mut IoCtx<'_>) {
        io.poller
            .add(self.listener.as_raw_fd(), self.id, Interest::READABLE);
        tracing::debug!(endpoint = %self.endpoint, "[Listener] accepting");
    }

    fn process(&mut self, io: &mut IoCtx<'_>, cmd: CommandKind) {
        match cmd {
            CommandKind::Term { .. } => {
                io.poller.remove(self.listener.as_raw_fd());
                io.send(self.socket, CommandKind::TermAck);
                io.retire(self.id);
                tracing::debug!(endpoint = %self.endpoint, "[Listener] closed");
            }
            other => tracing::trace!(
                id = self.id,
                kind = other.name(),
                "[Listener] dropping unexpected command"
            ),
        }
    }

    fn io_event(&mut self, io: &mut IoCtx<'_>, _readable: bool, _writable: bool) {
        loop {
            let stream = match self.listener.accept() {
                Ok((stream, peer)) => {
                    tracing::debug!(endpoint = %self.endpoint, %peer, "[Listener] accepted");
                    stream
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if tcp::accept_should_retry(&err) => continue,
                Err(err) => {
                    tracing::warn!(endpoint = %self.endpoint, %err, "[Listener] accept failed");
                    self.emit(SocketEvent::AcceptFailed(self.endpoint.clone()));
                    break;
                }
            };
            if let Err(err) = stream.set_nonblocking(true) {
                tracing::warn!(endpoint = %self.endpoint, %err, "[Listener] accepted stream unusable");
                continue;
            }
            if let Err(err) = tcp::tune_stream(&stream, &self.options) {
                tracing::warn!(endpoint = %self.endpoint, %err, "[Listener] socket tuning failed");
            }

            let session_id = io.ctx.next_object_id();
            let engine = Box::new(StreamEngine::new(
                stream,
                self.endpoint.clone(),
                self.socket_type,
                self.options.clone(),
                session_id,
            ));
            let session = Session::accepted(
                session_id,
                io.tid,
                self.socket,
                self.endpoint.clone(),
                self.options.clone(),
                self.socket_type,
                engine,
                self.monitor.clone(),
            );
            io.plug(session_id, Box::new(session));
            self.emit(SocketEvent::Accepted(self.endpoint.clone()));
        }
    }

    fn timer_event(&mut self, _io: &mut IoCtx<'_>, timer_id: u32) {
        tracing::trace!(id = self.id, timer = timer_id, "[Listener] unknown timer");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Target;
    use crate::ctx::CtxShared;
    use crate::io_thread::TestReactor;
    use std::net::TcpStream;
    use std::time::{Duration, Instant};

    fn listener_on_ephemeral(monitor: Option<SocketEventSender>) -> (Listener, TcpStream) {
        let inner = tcp::bind_listener("127.0.0.1:0".parse().unwrap(), 16).unwrap();
        let addr = inner.local_addr().unwrap();
        let endpoint = Endpoint::parse(&format!("tcp://{addr}")).unwrap();
        let listener = Listener::new(
            9,
            Dest::socket(0),
            inner,
            endpoint,
            SocketOptions::default(),
            SocketType::Rep,
            monitor,
        );
        let client = TcpStream::connect(addr).unwrap();
        (listener, client)
    }

    #[test]
    fn test_accept_plugs_a_session() {
        let (ctx, _rx) = CtxShared::for_tests(1);
        let mut reactor = TestReactor::new(ctx);
        let (tx, monitor) = crate::monitor::create_monitor();
        let (mut listener, _client) = listener_on_ephemeral(Some(tx));

        listener.plug(&mut reactor.io(0));
        let deadline = Instant::now() + Duration::from_secs(5);
        while reactor.take_plugs().is_empty() {
            assert!(Instant::now() < deadline, "connection never accepted");
            let mut events = Vec::new();
            reactor
                .poller
                .wait(Some(Duration::from_millis(100)), &mut events)
                .unwrap();
            for event in events {
                assert_eq!(event.token, 9);
                listener.io_event(&mut reactor.io(0), event.readable, event.writable);
            }
        }
        assert_eq!(
            monitor.try_recv().ok(),
            Some(SocketEvent::Accepted(listener.endpoint.clone()))
        );
    }

    #[test]
    fn test_term_acks_to_socket_and_retires() {
        let (ctx, mut rx) = CtxShared::for_tests(1);
        let mut rx0 = rx.pop().unwrap();
        let mut reactor = TestReactor::new(ctx);
        let (mut listener, _client) = listener_on_ephemeral(None);

        listener.plug(&mut reactor.io(0));
        listener.process(&mut reactor.io(0), CommandKind::Term { linger: None });

        let cmd = rx0.recv(Some(Duration::from_secs(1))).unwrap().unwrap();
        assert_eq!(cmd.dest.target, Target::Socket);
        assert!(matches!(cmd.kind, CommandKind::TermAck));
        assert_eq!(reactor.retired(), &[9]);
    }
}
