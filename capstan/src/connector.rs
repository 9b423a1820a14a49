//! Non-blocking TCP connecter.
//!
//! A [`TcpConnector`] owns one connection attempt cycle for a session:
//! resolve, connect without blocking, wait for writability, then hand a
//! ready [`StreamEngine`] back to the session and retire. Failures at
//! any step arm a retry timer on the backoff schedule instead of
//! propagating, so a connecter only goes away on success or when its
//! session tells it to stop.

use crate::command::{CommandKind, Dest, ObjectId};
use crate::engine::StreamEngine;
use crate::io_thread::{IoCtx, IoHandler};
use crate::monitor::{SocketEvent, SocketEventSender};
use crate::tcp;
use capstan_core::endpoint::Endpoint;
use capstan_core::options::SocketOptions;
use capstan_core::poller::Interest;
use capstan_core::reconnect::ReconnectState;
use capstan_core::socket_type::SocketType;
use std::net::TcpStream;
use std::os::fd::AsRawFd;

/// Timer id for the next scheduled attempt.
const RETRY_TIMER: u32 = 1;
/// Timer id bounding a single in-flight connect.
const CONNECT_TIMER: u32 = 2;

pub(crate) struct TcpConnector {
    id: ObjectId,
    /// Session the finished engine is delivered to.
    session: ObjectId,
    endpoint: Endpoint,
    options: SocketOptions,
    socket_type: SocketType,
    reconnect: ReconnectState,
    /// Stream with a connect in flight, registered for writability.
    stream: Option<TcpStream>,
    monitor: Option<SocketEventSender>,
    /// Wait one backoff interval before the first attempt. Set after an
    /// established connection died so a crashing peer is not hammered.
    deferred: bool,
}

impl TcpConnector {
    pub(crate) fn new(
        id: ObjectId,
        session: ObjectId,
        endpoint: Endpoint,
        options: SocketOptions,
        socket_type: SocketType,
        monitor: Option<SocketEventSender>,
        deferred: bool,
    ) -> Self {
        let reconnect = ReconnectState::new(&options);
        Self {
            id,
            session,
            endpoint,
            options,
            socket_type,
            reconnect,
            stream: None,
            monitor,
            deferred,
        }
    }

    fn emit(&self, event: SocketEvent) {
        if let Some(monitor) = &self.monitor {
            let _ = monitor.send(event);
        }
    }

    fn arm_retry(&mut self, io: &mut IoCtx<'_>) {
        let delay = self.reconnect.next_delay();
        tracing::debug!(
            endpoint = %self.endpoint,
            attempt = self.reconnect.attempt(),
            ?delay,
            "[Connector] retry scheduled"
        );
        io.timers.add(delay, self.id, RETRY_TIMER);
        self.emit(SocketEvent::ConnectRetried(self.endpoint.clone()));
    }

    fn start_attempt(&mut self, io: &mut IoCtx<'_>) {
        let addr = match self.endpoint.socket_addr() {
            Ok(addr) => addr,
            Err(err) => {
                tracing::warn!(endpoint = %self.endpoint, %err, "[Connector] address resolution failed");
                self.arm_retry(io);
                return;
            }
        };
        match tcp::start_connect(addr) {
            Ok((stream, true)) => self.finish(io, stream),
            Ok((stream, false)) => {
                io.poller
                    .add(stream.as_raw_fd(), self.id, Interest::WRITABLE);
                if let Some(timeout) = self.options.connect_timeout {
                    io.timers.add(timeout, self.id, CONNECT_TIMER);
                }
                self.stream = Some(stream);
                self.emit(SocketEvent::ConnectDelayed(self.endpoint.clone()));
            }
            Err(err) => {
                tracing::debug!(endpoint = %self.endpoint, %err, "[Connector] connect failed");
                self.arm_retry(io);
            }
        }
    }

    /// Abandon the in-flight attempt, if any.
    fn abort_attempt(&mut self, io: &mut IoCtx<'_>) {
        if let Some(stream) = self.stream.take() {
            io.poller.remove(stream.as_raw_fd());
            io.timers.cancel(self.id, CONNECT_TIMER);
        }
    }

    /// Wrap the connected stream in an engine, deliver it and retire.
    fn finish(&mut self, io: &mut IoCtx<'_>, stream: TcpStream) {
        if let Err(err) = tcp::tune_stream(&stream, &self.options) {
            tracing::warn!(endpoint = %self.endpoint, %err, "[Connector] socket tuning failed");
        }
        tracing::debug!(endpoint = %self.endpoint, "[Connector] connected");
        let engine = Box::new(StreamEngine::new(
            stream,
            self.endpoint.clone(),
            self.socket_type,
            self.options.clone(),
            self.session,
        ));
        io.send(
            Dest::object(io.tid, self.session),
            CommandKind::Attach { engine },
        );
        self.emit(SocketEvent::Connected(self.endpoint.clone()));
        io.retire(self.id);
    }
}

impl IoHandler for TcpConnector {
    fn plug(&mut self, io: &mut IoCtx<'_>) {
        if self.deferred {
            self.arm_retry(io);
        } else {
            self.start_attempt(io);
        }
    }

    fn process(&mut self, io: &mut IoCtx<'_>, cmd: CommandKind) {
        match cmd {
            CommandKind::Stop => {
                self.abort_attempt(io);
                io.timers.cancel_all(self.id);
                io.retire(self.id);
            }
            other => tracing::trace!(
                id = self.id,
                kind = other.name(),
                "[Connector] dropping unexpected command"
            ),
        }
    }

    fn io_event(&mut self, io: &mut IoCtx<'_>, _readable: bool, _writable: bool) {
        let Some(stream) = self.stream.take() else {
            return;
        };
        io.poller.remove(stream.as_raw_fd());
        io.timers.cancel(self.id, CONNECT_TIMER);
        match tcp::take_connect_error(&stream) {
            Ok(()) => self.finish(io, stream),
            Err(err) => {
                tracing::debug!(endpoint = %self.endpoint, %err, "[Connector] connect failed");
                self.arm_retry(io);
            }
        }
    }

    fn timer_event(&mut self, io: &mut IoCtx<'_>, timer_id: u32) {
        match timer_id {
            RETRY_TIMER => self.start_attempt(io),
            CONNECT_TIMER => {
                tracing::debug!(endpoint = %self.endpoint, "[Connector] connect timed out");
                self.abort_attempt(io);
                self.arm_retry(io);
            }
            other => tracing::trace!(id = self.id, timer = other, "[Connector] unknown timer"),
        }
    }
}
