//! Socket event monitoring.
//!
//! Every socket owns an unbounded event channel. Listeners, connecters
//! and engines push lifecycle events into it as they happen; the
//! application end is handed out by [`Socket::monitor`] and can be read,
//! polled or dropped without affecting the socket.
//!
//! [`Socket::monitor`]: crate::socket::Socket::monitor

use capstan_core::endpoint::Endpoint;
use std::fmt;

/// Receiving side of a socket's event stream.
pub type SocketMonitor = flume::Receiver<SocketEvent>;

/// Sending side, held by the socket and its I/O objects.
pub(crate) type SocketEventSender = flume::Sender<SocketEvent>;

/// Create a monitor channel pair.
pub(crate) fn create_monitor() -> (SocketEventSender, SocketMonitor) {
    flume::unbounded()
}

/// Lifecycle events reported on a socket's monitor channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    /// A listener accepted connections on the endpoint.
    Listening(Endpoint),
    /// Binding the endpoint failed.
    BindFailed(Endpoint),
    /// A listener accepted an incoming connection.
    Accepted(Endpoint),
    /// An accept attempt failed with a transient error.
    AcceptFailed(Endpoint),
    /// An outgoing connection completed its handshake path to a live
    /// engine.
    Connected(Endpoint),
    /// An outgoing connection attempt was scheduled for later.
    ConnectDelayed(Endpoint),
    /// An outgoing connection attempt failed and will be retried.
    ConnectRetried(Endpoint),
    /// An established connection was lost.
    Disconnected(Endpoint),
    /// The peer spoke an incompatible protocol or the handshake timed
    /// out.
    HandshakeFailed(Endpoint),
    /// The socket finished closing.
    Closed,
}

impl fmt::Display for SocketEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketEvent::Listening(ep) => write!(f, "listening on {ep}"),
            SocketEvent::BindFailed(ep) => write!(f, "bind failed on {ep}"),
            SocketEvent::Accepted(ep) => write!(f, "accepted connection on {ep}"),
            SocketEvent::AcceptFailed(ep) => write!(f, "accept failed on {ep}"),
            SocketEvent::Connected(ep) => write!(f, "connected to {ep}"),
            SocketEvent::ConnectDelayed(ep) => write!(f, "connect to {ep} delayed"),
            SocketEvent::ConnectRetried(ep) => write!(f, "connect to {ep} will be retried"),
            SocketEvent::Disconnected(ep) => write!(f, "disconnected from {ep}"),
            SocketEvent::HandshakeFailed(ep) => write!(f, "handshake failed with {ep}"),
            SocketEvent::Closed => write!(f, "socket closed"),
        }
    }
}
