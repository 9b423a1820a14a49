//! TCP socket plumbing shared by the listener and connecter.
//!
//! Everything here works on non-blocking `std::net` sockets; readiness is
//! the reactor's job. The helpers cover the three points where plain
//! `std::net` calls are not enough: binding with `SO_REUSEADDR`, starting
//! a connect that completes asynchronously, and tuning an established
//! stream per the owning socket's options.

use capstan_core::options::SocketOptions;
use socket2::{Domain, Protocol, SockRef, Socket, Type};
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};

/// Apply per-stream options to an established connection.
pub(crate) fn tune_stream(stream: &TcpStream, options: &SocketOptions) -> io::Result<()> {
    let sock = SockRef::from(stream);
    sock.set_nodelay(options.tcp_nodelay)?;
    if let Some(keepalive) = options.tcp_keepalive {
        sock.set_keepalive(keepalive)?;
    }
    Ok(())
}

/// Bind a non-blocking listener with `SO_REUSEADDR` set.
///
/// Reusing the address keeps rebinding after a restart from tripping
/// over sockets lingering in `TIME_WAIT`.
pub(crate) fn bind_listener(addr: SocketAddr, backlog: i32) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;
    Ok(socket.into())
}

/// Start a non-blocking connect.
///
/// Returns the stream and whether the connection already completed.
/// When it did not, the caller waits for writability and then calls
/// [`take_connect_error`] to learn the outcome.
pub(crate) fn start_connect(addr: SocketAddr) -> io::Result<(TcpStream, bool)> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_nonblocking(true)?;
    match socket.connect(&addr.into()) {
        Ok(()) => Ok((socket.into(), true)),
        Err(err) if connect_in_progress(&err) => Ok((socket.into(), false)),
        Err(err) => Err(err),
    }
}

fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock || err.raw_os_error() == Some(libc::EINPROGRESS)
}

/// Resolve a pending non-blocking connect after the socket signalled
/// writable.
pub(crate) fn take_connect_error(stream: &TcpStream) -> io::Result<()> {
    match stream.take_error()? {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Whether an `accept` failure is transient and the listener should keep
/// going.
///
/// Aborted handshakes and fd exhaustion come and go; anything else means
/// the listening socket itself is broken.
pub(crate) fn accept_should_retry(err: &io::Error) -> bool {
    if matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted
    ) {
        return true;
    }
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS)
    )
}
