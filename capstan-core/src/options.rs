//! Socket configuration options.
//!
//! One option bag per socket, captured by sessions and engines at attach
//! time. Options that shape a live connection (buffer sizes, byte order,
//! message ceiling) are read once when the connection is set up; changing
//! them later only affects connections made afterwards.

use crate::codec::Endianness;
use crate::error::{EngineError, Result};
use bytes::Bytes;
use std::time::Duration;

/// Socket configuration options.
///
/// # Examples
///
/// ```
/// use capstan_core::options::SocketOptions;
/// use std::time::Duration;
///
/// let opts = SocketOptions::default()
///     .with_recv_timeout(Duration::from_secs(5))
///     .with_send_hwm(5000);
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    /// Maximum time to wait for a receive operation.
    /// - `None`: Block indefinitely (default)
    /// - `Some(Duration::ZERO)`: Non-blocking
    /// - `Some(duration)`: Wait up to duration before giving up
    pub recv_timeout: Option<Duration>,

    /// Maximum time to wait for a send operation. Same scheme as
    /// [`recv_timeout`](Self::recv_timeout).
    pub send_timeout: Option<Duration>,

    /// Maximum time a fresh connection may spend in the greeting exchange
    /// before it is torn down. `Duration::ZERO` disables the limit.
    pub handshake_timeout: Duration,

    /// Time to keep draining unsent messages after a socket closes.
    /// - `None`: Close immediately, discard pending messages
    /// - `Some(duration)`: Keep the connection up to `duration` to finish
    ///   sending
    pub linger: Option<Duration>,

    /// Initial reconnection delay after connection loss.
    pub reconnect_ivl: Duration,

    /// Maximum reconnection delay for exponential backoff.
    /// `Duration::ZERO` disables backoff growth.
    pub reconnect_ivl_max: Duration,

    /// Maximum time a single connect attempt may take before it counts as
    /// failed and the backoff schedule takes over. `None` leaves it to the
    /// OS.
    pub connect_timeout: Option<Duration>,

    /// Maximum number of inbound messages queued per connection before the
    /// peer is made to stop sending.
    pub recv_hwm: usize,

    /// Maximum number of outbound messages queued per connection before
    /// sends refuse or skip the connection.
    pub send_hwm: usize,

    /// Maximum size of a single message in bytes. Oversized inbound frames
    /// kill the connection; oversized sends are refused locally.
    pub max_msg_size: Option<usize>,

    /// Byte order of the long frame length field on the wire.
    pub endianness: Endianness,

    /// Bytes read from the network per syscall.
    pub read_buffer_size: usize,

    /// Bytes batched per write syscall.
    pub write_buffer_size: usize,

    /// Identity announced to peers after the greeting. Empty means
    /// anonymous; ROUTER peers then assign a generated identity.
    pub identity: Option<Bytes>,

    /// ROUTER behaviour when the addressed peer is unknown or full.
    /// - `false` (default): Silently drop the message
    /// - `true`: Report the failure to the sender
    pub router_mandatory: bool,

    /// Queue messages only to completed connections. When `false`
    /// (default), messages may queue towards a connection that is still
    /// being established.
    pub immediate: bool,

    /// Pending-connection queue length for listeners.
    pub backlog: i32,

    /// Disable Nagle's algorithm on TCP connections.
    pub tcp_nodelay: bool,

    /// TCP keepalive probing. `None` leaves the OS default.
    pub tcp_keepalive: Option<bool>,

    /// Bitmask of I/O threads allowed to host this socket's connections.
    /// Bit N selects I/O thread N; zero means any thread.
    pub affinity: u64,
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self {
            recv_timeout: None, // Block indefinitely
            send_timeout: None, // Block indefinitely
            handshake_timeout: Duration::from_secs(30),
            linger: Some(Duration::from_secs(30)),
            reconnect_ivl: Duration::from_millis(100),
            reconnect_ivl_max: Duration::ZERO, // No backoff growth
            connect_timeout: None,              // OS default
            recv_hwm: 1000,
            send_hwm: 1000,
            max_msg_size: None, // No limit
            endianness: Endianness::Big,
            read_buffer_size: 8192,
            write_buffer_size: 8192,
            identity: None,
            router_mandatory: false,
            immediate: false,
            backlog: 100,
            tcp_nodelay: true,
            tcp_keepalive: None,
            affinity: 0, // Any I/O thread
        }
    }
}

impl SocketOptions {
    /// Create new socket options with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set receive timeout.
    #[must_use]
    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = Some(timeout);
        self
    }

    /// Set send timeout.
    #[must_use]
    pub fn with_send_timeout(mut self, timeout: Duration) -> Self {
        self.send_timeout = Some(timeout);
        self
    }

    /// Set handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set linger timeout.
    #[must_use]
    pub fn with_linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = linger;
        self
    }

    /// Set reconnection interval.
    #[must_use]
    pub fn with_reconnect_ivl(mut self, ivl: Duration) -> Self {
        self.reconnect_ivl = ivl;
        self
    }

    /// Set maximum reconnection interval for exponential backoff.
    #[must_use]
    pub fn with_reconnect_ivl_max(mut self, max: Duration) -> Self {
        self.reconnect_ivl_max = max;
        self
    }

    /// Set the per-attempt connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Set receive high water mark.
    #[must_use]
    pub fn with_recv_hwm(mut self, hwm: usize) -> Self {
        self.recv_hwm = hwm;
        self
    }

    /// Set send high water mark.
    #[must_use]
    pub fn with_send_hwm(mut self, hwm: usize) -> Self {
        self.send_hwm = hwm;
        self
    }

    /// Set maximum message size.
    #[must_use]
    pub fn with_max_msg_size(mut self, size: Option<usize>) -> Self {
        self.max_msg_size = size;
        self
    }

    /// Set the byte order of the long length field.
    #[must_use]
    pub fn with_endianness(mut self, endianness: Endianness) -> Self {
        self.endianness = endianness;
        self
    }

    /// Set read buffer size.
    #[must_use]
    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size;
        self
    }

    /// Set write buffer size.
    #[must_use]
    pub fn with_write_buffer_size(mut self, size: usize) -> Self {
        self.write_buffer_size = size;
        self
    }

    /// Set the socket identity.
    #[must_use]
    pub fn with_identity(mut self, identity: Bytes) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Enable ROUTER mandatory mode.
    #[must_use]
    pub fn with_router_mandatory(mut self, enabled: bool) -> Self {
        self.router_mandatory = enabled;
        self
    }

    /// Enable or disable immediate mode.
    #[must_use]
    pub fn with_immediate(mut self, immediate: bool) -> Self {
        self.immediate = immediate;
        self
    }

    /// Set the listener backlog.
    #[must_use]
    pub fn with_backlog(mut self, backlog: i32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Enable or disable TCP_NODELAY.
    #[must_use]
    pub fn with_tcp_nodelay(mut self, enabled: bool) -> Self {
        self.tcp_nodelay = enabled;
        self
    }

    /// Set TCP keepalive probing.
    #[must_use]
    pub fn with_tcp_keepalive(mut self, enabled: Option<bool>) -> Self {
        self.tcp_keepalive = enabled;
        self
    }

    /// Set the I/O-thread affinity mask.
    #[must_use]
    pub fn with_affinity(mut self, mask: u64) -> Self {
        self.affinity = mask;
        self
    }

    /// Check if receive operations should be non-blocking.
    #[must_use]
    pub fn is_recv_nonblocking(&self) -> bool {
        matches!(self.recv_timeout, Some(d) if d.is_zero())
    }

    /// Check if send operations should be non-blocking.
    #[must_use]
    pub fn is_send_nonblocking(&self) -> bool {
        matches!(self.send_timeout, Some(d) if d.is_zero())
    }

    /// Validate a caller-supplied identity.
    ///
    /// Identities must fit in one length byte and must not start with a
    /// null byte, which is reserved for generated identities.
    pub fn validate_identity(id: &[u8]) -> Result<()> {
        if id.is_empty() || id.len() > 255 {
            return Err(EngineError::InvalidIdentity);
        }
        if id[0] == 0x00 {
            return Err(EngineError::InvalidIdentity);
        }
        Ok(())
    }
}
