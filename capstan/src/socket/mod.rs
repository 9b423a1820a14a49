//! Sockets and their messaging patterns.
//!
//! A [`Socket`] is the application-facing handle: a thin wrapper that
//! forwards every call to its [`SocketCore`] and ships the core off to
//! the reaper on close. The core owns the socket's mailbox, its pipe
//! endpoints and the pattern state machine, and runs entirely on
//! whichever thread currently holds the handle; nothing here spawns or
//! borrows a thread of its own.
//!
//! Pattern behavior is split one file per pattern, with the shared
//! machinery (fair queue, load balancer, fan-out distributor) under
//! [`fq`], [`lb`] and [`dist`].

pub(crate) mod core;
mod dealer;
mod dist;
mod fq;
mod lb;
mod pair;
mod publisher;
mod pull;
mod push;
mod rep;
mod req;
mod router;
mod subscriber;

pub(crate) use self::core::SocketCore;

use crate::command::ObjectId;
use crate::ctx::{Context, TermGuard};
use crate::monitor::SocketMonitor;
use crate::pipe::Pipe;
use bytes::Bytes;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;
use capstan_core::options::SocketOptions;
use capstan_core::socket_type::SocketType;
use hashbrown::HashMap;
use std::sync::Arc;

use self::dealer::DealerSocket;
use self::pair::PairSocket;
use self::publisher::PubSocket;
use self::pull::PullSocket;
use self::push::PushSocket;
use self::rep::RepSocket;
use self::req::ReqSocket;
use self::router::RouterSocket;
use self::subscriber::SubSocket;

/// Pipe endpoints owned by a socket core, keyed by endpoint id.
pub(crate) type PipeMap = HashMap<ObjectId, Pipe>;

/// Why a pattern refused to take a message.
#[derive(Debug)]
pub(crate) enum SendError {
    /// Nothing writable right now; the message comes back untouched so
    /// the caller can retry it.
    Full(Msg),
    /// The send can never succeed (wrong state, unroutable peer).
    Fatal(EngineError),
}

/// Readiness of a socket, [`Socket::events`]'s answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Events {
    /// A `recv` would produce a message without blocking.
    pub readable: bool,
    /// A `send` would accept a message without blocking.
    pub writable: bool,
}

/// Dispatch over the per-pattern state machines.
pub(crate) enum Pattern {
    Pair(PairSocket),
    Pub(PubSocket),
    Sub(SubSocket),
    Req(ReqSocket),
    Rep(RepSocket),
    Dealer(DealerSocket),
    Router(RouterSocket),
    Pull(PullSocket),
    Push(PushSocket),
}

impl Pattern {
    pub(crate) fn new(socket_type: SocketType, options: &SocketOptions) -> Self {
        match socket_type {
            SocketType::Pair => Self::Pair(PairSocket::new()),
            SocketType::Pub => Self::Pub(PubSocket::new()),
            SocketType::Sub => Self::Sub(SubSocket::new()),
            SocketType::Req => Self::Req(ReqSocket::new()),
            SocketType::Rep => Self::Rep(RepSocket::new()),
            SocketType::Dealer => Self::Dealer(DealerSocket::new()),
            SocketType::Router => Self::Router(RouterSocket::new(options.router_mandatory)),
            SocketType::Pull => Self::Pull(PullSocket::new()),
            SocketType::Push => Self::Push(PushSocket::new()),
        }
    }

    pub(crate) fn options_changed(&mut self, options: &SocketOptions) {
        if let Self::Router(router) = self {
            router.set_mandatory(options.router_mandatory);
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId, pipes: &mut PipeMap) {
        match self {
            Self::Pair(p) => p.attach(id, pipes),
            Self::Pub(p) => p.attach(id),
            Self::Sub(p) => p.attach(id),
            Self::Req(p) => p.attach(id),
            Self::Rep(p) => p.attach(id, pipes),
            Self::Dealer(p) => p.attach(id),
            Self::Router(p) => p.attach(id, pipes),
            Self::Pull(p) => p.attach(id),
            Self::Push(p) => p.attach(id),
        }
    }

    pub(crate) fn identity_changed(&mut self, id: ObjectId, identity: Bytes, pipes: &mut PipeMap) {
        match self {
            Self::Rep(p) => p.identity_changed(id, identity, pipes),
            Self::Router(p) => p.identity_changed(id, identity, pipes),
            _ => {
                if let Some(pipe) = pipes.get_mut(&id) {
                    pipe.set_identity(identity);
                }
            }
        }
    }

    pub(crate) fn read_activated(&mut self, id: ObjectId) {
        match self {
            Self::Sub(p) => p.read_activated(id),
            Self::Req(p) => p.read_activated(id),
            Self::Rep(p) => p.read_activated(id),
            Self::Dealer(p) => p.read_activated(id),
            Self::Router(p) => p.read_activated(id),
            Self::Pull(p) => p.read_activated(id),
            Self::Pair(_) | Self::Pub(_) | Self::Push(_) => {}
        }
    }

    pub(crate) fn write_activated(&mut self, id: ObjectId) {
        match self {
            Self::Req(p) => p.write_activated(id),
            Self::Dealer(p) => p.write_activated(id),
            Self::Push(p) => p.write_activated(id),
            _ => {}
        }
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        match self {
            Self::Pair(p) => p.terminated(id),
            Self::Pub(p) => p.terminated(id),
            Self::Sub(p) => p.terminated(id),
            Self::Req(p) => p.terminated(id),
            Self::Rep(p) => p.terminated(id),
            Self::Dealer(p) => p.terminated(id),
            Self::Router(p) => p.terminated(id),
            Self::Pull(p) => p.terminated(id),
            Self::Push(p) => p.terminated(id),
        }
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        match self {
            Self::Pair(p) => p.send(msg, pipes),
            Self::Pub(p) => {
                p.send(msg, pipes);
                Ok(())
            }
            Self::Sub(p) => Err(SendError::Fatal(p.send())),
            Self::Req(p) => p.send(msg, pipes),
            Self::Rep(p) => p.send(msg, pipes),
            Self::Dealer(p) => p.send(msg, pipes),
            Self::Router(p) => p.send(msg, pipes),
            Self::Pull(p) => Err(SendError::Fatal(p.send())),
            Self::Push(p) => p.send(msg, pipes),
        }
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Result<Option<Msg>, EngineError> {
        match self {
            Self::Pair(p) => Ok(p.recv(pipes)),
            Self::Pub(p) => Err(p.recv()),
            Self::Sub(p) => Ok(p.recv(pipes)),
            Self::Req(p) => p.recv(pipes),
            Self::Rep(p) => p.recv(pipes),
            Self::Dealer(p) => Ok(p.recv(pipes)),
            Self::Router(p) => Ok(p.recv(pipes)),
            Self::Pull(p) => Ok(p.recv(pipes)),
            Self::Push(p) => Err(p.recv()),
        }
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        match self {
            Self::Pair(p) => p.has_in(pipes),
            Self::Sub(p) => p.has_in(pipes),
            Self::Req(p) => p.has_in(pipes),
            Self::Rep(p) => p.has_in(pipes),
            Self::Dealer(p) => p.has_in(pipes),
            Self::Router(p) => p.has_in(pipes),
            Self::Pull(p) => p.has_in(pipes),
            Self::Pub(_) | Self::Push(_) => false,
        }
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        match self {
            Self::Pair(p) => p.has_out(pipes),
            // Publishing drops instead of blocking, so it is always
            // possible.
            Self::Pub(_) => true,
            Self::Req(p) => p.has_out(pipes),
            Self::Rep(p) => p.has_out(),
            Self::Dealer(p) => p.has_out(pipes),
            Self::Router(p) => p.has_out(pipes),
            Self::Push(p) => p.has_out(pipes),
            Self::Sub(_) | Self::Pull(_) => false,
        }
    }

    pub(crate) fn subscribe(&mut self, prefix: Bytes) -> Result<(), EngineError> {
        match self {
            Self::Sub(p) => {
                p.subscribe(prefix);
                Ok(())
            }
            _ => Err(EngineError::Unsupported("only SUB sockets filter")),
        }
    }

    pub(crate) fn unsubscribe(&mut self, prefix: &[u8]) -> Result<(), EngineError> {
        match self {
            Self::Sub(p) => {
                p.unsubscribe(prefix);
                Ok(())
            }
            _ => Err(EngineError::Unsupported("only SUB sockets filter")),
        }
    }
}

/// A messaging socket.
///
/// Sockets are created through [`Context::socket`] and are `Send` but
/// not `Sync`: use one from any thread, hand it between threads freely,
/// but share it only behind external synchronization. Dropping a socket
/// closes it; [`close`] does the same thing with a name.
///
/// # Examples
///
/// ```
/// use capstan::{Context, Msg, SocketType};
///
/// let ctx = Context::builder().io_threads(0).build()?;
///
/// let mut server = ctx.socket(SocketType::Pair)?;
/// server.bind("inproc://greeter")?;
/// let mut client = ctx.socket(SocketType::Pair)?;
/// client.connect("inproc://greeter")?;
///
/// client.send(Msg::from("ping"))?;
/// assert_eq!(server.recv()?.data(), b"ping");
///
/// server.close();
/// client.close();
/// ctx.terminate()?;
/// # Ok::<(), capstan::EngineError>(())
/// ```
///
/// [`close`]: Socket::close
pub struct Socket {
    core: Option<Box<SocketCore>>,
    /// Keeps the context's service threads alive while the socket is
    /// open.
    _guard: Arc<TermGuard>,
}

impl Socket {
    pub(crate) fn create(ctx: &Context, socket_type: SocketType) -> Result<Self, EngineError> {
        let core = SocketCore::create(ctx.shared(), socket_type)?;
        Ok(Self {
            core: Some(Box::new(core)),
            _guard: Arc::clone(ctx.guard()),
        })
    }

    fn core(&mut self) -> &mut SocketCore {
        // The core only leaves on close, which consumes the socket.
        self.core.as_deref_mut().expect("core present until close")
    }

    /// Pattern of this socket.
    pub fn socket_type(&self) -> SocketType {
        self.core
            .as_deref()
            .expect("core present until close")
            .socket_type()
    }

    /// Accept connections on `endpoint` (`tcp://`, `ipc://` or
    /// `inproc://`).
    ///
    /// TCP and IPC binds claim the address here, on the calling thread,
    /// so a taken port fails immediately with
    /// [`EngineError::AddressInUse`]. Binding port `0` picks an
    /// ephemeral port; [`last_endpoint`] reports the resolved address.
    ///
    /// [`last_endpoint`]: Socket::last_endpoint
    pub fn bind(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.core().bind(endpoint)
    }

    /// Connect to `endpoint`.
    ///
    /// TCP and IPC connects return before the connection exists; the
    /// I/O thread keeps dialing with exponential backoff until the peer
    /// appears, and redials whenever an established connection dies.
    /// Messages sent meanwhile queue up to the high-water mark unless
    /// [`SocketOptions::immediate`] defers the queue to the first
    /// completed handshake. Inproc connects require the name to be
    /// bound already.
    pub fn connect(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.core().connect(endpoint)
    }

    /// Stop accepting on a bound endpoint. Established connections
    /// accepted from it live on.
    pub fn unbind(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.core().shutdown_endpoint(endpoint)
    }

    /// Drop a connected endpoint and stop reconnecting to it.
    pub fn disconnect(&mut self, endpoint: &str) -> Result<(), EngineError> {
        self.core().shutdown_endpoint(endpoint)
    }

    /// Queue one message frame.
    ///
    /// A frame with [`Msg::set_more`] set opens (or continues) a
    /// multipart message; the message is delivered to a peer atomically
    /// once its final frame is queued. Blocks while every eligible peer
    /// is over its high-water mark, up to
    /// [`SocketOptions::send_timeout`], then fails with
    /// [`EngineError::WouldBlock`].
    pub fn send(&mut self, msg: Msg) -> Result<(), EngineError> {
        self.core().send(msg)
    }

    /// Queue a whole multipart message, flagging every frame but the
    /// last.
    pub fn send_multipart<I>(&mut self, frames: I) -> Result<(), EngineError>
    where
        I: IntoIterator<Item = Msg>,
    {
        let mut frames = frames.into_iter().peekable();
        while let Some(mut frame) = frames.next() {
            frame.set_more(frames.peek().is_some());
            self.send(frame)?;
        }
        Ok(())
    }

    /// Receive one message frame, blocking up to
    /// [`SocketOptions::recv_timeout`].
    pub fn recv(&mut self) -> Result<Msg, EngineError> {
        self.core().recv()
    }

    /// Receive a whole multipart message.
    pub fn recv_multipart(&mut self) -> Result<Vec<Msg>, EngineError> {
        let mut frames = Vec::new();
        loop {
            let msg = self.recv()?;
            let more = msg.has_more();
            frames.push(msg);
            if !more {
                return Ok(frames);
            }
        }
    }

    /// Add a prefix subscription. SUB sockets only; they start with no
    /// subscriptions and deliver nothing until one is added.
    pub fn subscribe(&mut self, prefix: impl Into<Bytes>) -> Result<(), EngineError> {
        self.core().subscribe(prefix.into())
    }

    /// Remove one instance of a prefix subscription.
    pub fn unsubscribe(&mut self, prefix: &[u8]) -> Result<(), EngineError> {
        self.core().unsubscribe(prefix)
    }

    /// Replace the socket's options.
    ///
    /// Endpoints already set up keep the options they were created
    /// with; timeouts, watermarks for new pipes, and routing behavior
    /// apply from the next operation.
    pub fn set_options(&mut self, options: SocketOptions) -> Result<(), EngineError> {
        self.core().set_options(options)
    }

    pub fn options(&self) -> SocketOptions {
        self.core
            .as_deref()
            .expect("core present until close")
            .options()
            .clone()
    }

    /// Current readiness, the non-blocking preview of [`send`] and
    /// [`recv`].
    ///
    /// [`send`]: Socket::send
    /// [`recv`]: Socket::recv
    pub fn events(&mut self) -> Events {
        self.core().events()
    }

    /// Resolved address of the most recent bind.
    pub fn last_endpoint(&self) -> Option<String> {
        self.core.as_deref().and_then(|c| c.last_endpoint())
    }

    /// Stream of lifecycle events for endpoints created after this
    /// call. Each call starts a fresh channel and the previous one runs
    /// dry.
    pub fn monitor(&mut self) -> SocketMonitor {
        self.core().monitor()
    }

    /// Close the socket.
    ///
    /// Returns immediately; a background thread drains pending outbound
    /// messages for up to [`SocketOptions::linger`] and then tears the
    /// connections down. Dropping the socket does the same.
    pub fn close(mut self) {
        self.release_core();
    }

    fn release_core(&mut self) {
        if let Some(mut core) = self.core.take() {
            core.start_close();
            SocketCore::reap(core);
        }
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.release_core();
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_struct("Socket");
        match self.core.as_deref() {
            Some(core) => dbg
                .field("type", &core.socket_type().as_str())
                .field("tid", &core.tid()),
            None => dbg.field("closed", &true),
        }
        .finish()
    }
}
