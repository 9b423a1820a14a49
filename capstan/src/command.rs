//! Cross-thread control commands.
//!
//! Everything that mutates an object owned by another thread travels as a
//! [`Command`] through that thread's mailbox: pipe activation, pipe
//! termination, handler plugging, socket reaping. A command names its
//! destination explicitly (the owning thread's slot id plus a target
//! within that thread) and moves its payload, so delivery is at most once
//! by construction.

use crate::engine::StreamEngine;
use crate::io_thread::IoHandler;
use crate::pipe::Pipe;
use crate::socket::SocketCore;
use bytes::Bytes;
use std::fmt;
use std::time::Duration;

/// Identifies a handler, pipe endpoint or other addressable object.
///
/// Ids are allocated from a single per-context counter so an id is never
/// reused across object kinds, which keeps stale-command logs unambiguous.
pub(crate) type ObjectId = u32;

/// Target of a command within the destination thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Target {
    /// The thread itself (stop, plug a new handler).
    Thread,
    /// The socket core owned by the destination slot.
    Socket,
    /// A handler hosted on an I/O thread (session, listener, connector).
    Object(ObjectId),
    /// A pipe endpoint owned by the destination socket.
    Pipe(ObjectId),
}

/// Full command address: thread slot plus in-thread target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Dest {
    pub tid: u32,
    pub target: Target,
}

impl Dest {
    pub(crate) const fn thread(tid: u32) -> Self {
        Self {
            tid,
            target: Target::Thread,
        }
    }

    pub(crate) const fn socket(tid: u32) -> Self {
        Self {
            tid,
            target: Target::Socket,
        }
    }

    pub(crate) const fn object(tid: u32, id: ObjectId) -> Self {
        Self {
            tid,
            target: Target::Object(id),
        }
    }

    pub(crate) const fn pipe(tid: u32, id: ObjectId) -> Self {
        Self {
            tid,
            target: Target::Pipe(id),
        }
    }
}

impl fmt::Display for Dest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Target::Thread => write!(f, "thread {}", self.tid),
            Target::Socket => write!(f, "socket {}", self.tid),
            Target::Object(id) => write!(f, "object {} on thread {}", id, self.tid),
            Target::Pipe(id) => write!(f, "pipe {} on socket {}", id, self.tid),
        }
    }
}

/// A control command and its payload.
pub(crate) struct Command {
    pub dest: Dest,
    pub kind: CommandKind,
}

impl Command {
    pub(crate) fn new(dest: Dest, kind: CommandKind) -> Self {
        Self { dest, kind }
    }
}

/// The action a command performs at its destination.
pub(crate) enum CommandKind {
    /// Shut the destination down: sockets stop accepting work, threads
    /// exit their loop after the current iteration.
    Stop,

    /// Install a new handler on an I/O thread under the given id.
    Plug {
        id: ObjectId,
        handler: Box<dyn IoHandler>,
    },

    /// Hand a connected engine to its session.
    Attach { engine: Box<StreamEngine> },

    /// Hand a freshly created pipe endpoint to the destination socket.
    Bind { pipe: Pipe },

    /// The peer endpoint flushed while this end's reader was asleep.
    ActivateRead,

    /// The peer endpoint consumed messages; carries its running read count
    /// so the writer can refresh its high-water-mark credit.
    ActivateWrite { msgs_read: u64 },

    /// First phase of pipe termination, sent to the peer endpoint.
    PipeTerm,

    /// Acknowledgement phase of pipe termination.
    PipeTermAck,

    /// The wire handshake produced an identity for an already-attached
    /// pipe; routing sockets re-key on it.
    PipeIdentity { identity: Bytes },

    /// A handler created on behalf of a socket (an accepted session)
    /// registers itself as the socket's child.
    Own { child: Dest },

    /// A child asks its owner to terminate it (an accepted session whose
    /// connection died).
    TermReq { child: Dest },

    /// Owner tells a child to shut down, draining for up to `linger`.
    Term { linger: Option<Duration> },

    /// Child reports its shutdown complete.
    TermAck,

    /// A closed socket core is handed to the reaper thread.
    Reap { core: Box<SocketCore> },

    /// The reaper reports the last socket gone to the termination mailbox.
    Done,
}

impl CommandKind {
    /// Variant name for trace logs.
    pub(crate) const fn name(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Plug { .. } => "plug",
            Self::Attach { .. } => "attach",
            Self::Bind { .. } => "bind",
            Self::ActivateRead => "activate-read",
            Self::ActivateWrite { .. } => "activate-write",
            Self::PipeTerm => "pipe-term",
            Self::PipeTermAck => "pipe-term-ack",
            Self::PipeIdentity { .. } => "pipe-identity",
            Self::Own { .. } => "own",
            Self::TermReq { .. } => "term-req",
            Self::Term { .. } => "term",
            Self::TermAck => "term-ack",
            Self::Reap { .. } => "reap",
            Self::Done => "done",
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("dest", &self.dest)
            .field("kind", &self.kind.name())
            .finish()
    }
}
