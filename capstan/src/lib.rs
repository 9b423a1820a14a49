//! # Capstan
//!
//! An embeddable message-queue transport engine: ZeroMQ-style socket
//! patterns over TCP, IPC and in-process transports, driven by a small
//! pool of reactor threads.
//!
//! ## Architecture
//!
//! Capstan is split into two crates:
//!
//! - **`capstan-core`**: lock-free SPSC pipes and queues, command
//!   mailboxes, the readiness poller, the wire codec and greeting
//! - **`capstan`** (this crate): the context with its I/O threads,
//!   listeners, sessions and stream engines, and the socket patterns
//!   on top
//!
//! A [`Context`] owns the I/O thread pool and the in-process name
//! registry. Sockets created from it exchange messages with their peers
//! over lock-free pipes; everything else that crosses a thread boundary
//! travels as a command on a mailbox, so no socket state is ever shared
//! between threads.
//!
//! ## Socket patterns
//!
//! The nine [`SocketType`]s pair up the ZeroMQ way: `PAIR` with `PAIR`,
//! `PUB` fanning out to `SUB`, `REQ`/`REP` (and their `DEALER`/`ROUTER`
//! generalizations) for request-reply, `PUSH`/`PULL` for pipelines.
//!
//! ## Quick start
//!
//! ```
//! use capstan::{Context, Msg, SocketType};
//!
//! let ctx = Context::new()?;
//!
//! let mut pull = ctx.socket(SocketType::Pull)?;
//! pull.bind("tcp://127.0.0.1:0")?;
//! let endpoint = pull.last_endpoint().unwrap();
//!
//! let mut push = ctx.socket(SocketType::Push)?;
//! push.connect(&endpoint)?;
//!
//! push.send(Msg::from("job #1"))?;
//! assert_eq!(pull.recv()?.data(), b"job #1");
//!
//! push.close();
//! pull.close();
//! ctx.terminate()?;
//! # Ok::<(), capstan::EngineError>(())
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

mod command;
mod connector;
mod ctx;
pub mod dev_tracing;
mod engine;
mod io_thread;
mod listener;
mod monitor;
mod pipe;
mod reaper;
mod session;
mod socket;
mod tcp;

pub use crate::ctx::{Context, ContextBuilder};
pub use crate::monitor::{SocketEvent, SocketMonitor};
pub use crate::socket::{Events, Socket};

pub use bytes::Bytes;
pub use capstan_core::endpoint::{Endpoint, EndpointError};
pub use capstan_core::error::EngineError;
pub use capstan_core::msg::Msg;
pub use capstan_core::options::SocketOptions;
pub use capstan_core::socket_type::SocketType;
