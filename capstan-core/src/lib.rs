//! Capstan Core
//!
//! This crate contains the thread-based core building blocks:
//! - Chunked lock-free queue storage (`yqueue`)
//! - Single-producer single-consumer pipe with batched publication (`ypipe`)
//! - File-descriptor wakeup primitive (`signaler`)
//! - Command mailbox for inter-thread signalling (`mailbox`)
//! - Readiness poller + timer schedule for I/O threads (`poller`)
//! - Wire-frame codec and connection greeting (`codec`, `greeting`)
//! - Socket option bag (`options`)
//! - Reconnect backoff policy (`reconnect`)
//! - Endpoint parsing incl. hashed IPC emulation (`endpoint`, `ipc`)
//! - Error types (`error`)

// The queue/pipe/signaler/poller modules need raw pointers and fd access
#![cfg_attr(not(test), deny(unsafe_code))]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::items_after_statements)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::needless_pass_by_value)]
#![allow(clippy::match_same_arms)]
pub mod codec;
pub mod endpoint;
pub mod error;
pub mod greeting;
pub mod ipc;
pub mod mailbox;
pub mod msg;
pub mod options;
pub mod poller;
pub mod reconnect;
pub mod signaler;
pub mod socket_type;
pub mod ypipe;
pub mod yqueue;

// Optional: a small prelude to make downstream crates ergonomic.
// Keep it minimal to avoid API lock-in.
pub mod prelude {
    pub use crate::codec::{Decoder, Encoder};
    pub use crate::endpoint::Endpoint;
    pub use crate::error::{EngineError, Result};
    pub use crate::greeting::Greeting;
    pub use crate::mailbox::{mailbox, Mailbox, MailboxSender};
    pub use crate::msg::Msg;
    pub use crate::options::SocketOptions;
    pub use crate::poller::{Interest, Poller, Timers};
    pub use crate::reconnect::ReconnectState;
    pub use crate::signaler::Signaler;
    pub use crate::socket_type::SocketType;
    pub use crate::ypipe::{ypipe, YPipeReader, YPipeWriter};
}
