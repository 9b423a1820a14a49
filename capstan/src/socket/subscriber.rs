//! Subscribe side of pub/sub.
//!
//! Filtering happens here, on the receiving socket: publishers send
//! everything and the subscriber matches the first frame of each message
//! against its prefix list, swallowing messages that match nothing. An
//! empty prefix subscribes to everything; no subscriptions means nothing
//! is delivered.

use crate::command::ObjectId;
use crate::socket::fq::FairQueue;
use crate::socket::PipeMap;
use bytes::Bytes;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct SubSocket {
    fq: FairQueue,
    subscriptions: Vec<Bytes>,
    /// First frame of a matched message, pulled ahead by `has_in`.
    pending: Option<Msg>,
    /// Passing the rest of a matched message through.
    delivering: bool,
    /// Swallowing the rest of an unmatched message.
    discarding: bool,
}

impl SubSocket {
    pub(crate) fn new() -> Self {
        Self {
            fq: FairQueue::new(),
            subscriptions: Vec::new(),
            pending: None,
            delivering: false,
            discarding: false,
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.fq.attach(id);
    }

    pub(crate) fn read_activated(&mut self, id: ObjectId) {
        self.fq.activated(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.fq.terminated(id);
    }

    /// Add a prefix filter. Duplicate subscriptions stack: unsubscribing
    /// removes one instance at a time.
    pub(crate) fn subscribe(&mut self, prefix: Bytes) {
        self.subscriptions.push(prefix);
    }

    pub(crate) fn unsubscribe(&mut self, prefix: &[u8]) {
        if let Some(pos) = self.subscriptions.iter().position(|p| p == prefix) {
            self.subscriptions.remove(pos);
        }
    }

    fn matches(&self, data: &[u8]) -> bool {
        self.subscriptions.iter().any(|p| data.starts_with(p))
    }

    pub(crate) fn send(&mut self) -> EngineError {
        EngineError::Unsupported("SUB sockets cannot send")
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<Msg> {
        if let Some(msg) = self.pending.take() {
            self.delivering = msg.has_more();
            return Some(msg);
        }
        loop {
            let (_, msg) = self.fq.recv(pipes)?;
            if self.delivering {
                self.delivering = msg.has_more();
                return Some(msg);
            }
            if self.discarding {
                self.discarding = msg.has_more();
                continue;
            }
            // First frame of a fresh message.
            if self.matches(msg.data()) {
                self.delivering = msg.has_more();
                return Some(msg);
            }
            self.discarding = msg.has_more();
        }
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        if self.pending.is_some() {
            return true;
        }
        if self.delivering {
            return self.fq.has_in(pipes);
        }
        // Look ahead: pull until a message matches, parking its first
        // frame for the next recv.
        loop {
            let Some((_, msg)) = self.fq.recv(pipes) else {
                return false;
            };
            if self.discarding {
                self.discarding = msg.has_more();
                continue;
            }
            if self.matches(msg.data()) {
                self.pending = Some(msg);
                return true;
            }
            self.discarding = msg.has_more();
        }
    }
}
