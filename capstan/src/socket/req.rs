//! Request pattern: strict send/receive alternation on top of the
//! dealer plumbing.
//!
//! Every outgoing request is prefixed with an empty delimiter frame so
//! reply routers can carry the return path; the matching delimiter is
//! stripped from the reply before it reaches the caller. Sending twice
//! in a row, or receiving with no request outstanding, is a state
//! machine violation surfaced as [`EngineError::InvalidState`].

use crate::command::ObjectId;
use crate::socket::fq::FairQueue;
use crate::socket::lb::LoadBalancer;
use crate::socket::{PipeMap, SendError};
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct ReqSocket {
    lb: LoadBalancer,
    fq: FairQueue,
    /// A request is out; sends are refused until the reply lands.
    awaiting_reply: bool,
    /// The delimiter went out, remaining request frames follow it.
    sending_body: bool,
    /// The reply delimiter was consumed, body frames pass through.
    receiving_body: bool,
    /// Swallowing a malformed reply up to its final frame.
    discarding: bool,
}

impl ReqSocket {
    pub(crate) fn new() -> Self {
        Self {
            lb: LoadBalancer::new(),
            fq: FairQueue::new(),
            awaiting_reply: false,
            sending_body: false,
            receiving_body: false,
            discarding: false,
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.lb.attach(id);
        self.fq.attach(id);
    }

    pub(crate) fn read_activated(&mut self, id: ObjectId) {
        self.fq.activated(id);
    }

    pub(crate) fn write_activated(&mut self, id: ObjectId) {
        self.lb.activated(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.lb.terminated(id);
        self.fq.terminated(id);
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        if self.awaiting_reply {
            return Err(SendError::Fatal(EngineError::InvalidState(
                "REQ socket awaits a reply",
            )));
        }
        if !self.sending_body {
            let mut delimiter = Msg::new();
            delimiter.set_more(true);
            if self.lb.send(delimiter, pipes).is_err() {
                return Err(SendError::Full(msg));
            }
            self.sending_body = true;
        }
        let last = !msg.has_more();
        if let Err(msg) = self.lb.send(msg, pipes) {
            return Err(SendError::Full(msg));
        }
        if last {
            self.sending_body = false;
            self.awaiting_reply = true;
        }
        Ok(())
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Result<Option<Msg>, EngineError> {
        if !self.awaiting_reply {
            return Err(EngineError::InvalidState(
                "REQ socket has no outstanding request",
            ));
        }
        loop {
            if self.discarding {
                match self.fq.recv(pipes) {
                    Some((_, msg)) => {
                        if !msg.has_more() {
                            self.discarding = false;
                        }
                        continue;
                    }
                    None => return Ok(None),
                }
            }
            if !self.receiving_body {
                let Some((_, msg)) = self.fq.recv(pipes) else {
                    return Ok(None);
                };
                if msg.is_empty() && msg.has_more() {
                    self.receiving_body = true;
                    continue;
                }
                // A reply that does not open with the delimiter is bogus.
                tracing::warn!("[Req] discarding reply without a delimiter frame");
                self.discarding = msg.has_more();
                continue;
            }
            let Some((_, msg)) = self.fq.recv(pipes) else {
                return Ok(None);
            };
            if !msg.has_more() {
                self.receiving_body = false;
                self.awaiting_reply = false;
            }
            return Ok(Some(msg));
        }
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.awaiting_reply && self.fq.has_in(pipes)
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        !self.awaiting_reply && (self.sending_body || self.lb.has_out(pipes))
    }
}
