//! Reply pattern: a router that hides the routing envelope.
//!
//! On receive, every frame up to and including the empty delimiter is
//! captured instead of delivered, so the caller only sees request
//! bodies. The captured envelope is replayed in front of the next
//! reply, which routes it back to the requester. Mandatory routing is
//! off, so replies to peers that vanished are silently dropped.

use crate::command::ObjectId;
use crate::socket::router::RouterSocket;
use crate::socket::{PipeMap, SendError};
use bytes::Bytes;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct RepSocket {
    router: RouterSocket,
    /// Identity and envelope frames of the request being served.
    envelope: Vec<Msg>,
    /// A request was fully received; the caller must reply next.
    sending_reply: bool,
    /// The envelope is captured, body frames pass through.
    in_body: bool,
}

impl RepSocket {
    pub(crate) fn new() -> Self {
        Self {
            router: RouterSocket::new(false),
            envelope: Vec::new(),
            sending_reply: false,
            in_body: false,
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId, pipes: &mut PipeMap) {
        self.router.attach(id, pipes);
    }

    pub(crate) fn identity_changed(&mut self, id: ObjectId, identity: Bytes, pipes: &mut PipeMap) {
        self.router.identity_changed(id, identity, pipes);
    }

    pub(crate) fn read_activated(&mut self, id: ObjectId) {
        self.router.read_activated(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.router.terminated(id);
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        if !self.sending_reply {
            return Err(SendError::Fatal(EngineError::InvalidState(
                "REP socket has no request to reply to",
            )));
        }
        for frame in self.envelope.drain(..) {
            // Mandatory routing is off, so replaying the envelope cannot fail.
            self.router.send(frame, pipes)?;
        }
        let last = !msg.has_more();
        self.router.send(msg, pipes)?;
        if last {
            self.sending_reply = false;
        }
        Ok(())
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Result<Option<Msg>, EngineError> {
        if self.sending_reply {
            return Err(EngineError::InvalidState(
                "REP socket has a pending reply to send",
            ));
        }
        loop {
            if !self.in_body {
                let Some(frame) = self.router.recv(pipes) else {
                    return Ok(None);
                };
                if frame.has_more() {
                    let bottom = frame.is_empty();
                    self.envelope.push(frame);
                    if bottom {
                        self.in_body = true;
                    }
                    continue;
                }
                tracing::warn!("[Rep] discarding request without a delimiter frame");
                self.envelope.clear();
                continue;
            }
            let Some(frame) = self.router.recv(pipes) else {
                return Ok(None);
            };
            if !frame.has_more() {
                self.in_body = false;
                self.sending_reply = true;
            }
            return Ok(Some(frame));
        }
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        !self.sending_reply && self.router.has_in(pipes)
    }

    #[inline]
    pub(crate) fn has_out(&self) -> bool {
        self.sending_reply
    }
}
