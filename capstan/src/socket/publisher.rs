//! Publish side of pub/sub: fan-out, never blocks, drops to slow peers.

use crate::command::ObjectId;
use crate::socket::dist::Distributor;
use crate::socket::PipeMap;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct PubSocket {
    dist: Distributor,
}

impl PubSocket {
    pub(crate) fn new() -> Self {
        Self {
            dist: Distributor::new(),
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.dist.attach(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.dist.terminated(id);
    }

    /// Publishing always succeeds; subscribers over their watermark miss
    /// the message.
    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) {
        self.dist.send(msg, pipes);
    }

    pub(crate) fn recv(&mut self) -> EngineError {
        EngineError::Unsupported("PUB sockets cannot receive")
    }
}
