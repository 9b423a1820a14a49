//! Push half of the pipeline pattern: load-balanced, send-only.

use crate::command::ObjectId;
use crate::socket::lb::LoadBalancer;
use crate::socket::{PipeMap, SendError};
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct PushSocket {
    lb: LoadBalancer,
}

impl PushSocket {
    pub(crate) fn new() -> Self {
        Self {
            lb: LoadBalancer::new(),
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.lb.attach(id);
    }

    pub(crate) fn write_activated(&mut self, id: ObjectId) {
        self.lb.activated(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.lb.terminated(id);
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        self.lb.send(msg, pipes).map_err(SendError::Full)
    }

    pub(crate) fn recv(&mut self) -> EngineError {
        EngineError::Unsupported("PUSH sockets cannot receive")
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.lb.has_out(pipes)
    }
}
