//! Pull half of the pipeline pattern: fair-queued, receive-only.

use crate::command::ObjectId;
use crate::socket::fq::FairQueue;
use crate::socket::PipeMap;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;

pub(crate) struct PullSocket {
    fq: FairQueue,
}

impl PullSocket {
    pub(crate) fn new() -> Self {
        Self {
            fq: FairQueue::new(),
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

    pub(crate) fn send(&mut self) -> EngineError {
        EngineError::Unsupported("PULL sockets cannot send")
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<Msg> {
        self.fq.recv(pipes).map(|(_, msg)| msg)
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.fq.has_in(pipes)
    }
}
