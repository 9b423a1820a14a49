//! Dealer pattern: load-balanced sends, fair-queued receives, no state
//! machine between them.

use crate::command::ObjectId;
use crate::socket::fq::FairQueue;
use crate::socket::lb::LoadBalancer;
use crate::socket::{PipeMap, SendError};
use capstan_core::msg::Msg;

pub(crate) struct DealerSocket {
    lb: LoadBalancer,
    fq: FairQueue,
}

impl DealerSocket {
    pub(crate) fn new() -> Self {
        Self {
            lb: LoadBalancer::new(),
            fq: FairQueue::new(),
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
        self.lb.send(msg, pipes).map_err(SendError::Full)
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<Msg> {
        self.fq.recv(pipes).map(|(_, msg)| msg)
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.fq.has_in(pipes)
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.lb.has_out(pipes)
    }
}
