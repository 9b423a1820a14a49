//! Exclusive pair pattern: one peer, both directions.

use crate::command::ObjectId;
use crate::pipe::ReadOutcome;
use crate::socket::{PipeMap, SendError};
use capstan_core::msg::Msg;

pub(crate) struct PairSocket {
    pipe: Option<ObjectId>,
}

impl PairSocket {
    pub(crate) fn new() -> Self {
        Self { pipe: None }
    }

    /// A pair socket carries exactly one pipe; a second attach is
    /// refused by terminating the newcomer.
    pub(crate) fn attach(&mut self, id: ObjectId, pipes: &mut PipeMap) {
        if self.pipe.is_some() {
            tracing::warn!(id, "[Pair] rejecting second peer");
            if let Some(pipe) = pipes.get_mut(&id) {
                pipe.terminate(false);
            }
            return;
        }
        self.pipe = Some(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        if self.pipe == Some(id) {
            self.pipe = None;
        }
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        let Some(pipe) = self.pipe.and_then(|id| pipes.get_mut(&id)) else {
            return Err(SendError::Full(msg));
        };
        let last = !msg.has_more();
        match pipe.write(msg) {
            Ok(()) => {
                if last {
                    pipe.flush();
                }
                Ok(())
            }
            Err(msg) => Err(SendError::Full(msg)),
        }
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<Msg> {
        let pipe = self.pipe.and_then(|id| pipes.get_mut(&id))?;
        match pipe.read() {
            ReadOutcome::Msg(msg) => Some(msg),
            ReadOutcome::Empty | ReadOutcome::Finished => None,
        }
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(&id))
            .map_or(false, |p| p.check_read())
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        self.pipe
            .and_then(|id| pipes.get_mut(&id))
            .map_or(false, |p| p.check_write())
    }
}
