//! Fair queueing across inbound pipes.
//!
//! Pipes rotate round-robin at message boundaries. The active prefix of
//! the pipe list holds pipes believed readable; a pipe that runs dry
//! drops out of the prefix and rejoins when its `ActivateRead` arrives.
//! Mid-message the queue stays pinned to the current pipe so multipart
//! messages never interleave.

use crate::command::ObjectId;
use crate::pipe::{Pipe, ReadOutcome};
use crate::socket::PipeMap;
use capstan_core::msg::Msg;

pub(crate) struct FairQueue {
    pipes: Vec<ObjectId>,
    /// Length of the active prefix.
    active: usize,
    /// Index of the pipe to read next.
    current: usize,
    /// Mid-message: stay on `current` until the final frame.
    more: bool,
}

impl FairQueue {
    pub(crate) fn new() -> Self {
        Self {
            pipes: Vec::new(),
            active: 0,
            current: 0,
            more: false,
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.pipes.push(id);
        let last = self.pipes.len() - 1;
        self.pipes.swap(last, self.active);
        self.active += 1;
    }

    pub(crate) fn activated(&mut self, id: ObjectId) {
        let Some(pos) = self.pipes.iter().position(|p| *p == id) else {
            return;
        };
        if pos < self.active {
            return;
        }
        self.pipes.swap(pos, self.active);
        self.active += 1;
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        let Some(pos) = self.pipes.iter().position(|p| *p == id) else {
            return;
        };
        if pos < self.active {
            self.active -= 1;
            self.pipes.swap(pos, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        let gone = self.pipes.iter().position(|p| *p == id);
        if let Some(pos) = gone {
            self.pipes.swap_remove(pos);
            // swap_remove may have moved an active pipe into an inactive
            // slot; re-derive the prefix bound.
            if self.active > self.pipes.len() {
                self.active = self.pipes.len();
            }
        }
    }

    /// Read the next frame, together with the pipe it came from.
    ///
    /// `Ok(None)` means nothing is readable right now. Mid-message the
    /// queue reports `None` rather than switching pipes, and resumes on
    /// the same pipe once it is activated again.
    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<(ObjectId, Msg)> {
        loop {
            if self.active == 0 {
                return None;
            }
            if self.current >= self.active {
                self.current = 0;
            }
            let id = self.pipes[self.current];
            let Some(pipe) = pipes.get_mut(&id) else {
                debug_assert!(false, "pipe {id} in rotation but not in map");
                self.terminated(id);
                continue;
            };
            match pipe.read() {
                ReadOutcome::Msg(msg) => {
                    self.more = msg.has_more();
                    if !self.more {
                        self.current = (self.current + 1) % self.active;
                    }
                    return Some((id, msg));
                }
                ReadOutcome::Empty => {
                    if self.more {
                        // Multipart in flight: wait for this pipe.
                        return None;
                    }
                    self.active -= 1;
                    self.pipes.swap(self.current, self.active);
                    if self.current == self.active {
                        self.current = 0;
                    }
                }
                ReadOutcome::Finished => {
                    debug_assert!(!self.more, "delimiter inside a multipart message");
                    self.more = false;
                    self.terminated(id);
                }
            }
        }
    }

    /// Whether a frame could be read right now.
    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        if self.more {
            return self
                .pipes
                .get(self.current)
                .and_then(|id| pipes.get_mut(id))
                .map_or(false, Pipe::check_read);
        }
        while self.active > 0 {
            if self.current >= self.active {
                self.current = 0;
            }
            let id = self.pipes[self.current];
            if pipes.get_mut(&id).map_or(false, Pipe::check_read) {
                return true;
            }
            self.active -= 1;
            self.pipes.swap(self.current, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        false
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}
