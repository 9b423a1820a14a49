//! Router pattern: identity-addressed sends, identity-prefixed receives.
//!
//! Every attached pipe is keyed by its peer's identity; peers that did
//! not announce one get a generated identity of a zero byte followed by
//! a big-endian counter, which no application identity can collide with
//! (leading zero bytes are rejected at the option level).
//!
//! Inbound messages grow an identity frame in front; outbound messages
//! must start with one, which is consumed to pick the pipe. Unroutable
//! or over-watermark messages are dropped unless mandatory routing is
//! enabled, in which case they surface as errors.

use crate::command::ObjectId;
use crate::socket::fq::FairQueue;
use crate::socket::{PipeMap, SendError};
use bytes::Bytes;
use capstan_core::error::EngineError;
use capstan_core::msg::Msg;
use hashbrown::HashMap;

pub(crate) struct RouterSocket {
    fq: FairQueue,
    identities: HashMap<Bytes, ObjectId>,
    reverse: HashMap<ObjectId, Bytes>,
    next_generated: u32,
    mandatory: bool,
    /// First body frame, parked while the identity frame is delivered.
    prefetched: Option<Msg>,
    /// Remaining inbound frames pass straight through.
    passing: bool,
    /// Pipe the current outbound message is routed to.
    current_out: Option<ObjectId>,
    /// Mid outbound message.
    out_more: bool,
    /// Swallow outbound frames until the message ends.
    drop_out: bool,
}

impl RouterSocket {
    pub(crate) fn new(mandatory: bool) -> Self {
        Self {
            fq: FairQueue::new(),
            identities: HashMap::new(),
            reverse: HashMap::new(),
            next_generated: 0,
            mandatory,
            prefetched: None,
            passing: false,
            current_out: None,
            out_more: false,
            drop_out: false,
        }
    }

    fn generate_identity(&mut self) -> Bytes {
        loop {
            self.next_generated = self.next_generated.wrapping_add(1);
            let mut id = Vec::with_capacity(5);
            id.push(0u8);
            id.extend_from_slice(&self.next_generated.to_be_bytes());
            let id = Bytes::from(id);
            if !self.identities.contains_key(&id) {
                return id;
            }
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId, pipes: &mut PipeMap) {
        let announced = pipes
            .get(&id)
            .map(|p| p.identity().clone())
            .unwrap_or_default();
        let key = if announced.is_empty() {
            self.generate_identity()
        } else if self.identities.contains_key(&announced) {
            tracing::warn!(
                id,
                "[Router] duplicate peer identity, assigning a generated one"
            );
            self.generate_identity()
        } else {
            announced
        };
        if let Some(pipe) = pipes.get_mut(&id) {
            pipe.set_identity(key.clone());
        }
        self.identities.insert(key.clone(), id);
        self.reverse.insert(id, key);
        self.fq.attach(id);
    }

    /// A peer announced (or re-announced) its identity after the attach,
    /// which happens on freshly connected pipes once the handshake ends.
    pub(crate) fn identity_changed(&mut self, id: ObjectId, identity: Bytes, pipes: &mut PipeMap) {
        if identity.is_empty() || !self.reverse.contains_key(&id) {
            return;
        }
        if let Some(existing) = self.identities.get(&identity) {
            if *existing != id {
                tracing::warn!(id, "[Router] peer identity already taken, keeping old key");
            }
            return;
        }
        if let Some(old) = self.reverse.get(&id) {
            self.identities.remove(old);
        }
        if let Some(pipe) = pipes.get_mut(&id) {
            pipe.set_identity(identity.clone());
        }
        self.identities.insert(identity.clone(), id);
        self.reverse.insert(id, identity);
    }

    pub(crate) fn set_mandatory(&mut self, mandatory: bool) {
        self.mandatory = mandatory;
    }

    pub(crate) fn read_activated(&mut self, id: ObjectId) {
        self.fq.activated(id);
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        if let Some(key) = self.reverse.remove(&id) {
            self.identities.remove(&key);
        }
        self.fq.terminated(id);
        if self.current_out == Some(id) {
            self.current_out = None;
            if self.out_more {
                self.drop_out = true;
            }
        }
    }

    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) -> Result<(), SendError> {
        if !self.out_more {
            // The first frame addresses the message.
            if !msg.has_more() {
                tracing::trace!("[Router] dropping identity frame with no message behind it");
                return Ok(());
            }
            let identity = Bytes::copy_from_slice(msg.data());
            let Some(&pipe_id) = self.identities.get(&identity) else {
                if self.mandatory {
                    return Err(SendError::Fatal(EngineError::Unroutable));
                }
                self.out_more = true;
                self.drop_out = true;
                return Ok(());
            };
            match pipes.get_mut(&pipe_id) {
                Some(pipe) => {
                    if pipe.check_write() {
                        self.current_out = Some(pipe_id);
                        self.out_more = true;
                        self.drop_out = false;
                        return Ok(());
                    }
                    if self.mandatory {
                        // A watermark stall invites a retry once the peer
                        // reads on; anything else means the peer is gone.
                        return if pipe.check_hwm() {
                            Err(SendError::Fatal(EngineError::Unroutable))
                        } else {
                            Err(SendError::Full(msg))
                        };
                    }
                }
                None => {
                    if self.mandatory {
                        return Err(SendError::Fatal(EngineError::Unroutable));
                    }
                }
            }
            self.out_more = true;
            self.drop_out = true;
            return Ok(());
        }

        let last = !msg.has_more();
        if !self.drop_out {
            match self.current_out.and_then(|id| pipes.get_mut(&id)) {
                Some(pipe) => match pipe.write(msg) {
                    Ok(()) => {
                        if last {
                            pipe.flush();
                        }
                    }
                    Err(_) => {
                        // The watermark was checked when the message was
                        // routed, so the pipe must be going away. Take back
                        // the frames it already accepted.
                        pipe.rollback();
                        self.current_out = None;
                        self.drop_out = true;
                    }
                },
                None => self.drop_out = true,
            }
        }
        if last {
            self.out_more = false;
            self.drop_out = false;
            self.current_out = None;
        }
        Ok(())
    }

    pub(crate) fn recv(&mut self, pipes: &mut PipeMap) -> Option<Msg> {
        if let Some(msg) = self.prefetched.take() {
            self.passing = msg.has_more();
            return Some(msg);
        }
        if self.passing {
            let (_, msg) = self.fq.recv(pipes)?;
            self.passing = msg.has_more();
            return Some(msg);
        }
        let (pipe_id, first) = self.fq.recv(pipes)?;
        let identity = self.reverse.get(&pipe_id).cloned().unwrap_or_default();
        self.prefetched = Some(first);
        let mut ident = Msg::from(identity);
        ident.set_more(true);
        Some(ident)
    }

    pub(crate) fn has_in(&mut self, pipes: &mut PipeMap) -> bool {
        self.prefetched.is_some() || self.fq.has_in(pipes)
    }

    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        if !self.mandatory || self.out_more {
            return true;
        }
        pipes.values_mut().any(|pipe| pipe.check_write())
    }
}
