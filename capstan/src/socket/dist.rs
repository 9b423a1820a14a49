//! Fan-out distributor used by the publish side of pub/sub.
//!
//! Every attached pipe gets a copy of every message. A pipe that fails
//! the watermark test at a message boundary is skipped for that whole
//! message, and a pipe that joins mid-message waits for the next
//! boundary, so subscribers only ever see complete messages.

use crate::command::ObjectId;
use crate::socket::PipeMap;
use capstan_core::msg::Msg;
use smallvec::SmallVec;

pub(crate) struct Distributor {
    pipes: Vec<ObjectId>,
    /// Excluded from the message currently being distributed.
    skip: SmallVec<[ObjectId; 4]>,
    more: bool,
}

impl Distributor {
    pub(crate) fn new() -> Self {
        Self {
            pipes: Vec::new(),
            skip: SmallVec::new(),
            more: false,
        }
    }

    pub(crate) fn attach(&mut self, id: ObjectId) {
        self.pipes.push(id);
        if self.more {
            self.skip.push(id);
        }
    }

    pub(crate) fn terminated(&mut self, id: ObjectId) {
        self.pipes.retain(|p| *p != id);
        self.skip.retain(|p| *p != id);
    }

    /// Copy one frame to every eligible pipe. Never blocks: peers whose
    /// queue is full at the message boundary miss the whole message.
    pub(crate) fn send(&mut self, msg: Msg, pipes: &mut PipeMap) {
        let last = !msg.has_more();
        if !self.more {
            self.skip.clear();
            for &id in &self.pipes {
                if !pipes.get_mut(&id).map_or(false, |pipe| pipe.check_write()) {
                    self.skip.push(id);
                }
            }
        }
        for &id in &self.pipes {
            if self.skip.contains(&id) {
                continue;
            }
            let Some(pipe) = pipes.get_mut(&id) else {
                continue;
            };
            match pipe.write(msg.clone()) {
                Ok(()) => {
                    if last {
                        pipe.flush();
                    }
                }
                Err(_) => {
                    // Refused mid-message: drop the written frames so no
                    // torn head reaches this subscriber, and skip it for
                    // the rest of the message.
                    pipe.rollback();
                    self.skip.push(id);
                }
            }
        }
        self.more = !last;
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pipes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Dest, Target};
    use crate::ctx::CtxShared;
    use crate::pipe::{pipe_pair, Pipe, ReadOutcome};
    use capstan_core::mailbox::Mailbox;
    use hashbrown::HashMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn setup(
        n: usize,
        hwm: usize,
    ) -> (Arc<CtxShared>, Distributor, PipeMap, Vec<Pipe>, Mailbox<Command>) {
        let (ctx, mut receivers) = CtxShared::for_tests(2);
        let _ = receivers.pop();
        let rx0 = receivers.pop().unwrap();
        let mut dist = Distributor::new();
        let mut map: PipeMap = HashMap::new();
        let mut peers = Vec::new();
        for i in 0..n {
            let base = 10 + (i as u32) * 2;
            let (local, peer) = pipe_pair(
                &ctx,
                (base, base + 1),
                (Dest::pipe(0, base), Dest::pipe(1, base + 1)),
                (hwm, hwm),
            );
            dist.attach(local.id());
            map.insert(local.id(), local);
            peers.push(peer);
        }
        (ctx, dist, map, peers, rx0)
    }

    /// Route queued peer progress reports into the local endpoints.
    fn pump_local(map: &mut PipeMap, rx: &mut Mailbox<Command>) {
        while let Ok(Some(cmd)) = rx.recv(Some(Duration::ZERO)) {
            if let Target::Pipe(id) = cmd.dest.target {
                if let Some(pipe) = map.get_mut(&id) {
                    let _ = pipe.process_command(cmd.kind);
                }
            }
        }
    }

    fn drain_count(peer: &mut Pipe) -> usize {
        let mut n = 0;
        while let ReadOutcome::Msg(_) = peer.read() {
            n += 1;
        }
        n
    }

    #[test]
    fn test_every_peer_gets_a_copy() {
        let (_ctx, mut dist, mut map, mut peers, _rx0) = setup(3, 10);
        dist.send(Msg::from("fanout"), &mut map);
        for peer in &mut peers {
            assert_eq!(drain_count(peer), 1);
        }
    }

    #[test]
    fn test_full_peer_misses_whole_message() {
        let (_ctx, mut dist, mut map, mut peers, mut rx0) = setup(2, 1);
        dist.send(Msg::from("first"), &mut map);
        // Peer 0 drains and reports progress; peer 1 stays full.
        assert_eq!(drain_count(&mut peers[0]), 1);
        pump_local(&mut map, &mut rx0);

        let mut head = Msg::from("head");
        head.set_more(true);
        dist.send(head, &mut map);
        dist.send(Msg::from("tail"), &mut map);

        assert_eq!(drain_count(&mut peers[0]), 2);
        // The slow peer saw only the first message.
        assert_eq!(drain_count(&mut peers[1]), 1);
    }

    #[test]
    fn test_pipe_joining_mid_message_waits_for_boundary() {
        let (ctx, mut dist, mut map, mut peers, _rx0) = setup(1, 10);

        let mut head = Msg::from("head");
        head.set_more(true);
        dist.send(head, &mut map);

        let (local, late_peer) = pipe_pair(
            &ctx,
            (90, 91),
            (Dest::pipe(0, 90), Dest::pipe(1, 91)),
            (10, 10),
        );
        dist.attach(local.id());
        map.insert(local.id(), local);
        peers.push(late_peer);

        dist.send(Msg::from("tail"), &mut map);
        dist.send(Msg::from("next"), &mut map);

        assert_eq!(drain_count(&mut peers[0]), 3);
        // Late joiner skipped the in-progress message.
        assert_eq!(drain_count(&mut peers[1]), 1);
    }
}
