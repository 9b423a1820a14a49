//! Load balancing across outbound pipes.
//!
//! Messages go to the pipes of the active prefix round-robin, advancing
//! at message boundaries. A multipart message is pinned to the pipe that
//! accepted its first frame; if that pipe terminates mid-message the
//! remaining frames are swallowed so the next peer never sees a torn
//! message.

use crate::command::ObjectId;
use crate::socket::PipeMap;
use capstan_core::msg::Msg;

pub(crate) struct LoadBalancer {
    pipes: Vec<ObjectId>,
    active: usize,
    current: usize,
    /// Multipart in flight on `current`.
    more: bool,
    /// Swallow frames until the current message ends.
    dropping: bool,
}

impl LoadBalancer {
    pub(crate) fn new() -> Self {
        Self {
            pipes: Vec::new(),
            active: 0,
            current: 0,
            more: false,
            dropping: false,
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
        if let Some(pos) = self.pipes.iter().position(|p| *p == id) {
            if pos == self.current && self.more {
                self.dropping = true;
                self.more = false;
            }
            if pos < self.active {
                self.active -= 1;
                self.pipes.swap(pos, self.active);
                if self.current == self.active {
                    self.current = 0;
                }
            }
        }
        if let Some(pos) = self.pipes.iter().position(|p| *p == id) {
            self.pipes.swap_remove(pos);
            if self.active > self.pipes.len() {
                self.active = self.pipes.len();
            }
        }
    }

    /// Route one frame. `Err` returns the frame when every pipe is full
    /// at a message boundary; the caller decides whether to block.
    pub(crate) fn send(&mut self, mut msg: Msg, pipes: &mut PipeMap) -> Result<(), Msg> {
        if self.dropping {
            if !msg.has_more() {
                self.dropping = false;
            }
            return Ok(());
        }

        if self.more {
            let last = !msg.has_more();
            let id = self.pipes[self.current];
            match pipes.get_mut(&id) {
                Some(pipe) => match pipe.write(msg) {
                    Ok(()) => {
                        if last {
                            pipe.flush();
                            self.more = false;
                            self.current = (self.current + 1) % self.active.max(1);
                        }
                        return Ok(());
                    }
                    Err(refused) => {
                        // The pinned pipe is dying mid-message. Drop the
                        // frames it already took so no torn head survives,
                        // refuse this frame and swallow any retries up to
                        // the end of the message.
                        pipe.rollback();
                        self.more = false;
                        self.dropping = !last;
                        return Err(refused);
                    }
                },
                None => {
                    self.more = false;
                    self.dropping = !last;
                    return Err(msg);
                }
            }
        }

        while self.active > 0 {
            if self.current >= self.active {
                self.current = 0;
            }
            let id = self.pipes[self.current];
            let Some(pipe) = pipes.get_mut(&id) else {
                debug_assert!(false, "pipe {id} in rotation but not in map");
                self.terminated(id);
                continue;
            };
            if pipe.check_write() {
                let more = msg.has_more();
                match pipe.write(msg) {
                    Ok(()) => {
                        if more {
                            self.more = true;
                        } else {
                            pipe.flush();
                            self.current = (self.current + 1) % self.active;
                        }
                        return Ok(());
                    }
                    Err(returned) => msg = returned,
                }
            }
            self.active -= 1;
            self.pipes.swap(self.current, self.active);
            if self.current == self.active {
                self.current = 0;
            }
        }
        Err(msg)
    }

    /// Whether a frame would be accepted right now.
    pub(crate) fn has_out(&mut self, pipes: &mut PipeMap) -> bool {
        // A pinned message's remaining frames are always accepted.
        if self.more || self.dropping {
            return true;
        }
        while self.active > 0 {
            if self.current >= self.active {
                self.current = 0;
            }
            let id = self.pipes[self.current];
            if pipes.get_mut(&id).map_or(false, |pipe| pipe.check_write()) {
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::Dest;
    use crate::ctx::CtxShared;
    use crate::pipe::{pipe_pair, Pipe, ReadOutcome};
    use hashbrown::HashMap;

    fn setup(n: usize, hwm: usize) -> (LoadBalancer, PipeMap, Vec<Pipe>) {
        let (ctx, _rx) = CtxShared::for_tests(2);
        let mut lb = LoadBalancer::new();
        let mut map: PipeMap = HashMap::new();
        let mut readers = Vec::new();
        for i in 0..n {
            let base = 10 + (i as u32) * 2;
            let (local, peer) = pipe_pair(
                &ctx,
                (base, base + 1),
                (Dest::pipe(0, base), Dest::pipe(1, base + 1)),
                (hwm, hwm),
            );
            lb.attach(local.id());
            map.insert(local.id(), local);
            readers.push(peer);
        }
        (lb, map, readers)
    }

    fn drain(reader: &mut Pipe) -> Vec<Vec<u8>> {
        let mut out = Vec::new();
        while let ReadOutcome::Msg(m) = reader.read() {
            out.push(m.data().to_vec());
        }
        out
    }

    #[test]
    fn test_round_robin_at_message_boundaries() {
        let (mut lb, mut map, mut readers) = setup(2, 10);
        for i in 0..4u32 {
            lb.send(Msg::from(format!("m{i}").as_str()), &mut map)
                .unwrap();
        }
        assert_eq!(drain(&mut readers[0]).len(), 2);
        assert_eq!(drain(&mut readers[1]).len(), 2);
    }

    #[test]
    fn test_multipart_pinned_to_one_pipe() {
        let (mut lb, mut map, mut readers) = setup(2, 10);
        let mut head = Msg::from("head");
        head.set_more(true);
        lb.send(head, &mut map).unwrap();
        lb.send(Msg::from("tail"), &mut map).unwrap();
        lb.send(Msg::from("next"), &mut map).unwrap();

        let a = drain(&mut readers[0]);
        let b = drain(&mut readers[1]);
        // Both frames of the multipart landed together.
        let (multi, single) = if a.len() == 2 { (a, b) } else { (b, a) };
        assert_eq!(multi, vec![b"head".to_vec(), b"tail".to_vec()]);
        assert_eq!(single, vec![b"next".to_vec()]);
    }

    #[test]
    fn test_all_full_returns_message() {
        let (mut lb, mut map, _readers) = setup(2, 1);
        lb.send(Msg::from("a"), &mut map).unwrap();
        lb.send(Msg::from("b"), &mut map).unwrap();
        let refused = lb.send(Msg::from("c"), &mut map).unwrap_err();
        assert_eq!(refused.data(), b"c");
        assert!(!lb.has_out(&mut map));
    }

    #[test]
    fn test_terminated_mid_message_swallows_rest() {
        let (mut lb, mut map, mut readers) = setup(2, 10);
        let mut head = Msg::from("head");
        head.set_more(true);
        lb.send(head, &mut map).unwrap();

        // The pinned pipe dies before the tail arrives.
        let pinned = lb.pipes[lb.current];
        lb.terminated(pinned);
        map.remove(&pinned);

        lb.send(Msg::from("tail"), &mut map).unwrap();
        lb.send(Msg::from("fresh"), &mut map).unwrap();

        let mut all = drain(&mut readers[0]);
        all.extend(drain(&mut readers[1]));
        // The torn message never surfaces; only the fresh one does.
        assert_eq!(all, vec![b"fresh".to_vec()]);
    }

    #[test]
    fn test_refusal_mid_message_reports_once_then_drops() {
        let (mut lb, mut map, mut readers) = setup(2, 10);
        let mut head = Msg::from("head");
        head.set_more(true);
        lb.send(head, &mut map).unwrap();

        // The pinned pipe starts terminating under the half-sent message.
        let pinned = lb.pipes[lb.current];
        map.get_mut(&pinned).unwrap().terminate(false);

        let mut tail = Msg::from("tail");
        tail.set_more(true);
        let refused = lb.send(tail, &mut map).unwrap_err();
        assert_eq!(refused.data(), b"tail");

        // The retry and the rest of the message are swallowed, then the
        // next message picks the healthy pipe.
        let mut retry = Msg::from("tail");
        retry.set_more(true);
        lb.send(retry, &mut map).unwrap();
        lb.send(Msg::from("end"), &mut map).unwrap();
        lb.send(Msg::from("fresh"), &mut map).unwrap();

        let mut all = drain(&mut readers[0]);
        all.extend(drain(&mut readers[1]));
        assert_eq!(all, vec![b"fresh".to_vec()]);
    }
}
