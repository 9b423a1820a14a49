//! Pipe endpoints connecting a socket to its per-connection session (or,
//! for inproc, directly to the peer socket).
//!
//! [`pipe_pair`] builds two SPSC ypipes and wraps their four handles into
//! two [`Pipe`] endpoints, one per owner. Each endpoint writes into one
//! queue and reads from the other; all coordination beyond the ypipe
//! cursors travels as commands addressed to the peer endpoint's owner.
//!
//! Watermarks count whole messages, not frames: `msgs_written` advances on
//! the final frame of a message and `peer_msgs_read` only moves when the
//! peer reports progress via `ActivateWrite`, so the backpressure test is
//! approximate by design. The reader reports every `lwm` messages.
//!
//! Termination is the two-phase delimiter handshake: `terminate` rolls
//! back any incomplete write, pushes a delimiter past the watermark and
//! asks the peer to terminate; the peer drains up to its delimiter (when
//! draining was requested), then acks. The final ack releases the reader
//! handle; queue storage is freed once both sides have dropped theirs.

use crate::command::{Command, CommandKind, Dest, ObjectId};
use crate::ctx::CtxShared;
use bytes::Bytes;
use capstan_core::msg::Msg;
use capstan_core::ypipe::{ypipe, YPipeReader, YPipeWriter};
use std::sync::Arc;

/// Chunk size of message ypipes.
pub(crate) const MESSAGE_PIPE_GRANULARITY: usize = 256;

/// Largest gap allowed between high and low watermark.
const MAX_WATERMARK_DELTA: u64 = 1024;

/// Low watermark for a given high watermark.
///
/// Half the high watermark for small queues, a fixed distance below it for
/// large ones, so the reader reports progress often enough to keep the
/// writer busy without a command per message.
pub(crate) const fn compute_lwm(hwm: u64) -> u64 {
    if hwm > MAX_WATERMARK_DELTA * 2 {
        hwm - MAX_WATERMARK_DELTA
    } else {
        (hwm + 1) / 2
    }
}

/// Termination progress of one endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PipeState {
    /// Carrying messages both ways.
    Active,
    /// Read the peer's delimiter before any local terminate request.
    DelimiterReceived,
    /// Peer asked to terminate; still draining until the delimiter.
    WaitingForDelimiter,
    /// Sent our terminate request, waiting for the ack.
    TermReqSent,
    /// Both sides requested termination in parallel; ack sent, waiting
    /// for the peer's.
    TermReqSentBoth,
    /// Acked the peer's request; the closing ack releases this endpoint.
    TermAckSent,
}

/// What a processed command means for the endpoint's owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PipeEvent {
    /// Nothing the owner needs to act on.
    None,
    /// The endpoint has messages to read again.
    ReadActivated,
    /// The endpoint accepts writes again.
    WriteActivated,
    /// Termination handshake complete; the owner drops the endpoint.
    Terminated,
}

/// One end of a socket-to-session (or socket-to-socket) message pipe.
pub(crate) struct Pipe {
    id: ObjectId,
    /// Where commands for the peer endpoint go.
    peer: Dest,
    ctx: Arc<CtxShared>,
    writer: Option<YPipeWriter<Msg, MESSAGE_PIPE_GRANULARITY>>,
    reader: Option<YPipeReader<Msg, MESSAGE_PIPE_GRANULARITY>>,
    /// Outbound message ceiling; 0 = unlimited.
    hwm: u64,
    /// Inbound report cadence; 0 = never report.
    lwm: u64,
    msgs_written: u64,
    msgs_read: u64,
    /// Last read count reported by the peer.
    peer_msgs_read: u64,
    in_active: bool,
    out_active: bool,
    state: PipeState,
    /// Keep draining inbound messages after a terminate request.
    delay: bool,
    identity: Bytes,
}

/// Build a connected pair of pipe endpoints.
///
/// `ids` and `dests` give each endpoint its own id and the command address
/// it answers to; `inbound_hwms` are the message ceilings for traffic
/// *towards* endpoint 0 and endpoint 1 respectively.
pub(crate) fn pipe_pair(
    ctx: &Arc<CtxShared>,
    ids: (ObjectId, ObjectId),
    dests: (Dest, Dest),
    inbound_hwms: (usize, usize),
) -> (Pipe, Pipe) {
    // Queue a carries 0 -> 1 traffic, queue b the reverse.
    let (a_writer, a_reader) = ypipe::<Msg, MESSAGE_PIPE_GRANULARITY>();
    let (b_writer, b_reader) = ypipe::<Msg, MESSAGE_PIPE_GRANULARITY>();

    let end0 = Pipe {
        id: ids.0,
        peer: dests.1,
        ctx: Arc::clone(ctx),
        writer: Some(a_writer),
        reader: Some(b_reader),
        hwm: inbound_hwms.1 as u64,
        lwm: compute_lwm(inbound_hwms.0 as u64),
        msgs_written: 0,
        msgs_read: 0,
        peer_msgs_read: 0,
        in_active: true,
        out_active: true,
        state: PipeState::Active,
        delay: true,
        identity: Bytes::new(),
    };
    let end1 = Pipe {
        id: ids.1,
        peer: dests.0,
        ctx: Arc::clone(ctx),
        writer: Some(b_writer),
        reader: Some(a_reader),
        hwm: inbound_hwms.0 as u64,
        lwm: compute_lwm(inbound_hwms.1 as u64),
        msgs_written: 0,
        msgs_read: 0,
        peer_msgs_read: 0,
        in_active: true,
        out_active: true,
        state: PipeState::Active,
        delay: true,
        identity: Bytes::new(),
    };
    (end0, end1)
}

/// Outcome of a read attempt.
#[derive(Debug)]
pub(crate) enum ReadOutcome {
    /// A message frame.
    Msg(Msg),
    /// Nothing available right now; the endpoint deactivated itself and
    /// will be woken by `ActivateRead`.
    Empty,
    /// The peer's delimiter arrived; no further message will ever be read.
    Finished,
}

impl Pipe {
    pub(crate) fn id(&self) -> ObjectId {
        self.id
    }

    pub(crate) fn peer_dest(&self) -> Dest {
        self.peer
    }

    pub(crate) fn identity(&self) -> &Bytes {
        &self.identity
    }

    pub(crate) fn set_identity(&mut self, identity: Bytes) {
        self.identity = identity;
    }

    /// True while reads may still produce messages.
    fn readable_state(&self) -> bool {
        matches!(
            self.state,
            PipeState::Active | PipeState::WaitingForDelimiter
        )
    }

    /// Check whether a message is available without consuming it.
    ///
    /// Encountering the delimiter here advances the termination handshake
    /// and reports unreadable.
    pub(crate) fn check_read(&mut self) -> bool {
        if !self.in_active || !self.readable_state() {
            return false;
        }
        let Some(reader) = self.reader.as_mut() else {
            return false;
        };
        if !reader.check_read() {
            self.in_active = false;
            return false;
        }
        if reader.probe(Msg::is_delimiter) {
            let _ = reader.read();
            self.process_delimiter();
            return false;
        }
        true
    }

    /// Read the next frame.
    pub(crate) fn read(&mut self) -> ReadOutcome {
        if !self.in_active || !self.readable_state() {
            return ReadOutcome::Empty;
        }
        let Some(reader) = self.reader.as_mut() else {
            return ReadOutcome::Empty;
        };
        let Some(msg) = reader.read() else {
            self.in_active = false;
            return ReadOutcome::Empty;
        };
        if msg.is_delimiter() {
            self.process_delimiter();
            return ReadOutcome::Finished;
        }
        if !msg.has_more() {
            self.msgs_read += 1;
            if self.lwm > 0 && self.msgs_read % self.lwm == 0 {
                self.send_to_peer(CommandKind::ActivateWrite {
                    msgs_read: self.msgs_read,
                });
            }
        }
        ReadOutcome::Msg(msg)
    }

    /// Check whether a message could be written right now.
    ///
    /// Crossing the high watermark deactivates the write side until the
    /// peer reports enough progress via `ActivateWrite`.
    pub(crate) fn check_write(&mut self) -> bool {
        if !self.out_active || self.state != PipeState::Active {
            return false;
        }
        if !self.check_hwm() {
            self.out_active = false;
            return false;
        }
        true
    }

    /// Whether watermark accounting alone would admit another message.
    pub(crate) fn check_hwm(&self) -> bool {
        !(self.hwm > 0 && self.msgs_written.wrapping_sub(self.peer_msgs_read) >= self.hwm)
    }

    /// Write one frame, refusing when the watermark test fails.
    ///
    /// Frames stay invisible to the peer until [`flush`](Self::flush);
    /// watermark accounting advances on the final frame of each message,
    /// so a message accepted at its first frame is accepted whole.
    pub(crate) fn write(&mut self, msg: Msg) -> Result<(), Msg> {
        if !self.check_write() {
            return Err(msg);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(msg);
        };
        let more = msg.has_more();
        writer.write(msg, more);
        if !more {
            self.msgs_written += 1;
        }
        Ok(())
    }

    /// Retract the frames of an unfinished message.
    pub(crate) fn rollback(&mut self) {
        if let Some(writer) = self.writer.as_mut() {
            while writer.unwrite().is_some() {}
        }
    }

    /// Publish written frames, waking the peer when it reported asleep.
    pub(crate) fn flush(&mut self) {
        if self.state == PipeState::TermAckSent {
            return;
        }
        if let Some(writer) = self.writer.as_mut() {
            if !writer.flush() {
                self.send_to_peer(CommandKind::ActivateRead);
            }
        }
    }

    /// Handle a command addressed to this endpoint.
    pub(crate) fn process_command(&mut self, kind: CommandKind) -> PipeEvent {
        match kind {
            CommandKind::ActivateRead => {
                if !self.in_active && self.readable_state() {
                    self.in_active = true;
                    return PipeEvent::ReadActivated;
                }
                PipeEvent::None
            }
            CommandKind::ActivateWrite { msgs_read } => {
                self.peer_msgs_read = msgs_read;
                if !self.out_active && self.state == PipeState::Active {
                    self.out_active = true;
                    return PipeEvent::WriteActivated;
                }
                PipeEvent::None
            }
            CommandKind::PipeTerm => self.process_pipe_term(),
            CommandKind::PipeTermAck => self.process_pipe_term_ack(),
            other => {
                tracing::trace!(
                    pipe = self.id,
                    kind = other.name(),
                    "[Pipe] dropping unexpected command"
                );
                PipeEvent::None
            }
        }
    }

    /// Begin (or advance) termination of this endpoint.
    ///
    /// With `delay` the peer keeps draining buffered messages until it
    /// reads the delimiter; without it the peer acks immediately and
    /// buffered messages are discarded. Safe to call at any point in the
    /// handshake; repeated calls only ever move the state forward.
    pub(crate) fn terminate(&mut self, delay: bool) {
        self.delay = delay;
        match self.state {
            // Already requested; the handshake finishes on its own.
            PipeState::TermReqSent | PipeState::TermReqSentBoth | PipeState::TermAckSent => {
                return;
            }
            PipeState::Active | PipeState::DelimiterReceived => {
                self.send_to_peer(CommandKind::PipeTerm);
                self.state = PipeState::TermReqSent;
            }
            PipeState::WaitingForDelimiter if !delay => {
                // The owner gave up on draining: act as if the delimiter
                // already arrived.
                self.rollback();
                self.writer = None;
                self.send_to_peer(CommandKind::PipeTermAck);
                self.state = PipeState::TermAckSent;
            }
            // Still draining towards the peer's delimiter.
            PipeState::WaitingForDelimiter => {}
        }

        self.out_active = false;
        if self.writer.is_some() {
            // Park the delimiter behind everything written so far. It
            // bypasses watermark accounting so a full pipe can still
            // finish its handshake.
            self.rollback();
            if let Some(writer) = self.writer.as_mut() {
                writer.write(Msg::delimiter(), false);
            }
            self.flush();
        }
    }

    fn process_pipe_term(&mut self) -> PipeEvent {
        match self.state {
            PipeState::Active => {
                if self.delay {
                    self.state = PipeState::WaitingForDelimiter;
                } else {
                    self.state = PipeState::TermAckSent;
                    self.writer = None;
                    self.send_to_peer(CommandKind::PipeTermAck);
                }
            }
            PipeState::DelimiterReceived => {
                self.state = PipeState::TermAckSent;
                self.writer = None;
                self.send_to_peer(CommandKind::PipeTermAck);
            }
            PipeState::TermReqSent => {
                // Both sides terminated in parallel.
                self.state = PipeState::TermReqSentBoth;
                self.writer = None;
                self.send_to_peer(CommandKind::PipeTermAck);
            }
            state => {
                tracing::trace!(pipe = self.id, ?state, "[Pipe] stale terminate request");
            }
        }
        PipeEvent::None
    }

    fn process_pipe_term_ack(&mut self) -> PipeEvent {
        if self.state == PipeState::TermReqSent {
            // Simple case: the peer acked our request; release it in turn.
            self.writer = None;
            self.send_to_peer(CommandKind::PipeTermAck);
        } else {
            debug_assert!(matches!(
                self.state,
                PipeState::TermAckSent | PipeState::TermReqSentBoth
            ));
        }
        // Unread inbound messages die with the reader handle; the
        // underlying storage goes once the peer drops its writer.
        self.reader = None;
        PipeEvent::Terminated
    }

    fn process_delimiter(&mut self) {
        match self.state {
            PipeState::Active => self.state = PipeState::DelimiterReceived,
            PipeState::WaitingForDelimiter => {
                self.rollback();
                self.writer = None;
                self.send_to_peer(CommandKind::PipeTermAck);
                self.state = PipeState::TermAckSent;
            }
            state => debug_assert!(false, "delimiter in state {state:?}"),
        }
    }

    fn send_to_peer(&self, kind: CommandKind) {
        self.ctx.send_command(Command::new(self.peer, kind));
    }
}

impl std::fmt::Debug for Pipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipe")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("written", &self.msgs_written)
            .field("read", &self.msgs_read)
            .field("in_active", &self.in_active)
            .field("out_active", &self.out_active)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ctx::CtxShared;
    use capstan_core::mailbox::Mailbox;

    // Two endpoints with their owners' mailboxes registered in slots 0
    // and 1, so peer commands can be pumped by hand.
    fn pair_with_mailboxes(
        hwms: (usize, usize),
    ) -> (Pipe, Pipe, Mailbox<Command>, Mailbox<Command>) {
        let (ctx, mut receivers) = CtxShared::for_tests(2);
        let rx1 = receivers.pop().unwrap();
        let rx0 = receivers.pop().unwrap();
        let (a, b) = pipe_pair(
            &ctx,
            (100, 101),
            (Dest::pipe(0, 100), Dest::pipe(1, 101)),
            hwms,
        );
        (a, b, rx0, rx1)
    }

    fn drain(rx: &mut Mailbox<Command>) -> Vec<CommandKind> {
        let mut out = Vec::new();
        while let Ok(Some(cmd)) = rx.recv(Some(std::time::Duration::ZERO)) {
            out.push(cmd.kind);
        }
        out
    }

    fn pump(pipe: &mut Pipe, rx: &mut Mailbox<Command>) -> Vec<PipeEvent> {
        drain(rx)
            .into_iter()
            .map(|kind| pipe.process_command(kind))
            .collect()
    }

    #[test]
    fn test_round_trip_with_wakeup() {
        let (mut a, mut b, _rx0, mut rx1) = pair_with_mailboxes((100, 100));

        a.write(Msg::from("hello")).unwrap();
        a.flush();

        // b never slept, so no wake command is required; but if one was
        // sent it must activate reads.
        let _ = pump(&mut b, &mut rx1);
        match b.read() {
            ReadOutcome::Msg(m) => assert_eq!(m.data(), b"hello"),
            other => panic!("expected message, got {other:?}"),
        }
        assert!(matches!(b.read(), ReadOutcome::Empty));
    }

    #[test]
    fn test_hwm_refuses_and_activate_write_releases() {
        let (mut a, mut b, mut rx0, mut rx1) = pair_with_mailboxes((4, 4));

        for i in 0..4u32 {
            a.write(Msg::from(i.to_string().as_str())).unwrap();
        }
        a.flush();
        let refused = a.write(Msg::from("overflow")).unwrap_err();
        assert_eq!(refused.data(), b"overflow");
        assert!(!a.check_write());

        let _ = pump(&mut b, &mut rx1);
        // lwm of hwm 4 is 2: the second read reports progress.
        assert!(matches!(b.read(), ReadOutcome::Msg(_)));
        assert!(drain(&mut rx0).is_empty());
        assert!(matches!(b.read(), ReadOutcome::Msg(_)));
        let events = pump(&mut a, &mut rx0);
        assert!(events.contains(&PipeEvent::WriteActivated));
        assert!(a.check_write());
        a.write(Msg::from("fits")).unwrap();
    }

    #[test]
    fn test_multi_frame_message_counts_once() {
        let (mut a, mut b, _rx0, mut rx1) = pair_with_mailboxes((2, 2));

        let mut head = Msg::from("head");
        head.set_more(true);
        a.write(head).unwrap();
        a.write(Msg::from("tail")).unwrap();
        let mut head2 = Msg::from("head2");
        head2.set_more(true);
        a.write(head2).unwrap();
        a.write(Msg::from("tail2")).unwrap();
        a.flush();

        // Two whole messages hit the watermark; a third is refused.
        assert!(!a.check_write());

        let _ = pump(&mut b, &mut rx1);
        let mut frames = 0;
        while let ReadOutcome::Msg(_) = b.read() {
            frames += 1;
        }
        assert_eq!(frames, 4);
    }

    #[test]
    fn test_rollback_retracts_incomplete_message() {
        let (mut a, mut b, _rx0, mut rx1) = pair_with_mailboxes((10, 10));

        let mut part = Msg::from("partial");
        part.set_more(true);
        a.write(part).unwrap();
        a.rollback();
        a.write(Msg::from("whole")).unwrap();
        a.flush();

        let _ = pump(&mut b, &mut rx1);
        match b.read() {
            ReadOutcome::Msg(m) => assert_eq!(m.data(), b"whole"),
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_termination_handshake_simple() {
        let (mut a, mut b, mut rx0, mut rx1) = pair_with_mailboxes((10, 10));
        a.write(Msg::from("in flight")).unwrap();
        a.flush();

        // a terminates without waiting for the peer to drain.
        b.delay = false;
        a.terminate(true);

        // b sees the request and acks immediately (no drain requested).
        let events = pump(&mut b, &mut rx1);
        assert!(events.iter().all(|e| *e == PipeEvent::None));

        // a gets the ack, finishes, and releases b with a closing ack.
        let events = pump(&mut a, &mut rx0);
        assert!(events.contains(&PipeEvent::Terminated));
        let events = pump(&mut b, &mut rx1);
        assert!(events.contains(&PipeEvent::Terminated));
    }

    #[test]
    fn test_termination_drains_until_delimiter() {
        let (mut a, mut b, mut rx0, mut rx1) = pair_with_mailboxes((10, 10));

        for i in 0..3u32 {
            a.write(Msg::from(i.to_string().as_str())).unwrap();
        }
        a.flush();
        a.terminate(true);

        // b keeps draining: three messages, then the delimiter finishes
        // the read side and acks.
        let _ = pump(&mut b, &mut rx1);
        let mut got = 0;
        loop {
            match b.read() {
                ReadOutcome::Msg(_) => got += 1,
                ReadOutcome::Finished => break,
                ReadOutcome::Empty => panic!("pipe drained early"),
            }
        }
        assert_eq!(got, 3);

        let events = pump(&mut a, &mut rx0);
        assert!(events.contains(&PipeEvent::Terminated));
        let events = pump(&mut b, &mut rx1);
        assert!(events.contains(&PipeEvent::Terminated));
    }

    #[test]
    fn test_termination_is_idempotent() {
        let (mut a, mut b, mut rx0, mut rx1) = pair_with_mailboxes((10, 10));

        a.terminate(false);
        a.terminate(false);
        a.terminate(true);
        // Exactly one request reaches the peer.
        let cmds = drain(&mut rx1);
        assert_eq!(
            cmds.iter().filter(|k| k.name() == "pipe-term").count(),
            1
        );
        for kind in cmds {
            let _ = b.process_command(kind);
        }
        let events = pump(&mut a, &mut rx0);
        assert_eq!(
            events.iter().filter(|e| **e == PipeEvent::Terminated).count(),
            1
        );
    }

    #[test]
    fn test_parallel_termination() {
        let (mut a, mut b, mut rx0, mut rx1) = pair_with_mailboxes((10, 10));

        a.terminate(false);
        b.terminate(false);

        let mut a_done = false;
        let mut b_done = false;
        // Pump both mailboxes until quiescent.
        for _ in 0..4 {
            for event in pump(&mut a, &mut rx0) {
                a_done |= event == PipeEvent::Terminated;
            }
            for event in pump(&mut b, &mut rx1) {
                b_done |= event == PipeEvent::Terminated;
            }
        }
        assert!(a_done && b_done);
    }

    #[test]
    fn test_check_read_sees_delimiter() {
        let (mut a, mut b, _rx0, mut rx1) = pair_with_mailboxes((10, 10));
        a.terminate(true);
        let _ = pump(&mut b, &mut rx1);
        assert!(!b.check_read());
        assert!(matches!(b.read(), ReadOutcome::Empty));
    }

    #[test]
    fn test_lwm_formula() {
        assert_eq!(compute_lwm(0), 0);
        assert_eq!(compute_lwm(1), 1);
        assert_eq!(compute_lwm(4), 2);
        assert_eq!(compute_lwm(1000), 500);
        assert_eq!(compute_lwm(2048), 1024);
        assert_eq!(compute_lwm(2049), 1025);
        assert_eq!(compute_lwm(10_000), 9_000);
    }
}
