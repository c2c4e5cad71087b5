/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The protocol state machine.
//!
//! This module owns states, timers and retransmission; it never touches key
//! material itself. Packet preparation and verification live in the session
//! core, which the engine borrows for the duration of each event. Every
//! event handler runs to completion and produces at most one outbound
//! packet and one timer operation.

use crate::callbacks::{EnableSecurity, ZrtpCallback};
use crate::error::{ReportCode, SevereCode, Severity, WireError};
#[cfg(feature = "logging")]
use crate::log_event::LogEvent;
#[cfg(feature = "logging")]
use crate::packet::parse_header;
use crate::packet::MessageType;
use crate::session::{Abort, SessionCore};

/// Protocol states, one per stream. `CommitSent` is the post-commit state
/// of the tentative Initiator; `WaitClearAck` is reserved and never
/// entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Initial,
    Detect,
    AckDetected,
    AckSent,
    WaitCommit,
    CommitSent,
    WaitDhPart2,
    WaitConfirm1,
    WaitConfirm2,
    WaitConfAck,
    WaitClearAck,
    SecureState,
    Fail,
}

/// Events fed into the engine. Packets arrive pre-split into type and raw
/// message bytes.
pub(crate) enum Event<'a> {
    Initial,
    Packet(MessageType, &'a [u8]),
    Timer,
    Close,
}

/// Retransmission timer state. The resend counter lives here as well since
/// ZRTP couples the two.
struct Timer {
    time: i32,
    start: i32,
    capping: i32,
    counter: i32,
    max_resend: i32,
}

impl Timer {
    fn new(start: i32, capping: i32, max_resend: i32) -> Self {
        Self { time: start, start, capping, counter: 0, max_resend }
    }

    fn restart(&mut self) -> i32 {
        self.time = self.start;
        self.counter = 0;
        self.time
    }

    /// Double toward the cap. `None` once the resend budget is exhausted;
    /// a negative budget never exhausts.
    fn next(&mut self) -> Option<i32> {
        self.time = (self.time * 2).min(self.capping);
        self.counter += 1;
        if self.max_resend >= 0 && self.counter > self.max_resend {
            None
        } else {
            Some(self.time)
        }
    }
}

/// Index into the per-packet-kind retry counters.
#[derive(Clone, Copy)]
pub(crate) enum Retry {
    Hello = 0,
    HelloAck = 1,
    Commit = 2,
    DhPart2 = 3,
    Confirm2 = 4,
    Relay = 5,
}

pub(crate) const RETRY_COUNTERS: usize = 6;

pub(crate) struct StateEngine {
    state: State,
    t1: Timer,
    t2: Timer,
    t1_resend_extend: i32,
    /// The packet resent when the active timer fires.
    sent_packet: Option<Vec<u8>>,
    /// Which retry counter a resend of `sent_packet` bumps.
    sent_retry: Retry,
    /// Commit prepared on Hello receipt, sent once the peer acknowledges.
    commit_packet: Option<Vec<u8>>,
    /// Conf2Ack kept around to answer a repeated Confirm2 in secure state.
    conf2_ack: Option<Vec<u8>>,
    /// SASRelay awaiting its RelayAck inside the secure state.
    relay_packet: Option<Vec<u8>>,
    retry_counters: [u32; RETRY_COUNTERS],
}

impl StateEngine {
    pub fn new(t1_resend: i32, t1_resend_extend: i32, t1_cap: i32, t2_resend: i32, t2_cap: i32) -> Self {
        Self {
            state: State::Initial,
            t1: Timer::new(crate::proto::T1_START_MS, t1_cap, t1_resend),
            t2: Timer::new(crate::proto::T2_START_MS, t2_cap, t2_resend),
            t1_resend_extend,
            sent_packet: None,
            sent_retry: Retry::Hello,
            commit_packet: None,
            conf2_ack: None,
            relay_packet: None,
            retry_counters: [0; RETRY_COUNTERS],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn in_state(&self, state: State) -> bool {
        self.state == state
    }

    pub fn retry_counters(&self) -> &[u32; RETRY_COUNTERS] {
        &self.retry_counters
    }

    fn next_state<A: ZrtpCallback>(&mut self, _app: &mut A, to: State) {
        #[cfg(feature = "logging")]
        _app.event_log(LogEvent::Transition { from: self.state, to });
        self.state = to;
    }

    /// Central event dispatch. Error, Ping and SASRelay are handled here
    /// for every state, everything else goes to the per-state handler.
    pub fn process_event<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        if let Event::Packet(msg_type, msg) = event {
            match msg_type {
                MessageType::Error => {
                    app.cancel_timer();
                    self.sent_packet = None;
                    core.handle_error_packet(app, msg);
                    self.next_state(app, State::Fail);
                    return;
                }
                MessageType::Ping => {
                    if let Some(ack) = core.prepare_ping_ack(msg) {
                        core.send_packet(app, &ack);
                    }
                    return;
                }
                MessageType::SasRelay => {
                    if self.state == State::SecureState {
                        if let Some(ack) = core.handle_sas_relay(app, msg) {
                            core.send_packet(app, &ack);
                        }
                    }
                    return;
                }
                _ => {}
            }
        }
        match self.state {
            State::Initial => self.ev_initial(core, app, event),
            State::Detect => self.ev_detect(core, app, event),
            State::AckDetected => self.ev_ack_detected(core, app, event),
            State::AckSent => self.ev_ack_sent(core, app, event),
            State::WaitCommit => self.ev_wait_commit(core, app, event),
            State::CommitSent => self.ev_commit_sent(core, app, event),
            State::WaitDhPart2 => self.ev_wait_dhpart2(core, app, event),
            State::WaitConfirm1 => self.ev_wait_confirm1(core, app, event),
            State::WaitConfirm2 => self.ev_wait_confirm2(core, app, event),
            State::WaitConfAck => self.ev_wait_conf_ack(core, app, event),
            State::WaitClearAck => {}
            State::SecureState => self.ev_secure(core, app, event),
            State::Fail => {
                if let Event::Close = event {
                    app.cancel_timer();
                }
            }
        }
    }

    /// Build and send an Error message, then fail the stream. Sending the
    /// Error is best effort; the failure is surfaced either way.
    pub(crate) fn send_error<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, code: WireError) {
        app.cancel_timer();
        #[cfg(feature = "logging")]
        app.event_log(LogEvent::SendError(code as u32));
        let pkt = core.prepare_error(code);
        core.send_packet(app, &pkt);
        self.sent_packet = None;
        self.commit_packet = None;
        core.fail(app, Severity::ZrtpError, ReportCode::from(code));
        self.next_state(app, State::Fail);
    }

    fn abort<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, abort: Abort) {
        match abort {
            Abort::Ignore => {}
            Abort::Error(code) => self.send_error(core, app, code),
        }
    }

    /// Host send or timer refusal is unrecoverable for the stream.
    fn send_failed<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) {
        self.sent_packet = None;
        self.commit_packet = None;
        core.fail(app, Severity::Severe, ReportCode::from(SevereCode::CannotSend));
        self.next_state(app, State::Fail);
    }

    fn timer_failed<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, code: SevereCode) {
        self.sent_packet = None;
        self.commit_packet = None;
        core.fail(app, Severity::Severe, ReportCode::from(code));
        self.next_state(app, State::Fail);
    }

    fn arm_t1<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) -> bool {
        let ms = self.t1.restart();
        if !app.activate_timer(ms) {
            self.timer_failed(core, app, SevereCode::NoTimer);
            return false;
        }
        true
    }

    fn arm_t2<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) -> bool {
        let ms = self.t2.restart();
        if !app.activate_timer(ms) {
            self.timer_failed(core, app, SevereCode::NoTimer);
            return false;
        }
        true
    }

    /// Timer-driven retransmission of the stored packet; bumps the retry
    /// counter attributed to it.
    fn resend<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) -> bool {
        if let Some(pkt) = self.sent_packet.clone() {
            if !core.send_packet(app, &pkt) {
                self.send_failed(core, app);
                return false;
            }
            self.retry_counters[self.sent_retry as usize] += 1;
            #[cfg(feature = "logging")]
            if let Ok((t, _)) = parse_header(&pkt) {
                app.event_log(LogEvent::Resend {
                    msg_type: t,
                    attempt: self.retry_counters[self.sent_retry as usize] as i32,
                });
            }
        }
        true
    }

    /// Event-driven re-answer with the stored packet, e.g. a repeated
    /// Commit answered with the same DHPart1. Not counted as a retry.
    fn reply_last<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) -> bool {
        if let Some(pkt) = self.sent_packet.clone() {
            if !core.send_packet(app, &pkt) {
                self.send_failed(core, app);
                return false;
            }
        }
        true
    }

    /* Initial: waiting for the application to kick the engine off. */
    fn ev_initial<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        if let Event::Initial = event {
            let hello = core.hello_packet();
            if !core.send_packet(app, &hello) {
                self.send_failed(core, app);
                return;
            }
            self.sent_packet = Some(hello);
            self.sent_retry = Retry::Hello;
            if self.arm_t1(core, app) {
                self.next_state(app, State::Detect);
            }
        }
    }

    /* Detect: our Hello is on the wire, waiting for the peer to answer
     * with HelloAck and its own Hello. Both orders are possible. */
    fn ev_detect<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::HelloAck, _) => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::AckDetected);
            }
            Event::Packet(MessageType::Hello, msg) => {
                app.cancel_timer();
                match core.save_peer_hello(app, msg) {
                    Err(Abort::Ignore) => {
                        // Version above ours: keep sending our Hello, the
                        // peer is expected to step down.
                        self.arm_t1(core, app);
                    }
                    Err(Abort::Error(code)) => self.send_error(core, app, code),
                    Ok(()) => {
                        let ack = core.hello_ack_packet();
                        if !core.send_packet(app, &ack) {
                            self.send_failed(core, app);
                            return;
                        }
                        match core.prepare_commit(app) {
                            Ok(commit) => self.commit_packet = Some(commit),
                            Err(abort) => {
                                self.abort(core, app, abort);
                                return;
                            }
                        }
                        self.next_state(app, State::AckSent);
                        self.sent_retry = Retry::HelloAck;
                        if self.arm_t1(core, app) {
                            // Seen the peer: switch to the extended Hello
                            // retry budget, RFC 6189 section 6.
                            self.t1.max_resend = self.t1_resend_extend;
                        }
                    }
                }
            }
            Event::Timer => {
                if !self.resend(core, app) {
                    return;
                }
                match self.t1.next() {
                    Some(ms) => {
                        if !app.activate_timer(ms) {
                            self.timer_failed(core, app, SevereCode::NoTimer);
                        }
                    }
                    None => {
                        self.commit_packet = None;
                        self.sent_packet = None;
                        core.peer_not_responding(app);
                        self.next_state(app, State::Fail);
                    }
                }
            }
            Event::Initial => {
                // Application restarted discovery.
                app.cancel_timer();
                if self.resend(core, app) {
                    self.arm_t1(core, app);
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* AckDetected: the peer acknowledged our Hello but we have not seen
     * its Hello yet. */
    fn ev_ack_detected<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Hello, msg) => {
                match core.save_peer_hello(app, msg) {
                    Err(Abort::Ignore) => {}
                    Err(Abort::Error(code)) => self.send_error(core, app, code),
                    Ok(()) => {
                        // Prepare the Commit now even though we answer with
                        // HelloAck: the shared-secret setup needs the peer
                        // Hello and later states expect it ready.
                        match core.prepare_commit(app) {
                            Ok(commit) => self.commit_packet = Some(commit),
                            Err(abort) => {
                                self.abort(core, app, abort);
                                return;
                            }
                        }
                        let ack = core.hello_ack_packet();
                        self.next_state(app, State::WaitCommit);
                        self.sent_packet = Some(ack.clone());
                        self.sent_retry = Retry::HelloAck;
                        if !core.send_packet(app, &ack) {
                            self.send_failed(core, app);
                        }
                    }
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* AckSent: we answered the peer's Hello with HelloAck and keep
     * retransmitting our own Hello under T1. */
    fn ev_ack_sent<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::HelloAck, _) => {
                app.cancel_timer();
                let Some(commit) = self.commit_packet.take() else {
                    self.send_error(core, app, WireError::CriticalSwError);
                    return;
                };
                core.commit_as_initiator(app);
                self.sent_packet = Some(commit.clone());
                self.sent_retry = Retry::Commit;
                self.next_state(app, State::CommitSent);
                if !core.send_packet(app, &commit) {
                    self.send_failed(core, app);
                    return;
                }
                self.arm_t2(core, app);
            }
            Event::Packet(MessageType::Hello, _) => {
                // The peer missed our HelloAck; answer again, T1 keeps
                // resending our own Hello.
                let ack = core.hello_ack_packet();
                if !core.send_packet(app, &ack) {
                    self.send_failed(core, app);
                }
            }
            Event::Packet(MessageType::Commit, msg) => {
                app.cancel_timer();
                self.commit_packet = None;
                self.respond_to_commit(core, app, msg);
            }
            Event::Timer => {
                if !self.resend(core, app) {
                    return;
                }
                match self.t1.next() {
                    Some(ms) => {
                        if !app.activate_timer(ms) {
                            self.timer_failed(core, app, SevereCode::NoTimer);
                        }
                    }
                    None => {
                        self.commit_packet = None;
                        self.sent_packet = None;
                        core.peer_not_responding(app);
                        self.next_state(app, State::Fail);
                    }
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.commit_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* WaitCommit: we acknowledged the peer's Hello and expect its Commit;
     * we will be Responder. */
    fn ev_wait_commit<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Hello, _) => {
                if !self.reply_last(core, app) {
                    return;
                }
            }
            Event::Packet(MessageType::Commit, msg) => {
                self.commit_packet = None;
                self.respond_to_commit(core, app, msg);
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.commit_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /// Take the Responder role on a received Commit: answer with DHPart1,
    /// or with Confirm1 in multi-stream mode. No timer, the Initiator
    /// drives retransmission.
    fn respond_to_commit<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, msg: &[u8]) {
        core.commit_as_responder(app);
        if core.is_multi_stream() {
            match core.prepare_confirm1_multi(app, msg) {
                Ok(confirm) => {
                    self.sent_packet = Some(confirm.clone());
                    self.next_state(app, State::WaitConfirm2);
                    if !core.send_packet(app, &confirm) {
                        self.send_failed(core, app);
                    }
                }
                Err(abort) => self.abort(core, app, abort),
            }
        } else {
            match core.prepare_dhpart1(app, msg) {
                Ok(dhpart1) => {
                    self.sent_packet = Some(dhpart1.clone());
                    self.next_state(app, State::WaitDhPart2);
                    if !core.send_packet(app, &dhpart1) {
                        self.send_failed(core, app);
                    }
                }
                Err(abort) => self.abort(core, app, abort),
            }
        }
    }

    /* CommitSent: we are the tentative Initiator. Either the peer answers
     * with DHPart1 (Confirm1 in multi-stream mode) or we collide with its
     * own Commit and resolve contention. */
    fn ev_commit_sent<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Hello | MessageType::HelloAck, _) => {
                // Stragglers from the discovery phase.
            }
            Event::Packet(MessageType::Commit, msg) => {
                if !core.verify_peer_commit_chain(msg) {
                    // Not provably from our peer; drop it.
                    return;
                }
                app.cancel_timer();
                match core.compare_commit(msg) {
                    None => {
                        // Identical commit values cannot happen between
                        // honest peers under a secure hash.
                        self.send_error(core, app, WireError::CriticalSwError);
                    }
                    Some(true) => {
                        #[cfg(feature = "logging")]
                        app.event_log(LogEvent::CommitContention { we_win: true });
                        // We stay Initiator; keep resending the Commit, the
                        // peer will fall back to Responder.
                        self.arm_t2(core, app);
                    }
                    Some(false) => {
                        #[cfg(feature = "logging")]
                        app.event_log(LogEvent::CommitContention { we_win: false });
                        self.sent_packet = None;
                        self.respond_to_commit(core, app, msg);
                    }
                }
            }
            Event::Packet(MessageType::DhPart1, msg) => {
                if core.is_multi_stream() {
                    return;
                }
                app.cancel_timer();
                self.sent_packet = None;
                match core.prepare_dhpart2(app, msg) {
                    Ok(dhpart2) => {
                        self.sent_packet = Some(dhpart2.clone());
                        self.sent_retry = Retry::DhPart2;
                        self.next_state(app, State::WaitConfirm1);
                        if !core.send_packet(app, &dhpart2) {
                            self.send_failed(core, app);
                            return;
                        }
                        self.arm_t2(core, app);
                    }
                    Err(Abort::Ignore) => {
                        self.arm_t2(core, app);
                    }
                    Err(abort) => self.abort(core, app, abort),
                }
            }
            Event::Packet(MessageType::Confirm1, msg) if core.is_multi_stream() => {
                app.cancel_timer();
                match core.prepare_confirm2_multi(app, msg) {
                    Ok(confirm2) => {
                        self.sent_packet = Some(confirm2.clone());
                        self.sent_retry = Retry::Confirm2;
                        self.next_state(app, State::WaitConfAck);
                        if !core.send_packet(app, &confirm2) {
                            self.send_failed(core, app);
                            return;
                        }
                        if !self.arm_t2(core, app) {
                            return;
                        }
                        if !core.srtp_ready(app, EnableSecurity::ForReceiver) {
                            self.send_error(core, app, WireError::CriticalSwError);
                        }
                    }
                    Err(abort) => self.abort(core, app, abort),
                }
            }
            Event::Timer => {
                if !self.resend(core, app) {
                    return;
                }
                match self.t2.next() {
                    Some(ms) => {
                        if !app.activate_timer(ms) {
                            self.timer_failed(core, app, SevereCode::NoTimer);
                        }
                    }
                    None => self.timer_failed(core, app, SevereCode::TooMuchRetries),
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* WaitDhPart2: Responder sent DHPart1 and waits. No timer on our side. */
    fn ev_wait_dhpart2<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Commit, _) => {
                // Peer missed our DHPart1.
                if !self.reply_last(core, app) {
                    return;
                }
            }
            Event::Packet(MessageType::DhPart2, msg) => match core.prepare_confirm1(app, msg) {
                Ok(confirm1) => {
                    self.sent_packet = Some(confirm1.clone());
                    self.next_state(app, State::WaitConfirm2);
                    if !core.send_packet(app, &confirm1) {
                        self.send_failed(core, app);
                    }
                }
                Err(abort) => self.abort(core, app, abort),
            },
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* WaitConfirm1: Initiator sent DHPart2, T2 running. */
    fn ev_wait_confirm1<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Confirm1, msg) => {
                app.cancel_timer();
                match core.prepare_confirm2(app, msg) {
                    Ok(confirm2) => {
                        // After sending Confirm2 we must be able to receive
                        // SRTP, RFC 6189 section 4.6.
                        if !core.srtp_ready(app, EnableSecurity::ForReceiver) {
                            self.send_error(core, app, WireError::CriticalSwError);
                            return;
                        }
                        self.sent_packet = Some(confirm2.clone());
                        self.sent_retry = Retry::Confirm2;
                        self.next_state(app, State::WaitConfAck);
                        if !core.send_packet(app, &confirm2) {
                            self.send_failed(core, app);
                            return;
                        }
                        self.arm_t2(core, app);
                    }
                    Err(abort) => self.abort(core, app, abort),
                }
            }
            Event::Timer => {
                if !self.resend(core, app) {
                    return;
                }
                match self.t2.next() {
                    Some(ms) => {
                        if !app.activate_timer(ms) {
                            self.timer_failed(core, app, SevereCode::NoTimer);
                        }
                    }
                    None => self.timer_failed(core, app, SevereCode::TooMuchRetries),
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* WaitConfirm2: Responder sent Confirm1. The peer retransmits DHPart2
     * (or its Commit in multi-stream mode) until it sees our Confirm1. */
    fn ev_wait_confirm2<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::DhPart2, _) => {
                if !self.reply_last(core, app) {
                    return;
                }
            }
            Event::Packet(MessageType::Commit, _) if core.is_multi_stream() => {
                if !self.reply_last(core, app) {
                    return;
                }
            }
            Event::Packet(MessageType::Confirm2, msg) => match core.prepare_conf2ack(app, msg) {
                Ok(ack) => {
                    self.sent_packet = None;
                    self.conf2_ack = Some(ack.clone());
                    if !core.send_packet(app, &ack) {
                        self.send_failed(core, app);
                        return;
                    }
                    if !core.srtp_ready(app, EnableSecurity::ForReceiver)
                        || !core.srtp_ready(app, EnableSecurity::ForSender)
                    {
                        self.send_error(core, app, WireError::CriticalSwError);
                        return;
                    }
                    self.next_state(app, State::SecureState);
                    core.enter_secure(app);
                }
                Err(abort) => self.abort(core, app, abort),
            },
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /* WaitConfAck: Initiator sent Confirm2, receive side already up. */
    fn ev_wait_conf_ack<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Conf2Ack, _) => {
                app.cancel_timer();
                self.sent_packet = None;
                if !core.srtp_ready(app, EnableSecurity::ForSender) {
                    self.send_error(core, app, WireError::CriticalSwError);
                    return;
                }
                self.next_state(app, State::SecureState);
                core.enter_secure(app);
            }
            Event::Timer => {
                if !self.resend(core, app) {
                    core.srtp_off(app, EnableSecurity::ForReceiver);
                    return;
                }
                match self.t2.next() {
                    Some(ms) => {
                        if !app.activate_timer(ms) {
                            self.timer_failed(core, app, SevereCode::NoTimer);
                            core.srtp_off(app, EnableSecurity::ForReceiver);
                        }
                    }
                    None => {
                        self.timer_failed(core, app, SevereCode::TooMuchRetries);
                        core.srtp_off(app, EnableSecurity::ForReceiver);
                    }
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                self.next_state(app, State::Initial);
                core.srtp_off(app, EnableSecurity::ForReceiver);
            }
            _ => {}
        }
    }

    /* SecureState: SRTP is up. We still answer a repeated Confirm2 and run
     * the SASRelay sub-exchange if the application requests one. */
    fn ev_secure<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A, event: Event<'_>) {
        match event {
            Event::Packet(MessageType::Confirm2, _) => {
                // Responder side: the peer missed our Conf2Ack.
                if let Some(ack) = self.conf2_ack.clone() {
                    if !core.send_packet(app, &ack) {
                        self.send_failed(core, app);
                    }
                }
            }
            Event::Packet(MessageType::RelayAck, _) => {
                if self.relay_packet.take().is_some() {
                    app.cancel_timer();
                }
            }
            Event::Timer => {
                if let Some(relay) = self.relay_packet.clone() {
                    if !core.send_packet(app, &relay) {
                        self.send_failed(core, app);
                        return;
                    }
                    self.retry_counters[Retry::Relay as usize] += 1;
                    match self.t2.next() {
                        Some(ms) => {
                            if !app.activate_timer(ms) {
                                self.timer_failed(core, app, SevereCode::NoTimer);
                            }
                        }
                        None => {
                            // Give up on the relay but keep the session.
                            self.relay_packet = None;
                        }
                    }
                }
            }
            Event::Close => {
                app.cancel_timer();
                self.sent_packet = None;
                core.srtp_off(app, EnableSecurity::ForSender);
                core.srtp_off(app, EnableSecurity::ForReceiver);
                self.next_state(app, State::Initial);
            }
            _ => {}
        }
    }

    /// Start an outbound SASRelay exchange from the secure state.
    pub(crate) fn send_sas_relay<A: ZrtpCallback>(
        &mut self,
        core: &mut SessionCore,
        app: &mut A,
        relay: Vec<u8>,
    ) -> bool {
        if self.state != State::SecureState {
            return false;
        }
        if !core.send_packet(app, &relay) {
            self.send_failed(core, app);
            return false;
        }
        self.relay_packet = Some(relay);
        self.arm_t2(core, app)
    }

    /// First valid SRTP packet stands in for a lost Conf2Ack,
    /// RFC 6189 section 4.6.
    pub(crate) fn conf2_ack_secure<A: ZrtpCallback>(&mut self, core: &mut SessionCore, app: &mut A) {
        if self.state == State::WaitConfAck {
            app.cancel_timer();
            self.sent_packet = None;
            if core.srtp_ready(app, EnableSecurity::ForSender) {
                self.next_state(app, State::SecureState);
                core.enter_secure(app);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_doubles_to_cap_and_exhausts() {
        let mut t = Timer::new(50, 200, 3);
        assert_eq!(t.restart(), 50);
        assert_eq!(t.next(), Some(100));
        assert_eq!(t.next(), Some(200));
        assert_eq!(t.next(), Some(200));
        assert_eq!(t.next(), None);
    }

    #[test]
    fn negative_resend_budget_never_exhausts() {
        let mut t = Timer::new(150, 1200, -1);
        t.restart();
        for _ in 0..100 {
            assert!(t.next().is_some());
        }
        assert_eq!(t.time, 1200);
    }

    #[test]
    fn restart_resets_counter() {
        let mut t = Timer::new(50, 200, 1);
        t.restart();
        assert!(t.next().is_some());
        assert!(t.next().is_none());
        t.restart();
        assert!(t.next().is_some());
    }
}
