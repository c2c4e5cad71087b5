/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use crate::packet::MessageType;
use crate::state::State;

/// Protocol events that might be interesting to log or aggregate into
/// metrics. Delivered through `ZrtpCallback::event_log` when the `logging`
/// feature is enabled.
pub enum LogEvent<'a> {
    /// The state machine moved.
    Transition { from: State, to: State },
    /// A retransmission timer fired and the stored packet went out again.
    Resend { msg_type: MessageType, attempt: i32 },
    /// Both sides sent a Commit; `we_win` tells who stays Initiator.
    CommitContention { we_win: bool },
    /// Outcome of the retained-secret comparison for this handshake.
    SecretsMatched { rs1: bool, rs2: bool, aux: bool, pbx: bool },
    /// The cache held a secret but none matched, see RFC 6189 section 4.6.1.
    CacheMismatch,
    /// A retroactive packet MAC check failed.
    HmacFailed(MessageType),
    /// An Error message went out with this wire code.
    SendError(u32),
    /// A message was dropped without state change.
    Dropped { msg_type: Option<MessageType>, reason: &'a str },
}

impl<'a> std::fmt::Debug for LogEvent<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use LogEvent::*;
        match self {
            Transition { from, to } => write!(f, "Transition({:?} -> {:?})", from, to),
            Resend { msg_type, attempt } => write!(f, "Resend({:?}, attempt {})", msg_type, attempt),
            CommitContention { we_win } => write!(f, "CommitContention(we_win: {})", we_win),
            SecretsMatched { rs1, rs2, aux, pbx } => {
                write!(f, "SecretsMatched(rs1: {}, rs2: {}, aux: {}, pbx: {})", rs1, rs2, aux, pbx)
            }
            CacheMismatch => write!(f, "CacheMismatch"),
            HmacFailed(t) => write!(f, "HmacFailed({:?})", t),
            SendError(code) => write!(f, "SendError({:#x})", code),
            Dropped { msg_type, reason } => write!(f, "Dropped({:?}, {})", msg_type, reason),
        }
    }
}
