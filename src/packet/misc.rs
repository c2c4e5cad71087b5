/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The fixed-size single-purpose messages: the acknowledgements, Error,
//! Ping and PingAck.

use crate::packet::{MessageBuilder, MessageType, ParseError};
use crate::proto::*;

/// HelloACK, Conf2ACK, ErrorACK and RelayACK are bare headers.
pub(crate) fn build_ack(msg_type: MessageType) -> Vec<u8> {
    debug_assert!(matches!(
        msg_type,
        MessageType::HelloAck | MessageType::Conf2Ack | MessageType::ErrorAck | MessageType::RelayAck
    ));
    MessageBuilder::new(msg_type).finish()
}

/// Error message, RFC 6189 section 5.9: one word carrying the error code.
pub(crate) fn build_error(code: u32) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::Error);
    b.put_u32(code);
    b.finish()
}

pub(crate) fn parse_error_code(msg: &[u8]) -> Result<u32, ParseError> {
    if msg.len() != HEADER_SIZE + WORD_SIZE {
        return Err(ParseError::Malformed);
    }
    Ok(u32::from_be_bytes(msg[HEADER_SIZE..].try_into().unwrap()))
}

/* Ping and PingAck, RFC 6189 sections 5.15 and 5.16. The endpoint hash
   identifies an endpoint across what may be a forking proxy setup. */

const PING_VERSION_OFF: usize = 12;
const PING_HASH_OFF: usize = 16;
pub(crate) const ENDPOINT_HASH_SIZE: usize = 2 * WORD_SIZE;

pub(crate) struct PingView<'a> {
    msg: &'a [u8],
}

impl<'a> PingView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() != PING_HASH_OFF + ENDPOINT_HASH_SIZE {
            return Err(ParseError::Malformed);
        }
        Ok(Self { msg })
    }

    pub fn version(&self) -> &'a [u8; 4] {
        self.msg[PING_VERSION_OFF..PING_VERSION_OFF + 4].try_into().unwrap()
    }

    pub fn endpoint_hash(&self) -> &'a [u8; ENDPOINT_HASH_SIZE] {
        self.msg[PING_HASH_OFF..PING_HASH_OFF + ENDPOINT_HASH_SIZE].try_into().unwrap()
    }
}

#[cfg(test)]
pub(crate) fn build_ping(version: &[u8; 4], endpoint_hash: &[u8; ENDPOINT_HASH_SIZE]) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::Ping);
    b.put(version);
    b.put(endpoint_hash);
    b.finish()
}

const PING_ACK_SENDER_HASH_OFF: usize = 16;
const PING_ACK_RECEIVED_HASH_OFF: usize = 24;
const PING_ACK_SSRC_OFF: usize = 32;

#[cfg(test)]
pub(crate) struct PingAckView<'a> {
    msg: &'a [u8],
}

#[cfg(test)]
impl<'a> PingAckView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() != PING_ACK_SSRC_OFF + WORD_SIZE {
            return Err(ParseError::Malformed);
        }
        Ok(Self { msg })
    }

    pub fn sender_endpoint_hash(&self) -> &'a [u8; ENDPOINT_HASH_SIZE] {
        self.msg[PING_ACK_SENDER_HASH_OFF..PING_ACK_SENDER_HASH_OFF + ENDPOINT_HASH_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn received_endpoint_hash(&self) -> &'a [u8; ENDPOINT_HASH_SIZE] {
        self.msg[PING_ACK_RECEIVED_HASH_OFF..PING_ACK_RECEIVED_HASH_OFF + ENDPOINT_HASH_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn received_ssrc(&self) -> u32 {
        u32::from_be_bytes(self.msg[PING_ACK_SSRC_OFF..PING_ACK_SSRC_OFF + 4].try_into().unwrap())
    }
}

pub(crate) fn build_ping_ack(
    version: &[u8; 4],
    sender_endpoint_hash: &[u8; ENDPOINT_HASH_SIZE],
    received_endpoint_hash: &[u8; ENDPOINT_HASH_SIZE],
    received_ssrc: u32,
) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::PingAck);
    b.put(version);
    b.put(sender_endpoint_hash);
    b.put(received_endpoint_hash);
    b.put_u32(received_ssrc);
    b.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_header;

    #[test]
    fn acks_are_three_words() {
        for t in [MessageType::HelloAck, MessageType::Conf2Ack, MessageType::ErrorAck, MessageType::RelayAck] {
            let msg = build_ack(t);
            assert_eq!(msg.len(), 12);
            assert_eq!(parse_header(&msg).unwrap().0, t);
        }
    }

    #[test]
    fn error_code_round_trip() {
        let msg = build_error(0x61);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::Error);
        assert_eq!(parse_error_code(m), Ok(0x61));
    }

    #[test]
    fn ping_round_trip() {
        let msg = build_ping(b"1.10", &[3; 8]);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::Ping);
        let p = PingView::parse(m).unwrap();
        assert_eq!(p.version(), b"1.10");
        assert_eq!(p.endpoint_hash(), &[3; 8]);
    }

    #[test]
    fn ping_ack_round_trip() {
        let msg = build_ping_ack(b"1.10", &[1; 8], &[2; 8], 0xdead_beef);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::PingAck);
        let p = PingAckView::parse(m).unwrap();
        assert_eq!(p.sender_endpoint_hash(), &[1; 8]);
        assert_eq!(p.received_endpoint_hash(), &[2; 8]);
        assert_eq!(p.received_ssrc(), 0xdead_beef);
    }
}
