/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Typed views over ZRTP message buffers.
//!
//! A message is parsed once into a borrowed view that exposes typed field
//! accessors; the underlying byte buffer stays the single source of truth.
//! Builders assemble outgoing messages into owned buffers with the length
//! word and trailing MAC filled in last. The CRC and any transport framing
//! around the message are the transport's business, not ours.

pub(crate) mod commit;
pub(crate) mod confirm;
pub(crate) mod dhpart;
pub(crate) mod hello;
pub(crate) mod misc;

use crate::proto::*;

/// Why an incoming buffer was rejected. All of these are recoverable: the
/// packet is dropped and the state machine stays where it is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    TooShort,
    BadPreamble,
    /// Declared word count does not match the buffer length.
    LengthMismatch,
    UnknownType,
    /// A field inside the message is inconsistent with its length.
    Malformed,
}

/// The ZRTP message types this engine understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Hello,
    HelloAck,
    Commit,
    DhPart1,
    DhPart2,
    Confirm1,
    Confirm2,
    Conf2Ack,
    Error,
    ErrorAck,
    Ping,
    PingAck,
    SasRelay,
    RelayAck,
}

impl MessageType {
    pub(crate) fn type_block(self) -> &'static [u8; 8] {
        match self {
            MessageType::Hello => MSG_HELLO,
            MessageType::HelloAck => MSG_HELLO_ACK,
            MessageType::Commit => MSG_COMMIT,
            MessageType::DhPart1 => MSG_DHPART1,
            MessageType::DhPart2 => MSG_DHPART2,
            MessageType::Confirm1 => MSG_CONFIRM1,
            MessageType::Confirm2 => MSG_CONFIRM2,
            MessageType::Conf2Ack => MSG_CONF2_ACK,
            MessageType::Error => MSG_ERROR,
            MessageType::ErrorAck => MSG_ERROR_ACK,
            MessageType::Ping => MSG_PING,
            MessageType::PingAck => MSG_PING_ACK,
            MessageType::SasRelay => MSG_SAS_RELAY,
            MessageType::RelayAck => MSG_RELAY_ACK,
        }
    }

    fn from_type_block(block: &[u8]) -> Option<Self> {
        Some(match block {
            b"Hello   " => MessageType::Hello,
            b"HelloACK" => MessageType::HelloAck,
            b"Commit  " => MessageType::Commit,
            b"DHPart1 " => MessageType::DhPart1,
            b"DHPart2 " => MessageType::DhPart2,
            b"Confirm1" => MessageType::Confirm1,
            b"Confirm2" => MessageType::Confirm2,
            b"Conf2ACK" => MessageType::Conf2Ack,
            b"Error   " => MessageType::Error,
            b"ErrorACK" => MessageType::ErrorAck,
            b"Ping    " => MessageType::Ping,
            b"PingACK " => MessageType::PingAck,
            b"SASrelay" => MessageType::SasRelay,
            b"RelayACK" => MessageType::RelayAck,
        _ => return None,
        })
    }
}

/// Validate preamble, declared length and type block of a raw message.
///
/// Returns the message type and the message bytes trimmed to the declared
/// length. The caller hands in exactly one ZRTP message without CRC.
pub(crate) fn parse_header(buf: &[u8]) -> Result<(MessageType, &[u8]), ParseError> {
    if buf.len() < HEADER_SIZE {
        return Err(ParseError::TooShort);
    }
    if u16::from_be_bytes([buf[0], buf[1]]) != MESSAGE_PREAMBLE {
        return Err(ParseError::BadPreamble);
    }
    let declared = u16::from_be_bytes([buf[2], buf[3]]) as usize * WORD_SIZE;
    if declared < HEADER_SIZE || declared > MAX_MESSAGE_SIZE || declared != buf.len() {
        return Err(ParseError::LengthMismatch);
    }
    let msg_type = MessageType::from_type_block(&buf[WORD_SIZE..HEADER_SIZE]).ok_or(ParseError::UnknownType)?;
    Ok((msg_type, &buf[..declared]))
}

/// Assembles one outgoing message. The length word is patched in `finish`.
pub(crate) struct MessageBuilder {
    buf: Vec<u8>,
}

impl MessageBuilder {
    pub fn new(msg_type: MessageType) -> Self {
        let mut buf = Vec::with_capacity(128);
        buf.extend_from_slice(&MESSAGE_PREAMBLE.to_be_bytes());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(msg_type.type_block());
        Self { buf }
    }

    pub fn put(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    pub fn put_u32(&mut self, v: u32) -> &mut Self {
        self.buf.extend_from_slice(&v.to_be_bytes());
        self
    }

    /// Reserve space for the trailing MAC; the caller computes it over the
    /// whole message except these final two words.
    pub fn finish_with_mac(mut self, mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE]) -> Vec<u8> {
        self.patch_length(self.buf.len() + MAC_SIZE);
        let mac = mac_fn(&self.buf);
        self.buf.extend_from_slice(&mac);
        self.buf
    }

    pub fn finish(mut self) -> Vec<u8> {
        self.patch_length(self.buf.len());
        self.buf
    }

    fn patch_length(&mut self, total: usize) {
        debug_assert!(total % WORD_SIZE == 0 && total <= MAX_MESSAGE_SIZE);
        let words = (total / WORD_SIZE) as u16;
        self.buf[2..4].copy_from_slice(&words.to_be_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_header_and_length() {
        let msg = MessageBuilder::new(MessageType::HelloAck).finish();
        assert_eq!(msg.len(), 12);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::HelloAck);
        assert_eq!(m.len(), 12);
    }

    #[test]
    fn header_rejects_truncation_and_padding() {
        let msg = MessageBuilder::new(MessageType::Conf2Ack).finish();
        assert_eq!(parse_header(&msg[..8]), Err(ParseError::LengthMismatch));
        let mut padded = msg.clone();
        padded.extend_from_slice(&[0; 4]);
        assert_eq!(parse_header(&padded), Err(ParseError::LengthMismatch));
    }

    #[test]
    fn header_rejects_bad_preamble_and_type() {
        let mut msg = MessageBuilder::new(MessageType::Conf2Ack).finish();
        msg[0] = 0;
        assert_eq!(parse_header(&msg), Err(ParseError::BadPreamble));
        let mut msg = MessageBuilder::new(MessageType::Conf2Ack).finish();
        msg[4..12].copy_from_slice(b"Bogus   ");
        assert_eq!(parse_header(&msg), Err(ParseError::UnknownType));
    }

    #[test]
    fn mac_trailer_is_appended_after_length_patch(){
        let b = MessageBuilder::new(MessageType::Commit);
        let msg = b.finish_with_mac(|m| {
            // Length must already cover the MAC words while MACing.
            assert_eq!(u16::from_be_bytes([m[2], m[3]]) as usize * 4, m.len() + 8);
            [0xee; 8]
        });
        assert_eq!(&msg[msg.len() - 8..], &[0xee; 8]);
    }
}
