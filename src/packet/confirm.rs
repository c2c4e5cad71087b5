/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Confirm1/Confirm2 and the SASRelay message, which shares the
//! encrypt-then-HMAC envelope: confirm_mac, CFB IV, then the encrypted
//! body starting right after the IV.

use crate::packet::{MessageBuilder, MessageType, ParseError};
use crate::proto::*;

const MAC_OFF: usize = 12;
const IV_OFF: usize = MAC_OFF + MAC_SIZE;
/// Start of the encrypted region in both Confirm and SASRelay.
const ENC_OFF: usize = IV_OFF + IV_SIZE;

/* Confirm encrypted body, RFC 6189 section 5.7:
     H0 (8 words), filler (2 bytes), sig length (1 byte), flags (1 byte),
     cache expiration interval (1 word), optional signature block.
   The 9 bit signature length keeps its low 8 bits in the sig length byte
   and bit 8 in the second filler byte. */
const H0_OFF: usize = ENC_OFF;
const FILLER_OFF: usize = H0_OFF + HASH_IMAGE_SIZE;
const SIG_LEN_OFF: usize = FILLER_OFF + 2;
const FLAGS_OFF: usize = SIG_LEN_OFF + 1;
const EXPIRY_OFF: usize = FLAGS_OFF + 1;
const SIG_OFF: usize = EXPIRY_OFF + 4;

pub(crate) const CONFIRM_FIXED_LEN: usize = SIG_OFF;

pub(crate) const FLAG_ENROLLMENT: u8 = 0x8;
pub(crate) const FLAG_SAS_VERIFIED: u8 = 0x4;
pub(crate) const FLAG_ALLOW_CLEAR: u8 = 0x2;
pub(crate) const FLAG_DISCLOSURE: u8 = 0x1;

/// View over a received Confirm while its body is still encrypted.
pub(crate) struct ConfirmView<'a> {
    msg: &'a [u8],
}

impl<'a> ConfirmView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() < CONFIRM_FIXED_LEN {
            return Err(ParseError::TooShort);
        }
        Ok(Self { msg })
    }

    pub fn confirm_mac(&self) -> &'a [u8; MAC_SIZE] {
        self.msg[MAC_OFF..MAC_OFF + MAC_SIZE].try_into().unwrap()
    }

    pub fn iv(&self) -> &'a [u8; IV_SIZE] {
        self.msg[IV_OFF..IV_OFF + IV_SIZE].try_into().unwrap()
    }

    pub fn encrypted(&self) -> &'a [u8] {
        &self.msg[ENC_OFF..]
    }
}

/// A Confirm whose body has been decrypted into an owned buffer.
pub(crate) struct ConfirmDecrypted {
    buf: Vec<u8>,
}

impl ConfirmDecrypted {
    /// Take the full message with the body already decrypted in place and
    /// validate the signature length against the message length.
    pub fn new(buf: Vec<u8>) -> Result<Self, ParseError> {
        let c = Self { buf };
        if c.buf.len() != CONFIRM_FIXED_LEN + c.sig_len_words() * WORD_SIZE {
            return Err(ParseError::Malformed);
        }
        Ok(c)
    }

    fn sig_len_words(&self) -> usize {
        let mut sl = self.buf[SIG_LEN_OFF] as usize;
        if self.buf[FILLER_OFF + 1] == 1 {
            sl |= 0x100;
        }
        sl
    }

    pub fn h0(&self) -> &[u8; HASH_IMAGE_SIZE] {
        self.buf[H0_OFF..H0_OFF + HASH_IMAGE_SIZE].try_into().unwrap()
    }

    pub fn flags(&self) -> u8 {
        self.buf[FLAGS_OFF]
    }

    /// Cache expiration interval in seconds, RFC 6189 section 4.9.
    pub fn cache_expiry(&self) -> u32 {
        u32::from_be_bytes(self.buf[EXPIRY_OFF..EXPIRY_OFF + 4].try_into().unwrap())
    }

    pub fn signature(&self) -> Option<&[u8]> {
        if self.sig_len_words() == 0 {
            None
        } else {
            Some(&self.buf[SIG_OFF..])
        }
    }
}

pub(crate) struct ConfirmBody<'a> {
    pub h0: &'a [u8; HASH_IMAGE_SIZE],
    pub flags: u8,
    pub cache_expiry: u32,
    pub signature: Option<&'a [u8]>,
}

/// Build a Confirm1 or Confirm2. `encrypt_fn` runs over the plaintext body,
/// `mac_fn` over the resulting ciphertext; its result lands in confirm_mac.
pub(crate) fn build(
    msg_type: MessageType,
    body: &ConfirmBody<'_>,
    iv: &[u8; IV_SIZE],
    encrypt_fn: impl FnOnce(&mut [u8]),
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    debug_assert!(msg_type == MessageType::Confirm1 || msg_type == MessageType::Confirm2);
    let sig = body.signature.unwrap_or(&[]);
    let sig_words = sig.len() / WORD_SIZE;
    debug_assert!(sig.len() % WORD_SIZE == 0 && sig_words <= MAX_SIGNATURE_WORDS);

    let mut b = MessageBuilder::new(msg_type);
    b.put(&[0u8; MAC_SIZE]);
    b.put(iv);
    b.put(body.h0);
    b.put(&[0, (sig_words >> 8) as u8, (sig_words & 0xff) as u8, body.flags]);
    b.put_u32(body.cache_expiry);
    b.put(sig);
    let mut msg = b.finish();

    encrypt_fn(&mut msg[ENC_OFF..]);
    let mac = mac_fn(&msg[ENC_OFF..]);
    msg[MAC_OFF..MAC_OFF + MAC_SIZE].copy_from_slice(&mac);
    msg
}

/* SASRelay encrypted body, RFC 6189 section 5.13: filler/sig length/flags
   word as in Confirm, then the SAS rendering scheme (1 word) and the
   relayed SAS hash (8 words). */
const RELAY_FLAGS_WORD_OFF: usize = ENC_OFF;
const RELAY_RENDER_OFF: usize = RELAY_FLAGS_WORD_OFF + WORD_SIZE;
const RELAY_SAS_OFF: usize = RELAY_RENDER_OFF + WORD_SIZE;

pub(crate) const SAS_RELAY_FIXED_LEN: usize = RELAY_SAS_OFF + HASH_IMAGE_SIZE;

/// A SASRelay whose body has been decrypted into an owned buffer.
pub(crate) struct SasRelayDecrypted {
    buf: Vec<u8>,
}

impl SasRelayDecrypted {
    pub fn new(buf: Vec<u8>) -> Result<Self, ParseError> {
        if buf.len() < SAS_RELAY_FIXED_LEN {
            return Err(ParseError::TooShort);
        }
        Ok(Self { buf })
    }

    pub fn render_scheme(&self) -> &[u8; WORD_SIZE] {
        self.buf[RELAY_RENDER_OFF..RELAY_RENDER_OFF + WORD_SIZE].try_into().unwrap()
    }

    pub fn sas_hash(&self) -> &[u8; HASH_IMAGE_SIZE] {
        self.buf[RELAY_SAS_OFF..RELAY_SAS_OFF + HASH_IMAGE_SIZE].try_into().unwrap()
    }
}

/// Build a SASRelay carrying the full SAS hash and its rendering scheme.
pub(crate) fn build_sas_relay(
    sas_hash: &[u8; HASH_IMAGE_SIZE],
    render_scheme: &[u8; WORD_SIZE],
    iv: &[u8; IV_SIZE],
    encrypt_fn: impl FnOnce(&mut [u8]),
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::SasRelay);
    b.put(&[0u8; MAC_SIZE]);
    b.put(iv);
    b.put(&[0u8; WORD_SIZE]);
    b.put(render_scheme);
    b.put(sas_hash);
    let mut msg = b.finish();

    encrypt_fn(&mut msg[ENC_OFF..]);
    let mac = mac_fn(&msg[ENC_OFF..]);
    msg[MAC_OFF..MAC_OFF + MAC_SIZE].copy_from_slice(&mac);
    msg
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_header;

    #[test]
    fn round_trip_without_signature() {
        let body = ConfirmBody {
            h0: &[8; 32],
            flags: FLAG_SAS_VERIFIED | FLAG_DISCLOSURE,
            cache_expiry: 0xffff_ffff,
            signature: None,
        };
        let msg = build(MessageType::Confirm1, &body, &[1; 16], |b| b.iter_mut().for_each(|x| *x ^= 0x55), |_| [2; 8]);
        assert_eq!(msg.len(), 19 * 4);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::Confirm1);
        let view = ConfirmView::parse(m).unwrap();
        assert_eq!(view.confirm_mac(), &[2; 8]);
        assert_eq!(view.iv(), &[1; 16]);

        let mut plain = m.to_vec();
        plain[ENC_OFF..].iter_mut().for_each(|x| *x ^= 0x55);
        let dec = ConfirmDecrypted::new(plain).unwrap();
        assert_eq!(dec.h0(), &[8; 32]);
        assert_eq!(dec.flags(), FLAG_SAS_VERIFIED | FLAG_DISCLOSURE);
        assert_eq!(dec.cache_expiry(), 0xffff_ffff);
        assert!(dec.signature().is_none());
    }

    #[test]
    fn nine_bit_signature_length() {
        let sig = vec![0xabu8; 260 * 4];
        let body = ConfirmBody { h0: &[0; 32], flags: 0, cache_expiry: 0, signature: Some(&sig) };
        let msg = build(MessageType::Confirm2, &body, &[0; 16], |_| {}, |_| [0; 8]);
        // 260 does not fit in one byte; bit 8 lives in the filler.
        assert_eq!(msg[SIG_LEN_OFF], (260 & 0xff) as u8);
        assert_eq!(msg[FILLER_OFF + 1], 1);
        let dec = ConfirmDecrypted::new(msg).unwrap();
        assert_eq!(dec.signature().unwrap(), &sig[..]);
    }

    #[test]
    fn signature_length_mismatch_is_rejected() {
        let body = ConfirmBody { h0: &[0; 32], flags: 0, cache_expiry: 0, signature: None };
        let mut msg = build(MessageType::Confirm1, &body, &[0; 16], |_| {}, |_| [0; 8]);
        msg[SIG_LEN_OFF] = 3;
        assert!(ConfirmDecrypted::new(msg).is_err());
    }

    #[test]
    fn sas_relay_round_trip() {
        let msg = build_sas_relay(&[7; 32], b"B32 ", &[0; 16], |_| {}, |_| [9; 8]);
        assert_eq!(msg.len(), 19 * 4);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::SasRelay);
        let dec = SasRelayDecrypted::new(m.to_vec()).unwrap();
        assert_eq!(dec.render_scheme(), b"B32 ");
        assert_eq!(dec.sas_hash(), &[7; 32]);
    }
}
