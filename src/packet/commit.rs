/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crate::algorithm::*;
use crate::error::WireError;
use crate::packet::{MessageBuilder, MessageType, ParseError};
use crate::proto::*;

/* Commit layout, RFC 6189 section 5.4:
     12  H2 (8 words)
     44  ZID (3 words)
     56  committed algorithms: hash, cipher, auth tag, key agreement, SAS
     76  hvi (8 words), or nonce (4 words) in multi-stream mode
      -  MAC (2 words, keyed with H1)
*/
const H2_OFF: usize = 12;
const ZID_OFF: usize = 44;
const ALGOS_OFF: usize = 56;
const VARIANT_OFF: usize = 76;

const DH_LEN: usize = VARIANT_OFF + HVI_SIZE + MAC_SIZE;
const MULTI_LEN: usize = VARIANT_OFF + NONCE_SIZE + MAC_SIZE;

/// The part of a Commit that differs between DH and multi-stream mode.
pub(crate) enum CommitVariant<'a> {
    Dh { hvi: &'a [u8; HVI_SIZE] },
    MultiStream { nonce: &'a [u8; NONCE_SIZE] },
}

pub(crate) struct CommitView<'a> {
    msg: &'a [u8],
    multi_stream: bool,
}

impl<'a> CommitView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() < MULTI_LEN {
            return Err(ParseError::TooShort);
        }
        let multi_stream = &msg[ALGOS_OFF + 12..ALGOS_OFF + 16] == PubKeyAlgorithm::Mult.wire_name();
        let expected = if multi_stream { MULTI_LEN } else { DH_LEN };
        if msg.len() != expected {
            return Err(ParseError::Malformed);
        }
        Ok(Self { msg, multi_stream })
    }

    pub fn h2(&self) -> &'a [u8; HASH_IMAGE_SIZE] {
        self.msg[H2_OFF..H2_OFF + HASH_IMAGE_SIZE].try_into().unwrap()
    }

    pub fn zid(&self) -> &'a [u8; ZID_SIZE] {
        self.msg[ZID_OFF..ZID_OFF + ZID_SIZE].try_into().unwrap()
    }

    pub fn is_multi_stream(&self) -> bool {
        self.multi_stream
    }

    fn algo_name(&self, index: usize) -> &'a [u8] {
        &self.msg[ALGOS_OFF + index * WORD_SIZE..ALGOS_OFF + (index + 1) * WORD_SIZE]
    }

    /// Decode the committed suite. `None` if any name is outside the
    /// registry, which aborts the handshake with an algorithm error.
    pub fn suite(&self) -> Option<AlgorithmSuite> {
        self.suite_or_error().ok()
    }

    /// As `suite`, but naming the offending category through its wire
    /// error code.
    pub fn suite_or_error(&self) -> Result<AlgorithmSuite, WireError> {
        let pub_key = if self.multi_stream {
            PubKeyAlgorithm::Mult
        } else {
            PubKeyAlgorithm::from_wire_name(self.algo_name(3)).ok_or(WireError::UnsupportedPubKey)?
        };
        Ok(AlgorithmSuite {
            hash: HashAlgorithm::from_wire_name(self.algo_name(0)).ok_or(WireError::UnsupportedHash)?,
            cipher: CipherAlgorithm::from_wire_name(self.algo_name(1)).ok_or(WireError::UnsupportedCipher)?,
            auth_tag: AuthTag::from_wire_name(self.algo_name(2)).ok_or(WireError::UnsupportedAuthTag)?,
            pub_key,
            sas: SasRender::from_wire_name(self.algo_name(4)).ok_or(WireError::UnsupportedSasRender)?,
        })
    }

    pub fn variant(&self) -> CommitVariant<'a> {
        if self.multi_stream {
            CommitVariant::MultiStream {
                nonce: self.msg[VARIANT_OFF..VARIANT_OFF + NONCE_SIZE].try_into().unwrap(),
            }
        } else {
            CommitVariant::Dh {
                hvi: self.msg[VARIANT_OFF..VARIANT_OFF + HVI_SIZE].try_into().unwrap(),
            }
        }
    }

    pub fn hvi(&self) -> Option<&'a [u8; HVI_SIZE]> {
        match self.variant() {
            CommitVariant::Dh { hvi } => Some(hvi),
            CommitVariant::MultiStream { .. } => None,
        }
    }

    pub fn maced_region(&self) -> &'a [u8] {
        &self.msg[..self.msg.len() - MAC_SIZE]
    }

    pub fn mac(&self) -> &'a [u8; MAC_SIZE] {
        self.msg[self.msg.len() - MAC_SIZE..].try_into().unwrap()
    }
}

fn build_common(
    h2: &[u8; HASH_IMAGE_SIZE],
    zid: &[u8; ZID_SIZE],
    suite: &AlgorithmSuite,
    variant: &[u8],
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::Commit);
    b.put(h2);
    b.put(zid);
    b.put(suite.hash.wire_name());
    b.put(suite.cipher.wire_name());
    b.put(suite.auth_tag.wire_name());
    b.put(suite.pub_key.wire_name());
    b.put(suite.sas.wire_name());
    b.put(variant);
    b.finish_with_mac(mac_fn)
}

/// Build a DH-mode Commit carrying the hvi.
pub(crate) fn build_dh(
    h2: &[u8; HASH_IMAGE_SIZE],
    zid: &[u8; ZID_SIZE],
    suite: &AlgorithmSuite,
    hvi: &[u8; HVI_SIZE],
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    debug_assert!(suite.pub_key != PubKeyAlgorithm::Mult);
    build_common(h2, zid, suite, hvi, mac_fn)
}

/// Build a multi-stream Commit carrying a fresh nonce; the key agreement
/// field is the `Mult` pseudo type.
pub(crate) fn build_multi_stream(
    h2: &[u8; HASH_IMAGE_SIZE],
    zid: &[u8; ZID_SIZE],
    suite: &AlgorithmSuite,
    nonce: &[u8; NONCE_SIZE],
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    debug_assert!(suite.pub_key == PubKeyAlgorithm::Mult);
    build_common(h2, zid, suite, nonce, mac_fn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_header;

    fn suite() -> AlgorithmSuite {
        AlgorithmSuite {
            hash: HashAlgorithm::Sha256,
            cipher: CipherAlgorithm::Aes128,
            auth_tag: AuthTag::HmacSha1_32,
            pub_key: PubKeyAlgorithm::Dh3k,
            sas: SasRender::Base32,
        }
    }

    #[test]
    fn dh_round_trip() {
        let msg = build_dh(&[1; 32], &[2; 12], &suite(), &[3; 32], |_| [4; 8]);
        assert_eq!(msg.len(), 29 * 4);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::Commit);
        let c = CommitView::parse(m).unwrap();
        assert!(!c.is_multi_stream());
        assert_eq!(c.h2(), &[1; 32]);
        assert_eq!(c.zid(), &[2; 12]);
        assert_eq!(c.suite(), Some(suite()));
        assert_eq!(c.hvi(), Some(&[3u8; 32]));
        assert_eq!(c.mac(), &[4; 8]);
    }

    #[test]
    fn multi_stream_round_trip() {
        let mut s = suite();
        s.pub_key = PubKeyAlgorithm::Mult;
        let msg = build_multi_stream(&[1; 32], &[2; 12], &s, &[5; 16], |_| [4; 8]);
        assert_eq!(msg.len(), 25 * 4);
        let c = CommitView::parse(&msg).unwrap();
        assert!(c.is_multi_stream());
        assert!(c.hvi().is_none());
        match c.variant() {
            CommitVariant::MultiStream { nonce } => assert_eq!(nonce, &[5u8; 16]),
            _ => panic!(),
        }
    }

    #[test]
    fn unknown_algorithm_yields_no_suite() {
        let mut msg = build_dh(&[1; 32], &[2; 12], &suite(), &[3; 32], |_| [4; 8]);
        msg[56..60].copy_from_slice(b"S999");
        let c = CommitView::parse(&msg).unwrap();
        assert!(c.suite().is_none());
    }

    #[test]
    fn wrong_length_for_variant_is_rejected() {
        let msg = build_dh(&[1; 32], &[2; 12], &suite(), &[3; 32], |_| [4; 8]);
        assert_eq!(CommitView::parse(&msg[..100]).err(), Some(ParseError::Malformed));
    }
}
