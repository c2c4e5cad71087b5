/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256, Sha384};

use crate::algorithm::HashAlgorithm;
use crate::crypto::secret::SecretVec;

/// Output size of the implicit hash (SHA-256), used by the hash chain and by
/// the truncated MACs of Hello, Commit and DHPart.
pub const IMPLICIT_HASH_SIZE: usize = 32;

/// One-shot implicit hash.
pub(crate) fn sha256(parts: &[&[u8]]) -> [u8; IMPLICIT_HASH_SIZE] {
    let mut h = Sha256::new();
    for p in parts {
        h.update(p);
    }
    h.finalize().into()
}

/// One-shot implicit keyed MAC. The packet MACs truncate this to 2 words.
pub(crate) fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> [u8; IMPLICIT_HASH_SIZE] {
    let mut m = Hmac::<Sha256>::new_from_slice(key).unwrap();
    for p in parts {
        m.update(p);
    }
    m.finalize().into_bytes().into()
}

/// One-shot digest with the negotiated hash.
pub(crate) fn digest(alg: HashAlgorithm, parts: &[&[u8]]) -> Vec<u8> {
    match alg {
        HashAlgorithm::Sha256 => {
            let mut h = Sha256::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().to_vec()
        }
        HashAlgorithm::Sha384 => {
            let mut h = Sha384::new();
            for p in parts {
                h.update(p);
            }
            h.finalize().to_vec()
        }
    }
}

/// One-shot keyed MAC with the negotiated hash. The output is key material
/// as often as not, so it is returned in a zeroing container.
pub(crate) fn hmac(alg: HashAlgorithm, key: &[u8], parts: &[&[u8]]) -> SecretVec {
    match alg {
        HashAlgorithm::Sha256 => {
            let mut m = Hmac::<Sha256>::new_from_slice(key).unwrap();
            for p in parts {
                m.update(p);
            }
            SecretVec::from_vec(m.finalize().into_bytes().to_vec())
        }
        HashAlgorithm::Sha384 => {
            let mut m = Hmac::<Sha384>::new_from_slice(key).unwrap();
            for p in parts {
                m.update(p);
            }
            SecretVec::from_vec(m.finalize().into_bytes().to_vec())
        }
    }
}

/// Incremental digest context for the running transcript hash over
/// Hello(responder) || Commit || DHPart1 || DHPart2.
pub(crate) enum TranscriptHash {
    Sha256(Sha256),
    Sha384(Sha384),
}

impl TranscriptHash {
    pub fn new(alg: HashAlgorithm) -> Self {
        match alg {
            HashAlgorithm::Sha256 => TranscriptHash::Sha256(Sha256::new()),
            HashAlgorithm::Sha384 => TranscriptHash::Sha384(Sha384::new()),
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        match self {
            TranscriptHash::Sha256(h) => Digest::update(h, data),
            TranscriptHash::Sha384(h) => Digest::update(h, data),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            TranscriptHash::Sha256(h) => h.finalize().to_vec(),
            TranscriptHash::Sha384(h) => h.finalize().to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transcript_matches_one_shot() {
        for alg in [HashAlgorithm::Sha256, HashAlgorithm::Sha384] {
            let mut t = TranscriptHash::new(alg);
            t.update(b"hello");
            t.update(b"world");
            assert_eq!(t.finalize(), digest(alg, &[b"hello", b"world"]));
        }
    }

    #[test]
    fn negotiated_lengths() {
        assert_eq!(digest(HashAlgorithm::Sha256, &[b"x"]).len(), 32);
        assert_eq!(digest(HashAlgorithm::Sha384, &[b"x"]).len(), 48);
        assert_eq!(hmac(HashAlgorithm::Sha384, b"k", &[b"x"]).len(), 48);
    }

    #[test]
    fn implicit_hash_is_sha256() {
        assert_eq!(sha256(&[b"abc"]).to_vec(), digest(HashAlgorithm::Sha256, &[b"abc"]));
    }
}
