/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Key derivation, RFC 6189 sections 4.4 and 4.5.
//!
//! Everything downstream of the DH secret flows through here: `s0`, the
//! SRTP master keys and salts, the Confirm encryption and MAC keys, the
//! session/export keys, the SAS hash and the next retained secret.

use crate::algorithm::{CipherAlgorithm, HashAlgorithm};
use crate::crypto::hash;
use crate::crypto::secret::{Secret, SecretVec};
use crate::proto::*;

/// KDF context per RFC 6189 section 4.5.1: ZIDi || ZIDr || total_hash.
pub(crate) struct KdfContext {
    bytes: Vec<u8>,
}

impl KdfContext {
    pub fn new(zid_i: &[u8; ZID_SIZE], zid_r: &[u8; ZID_SIZE], total_hash: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(2 * ZID_SIZE + total_hash.len());
        bytes.extend_from_slice(zid_i);
        bytes.extend_from_slice(zid_r);
        bytes.extend_from_slice(total_hash);
        Self { bytes }
    }
}

/// The ZRTP KDF: HMAC(KI, counter || label || 0x00 || context || L) with the
/// 32 bit counter starting at 1 and L the output length in bits, iterated
/// and truncated to yield exactly `out_len` bytes.
pub(crate) fn kdf(alg: HashAlgorithm, key: &[u8], label: &[u8], context: &KdfContext, out_len: usize) -> SecretVec {
    let l_bits = ((out_len * 8) as u32).to_be_bytes();
    let mut out = Vec::with_capacity(out_len);
    let mut counter = 1u32;
    while out.len() < out_len {
        let block = hash::hmac(
            alg,
            key,
            &[&counter.to_be_bytes(), label, &[0u8], &context.bytes, &l_bits],
        );
        let take = (out_len - out.len()).min(block.len());
        out.extend_from_slice(&block.as_bytes()[..take]);
        counter += 1;
    }
    SecretVec::from_vec(out)
}

/// Compute s0 for a DH exchange, RFC 6189 section 4.4.1.4.
///
/// `s1..s3` are the matched retained, pbx and aux secrets in that strict
/// order; a slot that did not match is absent and contributes only a zero
/// length field.
pub(crate) fn derive_s0(
    alg: HashAlgorithm,
    dh_result: &SecretVec,
    zid_i: &[u8; ZID_SIZE],
    zid_r: &[u8; ZID_SIZE],
    total_hash: &[u8],
    s1: Option<&[u8]>,
    s2: Option<&[u8]>,
    s3: Option<&[u8]>,
) -> SecretVec {
    let counter = 1u32.to_be_bytes();
    let mut parts: Vec<&[u8]> = vec![&counter, dh_result.as_bytes(), LABEL_KDF, zid_i, zid_r, total_hash];
    let lens: Vec<[u8; 4]> = [s1, s2, s3]
        .iter()
        .map(|s| (s.map_or(0, |b| b.len()) as u32).to_be_bytes())
        .collect();
    for (len, s) in lens.iter().zip([s1, s2, s3]) {
        parts.push(len);
        if let Some(s) = s {
            parts.push(s);
        }
    }
    SecretVec::from_vec(hash::digest(alg, &parts))
}

/// Compute s0 for a dependent stream in multi-stream mode,
/// RFC 6189 section 4.4.3.2.
pub(crate) fn derive_s0_multi_stream(alg: HashAlgorithm, zrtp_session: &SecretVec, context: &KdfContext) -> SecretVec {
    kdf(alg, zrtp_session.as_bytes(), LABEL_MSK, context, alg.digest_size())
}

/// Retained-secret ID as carried in DHPart messages: leftmost 64 bits of
/// HMAC(secret, role label), RFC 6189 section 4.3.
pub(crate) fn secret_id(alg: HashAlgorithm, secret: &[u8], label: &[u8]) -> [u8; SECRET_ID_SIZE] {
    let mac = hash::hmac(alg, secret, &[label]);
    mac.as_bytes()[..SECRET_ID_SIZE].try_into().unwrap()
}

/// Everything derived from s0 for one stream.
pub(crate) struct SessionKeys {
    pub srtp_key_i: SecretVec,
    pub srtp_salt_i: SecretVec,
    pub srtp_key_r: SecretVec,
    pub srtp_salt_r: SecretVec,
    /// Keys for the MAC over the encrypted Confirm body.
    pub hmac_key_i: SecretVec,
    pub hmac_key_r: SecretVec,
    /// Keys encrypting the Confirm body.
    pub zrtp_key_i: SecretVec,
    pub zrtp_key_r: SecretVec,
    /// Master key for dependent multi-stream sessions.
    pub zrtp_session: SecretVec,
    /// Application exported key, RFC 6189 section 4.5.2.
    pub zrtp_export: SecretVec,
    /// Full SAS hash; the rendered SAS uses its leftmost 32 bits.
    pub sas_hash: [u8; 32],
    /// Next rs1, persisted to the cache after a successful handshake.
    pub new_rs1: Secret<RS_SIZE>,
}

/// Derive the complete key block from s0, RFC 6189 section 4.5.3.
pub(crate) fn derive_session_keys(
    alg: HashAlgorithm,
    s0: &SecretVec,
    cipher: CipherAlgorithm,
    context: &KdfContext,
) -> SessionKeys {
    let s0 = s0.as_bytes();
    let hash_len = alg.digest_size();
    let key_len = cipher.key_size();
    let sas = kdf(alg, s0, LABEL_SAS, context, 32);
    let rs = kdf(alg, s0, LABEL_RETAINED_SECRET, context, RS_SIZE);
    SessionKeys {
        srtp_key_i: kdf(alg, s0, LABEL_INI_SRTP_KEY, context, key_len),
        srtp_salt_i: kdf(alg, s0, LABEL_INI_SRTP_SALT, context, SRTP_SALT_SIZE),
        srtp_key_r: kdf(alg, s0, LABEL_RESP_SRTP_KEY, context, key_len),
        srtp_salt_r: kdf(alg, s0, LABEL_RESP_SRTP_SALT, context, SRTP_SALT_SIZE),
        hmac_key_i: kdf(alg, s0, LABEL_INI_HMAC_KEY, context, hash_len),
        hmac_key_r: kdf(alg, s0, LABEL_RESP_HMAC_KEY, context, hash_len),
        zrtp_key_i: kdf(alg, s0, LABEL_INI_ZRTP_KEY, context, key_len),
        zrtp_key_r: kdf(alg, s0, LABEL_RESP_ZRTP_KEY, context, key_len),
        zrtp_session: kdf(alg, s0, LABEL_SESSION_KEY, context, hash_len),
        zrtp_export: kdf(alg, s0, LABEL_EXPORTED_KEY, context, hash_len),
        sas_hash: sas.as_bytes().try_into().unwrap(),
        new_rs1: Secret::from_bytes(rs.as_bytes()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> KdfContext {
        KdfContext::new(&[0x11; ZID_SIZE], &[0x22; ZID_SIZE], &[0x33; 32])
    }

    #[test]
    fn kdf_yields_requested_length() {
        let c = ctx();
        for len in [8usize, 14, 16, 32, 48, 100] {
            assert_eq!(kdf(HashAlgorithm::Sha256, b"key", b"label", &c, len).len(), len);
        }
    }

    #[test]
    fn kdf_distinct_labels_distinct_output() {
        let c = ctx();
        let a = kdf(HashAlgorithm::Sha256, b"key", LABEL_INI_SRTP_KEY, &c, 16);
        let b = kdf(HashAlgorithm::Sha256, b"key", LABEL_RESP_SRTP_KEY, &c, 16);
        assert_ne!(a, b);
    }

    #[test]
    fn kdf_long_output_extends_first_block() {
        let c = ctx();
        let short = kdf(HashAlgorithm::Sha256, b"key", b"label", &c, 32);
        let long = kdf(HashAlgorithm::Sha256, b"key", b"label", &c, 64);
        assert_eq!(&long.as_bytes()[..32], short.as_bytes());
        assert_ne!(&long.as_bytes()[32..], short.as_bytes());
    }

    #[test]
    fn s0_depends_on_matched_secrets() {
        let dhss = SecretVec::from_slice(&[0xaa; 384]);
        let th = [0x33u8; 32];
        let none = derive_s0(HashAlgorithm::Sha256, &dhss, &[0x11; 12], &[0x22; 12], &th, None, None, None);
        let rs = [0x44u8; 32];
        let with_rs1 = derive_s0(HashAlgorithm::Sha256, &dhss, &[0x11; 12], &[0x22; 12], &th, Some(&rs), None, None);
        assert_eq!(none.len(), 32);
        assert_ne!(none, with_rs1);
    }

    #[test]
    fn s0_slot_position_matters() {
        let dhss = SecretVec::from_slice(&[0xaa; 32]);
        let th = [0x33u8; 32];
        let rs = [0x44u8; 32];
        let in_s1 = derive_s0(HashAlgorithm::Sha256, &dhss, &[0x11; 12], &[0x22; 12], &th, Some(&rs), None, None);
        let in_s3 = derive_s0(HashAlgorithm::Sha256, &dhss, &[0x11; 12], &[0x22; 12], &th, None, None, Some(&rs));
        assert_ne!(in_s1, in_s3);
    }

    #[test]
    fn derived_key_lengths_follow_negotiation() {
        let c = ctx();
        let s0 = SecretVec::from_slice(&[9u8; 48]);
        let keys = derive_session_keys(HashAlgorithm::Sha384, &s0, CipherAlgorithm::Aes256, &c);
        assert_eq!(keys.srtp_key_i.len(), 32);
        assert_eq!(keys.srtp_salt_i.len(), SRTP_SALT_SIZE);
        assert_eq!(keys.hmac_key_r.len(), 48);
        assert_eq!(keys.zrtp_session.len(), 48);
        assert_ne!(keys.srtp_key_i, keys.srtp_key_r);
        assert_ne!(keys.zrtp_key_i, keys.zrtp_key_r);
    }

    #[test]
    fn secret_id_role_separation() {
        let a = secret_id(HashAlgorithm::Sha256, &[1u8; 32], LABEL_INITIATOR);
        let b = secret_id(HashAlgorithm::Sha256, &[1u8; 32], LABEL_RESPONDER);
        assert_ne!(a, b);
    }
}
