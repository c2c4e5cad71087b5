/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use num_bigint::BigUint;
use num_traits::One;
use p256::elliptic_curve::sec1::ToEncodedPoint;
use rand_core::{CryptoRng, RngCore};

use crate::algorithm::PubKeyAlgorithm;
use crate::crypto::secret::{Secret, SecretVec};

/// RFC 3526 group 14, 2048 bit MODP prime, generator 2.
const MODP_2048_PRIME_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AACAA68FFFFFFFFFFFFFFFF";

/// RFC 3526 group 15, 3072 bit MODP prime, generator 2.
const MODP_3072_PRIME_HEX: &[u8] = b"\
FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE45B3DC2007CB8A163BF05\
98DA48361C55D39A69163FA8FD24CF5F83655D23DCA3AD961C62F356208552BB\
9ED529077096966D670C354E4ABC9804F1746C08CA18217C32905E462E36CE3B\
E39E772C180E86039B2783A2EC07A28FB5C55DF06F4C52C9DE2BCBF695581718\
3995497CEA956AE515D2261898FA051015728E5A8AAAC42DAD33170D04507A33\
A85521ABDF1CBA64ECFB850458DBEF0A8AEA71575D060C7DB3970F85A6E1E4C7\
ABF5AE8CDB0933D71E8C94E04A25619DCEE3D2261AD2EE6BF12FFA06D98A0864\
D87602733EC86A64521F2B18177B200CBBE117577A615D6C770988C0BAD946E2\
08E24FA074E5AB3143DB5BFCE0FD108E4B82D120A93AD2CAFFFFFFFFFFFFFFFF";

/// Private exponent width for the MODP groups.
const MODP_EXPONENT_SIZE: usize = 64;

/// Returned when a peer public value fails validation: zero, one, p-1, out
/// of range, off curve or non-contributory.
#[derive(Debug, PartialEq, Eq)]
pub struct BadPublicValue;

pub(crate) enum ModpGroup {
    Dh2k,
    Dh3k,
}

impl ModpGroup {
    fn prime(&self) -> BigUint {
        let hex = match self {
            ModpGroup::Dh2k => MODP_2048_PRIME_HEX,
            ModpGroup::Dh3k => MODP_3072_PRIME_HEX,
        };
        BigUint::parse_bytes(hex, 16).unwrap()
    }

    fn size(&self) -> usize {
        match self {
            ModpGroup::Dh2k => 256,
            ModpGroup::Dh3k => 384,
        }
    }
}

/// Per-session Diffie-Hellman context bound to the committed key agreement.
///
/// Holds the ephemeral private key, exposes the public value in the fixed
/// big-endian wire encoding of DHPart messages and computes the shared
/// secret after validating the peer's public value.
pub(crate) enum DhContext {
    Modp {
        group: ModpGroup,
        exponent: Secret<MODP_EXPONENT_SIZE>,
        public: Vec<u8>,
    },
    Ec25(p256::ecdh::EphemeralSecret),
    Ec38(p384::ecdh::EphemeralSecret),
    E255(x25519_dalek::StaticSecret),
}

impl DhContext {
    pub fn generate<R: RngCore + CryptoRng>(alg: PubKeyAlgorithm, rng: &mut R) -> Self {
        match alg {
            PubKeyAlgorithm::Dh2k | PubKeyAlgorithm::Dh3k => {
                let group = if alg == PubKeyAlgorithm::Dh2k { ModpGroup::Dh2k } else { ModpGroup::Dh3k };
                let mut exponent = Secret::<MODP_EXPONENT_SIZE>::new();
                rng.fill_bytes(exponent.as_mut());
                let p = group.prime();
                let x = BigUint::from_bytes_be(exponent.as_bytes());
                let public = to_fixed_width(&BigUint::from(2u32).modpow(&x, &p), group.size());
                DhContext::Modp { group, exponent, public }
            }
            PubKeyAlgorithm::Ec25 => DhContext::Ec25(p256::ecdh::EphemeralSecret::random(rng)),
            PubKeyAlgorithm::Ec38 => DhContext::Ec38(p384::ecdh::EphemeralSecret::random(rng)),
            PubKeyAlgorithm::E255 => DhContext::E255(x25519_dalek::StaticSecret::random_from_rng(rng)),
            PubKeyAlgorithm::Mult => unreachable!("multi-stream mode performs no key agreement"),
        }
    }

    pub fn algorithm(&self) -> PubKeyAlgorithm {
        match self {
            DhContext::Modp { group: ModpGroup::Dh2k, .. } => PubKeyAlgorithm::Dh2k,
            DhContext::Modp { group: ModpGroup::Dh3k, .. } => PubKeyAlgorithm::Dh3k,
            DhContext::Ec25(_) => PubKeyAlgorithm::Ec25,
            DhContext::Ec38(_) => PubKeyAlgorithm::Ec38,
            DhContext::E255(_) => PubKeyAlgorithm::E255,
        }
    }

    /// The public value as sent in a DHPart message: fixed-width big-endian
    /// for the MODP groups, X||Y affine coordinates for the NIST curves, the
    /// raw u-coordinate for X25519.
    pub fn public_value(&self) -> Vec<u8> {
        match self {
            DhContext::Modp { public, .. } => public.clone(),
            DhContext::Ec25(secret) => {
                let ep = p256::PublicKey::from(secret).to_encoded_point(false);
                ep.as_bytes()[1..].to_vec()
            }
            DhContext::Ec38(secret) => {
                let ep = p384::PublicKey::from(secret).to_encoded_point(false);
                ep.as_bytes()[1..].to_vec()
            }
            DhContext::E255(secret) => x25519_dalek::PublicKey::from(secret).as_bytes().to_vec(),
        }
    }

    /// Validate the peer's public value and compute the shared secret.
    ///
    /// The MODP result keeps leading zeros, i.e. DHss always has the full
    /// width of the prime as required for the s0 computation.
    pub fn agree(&self, peer_pv: &[u8]) -> Result<SecretVec, BadPublicValue> {
        if peer_pv.len() != self.algorithm().public_value_size() {
            return Err(BadPublicValue);
        }
        match self {
            DhContext::Modp { group, exponent, .. } => {
                let p = group.prime();
                let pv = BigUint::from_bytes_be(peer_pv);
                let p_minus_1 = &p - BigUint::one();
                if pv <= BigUint::one() || pv >= p_minus_1 {
                    return Err(BadPublicValue);
                }
                let x = BigUint::from_bytes_be(exponent.as_bytes());
                let mut ss = to_fixed_width(&pv.modpow(&x, &p), group.size());
                Ok(SecretVec::from_bytes_then_delete(&mut ss))
            }
            DhContext::Ec25(secret) => {
                let peer = p256::PublicKey::from_sec1_bytes(&sec1_uncompressed(peer_pv)).map_err(|_| BadPublicValue)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SecretVec::from_slice(shared.raw_secret_bytes().as_slice()))
            }
            DhContext::Ec38(secret) => {
                let peer = p384::PublicKey::from_sec1_bytes(&sec1_uncompressed(peer_pv)).map_err(|_| BadPublicValue)?;
                let shared = secret.diffie_hellman(&peer);
                Ok(SecretVec::from_slice(shared.raw_secret_bytes().as_slice()))
            }
            DhContext::E255(secret) => {
                let peer_bytes: [u8; 32] = peer_pv.try_into().map_err(|_| BadPublicValue)?;
                let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(peer_bytes));
                if !shared.was_contributory() {
                    return Err(BadPublicValue);
                }
                Ok(SecretVec::from_slice(shared.as_bytes()))
            }
        }
    }
}

fn to_fixed_width(n: &BigUint, width: usize) -> Vec<u8> {
    let raw = n.to_bytes_be();
    debug_assert!(raw.len() <= width);
    let mut out = vec![0u8; width];
    out[width - raw.len()..].copy_from_slice(&raw);
    out
}

fn sec1_uncompressed(pv: &[u8]) -> Vec<u8> {
    let mut sec1 = Vec::with_capacity(1 + pv.len());
    sec1.push(0x04);
    sec1.extend_from_slice(pv);
    sec1
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand_core::OsRng;

    fn agree_both_ways(alg: PubKeyAlgorithm) {
        let a = DhContext::generate(alg, &mut OsRng);
        let b = DhContext::generate(alg, &mut OsRng);
        assert_eq!(a.public_value().len(), alg.public_value_size());
        let ss_a = a.agree(&b.public_value()).unwrap();
        let ss_b = b.agree(&a.public_value()).unwrap();
        assert_eq!(ss_a, ss_b);
        assert!(!ss_a.is_empty());
    }

    #[test]
    fn shared_secret_agreement_dh2k() {
        agree_both_ways(PubKeyAlgorithm::Dh2k);
    }

    #[test]
    fn shared_secret_agreement_dh3k() {
        agree_both_ways(PubKeyAlgorithm::Dh3k);
    }

    #[test]
    fn shared_secret_agreement_ec25() {
        agree_both_ways(PubKeyAlgorithm::Ec25);
    }

    #[test]
    fn shared_secret_agreement_ec38() {
        agree_both_ways(PubKeyAlgorithm::Ec38);
    }

    #[test]
    fn shared_secret_agreement_e255() {
        agree_both_ways(PubKeyAlgorithm::E255);
    }

    #[test]
    fn modp_rejects_degenerate_public_values() {
        let ctx = DhContext::generate(PubKeyAlgorithm::Dh3k, &mut OsRng);
        let size = PubKeyAlgorithm::Dh3k.public_value_size();

        let zero = vec![0u8; size];
        assert_eq!(ctx.agree(&zero), Err(BadPublicValue));

        let mut one = vec![0u8; size];
        one[size - 1] = 1;
        assert_eq!(ctx.agree(&one), Err(BadPublicValue));

        let p = BigUint::parse_bytes(MODP_3072_PRIME_HEX, 16).unwrap();
        let p_minus_1 = to_fixed_width(&(&p - BigUint::one()), size);
        assert_eq!(ctx.agree(&p_minus_1), Err(BadPublicValue));

        assert_eq!(ctx.agree(&zero[..size - 1]), Err(BadPublicValue));
    }

    #[test]
    fn ec_rejects_off_curve_point() {
        let ctx = DhContext::generate(PubKeyAlgorithm::Ec25, &mut OsRng);
        let garbage = vec![0x42u8; PubKeyAlgorithm::Ec25.public_value_size()];
        assert_eq!(ctx.agree(&garbage), Err(BadPublicValue));
    }

    #[test]
    fn x25519_rejects_zero_point() {
        let ctx = DhContext::generate(PubKeyAlgorithm::E255, &mut OsRng);
        assert_eq!(ctx.agree(&[0u8; 32]), Err(BadPublicValue));
    }
}
