/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use aes::{Aes128, Aes256};
use cfb_mode::cipher::{AsyncStreamCipher, KeyIvInit};
use cfb_mode::{Decryptor, Encryptor};
use twofish::Twofish;

use crate::algorithm::CipherAlgorithm;
use crate::crypto::secret::Secret;
use crate::proto::IV_SIZE;

/// Encrypt the Confirm/SASRelay body in place with the negotiated cipher in
/// CFB-128 mode, RFC 6189 section 5.7.
pub(crate) fn encrypt(alg: CipherAlgorithm, key: &[u8], iv: &[u8; IV_SIZE], data: &mut [u8]) {
    debug_assert_eq!(key.len(), alg.key_size());
    match alg {
        CipherAlgorithm::Aes128 => Encryptor::<Aes128>::new_from_slices(key, iv).unwrap().encrypt(data),
        CipherAlgorithm::Aes256 => Encryptor::<Aes256>::new_from_slices(key, iv).unwrap().encrypt(data),
        CipherAlgorithm::Twofish128 | CipherAlgorithm::Twofish256 => {
            let key = twofish_key(alg, key);
            Encryptor::<Twofish>::new_from_slices(key.as_bytes(), iv).unwrap().encrypt(data)
        }
    }
}

/// Decrypt the Confirm/SASRelay body in place.
pub(crate) fn decrypt(alg: CipherAlgorithm, key: &[u8], iv: &[u8; IV_SIZE], data: &mut [u8]) {
    debug_assert_eq!(key.len(), alg.key_size());
    match alg {
        CipherAlgorithm::Aes128 => Decryptor::<Aes128>::new_from_slices(key, iv).unwrap().decrypt(data),
        CipherAlgorithm::Aes256 => Decryptor::<Aes256>::new_from_slices(key, iv).unwrap().decrypt(data),
        CipherAlgorithm::Twofish128 | CipherAlgorithm::Twofish256 => {
            let key = twofish_key(alg, key);
            Decryptor::<Twofish>::new_from_slices(key.as_bytes(), iv).unwrap().decrypt(data)
        }
    }
}

/// The Twofish key schedule defines short keys as zero-padded 256 bit keys,
/// which is also what the `twofish` crate expects to be handed.
fn twofish_key(alg: CipherAlgorithm, key: &[u8]) -> Secret<32> {
    let mut padded = Secret::<32>::new();
    padded.as_mut()[..alg.key_size()].copy_from_slice(key);
    padded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_all_ciphers() {
        let iv = [0x5au8; IV_SIZE];
        let plain = b"0123456789abcdef0123456789abcdefXYZ";
        for alg in CipherAlgorithm::all() {
            let key = vec![0x42u8; alg.key_size()];
            let mut buf = plain.to_vec();
            encrypt(*alg, &key, &iv, &mut buf);
            assert_ne!(&buf[..], &plain[..]);
            decrypt(*alg, &key, &iv, &mut buf);
            assert_eq!(&buf[..], &plain[..]);
        }
    }

    #[test]
    fn distinct_ivs_give_distinct_streams() {
        let key = [1u8; 16];
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        encrypt(CipherAlgorithm::Aes128, &key, &[0u8; IV_SIZE], &mut a);
        encrypt(CipherAlgorithm::Aes128, &key, &[1u8; IV_SIZE], &mut b);
        assert_ne!(a, b);
    }
}
