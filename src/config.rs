/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! Per-endpoint configuration: ordered algorithm preferences, policy flags
//! and timer tuning, plus the negotiation policy that turns a peer's Hello
//! offers into the committed suite.

use arrayvec::ArrayVec;

use crate::algorithm::*;
use crate::packet::hello::{HelloOffers, MAX_OFFERS};
use crate::proto::*;

/// Configuration handed to `ZrtpSession::new`. Starts out offering only the
/// mandatory algorithms; use `standard()` or the `add_*` methods to offer
/// more.
#[derive(Clone)]
pub struct ZrtpConfig {
    pub(crate) hashes: ArrayVec<HashAlgorithm, MAX_OFFERS>,
    pub(crate) ciphers: ArrayVec<CipherAlgorithm, MAX_OFFERS>,
    pub(crate) auth_tags: ArrayVec<AuthTag, MAX_OFFERS>,
    pub(crate) pub_keys: ArrayVec<PubKeyAlgorithm, MAX_OFFERS>,
    pub(crate) sas_renders: ArrayVec<SasRender, MAX_OFFERS>,

    pub(crate) trusted_mitm: bool,
    pub(crate) sas_signature: bool,
    pub(crate) paranoid: bool,
    pub(crate) disclosure: bool,

    pub(crate) t1_resend: i32,
    pub(crate) t1_resend_extend: i32,
    pub(crate) t1_cap: i32,
    pub(crate) t2_resend: i32,
    pub(crate) t2_cap: i32,

    /// TTL in seconds written into the Confirm cache expiry field and used
    /// for new retained secrets. Negative means forever.
    pub(crate) rs_ttl: i64,
}

impl ZrtpConfig {
    /// Mandatory-to-implement algorithms only.
    pub fn new() -> Self {
        let mut c = Self {
            hashes: ArrayVec::new(),
            ciphers: ArrayVec::new(),
            auth_tags: ArrayVec::new(),
            pub_keys: ArrayVec::new(),
            sas_renders: ArrayVec::new(),
            trusted_mitm: false,
            sas_signature: false,
            paranoid: false,
            disclosure: false,
            t1_resend: T1_RESEND,
            t1_resend_extend: T1_RESEND_EXTENDED,
            t1_cap: T1_CAP_MS,
            t2_resend: T2_RESEND,
            t2_cap: T2_CAP_MS,
            rs_ttl: -1,
        };
        c.hashes.push(HashAlgorithm::mandatory());
        c.ciphers.push(CipherAlgorithm::mandatory());
        c.pub_keys.push(PubKeyAlgorithm::mandatory());
        c.sas_renders.push(SasRender::mandatory());
        c.auth_tags.push(AuthTag::HmacSha1_32);
        c.auth_tags.push(AuthTag::HmacSha1_80);
        c
    }

    /// The full algorithm set in default preference order.
    pub fn standard() -> Self {
        let mut c = Self::new();
        c.hashes.clear();
        c.ciphers.clear();
        c.pub_keys.clear();
        let _ = c.add_hash(HashAlgorithm::Sha384);
        let _ = c.add_hash(HashAlgorithm::Sha256);
        let _ = c.add_cipher(CipherAlgorithm::Twofish256);
        let _ = c.add_cipher(CipherAlgorithm::Aes256);
        let _ = c.add_cipher(CipherAlgorithm::Twofish128);
        let _ = c.add_cipher(CipherAlgorithm::Aes128);
        let _ = c.add_pub_key(PubKeyAlgorithm::Ec25);
        let _ = c.add_pub_key(PubKeyAlgorithm::Dh3k);
        let _ = c.add_pub_key(PubKeyAlgorithm::Ec38);
        let _ = c.add_pub_key(PubKeyAlgorithm::E255);
        let _ = c.add_pub_key(PubKeyAlgorithm::Dh2k);
        c
    }

    fn add<T: PartialEq + Copy>(list: &mut ArrayVec<T, MAX_OFFERS>, algo: T) -> bool {
        if list.contains(&algo) || list.is_full() {
            return false;
        }
        list.push(algo);
        true
    }

    pub fn add_hash(&mut self, algo: HashAlgorithm) -> bool {
        Self::add(&mut self.hashes, algo)
    }

    pub fn add_cipher(&mut self, algo: CipherAlgorithm) -> bool {
        Self::add(&mut self.ciphers, algo)
    }

    pub fn add_auth_tag(&mut self, algo: AuthTag) -> bool {
        Self::add(&mut self.auth_tags, algo)
    }

    pub fn add_pub_key(&mut self, algo: PubKeyAlgorithm) -> bool {
        if algo == PubKeyAlgorithm::Mult {
            return false;
        }
        Self::add(&mut self.pub_keys, algo)
    }

    pub fn add_sas_render(&mut self, algo: SasRender) -> bool {
        Self::add(&mut self.sas_renders, algo)
    }

    pub fn clear_hashes(&mut self) {
        self.hashes.clear();
    }

    pub fn clear_ciphers(&mut self) {
        self.ciphers.clear();
    }

    pub fn clear_pub_keys(&mut self) {
        self.pub_keys.clear();
    }

    pub fn set_trusted_mitm(&mut self, yes: bool) {
        self.trusted_mitm = yes;
    }

    pub fn is_trusted_mitm(&self) -> bool {
        self.trusted_mitm
    }

    pub fn set_sas_signature(&mut self, yes: bool) {
        self.sas_signature = yes;
    }

    pub fn is_sas_signature(&self) -> bool {
        self.sas_signature
    }

    /// Paranoid mode: the SAS is always reported unverified, the verify API
    /// is a no-op and relayed SAS payloads are ignored, while retained
    /// secrets keep evolving normally.
    pub fn set_paranoid_mode(&mut self, yes: bool) {
        self.paranoid = yes;
    }

    pub fn is_paranoid_mode(&self) -> bool {
        self.paranoid
    }

    pub fn set_disclosure_flag(&mut self, yes: bool) {
        self.disclosure = yes;
    }

    pub fn is_disclosure_flag(&self) -> bool {
        self.disclosure
    }

    /* Timer tuning. Out-of-bounds values are ignored, matching the
     * documented lower bounds: counters below 10 (negative = infinite),
     * T1 cap below 50 ms, T2 cap below 150 ms. */

    pub fn set_t1_resend(&mut self, counter: i32) {
        if counter < 0 || counter >= RESEND_MIN {
            self.t1_resend = counter;
        }
    }

    pub fn set_t1_resend_extend(&mut self, counter: i32) {
        if counter < 0 || counter >= RESEND_MIN {
            self.t1_resend_extend = counter;
        }
    }

    pub fn set_t1_capping(&mut self, ms: i32) {
        if ms >= T1_CAP_MIN_MS {
            self.t1_cap = ms;
        }
    }

    pub fn set_t2_resend(&mut self, counter: i32) {
        if counter < 0 || counter >= RESEND_MIN {
            self.t2_resend = counter;
        }
    }

    pub fn set_t2_capping(&mut self, ms: i32) {
        if ms >= T2_CAP_MIN_MS {
            self.t2_cap = ms;
        }
    }

    pub fn set_retained_secret_ttl(&mut self, seconds: i64) {
        self.rs_ttl = seconds;
    }

    /* Negotiation policy, RFC 6189 section 4.1.2.
     *
     * Selection walks our preference list and takes the first entry the
     * peer offered too, falling back to the category's mandatory element.
     * Two peers with identical offer sets therefore commit to the same
     * suite no matter who ends up Initiator. */

    fn first_common<T: PartialEq + Copy>(prefs: &[T], offered: &[T]) -> Option<T> {
        prefs.iter().copied().find(|p| offered.contains(p))
    }

    /// Select the committed suite from a peer's Hello offers.
    pub(crate) fn select_suite(&self, offers: &HelloOffers) -> AlgorithmSuite {
        let pub_key =
            Self::first_common(&self.pub_keys, &offers.pub_keys).unwrap_or_else(PubKeyAlgorithm::mandatory);

        let hash = Self::first_common(&self.hashes, &offers.hashes).unwrap_or_else(HashAlgorithm::mandatory);

        // Non-NIST bias: a non-NIST curve pulls in non-NIST companions
        // where both sides offer them.
        //
        // RFC 6189 also couples cipher strength to the key agreement: a
        // DH-4096 class key agreement mandates a 256 bit cipher. Every key
        // agreement in the registry is of DH-3072 strength or below, so no
        // upgrade rule is needed; adding such a key type means adding its
        // coupling here.
        let cipher = if pub_key.is_non_nist() {
            let non_nist: ArrayVec<CipherAlgorithm, MAX_OFFERS> =
                self.ciphers.iter().copied().filter(|c| c.is_non_nist()).collect();
            Self::first_common(&non_nist, &offers.ciphers)
                .or_else(|| Self::first_common(&self.ciphers, &offers.ciphers))
                .unwrap_or_else(CipherAlgorithm::mandatory)
        } else {
            Self::first_common(&self.ciphers, &offers.ciphers).unwrap_or_else(CipherAlgorithm::mandatory)
        };

        let sas = Self::first_common(&self.sas_renders, &offers.sas_renders).unwrap_or_else(SasRender::mandatory);
        let auth_tag = Self::first_common(&self.auth_tags, &offers.auth_tags).unwrap_or_else(AuthTag::mandatory);

        AlgorithmSuite { hash, cipher, pub_key, sas, auth_tag }
    }

    /// Cross-check a Commit's suite against what we offered in our Hello.
    /// A peer may only commit to algorithms we offered (or the mandatory
    /// fallbacks).
    pub(crate) fn accepts_suite(&self, suite: &AlgorithmSuite) -> bool {
        (self.hashes.contains(&suite.hash) || suite.hash == HashAlgorithm::mandatory())
            && (self.ciphers.contains(&suite.cipher) || suite.cipher == CipherAlgorithm::mandatory())
            && (suite.pub_key == PubKeyAlgorithm::Mult
                || self.pub_keys.contains(&suite.pub_key)
                || suite.pub_key == PubKeyAlgorithm::mandatory())
            && (self.sas_renders.contains(&suite.sas) || suite.sas == SasRender::mandatory())
            && (self.auth_tags.contains(&suite.auth_tag) || suite.auth_tag == AuthTag::mandatory())
    }
}

impl Default for ZrtpConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offers_from(config: &ZrtpConfig) -> HelloOffers {
        let mut o = HelloOffers::default();
        o.hashes.extend(config.hashes.iter().copied());
        o.ciphers.extend(config.ciphers.iter().copied());
        o.auth_tags.extend(config.auth_tags.iter().copied());
        o.pub_keys.extend(config.pub_keys.iter().copied());
        o.sas_renders.extend(config.sas_renders.iter().copied());
        o
    }

    #[test]
    fn identical_offers_select_identically() {
        let a = ZrtpConfig::standard();
        let b = ZrtpConfig::standard();
        let s1 = a.select_suite(&offers_from(&b));
        let s2 = b.select_suite(&offers_from(&a));
        assert_eq!(s1, s2);
    }

    #[test]
    fn empty_offers_fall_back_to_mandatory() {
        let c = ZrtpConfig::standard();
        let suite = c.select_suite(&HelloOffers::default());
        assert_eq!(suite.hash, HashAlgorithm::mandatory());
        assert_eq!(suite.cipher, CipherAlgorithm::mandatory());
        assert_eq!(suite.pub_key, PubKeyAlgorithm::mandatory());
        assert_eq!(suite.sas, SasRender::mandatory());
    }

    #[test]
    fn preference_order_decides() {
        let mut c = ZrtpConfig::new();
        c.clear_hashes();
        c.add_hash(HashAlgorithm::Sha384);
        c.add_hash(HashAlgorithm::Sha256);
        let mut o = HelloOffers::default();
        o.hashes.push(HashAlgorithm::Sha256);
        o.hashes.push(HashAlgorithm::Sha384);
        // Our list is scanned in order, so Sha384 wins even though the peer
        // listed Sha256 first.
        assert_eq!(c.select_suite(&o).hash, HashAlgorithm::Sha384);
    }

    #[test]
    fn non_nist_curve_prefers_twofish() {
        let mut c = ZrtpConfig::new();
        c.clear_pub_keys();
        c.add_pub_key(PubKeyAlgorithm::E255);
        c.clear_ciphers();
        c.add_cipher(CipherAlgorithm::Aes128);
        c.add_cipher(CipherAlgorithm::Twofish128);

        let mut o = HelloOffers::default();
        o.pub_keys.push(PubKeyAlgorithm::E255);
        o.ciphers.push(CipherAlgorithm::Aes128);
        o.ciphers.push(CipherAlgorithm::Twofish128);

        // AES leads our preference list but the non-NIST bias kicks in.
        assert_eq!(c.select_suite(&o).cipher, CipherAlgorithm::Twofish128);

        // Without a Twofish offer the bias falls back to the normal rule.
        let mut o2 = HelloOffers::default();
        o2.pub_keys.push(PubKeyAlgorithm::E255);
        o2.ciphers.push(CipherAlgorithm::Aes128);
        assert_eq!(c.select_suite(&o2).cipher, CipherAlgorithm::Aes128);
    }

    #[test]
    fn timer_tuning_enforces_bounds() {
        let mut c = ZrtpConfig::new();
        c.set_t1_capping(10);
        assert_eq!(c.t1_cap, T1_CAP_MS);
        c.set_t1_capping(500);
        assert_eq!(c.t1_cap, 500);
        c.set_t2_resend(3);
        assert_eq!(c.t2_resend, T2_RESEND);
        c.set_t2_resend(-1);
        assert_eq!(c.t2_resend, -1);
        c.set_t2_resend(15);
        assert_eq!(c.t2_resend, 15);
    }
}
