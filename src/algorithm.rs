/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */

//! The closed set of algorithms this implementation can negotiate.
//!
//! Every category is a plain enum with its RFC 6189 4-character wire name.
//! The first element returned by `all()` is the mandatory-to-implement
//! algorithm of the category and the fallback whenever negotiation finds no
//! common entry.

use crate::proto::WORD_SIZE;

/// One 4-character algorithm name as it appears on the wire.
pub type WireName = [u8; WORD_SIZE];

/// Negotiated hash algorithm (RFC 6189 section 5.1.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HashAlgorithm {
    Sha256,
    Sha384,
}

impl HashAlgorithm {
    pub const fn wire_name(self) -> &'static WireName {
        match self {
            HashAlgorithm::Sha256 => b"S256",
            HashAlgorithm::Sha384 => b"S384",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Self> {
        match name {
            b"S256" => Some(HashAlgorithm::Sha256),
            b"S384" => Some(HashAlgorithm::Sha384),
            _ => None,
        }
    }

    /// Digest length in bytes; also the length of `s0` and its relatives.
    pub const fn digest_size(self) -> usize {
        match self {
            HashAlgorithm::Sha256 => 32,
            HashAlgorithm::Sha384 => 48,
        }
    }

    pub const fn mandatory() -> Self {
        HashAlgorithm::Sha256
    }

    pub const fn all() -> &'static [Self] {
        &[HashAlgorithm::Sha256, HashAlgorithm::Sha384]
    }
}

/// Negotiated symmetric cipher for the Confirm encryption and SRTP
/// (RFC 6189 section 5.1.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherAlgorithm {
    Aes128,
    Aes256,
    Twofish128,
    Twofish256,
}

impl CipherAlgorithm {
    pub const fn wire_name(self) -> &'static WireName {
        match self {
            CipherAlgorithm::Aes128 => b"AES1",
            CipherAlgorithm::Aes256 => b"AES3",
            CipherAlgorithm::Twofish128 => b"2FS1",
            CipherAlgorithm::Twofish256 => b"2FS3",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Self> {
        match name {
            b"AES1" => Some(CipherAlgorithm::Aes128),
            b"AES3" => Some(CipherAlgorithm::Aes256),
            b"2FS1" => Some(CipherAlgorithm::Twofish128),
            b"2FS3" => Some(CipherAlgorithm::Twofish256),
            _ => None,
        }
    }

    pub const fn key_size(self) -> usize {
        match self {
            CipherAlgorithm::Aes128 | CipherAlgorithm::Twofish128 => 16,
            CipherAlgorithm::Aes256 | CipherAlgorithm::Twofish256 => 32,
        }
    }

    /// Twofish is the non-NIST choice of the category.
    pub const fn is_non_nist(self) -> bool {
        matches!(self, CipherAlgorithm::Twofish128 | CipherAlgorithm::Twofish256)
    }

    pub const fn mandatory() -> Self {
        CipherAlgorithm::Aes128
    }

    pub const fn all() -> &'static [Self] {
        &[
            CipherAlgorithm::Aes128,
            CipherAlgorithm::Aes256,
            CipherAlgorithm::Twofish128,
            CipherAlgorithm::Twofish256,
        ]
    }
}

/// Negotiated key agreement (RFC 6189 section 5.1.5). `Mult` is the pseudo
/// key type used by multi-stream Commits and never negotiated from Hello
/// preference lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubKeyAlgorithm {
    Dh2k,
    Dh3k,
    Ec25,
    Ec38,
    E255,
    Mult,
}

impl PubKeyAlgorithm {
    pub const fn wire_name(self) -> &'static WireName {
        match self {
            PubKeyAlgorithm::Dh2k => b"DH2k",
            PubKeyAlgorithm::Dh3k => b"DH3k",
            PubKeyAlgorithm::Ec25 => b"EC25",
            PubKeyAlgorithm::Ec38 => b"EC38",
            PubKeyAlgorithm::E255 => b"E255",
            PubKeyAlgorithm::Mult => b"Mult",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Self> {
        match name {
            b"DH2k" => Some(PubKeyAlgorithm::Dh2k),
            b"DH3k" => Some(PubKeyAlgorithm::Dh3k),
            b"EC25" => Some(PubKeyAlgorithm::Ec25),
            b"EC38" => Some(PubKeyAlgorithm::Ec38),
            b"E255" => Some(PubKeyAlgorithm::E255),
            b"Mult" => Some(PubKeyAlgorithm::Mult),
            _ => None,
        }
    }

    /// Length in bytes of the public value in DHPart messages.
    pub const fn public_value_size(self) -> usize {
        match self {
            PubKeyAlgorithm::Dh2k => 256,
            PubKeyAlgorithm::Dh3k => 384,
            PubKeyAlgorithm::Ec25 => 64,
            PubKeyAlgorithm::Ec38 => 96,
            PubKeyAlgorithm::E255 => 32,
            PubKeyAlgorithm::Mult => 0,
        }
    }

    /// Curves outside the NIST families trigger the non-NIST selection bias.
    pub const fn is_non_nist(self) -> bool {
        matches!(self, PubKeyAlgorithm::E255)
    }

    pub const fn mandatory() -> Self {
        PubKeyAlgorithm::Dh3k
    }

    /// Negotiable members, i.e. everything except `Mult`.
    pub const fn all() -> &'static [Self] {
        &[
            PubKeyAlgorithm::Dh3k,
            PubKeyAlgorithm::Dh2k,
            PubKeyAlgorithm::Ec25,
            PubKeyAlgorithm::Ec38,
            PubKeyAlgorithm::E255,
        ]
    }
}

/// SAS rendering scheme (RFC 6189 section 5.1.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SasRender {
    Base32,
    Base256,
    Digits10,
}

impl SasRender {
    pub const fn wire_name(self) -> &'static WireName {
        match self {
            SasRender::Base32 => b"B32 ",
            SasRender::Base256 => b"B256",
            SasRender::Digits10 => b"B10D",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Self> {
        match name {
            b"B32 " => Some(SasRender::Base32),
            b"B256" => Some(SasRender::Base256),
            b"B10D" => Some(SasRender::Digits10),
            _ => None,
        }
    }

    pub const fn mandatory() -> Self {
        SasRender::Base32
    }

    pub const fn all() -> &'static [Self] {
        &[SasRender::Base32, SasRender::Base256, SasRender::Digits10]
    }
}

/// SRTP authentication tag length (RFC 6189 section 5.1.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthTag {
    HmacSha1_32,
    HmacSha1_80,
}

impl AuthTag {
    pub const fn wire_name(self) -> &'static WireName {
        match self {
            AuthTag::HmacSha1_32 => b"HS32",
            AuthTag::HmacSha1_80 => b"HS80",
        }
    }

    pub fn from_wire_name(name: &[u8]) -> Option<Self> {
        match name {
            b"HS32" => Some(AuthTag::HmacSha1_32),
            b"HS80" => Some(AuthTag::HmacSha1_80),
            _ => None,
        }
    }

    pub const fn tag_bits(self) -> usize {
        match self {
            AuthTag::HmacSha1_32 => 32,
            AuthTag::HmacSha1_80 => 80,
        }
    }

    pub const fn mandatory() -> Self {
        AuthTag::HmacSha1_32
    }

    pub const fn all() -> &'static [Self] {
        &[AuthTag::HmacSha1_32, AuthTag::HmacSha1_80]
    }
}

/// The committed algorithm suite of one session, as carried in a Commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlgorithmSuite {
    pub hash: HashAlgorithm,
    pub cipher: CipherAlgorithm,
    pub pub_key: PubKeyAlgorithm,
    pub sas: SasRender,
    pub auth_tag: AuthTag,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_names_round_trip() {
        for h in HashAlgorithm::all() {
            assert_eq!(HashAlgorithm::from_wire_name(h.wire_name()), Some(*h));
        }
        for c in CipherAlgorithm::all() {
            assert_eq!(CipherAlgorithm::from_wire_name(c.wire_name()), Some(*c));
        }
        for p in PubKeyAlgorithm::all() {
            assert_eq!(PubKeyAlgorithm::from_wire_name(p.wire_name()), Some(*p));
        }
        for s in SasRender::all() {
            assert_eq!(SasRender::from_wire_name(s.wire_name()), Some(*s));
        }
        for a in AuthTag::all() {
            assert_eq!(AuthTag::from_wire_name(a.wire_name()), Some(*a));
        }
        assert_eq!(PubKeyAlgorithm::from_wire_name(b"Mult"), Some(PubKeyAlgorithm::Mult));
    }

    #[test]
    fn mandatory_leads_its_category() {
        assert_eq!(HashAlgorithm::all()[0], HashAlgorithm::mandatory());
        assert_eq!(CipherAlgorithm::all()[0], CipherAlgorithm::mandatory());
        assert_eq!(PubKeyAlgorithm::all()[0], PubKeyAlgorithm::mandatory());
        assert_eq!(SasRender::all()[0], SasRender::mandatory());
        assert_eq!(AuthTag::all()[0], AuthTag::mandatory());
    }
}
