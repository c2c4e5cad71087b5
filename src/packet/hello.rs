/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crate::algorithm::*;
use crate::packet::{MessageBuilder, MessageType, ParseError};
use crate::proto::*;

/* Hello layout, RFC 6189 section 5.2. Offsets within the message:
     12  version (1 word)
     16  client id (4 words)
     32  H3 (8 words)
     64  ZID (3 words)
     76  flags byte, then algorithm counts packed in nibbles
     80  algorithm name lists: hash, cipher, auth tag, key agreement, SAS
      -  MAC (2 words, keyed with H2)
*/
const VERSION_OFF: usize = 12;
const CLIENT_ID_OFF: usize = 16;
const H3_OFF: usize = 32;
const ZID_OFF: usize = 64;
const FLAGS_OFF: usize = 76;
const LISTS_OFF: usize = 80;

// Bit 0x10 is the passive flag; this implementation neither sets nor
// honors it.
const FLAG_SAS_SIGN: u8 = 0x40;
const FLAG_MITM: u8 = 0x20;

/// Most algorithms one category may offer; counts are 4 bit nibbles but the
/// registry never exceeds this.
pub(crate) const MAX_OFFERS: usize = 7;

/// The algorithm lists a peer offered in its Hello, decoded into registry
/// members. Unknown names are skipped: we can only commit to what we know.
#[derive(Default)]
pub(crate) struct HelloOffers {
    pub hashes: arrayvec::ArrayVec<HashAlgorithm, MAX_OFFERS>,
    pub ciphers: arrayvec::ArrayVec<CipherAlgorithm, MAX_OFFERS>,
    pub auth_tags: arrayvec::ArrayVec<AuthTag, MAX_OFFERS>,
    pub pub_keys: arrayvec::ArrayVec<PubKeyAlgorithm, MAX_OFFERS>,
    pub sas_renders: arrayvec::ArrayVec<SasRender, MAX_OFFERS>,
    pub multi_stream: bool,
}

/// Borrowed view over a received Hello.
pub(crate) struct HelloView<'a> {
    msg: &'a [u8],
    counts: [usize; 5],
}

impl<'a> HelloView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() < LISTS_OFF + MAC_SIZE {
            return Err(ParseError::TooShort);
        }
        let counts = [
            (msg[FLAGS_OFF + 1] & 0x0f) as usize,
            (msg[FLAGS_OFF + 2] >> 4) as usize,
            (msg[FLAGS_OFF + 2] & 0x0f) as usize,
            (msg[FLAGS_OFF + 3] >> 4) as usize,
            (msg[FLAGS_OFF + 3] & 0x0f) as usize,
        ];
        let list_words: usize = counts.iter().sum();
        if LISTS_OFF + list_words * WORD_SIZE + MAC_SIZE != msg.len() {
            return Err(ParseError::Malformed);
        }
        Ok(Self { msg, counts })
    }

    pub fn version(&self) -> &'a [u8; 4] {
        self.msg[VERSION_OFF..VERSION_OFF + 4].try_into().unwrap()
    }

    pub fn client_id(&self) -> &'a [u8] {
        &self.msg[CLIENT_ID_OFF..CLIENT_ID_OFF + CLIENT_ID_SIZE]
    }

    pub fn h3(&self) -> &'a [u8; HASH_IMAGE_SIZE] {
        self.msg[H3_OFF..H3_OFF + HASH_IMAGE_SIZE].try_into().unwrap()
    }

    pub fn zid(&self) -> &'a [u8; ZID_SIZE] {
        self.msg[ZID_OFF..ZID_OFF + ZID_SIZE].try_into().unwrap()
    }

    pub fn is_sas_sign(&self) -> bool {
        self.msg[FLAGS_OFF] & FLAG_SAS_SIGN != 0
    }

    pub fn is_mitm(&self) -> bool {
        self.msg[FLAGS_OFF] & FLAG_MITM != 0
    }

    fn list(&self, index: usize) -> impl Iterator<Item = &'a [u8]> {
        let start = LISTS_OFF + self.counts[..index].iter().sum::<usize>() * WORD_SIZE;
        self.msg[start..start + self.counts[index] * WORD_SIZE].chunks_exact(WORD_SIZE)
    }

    /// Decode the offered algorithm lists. Unknown names and duplicates
    /// are skipped; an empty category means the peer relies on the
    /// mandatory algorithm, which is what negotiation falls back to
    /// anyway.
    pub fn offers(&self) -> HelloOffers {
        fn push_unique<T: PartialEq>(list: &mut arrayvec::ArrayVec<T, MAX_OFFERS>, algo: T) {
            if !list.contains(&algo) && !list.is_full() {
                list.push(algo);
            }
        }
        let mut o = HelloOffers::default();
        for name in self.list(0) {
            if let Some(h) = HashAlgorithm::from_wire_name(name) {
                push_unique(&mut o.hashes, h);
            }
        }
        for name in self.list(1) {
            if let Some(c) = CipherAlgorithm::from_wire_name(name) {
                push_unique(&mut o.ciphers, c);
            }
        }
        for name in self.list(2) {
            if let Some(a) = AuthTag::from_wire_name(name) {
                push_unique(&mut o.auth_tags, a);
            }
        }
        for name in self.list(3) {
            match PubKeyAlgorithm::from_wire_name(name) {
                Some(PubKeyAlgorithm::Mult) => o.multi_stream = true,
                Some(p) => push_unique(&mut o.pub_keys, p),
                None => {}
            }
        }
        for name in self.list(4) {
            if let Some(s) = SasRender::from_wire_name(name) {
                push_unique(&mut o.sas_renders, s);
            }
        }
        o
    }

    /// The region covered by the trailing MAC.
    pub fn maced_region(&self) -> &'a [u8] {
        &self.msg[..self.msg.len() - MAC_SIZE]
    }

    pub fn mac(&self) -> &'a [u8; MAC_SIZE] {
        self.msg[self.msg.len() - MAC_SIZE..].try_into().unwrap()
    }
}

pub(crate) struct HelloSpec<'a> {
    pub version: &'a [u8; 4],
    pub client_id: &'a [u8; CLIENT_ID_SIZE],
    pub h3: &'a [u8; HASH_IMAGE_SIZE],
    pub zid: &'a [u8; ZID_SIZE],
    pub sas_sign: bool,
    pub mitm: bool,
    pub hashes: &'a [HashAlgorithm],
    pub ciphers: &'a [CipherAlgorithm],
    pub auth_tags: &'a [AuthTag],
    pub pub_keys: &'a [PubKeyAlgorithm],
    pub multi_stream: bool,
    pub sas_renders: &'a [SasRender],
}

/// Build a Hello; the MAC is keyed with H2 which the caller supplies via
/// the closure.
pub(crate) fn build(spec: &HelloSpec<'_>, mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE]) -> Vec<u8> {
    let mut b = MessageBuilder::new(MessageType::Hello);
    b.put(spec.version);
    b.put(spec.client_id);
    b.put(spec.h3);
    b.put(spec.zid);

    let mut flags = 0u8;
    if spec.sas_sign {
        flags |= FLAG_SAS_SIGN;
    }
    if spec.mitm {
        flags |= FLAG_MITM;
    }
    let kc = spec.pub_keys.len() + usize::from(spec.multi_stream);
    debug_assert!(spec.hashes.len() <= MAX_OFFERS && kc <= MAX_OFFERS + 1);
    b.put(&[
        flags,
        spec.hashes.len() as u8,
        ((spec.ciphers.len() as u8) << 4) | spec.auth_tags.len() as u8,
        ((kc as u8) << 4) | spec.sas_renders.len() as u8,
    ]);

    for h in spec.hashes {
        b.put(h.wire_name());
    }
    for c in spec.ciphers {
        b.put(c.wire_name());
    }
    for a in spec.auth_tags {
        b.put(a.wire_name());
    }
    for p in spec.pub_keys {
        b.put(p.wire_name());
    }
    if spec.multi_stream {
        b.put(PubKeyAlgorithm::Mult.wire_name());
    }
    for s in spec.sas_renders {
        b.put(s.wire_name());
    }
    b.finish_with_mac(mac_fn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_header;

    fn sample() -> Vec<u8> {
        build(
            &HelloSpec {
                version: b"1.10",
                client_id: b"Rust ZRTP 0.1.0 ",
                h3: &[7u8; 32],
                zid: &[9u8; 12],
                sas_sign: false,
                mitm: true,
                hashes: &[HashAlgorithm::Sha256, HashAlgorithm::Sha384],
                ciphers: &[CipherAlgorithm::Aes128],
                auth_tags: &[AuthTag::HmacSha1_32, AuthTag::HmacSha1_80],
                pub_keys: &[PubKeyAlgorithm::Dh3k, PubKeyAlgorithm::E255],
                multi_stream: true,
                sas_renders: &[SasRender::Base32],
            },
            |_| [0xaa; 8],
        )
    }

    #[test]
    fn round_trip() {
        let msg = sample();
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::Hello);
        let hello = HelloView::parse(m).unwrap();
        assert_eq!(hello.version(), b"1.10");
        assert_eq!(hello.zid(), &[9u8; 12]);
        assert_eq!(hello.h3(), &[7u8; 32]);
        assert!(hello.is_mitm());
        assert!(!hello.is_sas_sign());
        let offers = hello.offers();
        assert_eq!(offers.hashes.as_slice(), &[HashAlgorithm::Sha256, HashAlgorithm::Sha384]);
        assert_eq!(offers.pub_keys.as_slice(), &[PubKeyAlgorithm::Dh3k, PubKeyAlgorithm::E255]);
        assert!(offers.multi_stream);
        assert_eq!(hello.mac(), &[0xaa; 8]);
    }

    #[test]
    fn rejects_count_length_mismatch() {
        let mut msg = sample();
        msg[77] = 5; // claim five hashes
        let (_, m) = parse_header(&msg).unwrap();
        assert_eq!(HelloView::parse(m).err(), Some(ParseError::Malformed));
    }

    #[test]
    fn unknown_names_are_skipped() {
        let mut msg = sample();
        // Overwrite the first hash name with an unknown one.
        msg[80..84].copy_from_slice(b"X999");
        let (_, m) = parse_header(&msg).unwrap();
        let offers = HelloView::parse(m).unwrap().offers();
        assert_eq!(offers.hashes.as_slice(), &[HashAlgorithm::Sha384]);
    }
}
