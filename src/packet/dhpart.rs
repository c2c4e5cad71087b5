/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c) ZeroTier, Inc.
 * https://www.zerotier.com/
 */
use crate::packet::{MessageBuilder, MessageType, ParseError};
use crate::proto::*;

/* DHPart1/DHPart2 layout, RFC 6189 sections 5.5 and 5.6:
     12  H1 (8 words)
     44  rs1ID, rs2ID, auxsecretID, pbxsecretID (2 words each)
     76  pv (variable, fixed width for the committed key agreement)
      -  MAC (2 words, keyed with H0)
*/
const H1_OFF: usize = 12;
const IDS_OFF: usize = 44;
const PV_OFF: usize = IDS_OFF + 4 * SECRET_ID_SIZE;

pub(crate) struct DhPartView<'a> {
    msg: &'a [u8],
}

impl<'a> DhPartView<'a> {
    pub fn parse(msg: &'a [u8]) -> Result<Self, ParseError> {
        if msg.len() < PV_OFF + MAC_SIZE + WORD_SIZE {
            return Err(ParseError::TooShort);
        }
        Ok(Self { msg })
    }

    pub fn h1(&self) -> &'a [u8; HASH_IMAGE_SIZE] {
        self.msg[H1_OFF..H1_OFF + HASH_IMAGE_SIZE].try_into().unwrap()
    }

    fn id(&self, index: usize) -> &'a [u8; SECRET_ID_SIZE] {
        self.msg[IDS_OFF + index * SECRET_ID_SIZE..IDS_OFF + (index + 1) * SECRET_ID_SIZE]
            .try_into()
            .unwrap()
    }

    pub fn rs1_id(&self) -> &'a [u8; SECRET_ID_SIZE] {
        self.id(0)
    }

    pub fn rs2_id(&self) -> &'a [u8; SECRET_ID_SIZE] {
        self.id(1)
    }

    pub fn aux_secret_id(&self) -> &'a [u8; SECRET_ID_SIZE] {
        self.id(2)
    }

    pub fn pbx_secret_id(&self) -> &'a [u8; SECRET_ID_SIZE] {
        self.id(3)
    }

    /// The peer's DH public value. Its width is validated against the
    /// committed key agreement by the caller.
    pub fn pv(&self) -> &'a [u8] {
        &self.msg[PV_OFF..self.msg.len() - MAC_SIZE]
    }

    pub fn maced_region(&self) -> &'a [u8] {
        &self.msg[..self.msg.len() - MAC_SIZE]
    }

    pub fn mac(&self) -> &'a [u8; MAC_SIZE] {
        self.msg[self.msg.len() - MAC_SIZE..].try_into().unwrap()
    }
}

/// Build a DHPart1 or DHPart2.
pub(crate) fn build(
    msg_type: MessageType,
    h1: &[u8; HASH_IMAGE_SIZE],
    ids: &[[u8; SECRET_ID_SIZE]; 4],
    pv: &[u8],
    mac_fn: impl FnOnce(&[u8]) -> [u8; MAC_SIZE],
) -> Vec<u8> {
    debug_assert!(msg_type == MessageType::DhPart1 || msg_type == MessageType::DhPart2);
    debug_assert!(pv.len() % WORD_SIZE == 0);
    let mut b = MessageBuilder::new(msg_type);
    b.put(h1);
    for id in ids {
        b.put(id);
    }
    b.put(pv);
    b.finish_with_mac(mac_fn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::parse_header;

    #[test]
    fn round_trip() {
        let ids = [[1u8; 8], [2; 8], [3; 8], [4; 8]];
        let pv = vec![0x55u8; 384];
        let msg = build(MessageType::DhPart1, &[9; 32], &ids, &pv, |_| [6; 8]);
        assert_eq!(msg.len(), 21 * 4 + 384);
        let (t, m) = parse_header(&msg).unwrap();
        assert_eq!(t, MessageType::DhPart1);
        let d = DhPartView::parse(m).unwrap();
        assert_eq!(d.h1(), &[9; 32]);
        assert_eq!(d.rs1_id(), &[1; 8]);
        assert_eq!(d.pbx_secret_id(), &[4; 8]);
        assert_eq!(d.pv(), &pv[..]);
        assert_eq!(d.mac(), &[6; 8]);
    }

    #[test]
    fn rejects_missing_pv() {
        let ids = [[0u8; 8]; 4];
        let msg = build(MessageType::DhPart2, &[0; 32], &ids, &[], |_| [0; 8]);
        assert_eq!(DhPartView::parse(&msg).err(), Some(ParseError::TooShort));
    }
}
